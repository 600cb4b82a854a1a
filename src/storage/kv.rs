//! Fixed-record key-value file.
//!
//! Every record is `key | value_1 | ... | value_n`, each column fixed width,
//! so a key's offset never changes once assigned and an update is a single
//! seeked write. The file is scanned once on open to rebuild the
//! `key -> offset` index.

use super::StorageError;
use super::types::*;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub type Entries = HashMap<Key, Vec<Value>>;

pub struct KeyValueStorage {
    path: PathBuf,
    file: File,
    key_type: FieldType,
    value_types: Vec<FieldType>,
    index: HashMap<Key, u64>,
    /// Key stored in each slot, in file order. Lets `remove` move the last
    /// record into the freed slot.
    slots: Vec<Key>,
    record_len: usize,
}

impl KeyValueStorage {
    /// Opens or creates the file and returns the store with every entry it holds.
    /// A trailing partial record is `InvalidFile`.
    pub fn open(
        path: impl AsRef<Path>,
        key_type: FieldType,
        value_types: Vec<FieldType>,
    ) -> Result<(Self, Entries), StorageError> {
        Self::open_inner(path.as_ref(), key_type, value_types, false)
    }

    /// Like `open`, but cuts a torn trailing record instead of failing.
    ///
    /// Only valid when the write-ahead log shows a metadata write was in
    /// flight: a torn tail can then only be a new key being appended, and
    /// the undo of that write removes the key anyway.
    pub fn open_repairing(
        path: impl AsRef<Path>,
        key_type: FieldType,
        value_types: Vec<FieldType>,
    ) -> Result<(Self, Entries), StorageError> {
        Self::open_inner(path.as_ref(), key_type, value_types, true)
    }

    fn open_inner(
        path: &Path,
        key_type: FieldType,
        value_types: Vec<FieldType>,
        repair_tail: bool,
    ) -> Result<(Self, Entries), StorageError> {
        key_type.validate()?;
        if !matches!(key_type, FieldType::FixedStr(_) | FieldType::FixedInt(_)) {
            return Err(StorageError::UnsupportedType(format!(
                "{:?} cannot be a key column",
                key_type
            )));
        }
        for ty in &value_types {
            ty.validate()?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let record_len = key_type.width() + value_types.iter().map(|t| t.width()).sum::<usize>();

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;

        let torn = contents.len() % record_len;
        if torn != 0 {
            if !repair_tail {
                return Err(StorageError::InvalidFile(format!(
                    "{} ends with a partial record ({} stray bytes)",
                    path.display(),
                    torn
                )));
            }
            tracing::warn!(
                "Cutting {} stray bytes off the end of {}",
                torn,
                path.display()
            );
            let keep = contents.len() - torn;
            contents.truncate(keep);
            file.set_len(keep as u64)?;
            file.sync_data()?;
        }

        let mut storage = Self {
            path: path.to_path_buf(),
            file,
            key_type,
            value_types,
            index: HashMap::new(),
            slots: Vec::new(),
            record_len,
        };

        let mut entries = HashMap::new();
        for (slot, record) in contents.chunks_exact(record_len).enumerate() {
            let (key, values) = storage.decode_record(record)?;
            if storage.index.contains_key(&key) {
                return Err(StorageError::InvalidFile(format!(
                    "key {} appears twice in {}",
                    key,
                    path.display()
                )));
            }
            storage
                .index
                .insert(key.clone(), (slot * record_len) as u64);
            storage.slots.push(key.clone());
            entries.insert(key, values);
        }

        tracing::debug!(
            "Opened {} with {} entries",
            storage.path.display(),
            entries.len()
        );

        Ok((storage, entries))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn next_offset(&self) -> u64 {
        (self.slots.len() * self.record_len) as u64
    }

    pub fn offset_of(&self, key: &Key) -> Option<u64> {
        self.index.get(key).copied()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.index.contains_key(key)
    }

    /// Upserts one key: overwritten in place if present, appended otherwise.
    pub fn store(&mut self, key: &Key, values: &[Value]) -> Result<(), StorageError> {
        self.write_record(key, values)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Upserts several keys, syncing once at the end. Callers pair this with a
    /// `ChangingFile` log entry so a partial application can be undone.
    pub fn store_all(&mut self, entries: &[(Key, Vec<Value>)]) -> Result<(), StorageError> {
        for (key, values) in entries {
            self.write_record(key, values)?;
        }
        self.file.sync_data()?;
        Ok(())
    }

    pub fn get(&mut self, key: &Key) -> Result<Option<Vec<Value>>, StorageError> {
        let Some(offset) = self.offset_of(key) else {
            return Ok(None);
        };
        let mut record = vec![0u8; self.record_len];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut record)?;
        let (_, values) = self.decode_record(&record)?;
        Ok(Some(values))
    }

    /// Removes a key by moving the last record into its slot and shrinking
    /// the file by one record. Removing the last record is a pure truncate.
    pub fn remove(&mut self, key: &Key) -> Result<bool, StorageError> {
        let Some(offset) = self.index.remove(key) else {
            return Ok(false);
        };
        let slot = (offset as usize) / self.record_len;
        let last_slot = self.slots.len() - 1;

        if slot != last_slot {
            let mut record = vec![0u8; self.record_len];
            let last_offset = (last_slot * self.record_len) as u64;
            self.file.seek(SeekFrom::Start(last_offset))?;
            self.file.read_exact(&mut record)?;
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.write_all(&record)?;

            let moved = self.slots[last_slot].clone();
            self.index.insert(moved.clone(), offset);
            self.slots[slot] = moved;
        }

        self.slots.pop();
        self.file.set_len(self.next_offset())?;
        self.file.sync_data()?;
        Ok(true)
    }

    fn write_record(&mut self, key: &Key, values: &[Value]) -> Result<(), StorageError> {
        let record = self.encode_record(key, values)?;
        let offset = match self.index.get(key) {
            Some(offset) => *offset,
            None => {
                let offset = self.next_offset();
                self.index.insert(key.clone(), offset);
                self.slots.push(key.clone());
                offset
            }
        };
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&record)?;
        Ok(())
    }

    fn encode_record(&self, key: &Key, values: &[Value]) -> Result<Vec<u8>, StorageError> {
        if values.len() != self.value_types.len() {
            return Err(StorageError::TooManyValues {
                count: values.len(),
                capacity: self.value_types.len(),
            });
        }
        let mut out = Vec::with_capacity(self.record_len);
        encode_field(self.key_type, &key.to_value(), &mut out)?;
        for (ty, value) in self.value_types.iter().zip(values) {
            encode_field(*ty, value, &mut out)?;
        }
        Ok(out)
    }

    fn decode_record(&self, record: &[u8]) -> Result<(Key, Vec<Value>), StorageError> {
        let key_width = self.key_type.width();
        let key = Key::from_value(decode_field(self.key_type, &record[..key_width])?)?;
        let mut values = Vec::with_capacity(self.value_types.len());
        let mut offset = key_width;
        for ty in &self.value_types {
            values.push(decode_field(*ty, &record[offset..offset + ty.width()])?);
            offset += ty.width();
        }
        Ok((key, values))
    }
}
