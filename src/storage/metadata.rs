//! Crash-recoverable process metadata.
//!
//! Pairs a `KeyValueStorage` (`metadata.bin`) with a `WriteAheadLog`
//! (`log.bin`) and drives every change through the four-phase protocol:
//!
//! 1. log `ChangingFile` with the before-image of the keys,
//! 2. write the keys,
//! 3. log `FinishedWriting`,
//! 4. ack upstream and log `AckedBatch`.
//!
//! On open, the newest log entry says which suffix of that protocol did not
//! complete; a `ChangingFile` is undone before anything else reads the store.

use super::StorageError;
use super::kv::KeyValueStorage;
use super::types::{FieldType, Key, Value};
use super::wal::{LogEntry, WriteAheadLog};
use crate::fault::{Checkpoint, FailureInjector};
use crate::protocol::SenderId;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const METADATA_FILE: &str = "metadata.bin";
pub const LOG_FILE: &str = "log.bin";

const KEY_WIDTH: usize = 48;
const LOG_TRUNCATE_THRESHOLD: u64 = 64 * 1024;

pub const LAST_SENT_SEQ: &str = "last_sent_seq_num";

pub fn pending_eof_key(client_id: u32) -> String {
    format!("pending eof client{}", client_id)
}

pub fn last_received_key(sender: SenderId) -> String {
    format!("last received from worker{}", sender)
}

/// Receipt of a sender's results for one client. GatewayOut holds back
/// results of detached clients, so one sender's batches may complete out
/// of order across clients.
pub fn result_received_key(sender: SenderId, client_id: u32) -> String {
    format!("result from {} client{}", sender, client_id)
}

pub fn context_generation_key(client_id: u32) -> String {
    format!("context generation client{}", client_id)
}

/// What the newest log entry found on open asks the owner to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Recovery {
    /// Empty log: nothing was in flight.
    Fresh,
    /// A metadata write was undone; the batch that caused it will be redelivered.
    RolledBack,
    /// The write landed but the upstream ack may not have.
    WriteFinished,
    /// Writing and acking both completed.
    Acked,
    /// A result batch for this client was about to go out.
    SentFinalResult { client_id: u32, seq: u32 },
    /// This client was fully served.
    ClientFinished { client_id: u32 },
}

pub struct MetadataHandler {
    dir: PathBuf,
    storage: KeyValueStorage,
    log: WriteAheadLog,
    values: HashMap<String, i64>,
    failures: FailureInjector,
}

impl MetadataHandler {
    pub fn open(
        dir: impl AsRef<Path>,
        failures: FailureInjector,
    ) -> Result<(Self, Recovery), StorageError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut log = WriteAheadLog::open(dir.join(LOG_FILE))?;
        let last = log.read_last()?;

        let key_type = FieldType::FixedStr(KEY_WIDTH);
        let value_types = vec![FieldType::FixedInt(8)];
        let metadata_path = dir.join(METADATA_FILE);
        let (storage, entries) = match &last {
            Some(LogEntry::ChangingFile { .. }) => {
                KeyValueStorage::open_repairing(&metadata_path, key_type, value_types)?
            }
            _ => KeyValueStorage::open(&metadata_path, key_type, value_types)?,
        };

        let mut handler = Self {
            dir,
            storage,
            log,
            values: HashMap::new(),
            failures,
        };
        handler.load(entries)?;

        let recovery = match last {
            None => Recovery::Fresh,
            Some(LogEntry::ChangingFile {
                filename,
                keys,
                old_values,
            }) => {
                tracing::warn!(
                    "Undoing interrupted write of {} key(s) in {}",
                    keys.len(),
                    filename
                );
                undo(&mut handler.storage, &keys, &old_values)?;
                for (key, old) in keys.iter().zip(&old_values) {
                    match old.as_ref().and_then(|v| v.first()).and_then(Value::as_int) {
                        Some(v) => handler.values.insert(key.to_string(), v),
                        None => handler.values.remove(&key.to_string()),
                    };
                }
                handler.log.truncate()?;
                Recovery::RolledBack
            }
            Some(LogEntry::FinishedWriting) => Recovery::WriteFinished,
            Some(LogEntry::AckedBatch) => Recovery::Acked,
            Some(LogEntry::SentFinalResult { client_id, seq }) => {
                Recovery::SentFinalResult { client_id, seq }
            }
            Some(LogEntry::FinishedSendingResults { client_id }) => {
                Recovery::ClientFinished { client_id }
            }
        };

        tracing::info!(
            "Metadata in {} loaded ({} keys), recovery: {:?}",
            handler.dir.display(),
            handler.values.len(),
            recovery
        );

        Ok((handler, recovery))
    }

    fn load(&mut self, entries: HashMap<Key, Vec<Value>>) -> Result<(), StorageError> {
        self.values.clear();
        for (key, values) in entries {
            let value = values.first().and_then(Value::as_int).ok_or_else(|| {
                StorageError::InvalidFile(format!("metadata key {} has no integer value", key))
            })?;
            self.values.insert(key.to_string(), value);
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn get(&self, key: &str) -> Option<i64> {
        self.values.get(key).copied()
    }

    pub fn last_sent_seq(&self) -> u32 {
        self.get(LAST_SENT_SEQ).unwrap_or(0) as u32
    }

    pub fn pending_eof(&self, client_id: u32) -> Option<i64> {
        self.get(&pending_eof_key(client_id))
    }

    pub fn last_received(&self, sender: SenderId) -> Option<u32> {
        self.get(&last_received_key(sender)).map(|v| v as u32)
    }

    pub fn result_received(&self, sender: SenderId, client_id: u32) -> Option<u32> {
        self.get(&result_received_key(sender, client_id)).map(|v| v as u32)
    }

    pub fn context_generation(&self, client_id: u32) -> Option<u64> {
        self.get(&context_generation_key(client_id)).map(|v| v as u64)
    }

    /// Clients with a pending-EOF counter that already reached zero.
    pub fn drained_clients(&self) -> Vec<u32> {
        let mut clients: Vec<u32> = self
            .values
            .iter()
            .filter(|(_, v)| **v <= 0)
            .filter_map(|(k, _)| k.strip_prefix("pending eof client"))
            .filter_map(|id| id.parse().ok())
            .collect();
        clients.sort_unstable();
        clients
    }

    /// Applies `changes` (`None` deletes) under the log protocol: before-image,
    /// write, `FinishedWriting`.
    pub fn commit(&mut self, changes: &[(String, Option<i64>)]) -> Result<(), StorageError> {
        if changes.is_empty() {
            return Ok(());
        }

        let keys: Vec<Key> = changes.iter().map(|(k, _)| Key::from(k.as_str())).collect();
        let old_values = changes
            .iter()
            .map(|(k, _)| self.get(k).map(|v| vec![Value::Int(v)]))
            .collect();
        self.log.append(&LogEntry::ChangingFile {
            filename: METADATA_FILE.to_string(),
            keys,
            old_values,
        })?;
        self.failures.check(Checkpoint::AfterChangingFile)?;

        let mut upserts = Vec::new();
        for (key, value) in changes {
            match value {
                Some(v) => upserts.push((Key::from(key.as_str()), vec![Value::Int(*v)])),
                None => {
                    if !upserts.is_empty() {
                        self.storage.store_all(&upserts)?;
                        upserts.clear();
                    }
                    self.storage.remove(&Key::from(key.as_str()))?;
                }
            }
        }
        if !upserts.is_empty() {
            self.storage.store_all(&upserts)?;
        }
        self.failures.check(Checkpoint::AfterMetadataWrite)?;

        self.log.append(&LogEntry::FinishedWriting)?;
        self.failures.check(Checkpoint::AfterFinishedWriting)?;

        for (key, value) in changes {
            match value {
                Some(v) => self.values.insert(key.clone(), *v),
                None => self.values.remove(key),
            };
        }
        Ok(())
    }

    /// Records that the upstream ack went out, closing the cycle. The log is
    /// emptied once it grows past a threshold.
    pub fn mark_acked(&mut self) -> Result<(), StorageError> {
        self.log.append(&LogEntry::AckedBatch)?;
        if self.log.len_bytes()? > LOG_TRUNCATE_THRESHOLD {
            self.log.truncate()?;
        }
        Ok(())
    }

    pub fn log_sent_final_result(&mut self, client_id: u32, seq: u32) -> Result<(), StorageError> {
        self.log.append(&LogEntry::SentFinalResult { client_id, seq })
    }

    pub fn log_finished_client(&mut self, client_id: u32) -> Result<(), StorageError> {
        self.log.append(&LogEntry::FinishedSendingResults { client_id })
    }

    pub fn log_entries(&mut self) -> Result<Vec<LogEntry>, StorageError> {
        self.log.entries()
    }
}

/// Restores the before-image of a `ChangingFile` entry, newest key first so
/// keys appended by the interrupted write are cut off the end in order.
pub fn undo(
    storage: &mut KeyValueStorage,
    keys: &[Key],
    old_values: &[Option<Vec<Value>>],
) -> Result<(), StorageError> {
    if keys.len() != old_values.len() {
        return Err(StorageError::InvalidFile(format!(
            "before-image has {} keys but {} values",
            keys.len(),
            old_values.len()
        )));
    }
    for (key, old) in keys.iter().zip(old_values).rev() {
        match old {
            Some(values) => storage.store(key, values)?,
            None => {
                storage.remove(key)?;
            }
        }
    }
    Ok(())
}
