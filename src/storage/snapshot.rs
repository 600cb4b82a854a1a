//! Generation-stamped worker context snapshots.
//!
//! A worker writes the next generation of a client's context to its own file
//! before committing the metadata that names that generation as live. Undoing
//! the metadata write therefore also rolls the context back, and stale
//! generations are removed only after the batch is acked.

use super::StorageError;

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().join("contexts");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, client_id: u32, generation: u64) -> PathBuf {
        self.dir
            .join(format!("client{}_gen{}.bin", client_id, generation))
    }

    /// Writes atomically: temp file, fsync, rename.
    pub fn write<T: Serialize>(
        &self,
        client_id: u32,
        generation: u64,
        value: &T,
    ) -> Result<(), StorageError> {
        let bytes =
            bincode::serialize(value).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let path = self.path(client_id, generation);
        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_data()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn read<T: DeserializeOwned>(
        &self,
        client_id: u32,
        generation: u64,
    ) -> Result<T, StorageError> {
        let path = self.path(client_id, generation);
        let bytes = fs::read(&path)?;
        bincode::deserialize(&bytes).map_err(|e| {
            StorageError::InvalidFile(format!("snapshot {}: {}", path.display(), e))
        })
    }

    /// Deletes every generation of `client_id` except `keep`.
    pub fn retain_only(&self, client_id: u32, keep: Option<u64>) -> Result<(), StorageError> {
        let prefix = format!("client{}_gen", client_id);
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            let generation = rest
                .strip_suffix(".bin")
                .or_else(|| rest.strip_suffix(".tmp"))
                .and_then(|g| g.parse::<u64>().ok());
            if generation.is_some() && generation != keep {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    pub fn clients(&self) -> Result<Vec<u32>, StorageError> {
        let mut clients = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name().to_string_lossy().to_string();
            if let Some(id) = name
                .strip_prefix("client")
                .and_then(|rest| rest.split('_').next())
                .and_then(|id| id.parse::<u32>().ok())
                && !clients.contains(&id)
            {
                clients.push(id);
            }
        }
        clients.sort_unstable();
        Ok(clients)
    }
}
