//! Append-only write-ahead log, read backward.
//!
//! Entry framing (bincode payload, CRC32 of the payload):
//!
//! ```text
//! [len:4][payload:len][crc32:4][len:4][type:1]
//! ```
//!
//! The trailer lets `read_previous` walk right-to-left from any entry end.
//! The leading length lets `open` walk left-to-right once to find the last
//! complete entry and cut a torn tail left by a crash mid-append.

use super::StorageError;
use super::types::{Key, Value};

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const LEADER_LEN: u64 = 4;
const TRAILER_LEN: u64 = 9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogEntry {
    /// Before-image of the metadata write about to happen. `None` means the
    /// key did not exist.
    ChangingFile {
        filename: String,
        keys: Vec<Key>,
        old_values: Vec<Option<Vec<Value>>>,
    },
    FinishedWriting,
    AckedBatch,
    SentFinalResult { client_id: u32, seq: u32 },
    FinishedSendingResults { client_id: u32 },
}

impl LogEntry {
    pub fn type_tag(&self) -> u8 {
        match self {
            LogEntry::ChangingFile { .. } => 1,
            LogEntry::FinishedWriting => 2,
            LogEntry::AckedBatch => 3,
            LogEntry::SentFinalResult { .. } => 4,
            LogEntry::FinishedSendingResults { .. } => 5,
        }
    }
}

pub struct WriteAheadLog {
    path: PathBuf,
    file: File,
    /// End offset of the next entry `read_previous` will return.
    cursor: u64,
}

impl WriteAheadLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        let valid = last_complete_end(&contents);
        if valid < contents.len() as u64 {
            tracing::warn!(
                "Discarding torn log tail of {} bytes in {}",
                contents.len() as u64 - valid,
                path.display()
            );
            file.set_len(valid)?;
            file.sync_data()?;
        }

        Ok(Self {
            path,
            file,
            cursor: valid,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len_bytes(&self) -> Result<u64, StorageError> {
        Ok(self.file.metadata()?.len())
    }

    /// Writes the entry and syncs it. Nothing the entry describes may be
    /// assumed done before this returns.
    pub fn append(&mut self, entry: &LogEntry) -> Result<(), StorageError> {
        let payload = bincode::serialize(entry)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let len = u32::try_from(payload.len())
            .map_err(|_| StorageError::Serialization("log entry too large".to_string()))?;

        let mut frame = Vec::with_capacity(payload.len() + (LEADER_LEN + TRAILER_LEN) as usize);
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.push(entry.type_tag());

        let end = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&frame)?;
        self.file.sync_data()?;
        self.cursor = end + frame.len() as u64;
        Ok(())
    }

    /// Positions at end of file and returns the newest entry.
    pub fn read_last(&mut self) -> Result<Option<LogEntry>, StorageError> {
        self.cursor = self.file.seek(SeekFrom::End(0))?;
        self.read_previous()
    }

    /// Returns the entry ending at the cursor and moves the cursor before it.
    /// `None` at start of file.
    pub fn read_previous(&mut self) -> Result<Option<LogEntry>, StorageError> {
        if self.cursor == 0 {
            return Ok(None);
        }
        if self.cursor < LEADER_LEN + TRAILER_LEN {
            return Err(StorageError::InvalidFile(format!(
                "log {} has a {} byte fragment at its start",
                self.path.display(),
                self.cursor
            )));
        }

        let mut trailer = [0u8; TRAILER_LEN as usize];
        self.file.seek(SeekFrom::Start(self.cursor - TRAILER_LEN))?;
        self.file.read_exact(&mut trailer)?;
        let crc = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let len = u32::from_be_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]) as u64;
        let type_tag = trailer[8];

        let start = self
            .cursor
            .checked_sub(TRAILER_LEN + len + LEADER_LEN)
            .ok_or_else(|| {
                StorageError::InvalidFile(format!("log entry length {} runs past start", len))
            })?;

        let mut payload = vec![0u8; len as usize];
        self.file.seek(SeekFrom::Start(start + LEADER_LEN))?;
        self.file.read_exact(&mut payload)?;
        if crc32fast::hash(&payload) != crc {
            return Err(StorageError::InvalidFile(format!(
                "log entry ending at {} fails its checksum",
                self.cursor
            )));
        }

        let entry: LogEntry = bincode::deserialize(&payload)
            .map_err(|e| StorageError::InvalidFile(format!("undecodable log entry: {}", e)))?;
        if entry.type_tag() != type_tag {
            return Err(StorageError::InvalidFile(format!(
                "log entry tagged {} decodes as {:?}",
                type_tag, entry
            )));
        }

        self.cursor = start;
        Ok(Some(entry))
    }

    /// Every entry, oldest first.
    pub fn entries(&mut self) -> Result<Vec<LogEntry>, StorageError> {
        let mut entries = Vec::new();
        let mut next = self.read_last()?;
        while let Some(entry) = next {
            entries.push(entry);
            next = self.read_previous()?;
        }
        entries.reverse();
        Ok(entries)
    }

    /// Empties the log once the metadata store is known consistent.
    pub fn truncate(&mut self) -> Result<(), StorageError> {
        self.file.set_len(0)?;
        self.file.sync_data()?;
        self.cursor = 0;
        Ok(())
    }
}

/// Offset just past the last entry whose framing and checksum are intact.
fn last_complete_end(contents: &[u8]) -> u64 {
    let mut pos = 0usize;
    loop {
        let Some(leader) = contents.get(pos..pos + LEADER_LEN as usize) else {
            return pos as u64;
        };
        let len = u32::from_be_bytes([leader[0], leader[1], leader[2], leader[3]]) as usize;
        let payload_start = pos + LEADER_LEN as usize;
        let end = payload_start + len + TRAILER_LEN as usize;
        let Some(frame) = contents.get(payload_start..end) else {
            return pos as u64;
        };
        let payload = &frame[..len];
        let trailer = &frame[len..];
        let crc = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let trailer_len = u32::from_be_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]);
        if crc32fast::hash(payload) != crc || trailer_len as usize != len {
            return pos as u64;
        }
        pos = end;
    }
}
