use crate::protocol::{Dataset, Message, SenderId};

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const CONNECT_ATTEMPTS: u32 = 6;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// GatewayIn `host:port`.
    pub server_addr: String,
    /// Result acceptor `host:port`.
    pub results_addr: String,
    /// Uploaded in order: books first, then reviews.
    pub sources: Vec<(Dataset, PathBuf)>,
    pub batch_size: usize,
    /// Queries whose results are written out; empty means all.
    pub queries: Vec<u8>,
    pub results_path: PathBuf,
    /// Random when unset.
    pub client_id: Option<u32>,
    pub connect_attempts: u32,
}

/// Result rows received so far, grouped by query, with the batches already
/// seen so a redelivered batch is never counted twice.
#[derive(Debug, Default)]
pub struct QueryResults {
    pub rows: BTreeMap<u8, Vec<Message>>,
    seen: HashSet<(SenderId, u32)>,
}

impl QueryResults {
    /// Returns false for a batch already taken.
    pub fn accept(&mut self, sender: SenderId, sequence_number: u32) -> bool {
        self.seen.insert((sender, sequence_number))
    }

    pub fn push(&mut self, query: u8, row: Message) {
        self.rows.entry(query).or_default().push(row);
    }

    pub fn count(&self, query: u8) -> usize {
        self.rows.get(&query).map_or(0, Vec::len)
    }
}
