//! Fault-Tolerant Book Analytics Pipeline
//!
//! This library crate defines the components of the distributed pipeline.
//! The binary (`main.rs`) runs one of them per process.
//!
//! ## Architecture Modules
//! - **`protocol`**: the binary record and batch format shared by every hop.
//! - **`storage`**: fixed-record key-value files, the write-ahead log and the
//!   metadata store that make persist-then-ack crash safe.
//! - **`router`**: exchanges and queues with ack/nack, in-memory or over HTTP.
//! - **`worker`**: the filter and accumulator pool members.
//! - **`gateway`**: client ingress, result egress and the result acceptor.
//! - **`ingestion`**: parsing of raw dataset lines.
//! - **`client`**: dataset upload and result collection.
//! - **`waker`**: leader-elected health monitoring and restarts.
//! - **`fault`**: failure injection at persistence checkpoints.
//! - **`config`**: command line and environment options per role.

pub mod client;
pub mod config;
pub mod fault;
pub mod gateway;
pub mod ingestion;
pub mod protocol;
pub mod router;
pub mod storage;
pub mod waker;
pub mod worker;
