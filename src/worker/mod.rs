//! Worker Pipeline Module
//!
//! One pool member of a query pipeline: consumes batches from its own queue,
//! transforms or accumulates them per client, and forwards results to the
//! next pools.
//!
//! ## Core Concepts
//! - **Kinds** (`types::WorkerKind`): a closed set of filters and
//!   accumulators, each with `process` and `finalize` (`logic`).
//! - **Contexts**: per-client accumulator state, snapshotted by generation so
//!   a metadata rollback also rolls the context back.
//! - **Deduplication**: a batch whose `(sender, sequence_number)` is not newer
//!   than the last one recorded for that sender is acked and skipped.
//! - **EOF countdown**: a client is finished here once `eof_to_receive`
//!   upstream EOFs arrived; accumulators then emit their final results and
//!   every member of each destination pool gets an EOF.

pub mod engine;
pub mod logic;
pub mod types;

pub use engine::{EngineState, Worker};
pub use types::{BatchOutcome, Predicate, WorkerConfig, WorkerContext, WorkerKind};

#[cfg(test)]
mod tests;
