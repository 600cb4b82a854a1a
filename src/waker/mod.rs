//! Waker Module
//!
//! Supervision of the pipeline's processes by a small cluster of monitors.
//!
//! ## Core Concepts
//! - **Bully Election** (`election`): the live waker with the greatest id
//!   leads. Lower wakers challenge higher ones and step back on `Ack`;
//!   followers re-elect when the leader falls silent.
//! - **Healthchecks** (`service`): the leader probes every other waker and
//!   every worker on a fixed interval. Each missed `Alive` costs a retry; at
//!   zero the process is restarted through a `Restarter`.
//! - **Responder** (`health`): what supervised processes run to answer
//!   probes while they consider themselves healthy.
//!
//! All messages are single bincode datagrams. Nothing is acknowledged at this
//! layer; timeouts cover loss.

pub mod election;
pub mod health;
pub mod service;
pub mod types;

pub use election::{Elector, Step};
pub use health::serve_health;
pub use service::{DockerRestarter, Restarter, Waker};
pub use types::{ElectionState, Monitored, Timing, WakerConfig, WakerMessage};
