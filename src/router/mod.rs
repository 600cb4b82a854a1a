//! Message Router Module
//!
//! Exchange/queue messaging between pipeline stages with explicit
//! acknowledgement.
//!
//! ## Core Concepts
//! - **Exchanges and routing keys**: a producer publishes to an exchange under
//!   a key; every queue bound to that key receives a copy.
//! - **Deliveries**: a consumed message stays owned by the router until acked.
//!   Nacked, recovered or lease-expired deliveries are requeued at the front
//!   and flagged `redelivered`.
//! - **Topology** (`topology`): how pools, queues and sharding map onto
//!   exchanges.
//! - **Transports**: the in-process `Broker`, and `RemoteRouter` talking to a
//!   broker served over HTTP by `handlers::broker_routes`.

pub mod broker;
pub mod handlers;
pub mod protocol;
pub mod remote;
pub mod topology;
pub mod types;

pub use broker::Broker;
pub use remote::RemoteRouter;
pub use topology::Destination;
pub use types::{Delivery, MessageRouter, QueueHandle};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("router transport disconnected: {0}")]
    TransportDisconnected(String),

    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    #[error("unknown exchange: {0}")]
    UnknownExchange(String),

    #[error("unknown delivery tag: {0}")]
    UnknownDelivery(u64),
}
