//! Gateway Module
//!
//! The pipeline's edge towards clients.
//!
//! ## Core Concepts
//! - **GatewayIn** (`gateway_in`): one session per uploading client. Each
//!   batch of raw lines is parsed, published to the first-stage pools and
//!   only then acked with one byte, which is the client's permission to send
//!   the next batch. EOF (explicit or a disconnect) is broadcast once.
//! - **GatewayOut** (`gateway_out`): the single consumer of final results.
//!   Shapes them per query, writes them to the client's result socket,
//!   deduplicates by sender and sequence number, and counts result EOFs down
//!   to the client's terminal EOF. Results for clients without a socket are
//!   held unacked and flushed once the socket attaches.
//! - **Acceptor** (`acceptor`): takes result-stream connections and hands
//!   the sockets to GatewayOut over a channel.

pub mod acceptor;
pub mod gateway_in;
pub mod gateway_out;
pub mod types;

pub use gateway_in::Ingress;
pub use gateway_out::GatewayOut;
pub use types::{FirstPool, GatewayConfig, parse_first_pools};

use crate::fault::FailureInjector;
use crate::router::MessageRouter;

use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

const REGISTRATION_BACKLOG: usize = 64;

/// Runs GatewayIn, the acceptor and GatewayOut until shutdown or until one
/// of them fails.
pub async fn run_gateway(
    config: GatewayConfig,
    router: Arc<dyn MessageRouter>,
    clients: TcpListener,
    results: TcpListener,
    failures: FailureInjector,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let ingress = Arc::new(Ingress::new(router.clone(), config.first_pools)?);
    ingress.declare().await?;

    let (tx, rx) = mpsc::channel(REGISTRATION_BACKLOG);
    let egress = GatewayOut::start(router, &config.data_dir, config.eof_to_receive, rx, failures).await?;

    tokio::select! {
        res = gateway_in::serve_clients(clients, ingress) => res,
        res = acceptor::accept_result_streams(results, tx) => res,
        res = egress.run(shutdown) => res,
    }
}

#[cfg(test)]
mod tests;
