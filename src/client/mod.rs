//! Client Module
//!
//! The user-facing end of the pipeline.
//!
//! ## Core Concepts
//! - **Upload** (`upload`): dataset rows go to GatewayIn as batches of raw
//!   CSV lines. The next batch is only sent after the previous one's ack
//!   byte, which is the whole flow control of the ingress side.
//! - **Results** (`results`): a second connection announces the client id
//!   and reads result batches until the terminal EOF. Batches are
//!   deduplicated by sender and sequence number before any row is kept.
//! - **Backoff**: both connections retry with exponential backoff up to a
//!   bounded number of attempts, then the client reports failure.

pub mod results;
pub mod types;
pub mod upload;

pub use results::{receive_results, write_results};
pub use types::{ClientConfig, QueryResults};
pub use upload::upload;

use anyhow::{Context, Result, anyhow};
use std::time::Duration;
use tokio::net::TcpStream;

const BASE_BACKOFF_MS: u64 = 150;
const MAX_BACKOFF_MS: u64 = 1200;

/// Connects to `addr`, retrying with exponential backoff and jitter.
pub async fn connect_with_backoff(addr: &str, attempts: u32) -> Result<TcpStream> {
    let mut backoff_ms = BASE_BACKOFF_MS;
    let mut last_err = None;

    for attempt in 1..=attempts.max(1) {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::debug!("Connect to {} failed (attempt {}): {}", addr, attempt, e);
                last_err = Some(e);
            }
        }
        if attempt < attempts {
            let jitter = rand::random::<u64>() % 50;
            tokio::time::sleep(Duration::from_millis(backoff_ms + jitter)).await;
            backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
        }
    }

    Err(anyhow!(
        "could not reach {} after {} attempts: {}",
        addr,
        attempts,
        last_err.map(|e| e.to_string()).unwrap_or_default()
    ))
}

/// Uploads the configured datasets and collects every query's results.
/// Returns the paths of the written result files.
pub async fn run_client(config: ClientConfig) -> Result<Vec<std::path::PathBuf>> {
    let client_id = config.client_id.unwrap_or_else(rand::random);
    tracing::info!("Client {} starting", client_id);

    let mut result_stream = connect_with_backoff(&config.results_addr, config.connect_attempts)
        .await
        .context("result stream")?;
    let receiver =
        tokio::spawn(async move { receive_results(&mut result_stream, client_id).await });

    let mut upload_stream = connect_with_backoff(&config.server_addr, config.connect_attempts)
        .await
        .context("upload stream")?;
    let batches = upload(
        &mut upload_stream,
        client_id,
        &config.sources,
        config.batch_size,
    )
    .await?;
    tracing::info!("Client {} sent {} batch(es), waiting for results", client_id, batches);

    let results = receiver.await??;
    let written = write_results(&config.results_path, &results, &config.queries)?;
    tracing::info!("Client {} wrote {} result file(s)", client_id, written.len());
    Ok(written)
}
