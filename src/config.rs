//! Command line and environment configuration.
//!
//! Every process role is a subcommand. Options mirror the container
//! environment, so a compose file only sets variables.

use crate::client::ClientConfig;
use crate::client::types::{CONNECT_ATTEMPTS, DEFAULT_BATCH_SIZE};
use crate::gateway::{GatewayConfig, parse_first_pools};
use crate::protocol::{Dataset, SenderId};
use crate::router::topology::parse_destinations;
use crate::waker::{Monitored, Timing, WakerConfig};
use crate::worker::{WorkerConfig, WorkerKind};

use anyhow::{Result, anyhow};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "distributed-pipeline", about = "Fault-tolerant book analytics pipeline")]
pub struct Cli {
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: tracing::Level,

    /// Chance of a simulated crash at each persistence checkpoint.
    #[arg(long, env = "FAILURE_PROBABILITY", default_value_t = 0.0, global = true)]
    pub failure_probability: f64,

    #[command(subcommand)]
    pub role: Role,
}

#[derive(Subcommand, Debug)]
pub enum Role {
    /// Serve the message router over HTTP.
    Broker(BrokerArgs),
    /// Run GatewayIn, GatewayOut and the result acceptor.
    Gateway(GatewayArgs),
    /// Run one pool member.
    Worker(WorkerArgs),
    /// Run one monitor of the waker cluster.
    Waker(WakerArgs),
    /// Upload the datasets and collect the results.
    Client(ClientArgs),
}

#[derive(Args, Debug)]
pub struct BrokerArgs {
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:5672")]
    pub bind_addr: String,

    /// Seconds a delivery may stay unacked before it is requeued.
    #[arg(long, env = "LEASE_SECS", default_value_t = 30)]
    pub lease_secs: u64,
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// `query.pool.index`
    #[arg(long, env = "WORKER_ID")]
    pub worker_id: SenderId,

    #[arg(long, env = "WORKER_KIND")]
    pub worker_kind: String,

    #[arg(long, env = "WORKER_FIELD")]
    pub worker_field: Option<String>,

    #[arg(long, env = "WORKER_VALUE")]
    pub worker_value: Option<String>,

    #[arg(long, env = "ACCUMULATE_BY")]
    pub accumulate_by: Option<String>,

    #[arg(long, env = "EOF_TO_RECEIVE", default_value_t = 1)]
    pub eof_to_receive: i64,

    /// Destination pools (`query.pool`) or `results`, comma separated.
    #[arg(long, env = "FORWARD_TO")]
    pub forward_to: String,

    #[arg(long, env = "NEXT_POOL_WORKERS", default_value = "")]
    pub next_pool_workers: String,

    #[arg(long, env = "SHARD_BY", default_value = "")]
    pub shard_by: String,

    #[arg(long, env = "ROUTER_ADDR", default_value = "router:5672")]
    pub router_addr: String,

    #[arg(long, env = "DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    #[arg(long, env = "HEALTH_PORT", default_value_t = 7001)]
    pub health_port: u16,
}

impl WorkerArgs {
    pub fn worker_config(&self) -> Result<WorkerConfig> {
        let kind = WorkerKind::from_parts(
            &self.worker_kind,
            self.worker_field.as_deref(),
            self.worker_value.as_deref(),
            self.accumulate_by.as_deref(),
        )
        .map_err(|e| anyhow!("invalid worker kind: {}", e))?;
        let destinations = parse_destinations(&self.forward_to, &self.next_pool_workers, &self.shard_by)
            .map_err(|e| anyhow!("invalid destinations: {}", e))?;
        Ok(WorkerConfig {
            id: self.worker_id,
            kind,
            eof_to_receive: self.eof_to_receive,
            destinations,
            data_dir: self.data_dir.clone(),
        })
    }
}

#[derive(Args, Debug)]
pub struct GatewayArgs {
    #[arg(long, env = "SERVER_PORT", default_value_t = 12345)]
    pub server_port: u16,

    #[arg(long, env = "RESULTS_PORT", default_value_t = 12346)]
    pub results_port: u16,

    #[arg(long, env = "FIRST_POOLS")]
    pub first_pools: String,

    #[arg(long, env = "FIRST_POOL_WORKERS", default_value = "")]
    pub first_pool_workers: String,

    #[arg(long, env = "FIRST_POOL_SHARD_BY", default_value = "")]
    pub first_pool_shard_by: String,

    /// Per first pool: `books`, `reviews` or `books+reviews`.
    #[arg(long, env = "FIRST_POOL_DATASETS", default_value = "")]
    pub first_pool_datasets: String,

    /// Result EOFs per client, one per last pool member.
    #[arg(long, env = "EOF_TO_RECEIVE", default_value_t = 1)]
    pub eof_to_receive: i64,

    #[arg(long, env = "ROUTER_ADDR", default_value = "router:5672")]
    pub router_addr: String,

    #[arg(long, env = "DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    #[arg(long, env = "HEALTH_PORT", default_value_t = 7001)]
    pub health_port: u16,
}

impl GatewayArgs {
    pub fn gateway_config(&self) -> Result<GatewayConfig> {
        let first_pools = parse_first_pools(
            &self.first_pools,
            &self.first_pool_workers,
            &self.first_pool_shard_by,
            &self.first_pool_datasets,
        )
        .map_err(|e| anyhow!("invalid first pools: {}", e))?;
        Ok(GatewayConfig {
            first_pools,
            eof_to_receive: self.eof_to_receive,
            data_dir: self.data_dir.clone(),
        })
    }
}

#[derive(Args, Debug)]
pub struct WakerArgs {
    #[arg(long, env = "WAKER_ID")]
    pub waker_id: String,

    /// Every waker container, this one included.
    #[arg(long, env = "WAKERS_CONTAINERS", default_value = "")]
    pub wakers_containers: String,

    #[arg(long, env = "WORKERS_CONTAINERS", default_value = "")]
    pub workers_containers: String,

    #[arg(long, env = "WAKER_PORT", default_value_t = 7000)]
    pub waker_port: u16,

    /// Port the supervised processes answer healthchecks on.
    #[arg(long, env = "HEALTH_PORT", default_value_t = 7001)]
    pub health_port: u16,
}

impl WakerArgs {
    pub fn waker_config(&self) -> WakerConfig {
        let peers = Monitored::from_names(&self.wakers_containers, self.waker_port)
            .into_iter()
            .filter(|peer| peer.name != self.waker_id)
            .collect();
        WakerConfig {
            id: self.waker_id.clone(),
            peers,
            workers: Monitored::from_names(&self.workers_containers, self.health_port),
            timing: Timing::default(),
        }
    }
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    #[arg(long, env = "SERVER_HOST", default_value = "gateway")]
    pub server_host: String,

    #[arg(long, env = "SERVER_PORT", default_value_t = 12345)]
    pub server_port: u16,

    #[arg(long, env = "RESULTS_PORT", default_value_t = 12346)]
    pub results_port: u16,

    #[arg(long, env = "BOOKS_PATH", default_value = "data/books_data.csv")]
    pub books_path: PathBuf,

    #[arg(long, env = "REVIEWS_PATH", default_value = "data/Books_rating.csv")]
    pub reviews_path: PathBuf,

    #[arg(long, env = "BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Queries to write out, comma separated; empty writes all.
    #[arg(long, env = "QUERIES", default_value = "1,2,3,4,5")]
    pub queries: String,

    #[arg(long, env = "QUERY_RESULTS_PATH", default_value = "results")]
    pub query_results_path: PathBuf,

    #[arg(long, env = "CLIENT_ID")]
    pub client_id: Option<u32>,
}

impl ClientArgs {
    pub fn client_config(&self) -> Result<ClientConfig> {
        let queries = self
            .queries
            .split(',')
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(|q| q.parse::<u8>().map_err(|e| anyhow!("invalid query '{}': {}", q, e)))
            .collect::<Result<Vec<_>>>()?;
        Ok(ClientConfig {
            server_addr: format!("{}:{}", self.server_host, self.server_port),
            results_addr: format!("{}:{}", self.server_host, self.results_port),
            sources: vec![
                (Dataset::Books, self.books_path.clone()),
                (Dataset::Reviews, self.reviews_path.clone()),
            ],
            batch_size: self.batch_size,
            queries,
            results_path: self.query_results_path.clone(),
            client_id: self.client_id,
            connect_attempts: CONNECT_ATTEMPTS,
        })
    }
}
