//! Exchange/queue naming and per-destination routing policy.
//!
//! Each pool `query.pool` owns exchange `q{query}.p{pool}` with one routing key
//! per member and one queue per member. Results for GatewayOut go through the
//! single `results` exchange. Producers declare the destination's queues
//! themselves, so nothing published before a consumer starts is dropped.

use super::types::MessageRouter;
use super::RouterError;
use crate::protocol::{Field, Record};

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

pub const RESULTS_EXCHANGE: &str = "results";
pub const RESULTS_QUEUE: &str = "results";

pub fn pool_exchange(query: u16, pool: u16) -> String {
    format!("q{}.p{}", query, pool)
}

pub fn worker_queue(query: u16, pool: u16, index: u32) -> String {
    format!("q{}.p{}.w{}", query, pool, index)
}

/// Shard index for a value, stable across processes running the same build.
pub fn shard_of(value: &str, workers: u32) -> u32 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as u32
}

#[derive(Debug, Clone, PartialEq)]
pub enum Destination {
    Pool {
        query: u16,
        pool: u16,
        workers: u32,
        shard_by: Option<Field>,
    },
    Results,
}

impl Destination {
    pub fn exchange(&self) -> String {
        match self {
            Destination::Pool { query, pool, .. } => pool_exchange(*query, *pool),
            Destination::Results => RESULTS_EXCHANGE.to_string(),
        }
    }

    pub fn workers(&self) -> u32 {
        match self {
            Destination::Pool { workers, .. } => (*workers).max(1),
            Destination::Results => 1,
        }
    }

    pub fn routing_keys(&self) -> Vec<String> {
        (0..self.workers()).map(|i| i.to_string()).collect()
    }

    fn queue_for(&self, index: u32) -> String {
        match self {
            Destination::Pool { query, pool, .. } => worker_queue(*query, *pool, index),
            Destination::Results => RESULTS_QUEUE.to_string(),
        }
    }

    /// Declares the exchange and binds every member's queue.
    pub async fn declare(&self, router: &dyn MessageRouter) -> Result<(), RouterError> {
        let exchange = self.exchange();
        router.declare_exchange(&exchange).await?;
        for index in 0..self.workers() {
            router
                .bind_queue(&exchange, &index.to_string(), &self.queue_for(index))
                .await?;
        }
        Ok(())
    }

    /// Splits records into per-routing-key groups. Sharded destinations group
    /// by `hash(field) % workers`; the rest rotate whole batches over members
    /// by `rotation`, which callers derive from the outgoing sequence number
    /// so a replayed batch lands where the original did.
    pub fn route(&self, records: Vec<Record>, rotation: u32) -> Vec<(String, Vec<Record>)> {
        if records.is_empty() {
            return Vec::new();
        }
        let shard_by = match self {
            Destination::Pool { shard_by, .. } => *shard_by,
            Destination::Results => None,
        };
        match shard_by {
            None => vec![((rotation % self.workers()).to_string(), records)],
            Some(field) => {
                let mut groups: BTreeMap<u32, Vec<Record>> = BTreeMap::new();
                for record in records {
                    let text = record
                        .as_message()
                        .and_then(|msg| msg.text_of(field))
                        .unwrap_or_default();
                    groups
                        .entry(shard_of(&text, self.workers()))
                        .or_default()
                        .push(record);
                }
                groups
                    .into_iter()
                    .map(|(shard, records)| (shard.to_string(), records))
                    .collect()
            }
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Pool {
                query,
                pool,
                workers,
                shard_by,
            } => {
                write!(f, "{}.{}x{}", query, pool, workers)?;
                if let Some(field) = shard_by {
                    write!(f, " by {}", field)?;
                }
                Ok(())
            }
            Destination::Results => f.write_str(RESULTS_EXCHANGE),
        }
    }
}

/// Parses the positional `FORWARD_TO` / `NEXT_POOL_WORKERS` / `SHARD_BY`
/// lists. `FORWARD_TO` entries are `query.pool` or `results`; an empty
/// `SHARD_BY` slot means round-robin.
pub fn parse_destinations(
    forward_to: &str,
    next_pool_workers: &str,
    shard_by: &str,
) -> Result<Vec<Destination>, String> {
    let targets: Vec<&str> = split_list(forward_to);
    let workers: Vec<&str> = next_pool_workers.split(',').map(str::trim).collect();
    let shards: Vec<&str> = shard_by.split(',').map(str::trim).collect();

    targets
        .iter()
        .enumerate()
        .map(|(i, target)| {
            if target.eq_ignore_ascii_case(RESULTS_EXCHANGE) {
                return Ok(Destination::Results);
            }
            let (query, pool) = target
                .split_once('.')
                .ok_or_else(|| format!("destination '{}' is not query.pool", target))?;
            let workers = workers
                .get(i)
                .filter(|w| !w.is_empty())
                .ok_or_else(|| format!("no worker count for destination '{}'", target))?;
            let shard_by = match shards.get(i).filter(|s| !s.is_empty()) {
                Some(field) => Some(Field::from_str(field)?),
                None => None,
            };
            Ok(Destination::Pool {
                query: query.parse().map_err(|e| format!("{}: {}", target, e))?,
                pool: pool.parse().map_err(|e| format!("{}: {}", target, e))?,
                workers: workers.parse().map_err(|e| format!("{}: {}", workers, e))?,
                shard_by,
            })
        })
        .collect()
}

fn split_list(value: &str) -> Vec<&str> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}
