use crate::protocol::Dataset;
use crate::router::Destination;
use crate::router::topology::parse_destinations;

use std::path::PathBuf;

/// A first-stage pool and the datasets it is fed.
#[derive(Debug, Clone, PartialEq)]
pub struct FirstPool {
    pub destination: Destination,
    pub datasets: Vec<Dataset>,
}

impl FirstPool {
    pub fn wants(&self, dataset: Dataset) -> bool {
        self.datasets.contains(&dataset)
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub first_pools: Vec<FirstPool>,
    /// Result-stream EOFs GatewayOut waits for per client.
    pub eof_to_receive: i64,
    pub data_dir: PathBuf,
}

/// Parses the positional `FIRST_POOLS` / `FIRST_POOL_WORKERS` /
/// `FIRST_POOL_SHARD_BY` / `FIRST_POOL_DATASETS` lists. A dataset slot is
/// `books`, `reviews` or `books+reviews`; empty means books.
pub fn parse_first_pools(
    pools: &str,
    workers: &str,
    shard_by: &str,
    datasets: &str,
) -> Result<Vec<FirstPool>, String> {
    let destinations = parse_destinations(pools, workers, shard_by)?;
    let slots: Vec<&str> = datasets.split(',').map(str::trim).collect();

    destinations
        .into_iter()
        .enumerate()
        .map(|(i, destination)| {
            if destination == Destination::Results {
                return Err("the results exchange cannot be a first pool".to_string());
            }
            let datasets = match slots.get(i).filter(|s| !s.is_empty()) {
                None => vec![Dataset::Books],
                Some(slot) => slot
                    .split('+')
                    .map(|name| match name.trim().to_ascii_lowercase().as_str() {
                        "books" => Ok(Dataset::Books),
                        "reviews" => Ok(Dataset::Reviews),
                        other => Err(format!("unknown dataset '{}'", other)),
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            };
            Ok(FirstPool {
                destination,
                datasets,
            })
        })
        .collect()
}
