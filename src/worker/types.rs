use crate::protocol::{Field, Message, SenderId};
use crate::router::Destination;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Condition a `Filter` worker keeps messages by.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// List field holds this element (case-insensitive).
    Contains(String),
    /// Text field contains this substring (case-insensitive).
    Substring(String),
    /// Inclusive year range.
    YearRange(u16, u16),
    /// Numeric field is at least this value.
    AtLeast(f64),
}

impl Predicate {
    /// Parses `value` according to what makes sense for `field`.
    pub fn parse(field: Field, value: &str) -> Result<Self, String> {
        let value = value.trim();
        match field {
            Field::Authors | Field::Categories => Ok(Predicate::Contains(value.to_lowercase())),
            Field::Title | Field::Publisher | Field::ReviewText => {
                Ok(Predicate::Substring(value.to_lowercase()))
            }
            Field::Year => {
                let (from, to) = value.split_once('-').unwrap_or((value, value));
                let parse = |s: &str| {
                    s.trim()
                        .parse::<u16>()
                        .map_err(|e| format!("invalid year '{}': {}", s, e))
                };
                Ok(Predicate::YearRange(parse(from)?, parse(to)?))
            }
            Field::Rating | Field::Polarity => value
                .parse::<f64>()
                .map(Predicate::AtLeast)
                .map_err(|e| format!("invalid threshold '{}': {}", value, e)),
        }
    }

    pub fn matches(&self, field: Field, msg: &Message) -> bool {
        match self {
            Predicate::Contains(wanted) => {
                let list = match field {
                    Field::Authors => msg.authors.as_ref(),
                    Field::Categories => msg.categories.as_ref(),
                    _ => None,
                };
                list.is_some_and(|items| items.iter().any(|i| i.to_lowercase() == *wanted))
            }
            Predicate::Substring(wanted) => msg
                .text_of(field)
                .is_some_and(|text| text.to_lowercase().contains(wanted.as_str())),
            Predicate::YearRange(from, to) => msg.year.is_some_and(|y| (*from..=*to).contains(&y)),
            Predicate::AtLeast(min) => msg.number_of(field).is_some_and(|v| v >= *min),
        }
    }
}

/// The closed set of worker behaviours.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerKind {
    Filter { field: Field, predicate: Predicate },
    /// Keeps the `k` messages with the highest `by`.
    TopK { k: usize, by: Field },
    /// Forwards the first message seen per value of `by`.
    Distinct { by: Field },
    /// Joins books with the reviews sharing `key` and emits books with at
    /// least `min_count` reviews, carrying the mean `metric` as the rating.
    RunningMean {
        key: Field,
        metric: Field,
        min_count: u64,
    },
    /// Like `RunningMean`, but emits the books whose mean `metric` is at or
    /// above the `percentile`-th percentile of all means.
    Percentile {
        key: Field,
        metric: Field,
        percentile: f64,
    },
    /// Emits authors whose books span at least `min_decades` decades.
    DecadeSet { min_decades: usize },
}

impl WorkerKind {
    /// Builds a kind from `WORKER_KIND`, `WORKER_FIELD`, `WORKER_VALUE` and
    /// `ACCUMULATE_BY`.
    pub fn from_parts(
        kind: &str,
        field: Option<&str>,
        value: Option<&str>,
        accumulate_by: Option<&str>,
    ) -> Result<Self, String> {
        let field = |default: Option<Field>| -> Result<Field, String> {
            match field.filter(|f| !f.trim().is_empty()) {
                Some(f) => f.parse(),
                None => default.ok_or_else(|| format!("worker kind '{}' needs a field", kind)),
            }
        };
        let value = || {
            value
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| format!("worker kind '{}' needs a value", kind))
        };
        let key = match accumulate_by.filter(|k| !k.trim().is_empty()) {
            Some(k) => k.parse()?,
            None => Field::Title,
        };

        match kind.trim().to_ascii_lowercase().as_str() {
            "filter" => {
                let field = field(None)?;
                Ok(WorkerKind::Filter {
                    field,
                    predicate: Predicate::parse(field, value()?)?,
                })
            }
            "topk" | "top_k" => Ok(WorkerKind::TopK {
                k: value()?.parse().map_err(|e| format!("invalid k: {}", e))?,
                by: field(Some(Field::Rating))?,
            }),
            "distinct" | "grouped_set" => Ok(WorkerKind::Distinct { by: key }),
            "running_mean" => Ok(WorkerKind::RunningMean {
                key,
                metric: field(Some(Field::Rating))?,
                min_count: value()?
                    .parse()
                    .map_err(|e| format!("invalid minimum count: {}", e))?,
            }),
            "percentile" => {
                let percentile: f64 = value()?
                    .parse()
                    .map_err(|e| format!("invalid percentile: {}", e))?;
                if !(0.0..=100.0).contains(&percentile) {
                    return Err(format!("percentile {} outside 0..=100", percentile));
                }
                Ok(WorkerKind::Percentile {
                    key,
                    metric: field(Some(Field::Polarity))?,
                    percentile,
                })
            }
            "decade_set" | "decades" => Ok(WorkerKind::DecadeSet {
                min_decades: value()?
                    .parse()
                    .map_err(|e| format!("invalid decade count: {}", e))?,
            }),
            other => Err(format!("unknown worker kind '{}'", other)),
        }
    }

    pub fn is_stateful(&self) -> bool {
        !matches!(self, WorkerKind::Filter { .. })
    }

    pub fn initial_context(&self) -> WorkerContext {
        match self {
            WorkerKind::Filter { .. } => WorkerContext::Stateless,
            WorkerKind::TopK { .. } => WorkerContext::TopK(Vec::new()),
            WorkerKind::Distinct { .. } => WorkerContext::Seen(BTreeSet::new()),
            WorkerKind::RunningMean { .. } | WorkerKind::Percentile { .. } => {
                WorkerContext::Means(BTreeMap::new())
            }
            WorkerKind::DecadeSet { .. } => WorkerContext::Decades(BTreeMap::new()),
        }
    }
}

/// Review aggregate for one key, joined with its book once seen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeanEntry {
    pub book: Option<Message>,
    pub count: u64,
    pub sum: f64,
}

impl MeanEntry {
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Per-client accumulator state. Collections are ordered so that finalize
/// output is the same on every replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerContext {
    Stateless,
    /// Best messages so far, sorted best first.
    TopK(Vec<Message>),
    Seen(BTreeSet<String>),
    Means(BTreeMap<String, MeanEntry>),
    /// Author -> decades (year / 10) of their books.
    Decades(BTreeMap<String, BTreeSet<u16>>),
}

/// Everything a worker process needs to know about its place in the pipeline.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub id: SenderId,
    pub kind: WorkerKind,
    /// Upstream EOFs expected per client before the client is finished here.
    pub eof_to_receive: i64,
    pub destinations: Vec<Destination>,
    pub data_dir: PathBuf,
}

impl WorkerConfig {
    pub fn queue_name(&self) -> String {
        crate::router::topology::worker_queue(self.id.query, self.id.pool, self.id.index)
    }

    pub fn exchange(&self) -> String {
        crate::router::topology::pool_exchange(self.id.query, self.id.pool)
    }
}

/// What one consumed delivery amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    /// New batch handled; `forwarded` batches went downstream.
    Processed { forwarded: usize },
    /// Already seen `(sender, sequence_number)`; acked and skipped.
    Duplicate,
    /// Body did not decode; acked and dropped.
    Malformed,
    /// Kept unacked until its client's result stream attaches.
    Held,
    /// Nothing arrived before the timeout.
    Idle,
}
