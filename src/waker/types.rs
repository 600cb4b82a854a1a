use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// The datagram protocol shared by wakers and health responders.
///
/// - `Election/Ack/Coordinator`: bully election among wakers.
/// - `Healthcheck/Alive`: the leader's liveness probe and its reply. `target`
///   names who the probe is meant for; responders echo it back as `from`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WakerMessage {
    Election { from: String },
    Ack { from: String },
    Coordinator { from: String },
    Healthcheck { from: String, target: String },
    Alive { from: String },
}

impl WakerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Something a waker watches: its name (also the container to restart) and
/// the `host:port` it answers healthchecks on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Monitored {
    pub name: String,
    pub addr: String,
}

impl Monitored {
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
        }
    }

    /// `names` is comma separated; every entry listens on `port`.
    pub fn from_names(names: &str, port: u16) -> Vec<Self> {
        names
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| Self::new(name, format!("{}:{}", name, port)))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct Timing {
    /// How long an election waits for an `Ack`, then for a `Coordinator`.
    pub election_timeout: Duration,
    pub healthcheck_interval: Duration,
    /// Deadline for the `Alive` reply to one healthcheck.
    pub alive_timeout: Duration,
    /// Missed replies tolerated before a restart.
    pub retries: u32,
    /// Silence from the leader after which followers re-elect.
    pub leader_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_secs(2),
            healthcheck_interval: Duration::from_secs(1),
            alive_timeout: Duration::from_secs(1),
            retries: 3,
            leader_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WakerConfig {
    pub id: String,
    /// Every other waker, addressed at its election port.
    pub peers: Vec<Monitored>,
    /// Workers and gateways, addressed at their health port.
    pub workers: Vec<Monitored>,
    pub timing: Timing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionState {
    /// `acked` once a higher waker answered; the election then waits for its
    /// `Coordinator` instead of claiming leadership.
    Electing { acked: bool },
    Follower { leader: String },
    Leader,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// `term` counts this waker's leaderships; rounds of an earlier one are
    /// dropped.
    HealthcheckRound { term: u64 },
    /// Fires `alive_timeout` after a probe; `sent_at` is compared with the
    /// target's last `Alive`.
    AliveCheck {
        target: String,
        sent_at: Instant,
        term: u64,
    },
    ElectionTimeout { round: u64 },
    LeaderCheck,
}

/// Scheduled work for the waker's min-heap, ordered by deadline and then by
/// insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub deadline: Instant,
    pub order: u64,
    pub kind: EventKind,
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.order).cmp(&(other.deadline, other.order))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
