use anyhow::{Result, bail};
use async_trait::async_trait;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::watch;

use super::election::{Elector, Step};
use super::types::{ElectionState, Event, EventKind, Monitored, WakerConfig, WakerMessage};

const MAX_DATAGRAM: usize = 2048;
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// The external action that brings a dead process back.
#[async_trait]
pub trait Restarter: Send + Sync {
    async fn restart(&self, name: &str) -> Result<()>;
}

/// Restarts containers with `docker start`.
pub struct DockerRestarter;

#[async_trait]
impl Restarter for DockerRestarter {
    async fn restart(&self, name: &str) -> Result<()> {
        let status = tokio::process::Command::new("docker")
            .args(["start", name])
            .status()
            .await?;
        if !status.success() {
            bail!("docker start {} exited with {}", name, status);
        }
        Ok(())
    }
}

/// One monitor process: an elector wired to a UDP socket, plus the leader's
/// healthcheck schedule.
pub struct Waker {
    config: WakerConfig,
    elector: Elector,
    socket: Arc<UdpSocket>,
    restarter: Arc<dyn Restarter>,
    events: BinaryHeap<Reverse<Event>>,
    next_order: u64,
    last_alive: HashMap<String, Instant>,
    retries_left: HashMap<String, u32>,
    leader_seen: Instant,
    leader_term: u64,
    status: watch::Sender<ElectionState>,
}

impl Waker {
    pub fn new(config: WakerConfig, socket: UdpSocket, restarter: Arc<dyn Restarter>) -> Self {
        let peer_ids = config.peers.iter().map(|p| p.name.clone()).collect();
        let elector = Elector::new(config.id.clone(), peer_ids);
        let (status, _) = watch::channel(elector.state().clone());
        Self {
            config,
            elector,
            socket: Arc::new(socket),
            restarter,
            events: BinaryHeap::new(),
            next_order: 0,
            last_alive: HashMap::new(),
            retries_left: HashMap::new(),
            leader_seen: Instant::now(),
            leader_term: 0,
            status,
        }
    }

    /// Follows the election state, mostly for tests and logs.
    pub fn status(&self) -> watch::Receiver<ElectionState> {
        self.status.subscribe()
    }

    fn schedule(&mut self, after: Duration, kind: EventKind) {
        self.next_order += 1;
        self.events.push(Reverse(Event {
            deadline: Instant::now() + after,
            order: self.next_order,
            kind,
        }));
    }

    /// Everyone the leader probes: the other wakers and every worker.
    fn monitored(&self) -> impl Iterator<Item = &Monitored> {
        self.config.peers.iter().chain(self.config.workers.iter())
    }

    fn peer_addr(&self, name: &str) -> Option<&str> {
        self.config
            .peers
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.addr.as_str())
    }

    async fn send(&self, addr: &str, msg: &WakerMessage) {
        match msg.encode() {
            Ok(bytes) => {
                if let Err(e) = self.socket.send_to(&bytes, addr).await {
                    tracing::debug!("Unreachable peer {}: {}", addr, e);
                }
            }
            Err(e) => tracing::error!("Failed to serialize {:?}: {}", msg, e),
        }
    }

    /// Sends the step's datagrams and reacts to a change of role.
    async fn apply(&mut self, step: Step) {
        let was_leader = *self.status.borrow() == ElectionState::Leader;

        for (peer, msg) in &step.outgoing {
            match self.peer_addr(peer) {
                Some(addr) => self.send(addr, msg).await,
                None => tracing::warn!("No address for peer {}", peer),
            }
        }
        if let Some(round) = step.arm_timer {
            let timeout = self.config.timing.election_timeout;
            self.schedule(timeout, EventKind::ElectionTimeout { round });
        }

        let state = self.elector.state().clone();
        if state == ElectionState::Leader && !was_leader {
            let names: Vec<String> = self.monitored().map(|m| m.name.clone()).collect();
            for name in names {
                self.retries_left.insert(name, self.config.timing.retries);
            }
            self.leader_term += 1;
            let term = self.leader_term;
            self.schedule(Duration::ZERO, EventKind::HealthcheckRound { term });
        }
        if matches!(state, ElectionState::Follower { .. }) {
            self.leader_seen = Instant::now();
        }
        self.status.send_replace(state);
    }

    async fn handle_datagram(&mut self, msg: WakerMessage, src: std::net::SocketAddr) {
        match msg {
            WakerMessage::Healthcheck { from, .. } => {
                if self.elector.leader() == Some(from.as_str()) {
                    self.leader_seen = Instant::now();
                }
                let reply = WakerMessage::Alive {
                    from: self.config.id.clone(),
                };
                self.send(&src.to_string(), &reply).await;
            }
            WakerMessage::Alive { from } => {
                self.last_alive.insert(from, Instant::now());
            }
            election => {
                if let WakerMessage::Coordinator { from } = &election
                    && self.elector.leader() == Some(from.as_str())
                {
                    self.leader_seen = Instant::now();
                }
                let step = self.elector.on_message(&election);
                self.apply(step).await;
            }
        }
    }

    async fn fire(&mut self, kind: EventKind) {
        match kind {
            EventKind::ElectionTimeout { round } => {
                let step = self.elector.on_election_timeout(round);
                self.apply(step).await;
            }
            EventKind::LeaderCheck => {
                let timeout = self.config.timing.leader_timeout;
                if matches!(self.elector.state(), ElectionState::Follower { .. })
                    && self.leader_seen.elapsed() > timeout
                {
                    let step = self.elector.on_leader_lost();
                    self.apply(step).await;
                }
                self.schedule(timeout / 2, EventKind::LeaderCheck);
            }
            EventKind::HealthcheckRound { term } => {
                if !self.elector.is_leader() || term != self.leader_term {
                    return;
                }
                let targets: Vec<Monitored> = self.monitored().cloned().collect();
                let sent_at = Instant::now();
                for target in targets {
                    let probe = WakerMessage::Healthcheck {
                        from: self.config.id.clone(),
                        target: target.name.clone(),
                    };
                    self.send(&target.addr, &probe).await;
                    let alive_timeout = self.config.timing.alive_timeout;
                    self.schedule(
                        alive_timeout,
                        EventKind::AliveCheck {
                            target: target.name,
                            sent_at,
                            term,
                        },
                    );
                }
                let interval = self.config.timing.healthcheck_interval;
                self.schedule(interval, EventKind::HealthcheckRound { term });
            }
            EventKind::AliveCheck {
                target,
                sent_at,
                term,
            } => {
                if !self.elector.is_leader() || term != self.leader_term {
                    return;
                }
                self.check_alive(target, sent_at).await;
            }
        }
    }

    async fn check_alive(&mut self, target: String, sent_at: Instant) {
        let full = self.config.timing.retries;
        if self.last_alive.get(&target).is_some_and(|t| *t >= sent_at) {
            self.retries_left.insert(target, full);
            return;
        }

        let left = self.retries_left.entry(target.clone()).or_insert(full);
        *left = left.saturating_sub(1);
        if *left > 0 {
            tracing::debug!("{} missed a healthcheck, {} retries left", target, left);
            return;
        }

        *left = full;
        tracing::warn!("{} is not answering, restarting it", target);
        if let Err(e) = self.restarter.restart(&target).await {
            tracing::error!("Failed to restart {}: {}", target, e);
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!(
            "Waker {} up, {} peer(s), {} worker(s)",
            self.config.id,
            self.config.peers.len(),
            self.config.workers.len()
        );
        let step = self.elector.start_election();
        self.apply(step).await;
        let leader_timeout = self.config.timing.leader_timeout;
        self.schedule(leader_timeout / 2, EventKind::LeaderCheck);

        let socket = self.socket.clone();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let deadline = self
                .events
                .peek()
                .map(|Reverse(e)| e.deadline)
                .unwrap_or_else(|| Instant::now() + IDLE_WAIT);

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, src)) => match WakerMessage::decode(&buf[..len]) {
                        Ok(msg) => self.handle_datagram(msg, src).await,
                        Err(e) => tracing::warn!("Failed to deserialize datagram from {}: {}", src, e),
                    },
                    Err(e) => {
                        tracing::error!("Failed to receive UDP packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = tokio::time::sleep_until(deadline.into()) => {
                    while let Some(Reverse(event)) = self.events.peek() {
                        if event.deadline > Instant::now() {
                            break;
                        }
                        if let Some(Reverse(event)) = self.events.pop() {
                            self.fire(event.kind).await;
                        }
                    }
                }
            }
        }
        tracing::info!("Waker {} stopped", self.config.id);
        Ok(())
    }
}
