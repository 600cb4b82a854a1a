//! In-memory broker.
//!
//! Exchanges map routing keys to bound queues; queues hold ready messages and
//! the deliveries handed out but not yet acked. A delivery unacked past the
//! lease is assumed lost with its consumer and requeued by `reap_expired`.

use super::RouterError;
use super::types::*;

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

#[derive(Default)]
struct QueueState {
    ready: VecDeque<(Vec<u8>, bool)>,
    unacked: BTreeMap<u64, (Vec<u8>, Instant)>,
}

#[derive(Default)]
struct Queue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Queue {
    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Default)]
struct Exchange {
    /// Routing key -> bound queue names.
    bindings: BTreeMap<String, Vec<String>>,
    next_key: usize,
}

pub struct Broker {
    exchanges: DashMap<String, Exchange>,
    queues: DashMap<String, Arc<Queue>>,
    next_tag: AtomicU64,
    published: AtomicUsize,
    lease: Duration,
}

impl Broker {
    pub fn new() -> Arc<Self> {
        Self::with_lease(DEFAULT_LEASE)
    }

    pub fn with_lease(lease: Duration) -> Arc<Self> {
        Arc::new(Self {
            exchanges: DashMap::new(),
            queues: DashMap::new(),
            next_tag: AtomicU64::new(1),
            published: AtomicUsize::new(0),
            lease,
        })
    }

    fn queue(&self, name: &str) -> Result<Arc<Queue>, RouterError> {
        self.queues
            .get(name)
            .map(|q| q.value().clone())
            .ok_or_else(|| RouterError::UnknownQueue(name.to_string()))
    }

    fn enqueue(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> Result<(), RouterError> {
        let targets = {
            let ex = self
                .exchanges
                .get(exchange)
                .ok_or_else(|| RouterError::UnknownExchange(exchange.to_string()))?;
            ex.bindings.get(routing_key).cloned().unwrap_or_default()
        };

        if targets.is_empty() {
            tracing::warn!(
                "Dropping message on {}/{}: no queue bound",
                exchange,
                routing_key
            );
            return Ok(());
        }

        for name in targets {
            let queue = self.queue(&name)?;
            queue.lock().ready.push_back((body.clone(), false));
            queue.notify.notify_one();
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn published_count(&self) -> usize {
        self.published.load(Ordering::Relaxed)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.iter().map(|q| q.key().clone()).collect();
        names.sort();
        names
    }

    /// Requeues deliveries held past the lease. Returns how many moved.
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let mut requeued = 0;
        for entry in self.queues.iter() {
            let queue = entry.value();
            let mut state = queue.lock();
            let expired: Vec<u64> = state
                .unacked
                .iter()
                .filter(|(_, (_, since))| now.duration_since(*since) > self.lease)
                .map(|(tag, _)| *tag)
                .collect();
            let mut moved = 0;
            for tag in expired.into_iter().rev() {
                if let Some((body, _)) = state.unacked.remove(&tag) {
                    state.ready.push_front((body, true));
                    moved += 1;
                }
            }
            if moved > 0 {
                queue.notify.notify_one();
            }
            requeued += moved;
        }
        if requeued > 0 {
            tracing::warn!("Requeued {} deliveries with expired leases", requeued);
        }
        requeued
    }

    /// Runs `reap_expired` forever at a fraction of the lease.
    pub async fn reaper_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.lease / 4);
        loop {
            interval.tick().await;
            self.reap_expired();
        }
    }

    fn try_take(&self, queue: &Queue) -> Option<Delivery> {
        let mut state = queue.lock();
        let (body, redelivered) = state.ready.pop_front()?;
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        state.unacked.insert(tag, (body.clone(), Instant::now()));
        Some(Delivery {
            tag,
            body,
            redelivered,
        })
    }
}

#[async_trait]
impl MessageRouter for Broker {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), RouterError> {
        self.exchanges.entry(exchange.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(
        &self,
        exchange: &str,
        routing_key: &str,
        queue: &str,
    ) -> Result<QueueHandle, RouterError> {
        self.queues.entry(queue.to_string()).or_default();
        let mut ex = self.exchanges.entry(exchange.to_string()).or_default();
        let bound = ex.bindings.entry(routing_key.to_string()).or_default();
        if !bound.iter().any(|q| q == queue) {
            tracing::debug!("Bound {} to {}/{}", queue, exchange, routing_key);
            bound.push(queue.to_string());
        }
        Ok(QueueHandle(queue.to_string()))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
    ) -> Result<(), RouterError> {
        self.enqueue(exchange, routing_key, body)
    }

    async fn publish_next_routing_key(
        &self,
        exchange: &str,
        body: Vec<u8>,
    ) -> Result<String, RouterError> {
        let key = {
            let mut ex = self
                .exchanges
                .get_mut(exchange)
                .ok_or_else(|| RouterError::UnknownExchange(exchange.to_string()))?;
            if ex.bindings.is_empty() {
                return Err(RouterError::UnknownExchange(exchange.to_string()));
            }
            let idx = ex.next_key % ex.bindings.len();
            ex.next_key = ex.next_key.wrapping_add(1);
            ex.bindings.keys().nth(idx).cloned().unwrap_or_default()
        };
        self.enqueue(exchange, &key, body)?;
        Ok(key)
    }

    async fn consume(
        &self,
        queue: &QueueHandle,
        timeout: Duration,
    ) -> Result<Option<Delivery>, RouterError> {
        let q = self.queue(queue.name())?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = q.notify.notified();
            if let Some(delivery) = self.try_take(&q) {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.try_take(&q));
            }
        }
    }

    async fn ack(&self, queue: &QueueHandle, tag: u64) -> Result<(), RouterError> {
        let q = self.queue(queue.name())?;
        let removed = q.lock().unacked.remove(&tag);
        removed
            .map(|_| ())
            .ok_or(RouterError::UnknownDelivery(tag))
    }

    async fn nack(&self, queue: &QueueHandle, tag: u64) -> Result<(), RouterError> {
        let q = self.queue(queue.name())?;
        {
            let mut state = q.lock();
            let (body, _) = state
                .unacked
                .remove(&tag)
                .ok_or(RouterError::UnknownDelivery(tag))?;
            state.ready.push_front((body, true));
        }
        q.notify.notify_one();
        Ok(())
    }

    async fn recover(&self, queue: &QueueHandle) -> Result<usize, RouterError> {
        let q = self.queue(queue.name())?;
        let count = {
            let mut state = q.lock();
            let unacked = std::mem::take(&mut state.unacked);
            let count = unacked.len();
            for (_, (body, _)) in unacked.into_iter().rev() {
                state.ready.push_front((body, true));
            }
            count
        };
        if count > 0 {
            q.notify.notify_one();
        }
        Ok(count)
    }

    async fn pending_count(&self, queue: &QueueHandle) -> Result<usize, RouterError> {
        let q = self.queue(queue.name())?;
        let state = q.lock();
        Ok(state.ready.len() + state.unacked.len())
    }
}

/// Snapshot of queue depths, for the stats reporter.
pub fn queue_depths(broker: &Broker) -> HashMap<String, (usize, usize)> {
    broker
        .queues
        .iter()
        .map(|entry| {
            let state = entry.value().lock();
            (entry.key().clone(), (state.ready.len(), state.unacked.len()))
        })
        .collect()
}
