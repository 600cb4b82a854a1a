//! Receive, process and forward loop of one pool member.
//!
//! Every consumed batch goes through the same cycle:
//!
//! 1. drop it if `(sender, sequence_number)` was already handled,
//! 2. apply it to the client's context and collect the outgoing batches,
//! 3. write the next context generation to its own snapshot file,
//! 4. publish downstream,
//! 5. commit the metadata (`last received`, sequence counter, EOF countdown,
//!    live generation) under the log protocol,
//! 6. ack upstream.
//!
//! A crash anywhere before 5 completes rolls the metadata back and the batch is
//! redelivered, producing byte-identical outgoing batches that downstream
//! drops as duplicates.

use super::types::*;
use crate::fault::{Checkpoint, FailureInjector};
use crate::protocol::batch::MAX_RECORDS;
use crate::protocol::{Batch, Message, Record, SenderId};
use crate::router::{MessageRouter, QueueHandle, RouterError};
use crate::storage::metadata::*;
use crate::storage::snapshot::SnapshotStore;

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const CONNECT_ATTEMPTS: usize = 8;
const POLL_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Connecting,
    Running,
    Draining,
    Terminated,
}

struct Outgoing {
    exchange: String,
    routing_key: String,
    batch: Batch,
}

pub struct Worker {
    config: WorkerConfig,
    router: Arc<dyn MessageRouter>,
    queue: QueueHandle,
    metadata: MetadataHandler,
    snapshots: SnapshotStore,
    contexts: HashMap<u32, WorkerContext>,
    failures: FailureInjector,
    state: EngineState,
}

impl Worker {
    /// Recovers persisted state, then attaches to the router and requeues
    /// whatever a previous incarnation left unacked.
    pub async fn start(
        config: WorkerConfig,
        router: Arc<dyn MessageRouter>,
        failures: FailureInjector,
    ) -> Result<Self> {
        let (metadata, recovery) = MetadataHandler::open(&config.data_dir, failures.clone())?;
        let snapshots = SnapshotStore::open(&config.data_dir)?;
        let contexts = load_contexts(&metadata, &snapshots)?;

        tracing::info!(
            "Worker {} ({:?}) connecting, recovery {:?}, {} live context(s)",
            config.id,
            config.kind,
            recovery,
            contexts.len()
        );

        let queue = connect(router.as_ref(), &config).await?;
        let requeued = router.recover(&queue).await?;
        if requeued > 0 {
            tracing::info!("Requeued {} unacked deliveries on {}", requeued, queue.name());
        }

        Ok(Self {
            config,
            router,
            queue,
            metadata,
            snapshots,
            contexts,
            failures,
            state: EngineState::Running,
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn id(&self) -> SenderId {
        self.config.id
    }

    pub fn context(&self, client_id: u32) -> Option<&WorkerContext> {
        self.contexts.get(&client_id)
    }

    pub fn metadata(&self) -> &MetadataHandler {
        &self.metadata
    }

    /// Consumes and fully handles at most one delivery.
    pub async fn step(&mut self, timeout: Duration) -> Result<BatchOutcome> {
        let Some(delivery) = self.router.consume(&self.queue, timeout).await? else {
            return Ok(BatchOutcome::Idle);
        };

        let batch = match Batch::decode(&delivery.body) {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!("Dropping undecodable batch on {}: {}", self.queue.name(), e);
                self.router.ack(&self.queue, delivery.tag).await?;
                return Ok(BatchOutcome::Malformed);
            }
        };
        let Some(sender) = batch.sender_id else {
            tracing::warn!("Dropping batch without sender for client {}", batch.client_id);
            self.router.ack(&self.queue, delivery.tag).await?;
            return Ok(BatchOutcome::Malformed);
        };

        if self
            .metadata
            .last_received(sender)
            .is_some_and(|last| batch.sequence_number <= last)
        {
            tracing::debug!(
                "Duplicate batch {} from {} (redelivered: {})",
                batch.sequence_number,
                sender,
                delivery.redelivered
            );
            self.router.ack(&self.queue, delivery.tag).await?;
            return Ok(BatchOutcome::Duplicate);
        }

        let client_id = batch.client_id;
        let mut ctx = self
            .contexts
            .remove(&client_id)
            .unwrap_or_else(|| self.config.kind.initial_context());
        let mut next_seq = self.metadata.last_sent_seq();
        let mut outgoing = Vec::new();
        let mut changes: Vec<(String, Option<i64>)> = Vec::new();
        let mut finished = false;

        if batch.is_eof() {
            let pending = self
                .metadata
                .pending_eof(client_id)
                .unwrap_or(self.config.eof_to_receive)
                - 1;
            tracing::debug!(
                "EOF from {} for client {}, {} still pending",
                sender,
                client_id,
                pending.max(0)
            );
            if pending > 0 {
                changes.push((pending_eof_key(client_id), Some(pending)));
            } else {
                let results = self.config.kind.finalize(std::mem::replace(
                    &mut ctx,
                    WorkerContext::Stateless,
                ));
                self.route(results, client_id, &mut next_seq, &mut outgoing);
                next_seq += 1;
                for dest in &self.config.destinations {
                    for routing_key in dest.routing_keys() {
                        outgoing.push(Outgoing {
                            exchange: dest.exchange(),
                            routing_key,
                            batch: Batch::eof(client_id, Some(self.config.id), next_seq),
                        });
                    }
                }
                changes.push((pending_eof_key(client_id), None));
                if self.metadata.context_generation(client_id).is_some() {
                    changes.push((context_generation_key(client_id), None));
                }
                finished = true;
            }
        } else {
            let mut results = Vec::new();
            for record in batch.records {
                match record {
                    Record::Message(msg) => results.extend(self.config.kind.process(&mut ctx, msg)),
                    Record::Line { dataset, .. } => {
                        tracing::warn!("Skipping unparsed {:?} line from {}", dataset, sender)
                    }
                }
            }
            self.route(results, client_id, &mut next_seq, &mut outgoing);
        }

        let mut generation = None;
        if !finished && self.config.kind.is_stateful() {
            let next = self.metadata.context_generation(client_id).map_or(1, |g| g + 1);
            self.snapshots.write(client_id, next, &ctx)?;
            changes.push((context_generation_key(client_id), Some(next as i64)));
            generation = Some(next);
        }
        changes.push((last_received_key(sender), Some(batch.sequence_number as i64)));
        if next_seq != self.metadata.last_sent_seq() {
            changes.push((LAST_SENT_SEQ.to_string(), Some(next_seq as i64)));
        }

        self.failures.check(Checkpoint::BeforeForward)?;
        for out in &outgoing {
            self.router
                .publish(&out.exchange, &out.routing_key, out.batch.encode()?)
                .await?;
        }

        self.metadata.commit(&changes)?;
        self.router.ack(&self.queue, delivery.tag).await?;
        self.failures.check(Checkpoint::AfterAck)?;
        self.metadata.mark_acked()?;

        if finished {
            self.snapshots.retain_only(client_id, None)?;
            tracing::info!("Client {} finished on worker {}", client_id, self.config.id);
        } else if self.config.kind.is_stateful() {
            self.snapshots.retain_only(client_id, generation)?;
            self.contexts.insert(client_id, ctx);
        }

        Ok(BatchOutcome::Processed {
            forwarded: outgoing.len(),
        })
    }

    /// Splits results into batches, one sequence number each, and routes
    /// them to every destination.
    fn route(
        &self,
        results: Vec<Message>,
        client_id: u32,
        next_seq: &mut u32,
        outgoing: &mut Vec<Outgoing>,
    ) {
        let records: Vec<Record> = results.into_iter().map(Record::Message).collect();
        for chunk in records.chunks(MAX_RECORDS) {
            *next_seq += 1;
            for dest in &self.config.destinations {
                for (routing_key, records) in dest.route(chunk.to_vec(), *next_seq) {
                    outgoing.push(Outgoing {
                        exchange: dest.exchange(),
                        routing_key,
                        batch: Batch::new(client_id, Some(self.config.id), *next_seq, records),
                    });
                }
            }
        }
    }

    /// Steps until `shutdown` flips to true or a step fails. The batch in
    /// progress when shutdown is requested is finished first.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!("Worker {} running on {}", self.config.id, self.queue.name());
        loop {
            if *shutdown.borrow_and_update() {
                self.state = EngineState::Draining;
                break;
            }
            if let Err(e) = self.step(POLL_TIMEOUT).await {
                self.state = EngineState::Terminated;
                match e.downcast_ref::<RouterError>() {
                    Some(RouterError::TransportDisconnected(_)) => {
                        tracing::error!("Worker {} lost the router: {}", self.config.id, e)
                    }
                    _ => tracing::error!("Worker {} failed: {}", self.config.id, e),
                }
                return Err(e);
            }
        }
        self.state = EngineState::Terminated;
        tracing::info!("Worker {} stopped", self.config.id);
        Ok(())
    }
}

/// Declares the worker's own binding and every destination, retrying with
/// backoff while the router comes up.
async fn connect(
    router: &dyn MessageRouter,
    config: &WorkerConfig,
) -> Result<QueueHandle, RouterError> {
    let mut delay_ms = 200u64;
    let mut attempt = 1;
    loop {
        match declare_topology(router, config).await {
            Ok(queue) => return Ok(queue),
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                tracing::warn!("Router not ready (attempt {}): {}", attempt, e);
                let jitter = rand::random::<u64>() % 100;
                tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                delay_ms = (delay_ms * 2).min(3000);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn declare_topology(
    router: &dyn MessageRouter,
    config: &WorkerConfig,
) -> Result<QueueHandle, RouterError> {
    let exchange = config.exchange();
    router.declare_exchange(&exchange).await?;
    let queue = router
        .bind_queue(&exchange, &config.id.index.to_string(), &config.queue_name())
        .await?;
    for dest in &config.destinations {
        dest.declare(router).await?;
    }
    Ok(queue)
}

/// Loads the live generation of every client's context and deletes the rest.
fn load_contexts(
    metadata: &MetadataHandler,
    snapshots: &SnapshotStore,
) -> Result<HashMap<u32, WorkerContext>> {
    let mut contexts = HashMap::new();
    for client_id in snapshots.clients()? {
        let live = metadata.context_generation(client_id);
        snapshots.retain_only(client_id, live)?;
        if let Some(generation) = live {
            let ctx: WorkerContext = snapshots.read(client_id, generation)?;
            contexts.insert(client_id, ctx);
        }
    }
    Ok(contexts)
}
