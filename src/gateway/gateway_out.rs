//! Result egress: the single consumer of the `results` queue.
//!
//! Result batches are shaped per query and written to the owning client's
//! socket. A client's stream ends once `eof_to_receive` upstream EOFs have
//! arrived for it; the terminal EOF is bracketed in the log by
//! `SentFinalResult` and `FinishedSendingResults`, so a restart resumes or
//! completes it.
//!
//! Batches for a client without a result stream are held in memory, still
//! unacked, and flushed in order once its socket attaches. Other clients keep
//! receiving meanwhile. Receipts are tracked per sender and client since held
//! batches complete out of order across clients.

use crate::fault::FailureInjector;
use crate::protocol::{Batch, MessageKind, Record, SenderId, query_result_fields};
use crate::router::topology::RESULTS_QUEUE;
use crate::router::{Destination, MessageRouter, QueueHandle, RouterError};
use crate::storage::metadata::*;
use crate::worker::BatchOutcome;

use anyhow::Result;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

const POLL_TIMEOUT: Duration = Duration::from_millis(200);

/// A result-stream socket announced by the acceptor.
pub type Registration = (u32, TcpStream);

/// A consumed, already shaped result batch that still owes its ack.
struct Held {
    tag: u64,
    sender: SenderId,
    batch: Batch,
}

pub struct GatewayOut {
    router: Arc<dyn MessageRouter>,
    queue: QueueHandle,
    metadata: MetadataHandler,
    eof_to_receive: i64,
    clients: HashMap<u32, TcpStream>,
    registrations: mpsc::Receiver<Registration>,
    /// Batches of clients without a result stream, in arrival order.
    held: HashMap<u32, VecDeque<Held>>,
    /// Countdown reached zero but the terminal EOF is not delivered yet.
    awaiting_final: BTreeSet<u32>,
}

impl GatewayOut {
    pub async fn start(
        router: Arc<dyn MessageRouter>,
        data_dir: &std::path::Path,
        eof_to_receive: i64,
        registrations: mpsc::Receiver<Registration>,
        failures: FailureInjector,
    ) -> Result<Self> {
        let (mut metadata, recovery) = MetadataHandler::open(data_dir, failures)?;

        if let Recovery::ClientFinished { client_id } = recovery
            && metadata.pending_eof(client_id).is_some()
        {
            tracing::info!("Completing purge of finished client {}", client_id);
            metadata.commit(&[(pending_eof_key(client_id), None)])?;
        }
        let awaiting_final: BTreeSet<u32> = metadata.drained_clients().into_iter().collect();
        if !awaiting_final.is_empty() {
            tracing::info!("Clients awaiting their final EOF: {:?}", awaiting_final);
        }

        Destination::Results.declare(router.as_ref()).await?;
        let queue = QueueHandle(RESULTS_QUEUE.to_string());
        let requeued = router.recover(&queue).await?;
        if requeued > 0 {
            tracing::info!("Requeued {} unacked result batches", requeued);
        }

        Ok(Self {
            router,
            queue,
            metadata,
            eof_to_receive,
            clients: HashMap::new(),
            registrations,
            held: HashMap::new(),
            awaiting_final,
        })
    }

    pub fn metadata(&self) -> &MetadataHandler {
        &self.metadata
    }

    pub fn is_registered(&self, client_id: u32) -> bool {
        self.clients.contains_key(&client_id)
    }

    pub fn held_count(&self, client_id: u32) -> usize {
        self.held.get(&client_id).map_or(0, VecDeque::len)
    }

    /// Merges sockets announced since the last call and flushes what was
    /// held for them.
    async fn accept_registrations(&mut self) -> Result<()> {
        while let Ok((client_id, stream)) = self.registrations.try_recv() {
            tracing::info!("Result stream of client {} attached", client_id);
            self.clients.insert(client_id, stream);
            self.flush_held(client_id).await?;
            if self.awaiting_final.contains(&client_id) {
                self.finish_client(client_id).await?;
            }
        }
        Ok(())
    }

    async fn flush_held(&mut self, client_id: u32) -> Result<()> {
        while self.clients.contains_key(&client_id) {
            let Some(item) = self.held.get_mut(&client_id).and_then(VecDeque::pop_front) else {
                break;
            };
            self.deliver(item).await?;
        }
        if self.held.get(&client_id).is_some_and(VecDeque::is_empty) {
            self.held.remove(&client_id);
        }
        Ok(())
    }

    pub async fn step(&mut self, timeout: Duration) -> Result<BatchOutcome> {
        self.accept_registrations().await?;

        let Some(delivery) = self.router.consume(&self.queue, timeout).await? else {
            return Ok(BatchOutcome::Idle);
        };
        let batch = match Batch::decode(&delivery.body) {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!("Dropping undecodable result batch: {}", e);
                self.router.ack(&self.queue, delivery.tag).await?;
                return Ok(BatchOutcome::Malformed);
            }
        };
        let Some(sender) = batch.sender_id else {
            tracing::warn!("Dropping result batch without sender");
            self.router.ack(&self.queue, delivery.tag).await?;
            return Ok(BatchOutcome::Malformed);
        };
        let client_id = batch.client_id;

        if self
            .metadata
            .result_received(sender, client_id)
            .is_some_and(|last| batch.sequence_number <= last)
        {
            self.router.ack(&self.queue, delivery.tag).await?;
            return Ok(BatchOutcome::Duplicate);
        }
        if let Some(queue) = self.held.get_mut(&client_id)
            && let Some(held) = queue
                .iter_mut()
                .find(|h| h.sender == sender && h.batch.sequence_number == batch.sequence_number)
        {
            // Lease ran out while held; only the new tag is ackable.
            held.tag = delivery.tag;
            return Ok(BatchOutcome::Held);
        }

        let batch = if batch.is_eof() {
            batch
        } else {
            let Some(MessageKind::Query(query)) = MessageKind::query(sender.query) else {
                tracing::warn!(
                    "Dropping results from {}: query {} has no result shape",
                    sender,
                    sender.query
                );
                self.router.ack(&self.queue, delivery.tag).await?;
                return Ok(BatchOutcome::Malformed);
            };
            shape_results(&batch, sender, query)
        };
        let item = Held {
            tag: delivery.tag,
            sender,
            batch,
        };

        if !self.clients.contains_key(&client_id) || self.held.contains_key(&client_id) {
            tracing::debug!("No result stream for client {} yet, holding", client_id);
            self.held.entry(client_id).or_default().push_back(item);
            return Ok(BatchOutcome::Held);
        }
        self.deliver(item).await
    }

    /// Writes one held batch (or counts its EOF) and acks it under the log
    /// protocol. A lost socket puts the batch back at the head of the hold.
    async fn deliver(&mut self, item: Held) -> Result<BatchOutcome> {
        let client_id = item.batch.client_id;
        let mut changes = vec![(
            result_received_key(item.sender, client_id),
            Some(item.batch.sequence_number as i64),
        )];
        let mut finished = false;

        if item.batch.is_eof() {
            let pending = self
                .metadata
                .pending_eof(client_id)
                .unwrap_or(self.eof_to_receive)
                - 1;
            tracing::debug!(
                "Result EOF from {} for client {}, {} pending",
                item.sender,
                client_id,
                pending.max(0)
            );
            changes.push((pending_eof_key(client_id), Some(pending.max(0))));
            finished = pending <= 0;
        } else if !self.write_to_client(client_id, &item.batch).await {
            self.held.entry(client_id).or_default().push_front(item);
            return Ok(BatchOutcome::Held);
        }

        self.metadata.commit(&changes)?;
        self.ack_delivery(item.tag).await?;
        self.metadata.mark_acked()?;

        if finished {
            self.awaiting_final.insert(client_id);
            self.finish_client(client_id).await?;
        }
        Ok(BatchOutcome::Processed {
            forwarded: usize::from(!item.batch.is_eof()),
        })
    }

    async fn ack_delivery(&self, tag: u64) -> Result<()> {
        match self.router.ack(&self.queue, tag).await {
            Err(RouterError::UnknownDelivery(tag)) => {
                // Requeued after the receipt was committed; its redelivery
                // is dropped as a duplicate.
                tracing::debug!("Delivery {} was already requeued", tag);
                Ok(())
            }
            other => Ok(other?),
        }
    }

    /// Writes to the client's socket; a failed write detaches the client.
    async fn write_to_client(&mut self, client_id: u32, batch: &Batch) -> bool {
        let Some(stream) = self.clients.get_mut(&client_id) else {
            return false;
        };
        match batch.write_to(stream).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Result stream of client {} lost: {}", client_id, e);
                self.clients.remove(&client_id);
                false
            }
        }
    }

    /// Sends the terminal EOF and purges the client. Without a socket the
    /// client stays in `awaiting_final` until it attaches.
    async fn finish_client(&mut self, client_id: u32) -> Result<()> {
        if !self.clients.contains_key(&client_id) {
            return Ok(());
        }
        let seq = self.metadata.last_sent_seq().wrapping_add(1);
        self.metadata.log_sent_final_result(client_id, seq)?;
        if !self
            .write_to_client(client_id, &Batch::eof(client_id, None, seq))
            .await
        {
            return Ok(());
        }
        self.metadata.log_finished_client(client_id)?;
        self.metadata.commit(&[
            (pending_eof_key(client_id), None),
            (LAST_SENT_SEQ.to_string(), Some(seq as i64)),
        ])?;
        self.awaiting_final.remove(&client_id);
        self.clients.remove(&client_id);
        tracing::info!("Client {} served completely", client_id);
        Ok(())
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!("GatewayOut consuming {}", self.queue.name());
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            if let Err(e) = self.step(POLL_TIMEOUT).await {
                tracing::error!("GatewayOut failed: {}", e);
                return Err(e);
            }
        }
        tracing::info!("GatewayOut stopped");
        Ok(())
    }
}

/// Trims every record to the fields `query` reports and retags it.
fn shape_results(batch: &Batch, sender: SenderId, query: u8) -> Batch {
    let fields = query_result_fields(query);
    let records = batch
        .records
        .iter()
        .filter_map(Record::as_message)
        .map(|msg| {
            let mut shaped = msg.keeping_fields(fields);
            shaped.kind = MessageKind::Query(query);
            Record::Message(shaped)
        })
        .collect();
    Batch::new(batch.client_id, Some(sender), batch.sequence_number, records)
}
