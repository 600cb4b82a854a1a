//! Client-facing ingress: one session per connected client.

use super::types::FirstPool;
use crate::ingestion::LineParser;
use crate::protocol::{Batch, Dataset, Message, MessageKind, Record, SenderId};
use crate::router::MessageRouter;

use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const ACK_BYTE: u8 = 1;

/// Everything sessions share.
pub struct Ingress {
    router: Arc<dyn MessageRouter>,
    first_pools: Vec<FirstPool>,
    parser: LineParser,
}

impl Ingress {
    pub fn new(router: Arc<dyn MessageRouter>, first_pools: Vec<FirstPool>) -> Result<Self> {
        Ok(Self {
            router,
            first_pools,
            parser: LineParser::new()?,
        })
    }

    pub async fn declare(&self) -> Result<()> {
        for pool in &self.first_pools {
            pool.destination.declare(self.router.as_ref()).await?;
        }
        Ok(())
    }

    /// Parses a batch's lines and publishes them to every first pool that
    /// takes their dataset. Returns how many batches were published.
    pub async fn forward(&self, batch: &Batch) -> Result<usize> {
        let sender = SenderId::gateway(batch.client_id);
        let mut parsed: Vec<(Dataset, Message)> = Vec::with_capacity(batch.records.len());
        for record in &batch.records {
            match record {
                Record::Line { dataset, text } => match self.parser.parse(*dataset, text) {
                    Ok(msg) => parsed.push((*dataset, msg)),
                    Err(e) => tracing::debug!("Skipping {:?} line: {}", dataset, e),
                },
                Record::Message(msg) => {
                    let dataset = match msg.kind {
                        MessageKind::Review => Dataset::Reviews,
                        _ => Dataset::Books,
                    };
                    parsed.push((dataset, msg.clone()));
                }
            }
        }

        let mut published = 0;
        for pool in &self.first_pools {
            let records: Vec<Record> = parsed
                .iter()
                .filter(|(dataset, _)| pool.wants(*dataset))
                .map(|(_, msg)| Record::Message(msg.clone()))
                .collect();
            let exchange = pool.destination.exchange();
            for (routing_key, group) in pool.destination.route(records, batch.sequence_number) {
                let out = Batch::new(batch.client_id, Some(sender), batch.sequence_number, group);
                self.router
                    .publish(&exchange, &routing_key, out.encode()?)
                    .await?;
                published += 1;
            }
        }
        Ok(published)
    }

    /// Broadcasts the client's EOF to every member of every first pool.
    pub async fn broadcast_eof(&self, client_id: u32, sequence_number: u32) -> Result<()> {
        let eof = Batch::eof(client_id, Some(SenderId::gateway(client_id)), sequence_number);
        let body = eof.encode()?;
        for pool in &self.first_pools {
            let exchange = pool.destination.exchange();
            for routing_key in pool.destination.routing_keys() {
                self.router.publish(&exchange, &routing_key, body.clone()).await?;
            }
        }
        tracing::info!("Client {} upload finished, EOF sent", client_id);
        Ok(())
    }

    /// Reads batches until the client's EOF or disconnect, acking each
    /// batch once it is published. A disconnect counts as EOF.
    pub async fn serve_session(&self, stream: TcpStream) -> Result<()> {
        let peer = stream.peer_addr()?.to_string();
        let (reader, writer) = stream.into_split();
        self.serve_upload(reader, writer, &peer).await
    }

    /// Session loop over any byte stream pair. Every way out of it after
    /// the first batch sends the client's EOF downstream, a failed publish
    /// included (best effort).
    pub async fn serve_upload<R, W>(&self, mut reader: R, mut writer: W, peer: &str) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut client: Option<(u32, u32)> = None;

        loop {
            let batch = match Batch::decode_from_stream(&mut reader).await {
                Ok(batch) => batch,
                Err(e) => {
                    if e.is_disconnect() {
                        tracing::warn!("Client at {} disconnected mid-upload", peer);
                    } else {
                        tracing::warn!("Closing session with {}: {}", peer, e);
                    }
                    break;
                }
            };

            if let Some((expected, _)) = client
                && expected != batch.client_id
            {
                tracing::warn!(
                    "Session of client {} sent a batch for {}; closing",
                    expected,
                    batch.client_id
                );
                break;
            }

            if batch.is_eof() {
                self.broadcast_eof(batch.client_id, batch.sequence_number).await?;
                return Ok(());
            }

            let published = match self.forward(&batch).await {
                Ok(published) => published,
                Err(e) => {
                    tracing::error!(
                        "Publishing batch {} of client {} failed: {}",
                        batch.sequence_number,
                        batch.client_id,
                        e
                    );
                    let next = batch.sequence_number.wrapping_add(1);
                    if let Err(eof_err) = self.broadcast_eof(batch.client_id, next).await {
                        tracing::warn!("EOF for client {} not sent: {}", batch.client_id, eof_err);
                    }
                    return Err(e);
                }
            };
            tracing::debug!(
                "Batch {} of client {} forwarded as {} batch(es)",
                batch.sequence_number,
                batch.client_id,
                published
            );
            client = Some((batch.client_id, batch.sequence_number));
            if let Err(e) = writer.write_all(&[ACK_BYTE]).await {
                tracing::warn!("Client at {} gone before its ack: {}", peer, e);
                break;
            }
        }

        if let Some((client_id, last_seq)) = client {
            self.broadcast_eof(client_id, last_seq.wrapping_add(1)).await?;
        }
        Ok(())
    }
}

/// Accepts client connections forever, one task per session.
pub async fn serve_clients(listener: TcpListener, ingress: Arc<Ingress>) -> Result<()> {
    tracing::info!("GatewayIn listening on {}", listener.local_addr()?);
    loop {
        let (stream, peer) = listener.accept().await?;
        tracing::info!("Client connected from {}", peer);
        let ingress = ingress.clone();
        tokio::spawn(async move {
            if let Err(e) = ingress.serve_session(stream).await {
                tracing::error!("Session with {} failed: {}", peer, e);
            }
        });
    }
}
