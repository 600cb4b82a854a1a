//! Streams dataset files to GatewayIn as batches of raw lines.

use crate::ingestion::record_to_line;
use crate::protocol::{Batch, Dataset, Record};

use anyhow::{Context, Result, bail};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

/// Sends one batch and waits for the gateway's ack byte.
pub async fn send_batch<S>(stream: &mut S, batch: &Batch) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    batch.write_to(stream).await?;
    stream
        .read_u8()
        .await
        .with_context(|| format!("no ack for batch {}", batch.sequence_number))?;
    Ok(())
}

/// Uploads every source in order, then the EOF. Sequence numbers start at
/// zero and run across all sources. Returns the number of data batches.
pub async fn upload<S, P>(
    stream: &mut S,
    client_id: u32,
    sources: &[(Dataset, P)],
    batch_size: usize,
) -> Result<u32>
where
    S: AsyncRead + AsyncWrite + Unpin,
    P: AsRef<Path>,
{
    if batch_size == 0 || batch_size > crate::protocol::batch::MAX_RECORDS {
        bail!(
            "batch size must be between 1 and {}",
            crate::protocol::batch::MAX_RECORDS
        );
    }

    let mut seq: u32 = 0;
    for (dataset, path) in sources {
        let path = path.as_ref();
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("cannot open {}", path.display()))?;

        let mut lines = Vec::with_capacity(batch_size);
        let mut sent_lines = 0usize;
        for record in reader.records() {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!("Skipping unreadable row of {}: {}", path.display(), e);
                    continue;
                }
            };
            lines.push(Record::Line {
                dataset: *dataset,
                text: record_to_line(&record)?,
            });
            if lines.len() == batch_size {
                sent_lines += lines.len();
                let batch = Batch::new(client_id, None, seq, std::mem::take(&mut lines));
                send_batch(stream, &batch).await?;
                seq += 1;
            }
        }
        if !lines.is_empty() {
            sent_lines += lines.len();
            send_batch(stream, &Batch::new(client_id, None, seq, lines)).await?;
            seq += 1;
        }
        tracing::info!("Uploaded {} {:?} rows from {}", sent_lines, dataset, path.display());
    }

    Batch::eof(client_id, None, seq).write_to(stream).await?;
    Ok(seq)
}
