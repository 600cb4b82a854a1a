//! Receives a client's result stream and writes one CSV per query.

use super::types::QueryResults;
use crate::protocol::{Batch, MessageKind, Record, query_result_fields};

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Announces `client_id` and reads result batches until the terminal EOF,
/// which is the only batch without a sender.
pub async fn receive_results<S>(stream: &mut S, client_id: u32) -> Result<QueryResults>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_u32(client_id).await?;
    let mut results = QueryResults::default();

    loop {
        let batch = Batch::decode_from_stream(stream)
            .await
            .context("result stream broken before EOF")?;
        let Some(sender) = batch.sender_id else {
            if batch.is_eof() {
                break;
            }
            tracing::warn!("Ignoring result batch without sender");
            continue;
        };
        if batch.is_eof() || !results.accept(sender, batch.sequence_number) {
            continue;
        }
        for msg in batch.records.iter().filter_map(Record::as_message) {
            if let MessageKind::Query(query) = msg.kind {
                results.push(query, msg.clone());
            }
        }
    }

    for (query, rows) in &results.rows {
        tracing::info!("Query {}: {} result row(s)", query, rows.len());
    }
    Ok(results)
}

pub fn result_file(dir: &Path, query: u8) -> PathBuf {
    dir.join(format!("query_{}.csv", query))
}

/// Writes `query_<n>.csv` under `dir` for each wanted query, an empty
/// `queries` meaning every query that produced rows. Columns are the fields
/// that query returns.
pub fn write_results(dir: &Path, results: &QueryResults, queries: &[u8]) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;
    let wanted: Vec<u8> = if queries.is_empty() {
        results.rows.keys().copied().collect()
    } else {
        queries.to_vec()
    };

    let mut written = Vec::with_capacity(wanted.len());
    for query in wanted {
        let fields = query_result_fields(query);
        let path = result_file(dir, query);
        let mut writer = csv::Writer::from_path(&path)
            .with_context(|| format!("cannot create {}", path.display()))?;
        writer.write_record(fields.iter().map(|f| f.to_string()))?;
        for row in results.rows.get(&query).into_iter().flatten() {
            writer.write_record(
                fields
                    .iter()
                    .map(|f| row.text_of(*f).unwrap_or_default()),
            )?;
        }
        writer.flush()?;
        written.push(path);
    }
    Ok(written)
}
