//! Per-message transforms and end-of-stream aggregation for each worker kind.

use super::types::*;
use crate::protocol::{Field, Message, MessageKind};

use std::cmp::Ordering;

impl WorkerKind {
    /// Applies one message to the client's context, returning what must be
    /// forwarded right away.
    pub fn process(&self, ctx: &mut WorkerContext, msg: Message) -> Vec<Message> {
        self.reset_if_foreign(ctx);
        match (self, ctx) {
            (WorkerKind::Filter { field, predicate }, _) => {
                if !predicate.matches(*field, &msg) {
                    return Vec::new();
                }
                let mut kept = msg;
                if field.is_list() {
                    kept.clear(*field);
                }
                vec![kept]
            }
            (WorkerKind::TopK { k, by }, WorkerContext::TopK(best)) => {
                if msg.number_of(*by).is_some() {
                    let at = best
                        .iter()
                        .position(|other| rank(&msg, other, *by) == Ordering::Less)
                        .unwrap_or(best.len());
                    best.insert(at, msg);
                    best.truncate(*k);
                }
                Vec::new()
            }
            (WorkerKind::Distinct { by }, WorkerContext::Seen(seen)) => match msg.text_of(*by) {
                Some(key) => {
                    if seen.insert(key) {
                        vec![msg]
                    } else {
                        Vec::new()
                    }
                }
                None => Vec::new(),
            },
            (
                WorkerKind::RunningMean { key, metric, .. }
                | WorkerKind::Percentile { key, metric, .. },
                WorkerContext::Means(entries),
            ) => {
                let Some(k) = msg.text_of(*key) else {
                    return Vec::new();
                };
                let entry = entries.entry(k).or_default();
                match msg.kind {
                    MessageKind::Book => {
                        if entry.book.is_none() {
                            entry.book = Some(msg);
                        }
                    }
                    MessageKind::Review => {
                        if let Some(value) = msg.number_of(*metric) {
                            entry.count += 1;
                            entry.sum += value;
                        }
                    }
                    MessageKind::Query(_) => {}
                }
                Vec::new()
            }
            (WorkerKind::DecadeSet { .. }, WorkerContext::Decades(decades)) => {
                if let (Some(year), Some(authors)) = (msg.year, msg.authors.as_ref()) {
                    for author in authors {
                        decades.entry(author.clone()).or_default().insert(year / 10);
                    }
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// Final results for a client whose every upstream sender reached EOF.
    pub fn finalize(&self, mut ctx: WorkerContext) -> Vec<Message> {
        self.reset_if_foreign(&mut ctx);
        match (self, ctx) {
            (WorkerKind::TopK { .. }, WorkerContext::TopK(best)) => best,
            (WorkerKind::RunningMean { metric, min_count, .. }, WorkerContext::Means(entries)) => {
                entries
                    .into_values()
                    .filter(|e| e.count >= *min_count)
                    .filter_map(|e| {
                        let mean = e.mean()?;
                        e.book.map(|book| with_metric(book, *metric, mean))
                    })
                    .collect()
            }
            (
                WorkerKind::Percentile {
                    metric, percentile, ..
                },
                WorkerContext::Means(entries),
            ) => {
                let joined: Vec<(Message, f64)> = entries
                    .into_values()
                    .filter_map(|e| {
                        let mean = e.mean()?;
                        e.book.map(|book| (book, mean))
                    })
                    .collect();
                let Some(threshold) = nearest_rank(joined.iter().map(|(_, m)| *m), *percentile)
                else {
                    return Vec::new();
                };
                joined
                    .into_iter()
                    .filter(|(_, mean)| *mean >= threshold)
                    .map(|(book, mean)| with_metric(book, *metric, mean))
                    .collect()
            }
            (WorkerKind::DecadeSet { min_decades }, WorkerContext::Decades(decades)) => decades
                .into_iter()
                .filter(|(_, seen)| seen.len() >= *min_decades)
                .map(|(author, _)| {
                    let mut msg = Message::new(MessageKind::Book);
                    msg.authors = Some(vec![author]);
                    msg
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    fn reset_if_foreign(&self, ctx: &mut WorkerContext) {
        let fits = matches!(
            (self, &*ctx),
            (WorkerKind::Filter { .. }, WorkerContext::Stateless)
                | (WorkerKind::TopK { .. }, WorkerContext::TopK(_))
                | (WorkerKind::Distinct { .. }, WorkerContext::Seen(_))
                | (WorkerKind::RunningMean { .. }, WorkerContext::Means(_))
                | (WorkerKind::Percentile { .. }, WorkerContext::Means(_))
                | (WorkerKind::DecadeSet { .. }, WorkerContext::Decades(_))
        );
        if !fits {
            tracing::warn!("Discarding context of another worker kind");
            *ctx = self.initial_context();
        }
    }
}

/// Higher metric first, title breaking ties.
fn rank(a: &Message, b: &Message, by: Field) -> Ordering {
    let metric = |m: &Message| m.number_of(by).unwrap_or(f64::MIN);
    metric(b)
        .total_cmp(&metric(a))
        .then_with(|| a.title.cmp(&b.title))
}

fn with_metric(mut msg: Message, metric: Field, value: f64) -> Message {
    match metric {
        Field::Polarity => msg.polarity = Some(value as f32),
        Field::Year => msg.year = Some(value.round() as u16),
        _ => msg.rating = Some(value as f32),
    }
    msg
}

/// Nearest-rank percentile of `values`, `None` when empty.
pub fn nearest_rank(values: impl Iterator<Item = f64>, percentile: f64) -> Option<f64> {
    let mut sorted: Vec<f64> = values.collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f64::total_cmp);
    let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, sorted.len()) - 1])
}
