//! Worker Module Tests
//!
//! ## Test Scopes
//! - **Kinds**: configuration parsing, filter predicates, accumulator
//!   finalize output.
//! - **Engine**: deduplication, EOF countdown in any order, context survival
//!   across restarts, and replay after a crash mid-commit.

#[cfg(test)]
mod tests {
    use crate::fault::{Checkpoint, FailureInjector};
    use crate::protocol::{Batch, Field, Message, MessageKind, Record, SenderId};
    use crate::router::topology::{pool_exchange, RESULTS_QUEUE};
    use crate::router::{Broker, Destination, MessageRouter, QueueHandle};
    use crate::worker::logic::nearest_rank;
    use crate::worker::*;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    const SHORT: Duration = Duration::from_millis(50);

    fn book(title: &str, year: u16, authors: &[&str], categories: &[&str]) -> Message {
        let mut msg = Message::new(MessageKind::Book);
        msg.title = Some(title.to_string());
        msg.year = Some(year);
        msg.authors = Some(authors.iter().map(|a| a.to_string()).collect());
        msg.categories = Some(categories.iter().map(|c| c.to_string()).collect());
        msg
    }

    fn rated(title: &str, rating: f32) -> Message {
        let mut msg = Message::new(MessageKind::Book);
        msg.title = Some(title.to_string());
        msg.rating = Some(rating);
        msg
    }

    fn review(title: &str, rating: f32) -> Message {
        let mut msg = Message::new(MessageKind::Review);
        msg.title = Some(title.to_string());
        msg.rating = Some(rating);
        msg
    }

    fn config(dir: &Path, kind: WorkerKind, eof_to_receive: i64) -> WorkerConfig {
        WorkerConfig {
            id: SenderId::new(1, 1, 0),
            kind,
            eof_to_receive,
            destinations: vec![Destination::Results],
            data_dir: dir.to_path_buf(),
        }
    }

    fn fiction_filter() -> WorkerKind {
        WorkerKind::Filter {
            field: Field::Categories,
            predicate: Predicate::Contains("fiction".to_string()),
        }
    }

    async fn send(broker: &Broker, batch: &Batch) {
        broker
            .publish(&pool_exchange(1, 1), "0", batch.encode().unwrap())
            .await
            .unwrap();
    }

    async fn drain_results(broker: &Broker) -> Vec<Batch> {
        let queue = QueueHandle(RESULTS_QUEUE.to_string());
        let mut batches = Vec::new();
        while let Some(delivery) = broker.consume(&queue, SHORT).await.unwrap() {
            broker.ack(&queue, delivery.tag).await.unwrap();
            batches.push(Batch::decode(&delivery.body).unwrap());
        }
        batches
    }

    fn messages(batch: &Batch) -> Vec<Message> {
        batch
            .records
            .iter()
            .filter_map(|r| r.as_message().cloned())
            .collect()
    }

    // ============================================================
    // KIND CONFIGURATION TESTS
    // ============================================================

    #[test]
    fn test_kind_from_parts() {
        assert_eq!(
            WorkerKind::from_parts("filter", Some("categories"), Some("Fiction"), None).unwrap(),
            fiction_filter()
        );
        assert_eq!(
            WorkerKind::from_parts("filter", Some("year"), Some("1990-1999"), None).unwrap(),
            WorkerKind::Filter {
                field: Field::Year,
                predicate: Predicate::YearRange(1990, 1999)
            }
        );
        assert_eq!(
            WorkerKind::from_parts("topk", Some("rating"), Some("10"), None).unwrap(),
            WorkerKind::TopK {
                k: 10,
                by: Field::Rating
            }
        );
        assert_eq!(
            WorkerKind::from_parts("running_mean", None, Some("500"), Some("title")).unwrap(),
            WorkerKind::RunningMean {
                key: Field::Title,
                metric: Field::Rating,
                min_count: 500
            }
        );
        assert!(WorkerKind::from_parts("filter", None, Some("x"), None).is_err());
        assert!(WorkerKind::from_parts("percentile", None, Some("101"), None).is_err());
        assert!(WorkerKind::from_parts("sorter", None, None, None).is_err());
    }

    #[test]
    fn test_predicates() {
        let msg = book("The Hobbit", 1937, &["Tolkien"], &["Fiction"]);
        assert!(Predicate::Contains("fiction".to_string()).matches(Field::Categories, &msg));
        assert!(!Predicate::Contains("fict".to_string()).matches(Field::Categories, &msg));
        assert!(Predicate::Substring("hobbit".to_string()).matches(Field::Title, &msg));
        assert!(Predicate::YearRange(1930, 1939).matches(Field::Year, &msg));
        assert!(!Predicate::YearRange(1990, 1999).matches(Field::Year, &msg));
        assert!(!Predicate::AtLeast(1.0).matches(Field::Rating, &msg));
        assert!(Predicate::AtLeast(4.0).matches(Field::Rating, &rated("x", 4.0)));
    }

    // ============================================================
    // KIND LOGIC TESTS
    // ============================================================

    #[test]
    fn test_filter_drops_list_field_it_matched_on() {
        let kind = fiction_filter();
        let mut ctx = kind.initial_context();

        let out = kind.process(&mut ctx, book("T1", 1995, &["A"], &["fiction"]));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].categories, None);
        assert_eq!(out[0].authors, Some(vec!["A".to_string()]));

        assert!(kind
            .process(&mut ctx, book("T2", 1995, &["A"], &["poetry"]))
            .is_empty());
        assert!(kind.process(&mut ctx, review("T1", 5.0)).is_empty());
    }

    #[test]
    fn test_top_k_keeps_best_sorted() {
        let kind = WorkerKind::TopK {
            k: 2,
            by: Field::Rating,
        };
        let mut ctx = kind.initial_context();
        for (title, rating) in [("a", 3.0), ("b", 4.5), ("c", 1.0), ("d", 4.5), ("e", 4.0)] {
            assert!(kind.process(&mut ctx, rated(title, rating)).is_empty());
        }
        let titles: Vec<_> = kind
            .finalize(ctx)
            .into_iter()
            .filter_map(|m| m.title)
            .collect();
        assert_eq!(titles, vec!["b", "d"]);
    }

    #[test]
    fn test_distinct_forwards_first_per_key() {
        let kind = WorkerKind::Distinct { by: Field::Title };
        let mut ctx = kind.initial_context();
        assert_eq!(kind.process(&mut ctx, rated("a", 1.0)).len(), 1);
        assert!(kind.process(&mut ctx, rated("a", 2.0)).is_empty());
        assert_eq!(kind.process(&mut ctx, rated("b", 1.0)).len(), 1);
        assert!(kind.finalize(ctx).is_empty());
    }

    #[test]
    fn test_running_mean_joins_books_and_counts_reviews() {
        let kind = WorkerKind::RunningMean {
            key: Field::Title,
            metric: Field::Rating,
            min_count: 2,
        };
        let mut ctx = kind.initial_context();
        // Reviews may arrive before their book.
        for msg in [
            review("Dune", 4.0),
            review("Dune", 5.0),
            review("Orphan", 5.0),
            review("Orphan", 5.0),
            book("Dune", 1965, &["Herbert"], &[]),
            book("Emma", 1815, &["Austen"], &[]),
            review("Emma", 3.0),
        ] {
            assert!(kind.process(&mut ctx, msg).is_empty());
        }

        let out = kind.finalize(ctx);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].title.as_deref(), Some("Dune"));
        assert_eq!(out[0].rating, Some(4.5));
        assert_eq!(out[0].authors, Some(vec!["Herbert".to_string()]));
    }

    #[test]
    fn test_percentile_keeps_top_means() {
        let kind = WorkerKind::Percentile {
            key: Field::Title,
            metric: Field::Rating,
            percentile: 75.0,
        };
        let mut ctx = kind.initial_context();
        for (title, score) in [("a", 1.0), ("b", 2.0), ("c", 3.0), ("d", 4.0)] {
            kind.process(&mut ctx, book(title, 2000, &["x"], &[]));
            kind.process(&mut ctx, review(title, score));
        }
        let titles: Vec<_> = kind
            .finalize(ctx)
            .into_iter()
            .filter_map(|m| m.title)
            .collect();
        assert_eq!(titles, vec!["c", "d"]);

        assert_eq!(nearest_rank([5.0, 1.0].into_iter(), 50.0), Some(1.0));
        assert_eq!(nearest_rank(std::iter::empty(), 90.0), None);
    }

    #[test]
    fn test_decade_set_counts_distinct_decades() {
        let kind = WorkerKind::DecadeSet { min_decades: 2 };
        let mut ctx = kind.initial_context();
        for msg in [
            book("a", 1961, &["Ann", "Bob"], &[]),
            book("b", 1969, &["Bob"], &[]),
            book("c", 1975, &["Ann"], &[]),
        ] {
            kind.process(&mut ctx, msg);
        }
        let authors: Vec<_> = kind
            .finalize(ctx)
            .into_iter()
            .filter_map(|m| m.authors)
            .collect();
        assert_eq!(authors, vec![vec!["Ann".to_string()]]);
    }

    // ============================================================
    // ENGINE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_duplicate_batch_is_forwarded_once() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Broker::new();
        let mut worker = Worker::start(
            config(dir.path(), fiction_filter(), 1),
            broker.clone(),
            FailureInjector::Disabled,
        )
        .await
        .unwrap();

        let sender = SenderId::gateway(7);
        let batch = Batch::new(
            7,
            Some(sender),
            0,
            vec![Record::Message(book("T1", 1995, &["A"], &["fiction"]))],
        );
        send(&broker, &batch).await;
        send(&broker, &batch).await;

        assert_eq!(
            worker.step(SHORT).await.unwrap(),
            BatchOutcome::Processed { forwarded: 1 }
        );
        assert_eq!(worker.metadata().last_received(sender), Some(0));
        assert_eq!(worker.step(SHORT).await.unwrap(), BatchOutcome::Duplicate);
        assert_eq!(worker.metadata().last_received(sender), Some(0));
        assert_eq!(worker.step(SHORT).await.unwrap(), BatchOutcome::Idle);

        let results = drain_results(&broker).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].sender_id, Some(SenderId::new(1, 1, 0)));
        assert_eq!(results[0].sequence_number, 1);
    }

    #[tokio::test]
    async fn test_eof_countdown_any_order() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Broker::new();
        let kind = WorkerKind::TopK {
            k: 2,
            by: Field::Rating,
        };
        let mut worker = Worker::start(config(dir.path(), kind, 3), broker.clone(), FailureInjector::Disabled)
            .await
            .unwrap();

        let upstream = |i| SenderId::new(1, 0, i);
        send(
            &broker,
            &Batch::new(
                5,
                Some(upstream(1)),
                1,
                vec![
                    Record::Message(rated("low", 1.0)),
                    Record::Message(rated("high", 5.0)),
                    Record::Message(rated("mid", 3.0)),
                ],
            ),
        )
        .await;
        send(&broker, &Batch::eof(5, Some(upstream(2)), 1)).await;
        send(&broker, &Batch::eof(5, Some(upstream(2)), 1)).await;
        send(&broker, &Batch::eof(5, Some(upstream(0)), 4)).await;

        for _ in 0..4 {
            worker.step(SHORT).await.unwrap();
        }
        assert!(drain_results(&broker).await.is_empty());
        assert_eq!(worker.metadata().pending_eof(5), Some(1));

        send(&broker, &Batch::eof(5, Some(upstream(1)), 2)).await;
        assert_eq!(
            worker.step(SHORT).await.unwrap(),
            BatchOutcome::Processed { forwarded: 2 }
        );

        let results = drain_results(&broker).await;
        assert_eq!(results.len(), 2);
        let titles: Vec<_> = messages(&results[0])
            .into_iter()
            .filter_map(|m| m.title)
            .collect();
        assert_eq!(titles, vec!["high", "mid"]);
        assert!(results[1].is_eof());
        assert!(results[1].sequence_number > results[0].sequence_number);
        assert_eq!(worker.metadata().pending_eof(5), None);
        assert!(worker.context(5).is_none());
    }

    #[tokio::test]
    async fn test_context_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Broker::new();
        let kind = WorkerKind::TopK {
            k: 5,
            by: Field::Rating,
        };
        let upstream = SenderId::new(1, 0, 0);

        {
            let mut worker = Worker::start(
                config(dir.path(), kind.clone(), 1),
                broker.clone(),
                FailureInjector::Disabled,
            )
            .await
            .unwrap();
            send(
                &broker,
                &Batch::new(9, Some(upstream), 1, vec![Record::Message(rated("kept", 4.0))]),
            )
            .await;
            worker.step(SHORT).await.unwrap();
        }

        let mut worker = Worker::start(config(dir.path(), kind, 1), broker.clone(), FailureInjector::Disabled)
            .await
            .unwrap();
        assert!(worker.context(9).is_some());

        send(&broker, &Batch::eof(9, Some(upstream), 2)).await;
        worker.step(SHORT).await.unwrap();

        let results = drain_results(&broker).await;
        assert_eq!(results.len(), 2);
        assert_eq!(messages(&results[0])[0].title.as_deref(), Some("kept"));
        assert!(results[1].is_eof());
    }

    #[tokio::test]
    async fn test_crash_after_changing_file_replays_batch_once() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Broker::new();
        let sender = SenderId::gateway(3);
        let batch = Batch::new(
            3,
            Some(sender),
            0,
            vec![Record::Message(book("T1", 1995, &["A"], &["fiction"]))],
        );

        {
            let mut worker = Worker::start(
                config(dir.path(), fiction_filter(), 1),
                broker.clone(),
                FailureInjector::scripted([Checkpoint::AfterChangingFile]),
            )
            .await
            .unwrap();
            send(&broker, &batch).await;
            assert!(worker.step(SHORT).await.is_err());
        }

        let mut worker = Worker::start(
            config(dir.path(), fiction_filter(), 1),
            broker.clone(),
            FailureInjector::Disabled,
        )
        .await
        .unwrap();
        // Pre-write image restored.
        assert_eq!(worker.metadata().last_received(sender), None);
        assert_eq!(worker.metadata().last_sent_seq(), 0);

        assert_eq!(
            worker.step(SHORT).await.unwrap(),
            BatchOutcome::Processed { forwarded: 1 }
        );
        assert_eq!(worker.step(SHORT).await.unwrap(), BatchOutcome::Idle);
        assert_eq!(worker.metadata().last_received(sender), Some(0));

        // Both attempts published, with the same identity, so downstream
        // keeps exactly one.
        let results = drain_results(&broker).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0], results[1]);
        assert_eq!(results[0].sequence_number, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Broker::new();
        let worker = Worker::start(
            config(dir.path(), fiction_filter(), 1),
            broker.clone(),
            FailureInjector::Disabled,
        )
        .await
        .unwrap();
        assert_eq!(worker.state(), EngineState::Running);

        let (tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(worker.run(rx));
        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
