//! Gateway Module Tests
//!
//! ## Test Scopes
//! - **Configuration**: first-pool lists.
//! - **GatewayIn**: fan-out, ack byte, EOF on disconnect, on a lost ack and
//!   on a failed publish.
//! - **GatewayOut**: holding results of detached clients without stalling
//!   the others, dedup, unknown queries, EOF countdown, resuming a final EOF
//!   after restart.
//! - **End to end**: client -> GatewayIn -> filter pool -> GatewayOut ->
//!   client over loopback TCP.

#[cfg(test)]
mod tests {
    use crate::fault::FailureInjector;
    use crate::gateway::gateway_in::ACK_BYTE;
    use crate::gateway::*;
    use crate::protocol::{Batch, Dataset, Field, Message, MessageKind, Record, SenderId};
    use crate::router::topology::{RESULTS_EXCHANGE, RESULTS_QUEUE, worker_queue};
    use crate::router::{Broker, Destination, MessageRouter, QueueHandle};
    use crate::storage::metadata::MetadataHandler;
    use crate::worker::{BatchOutcome, Predicate, Worker, WorkerConfig, WorkerKind};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::{mpsc, watch};

    const SHORT: Duration = Duration::from_millis(50);
    const PATIENCE: Duration = Duration::from_secs(10);

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn titled(title: &str) -> Message {
        let mut msg = Message::new(MessageKind::Book);
        msg.title = Some(title.to_string());
        msg.authors = Some(vec!["A".to_string()]);
        msg.year = Some(2001);
        msg
    }

    async fn publish_result(broker: &Broker, batch: Batch) {
        broker
            .publish(RESULTS_EXCHANGE, "0", batch.encode().unwrap())
            .await
            .unwrap();
    }

    async fn read_batch(stream: &mut TcpStream) -> Batch {
        tokio::time::timeout(PATIENCE, Batch::decode_from_stream(stream))
            .await
            .unwrap()
            .unwrap()
    }

    // ============================================================
    // CONFIGURATION TESTS
    // ============================================================

    #[test]
    fn test_parse_first_pools() {
        let pools = parse_first_pools("1.1,3.2", "2,3", ",title", ",reviews+books").unwrap();
        assert_eq!(pools.len(), 2);
        assert_eq!(pools[0].datasets, vec![Dataset::Books]);
        assert_eq!(
            pools[1].destination,
            Destination::Pool {
                query: 3,
                pool: 2,
                workers: 3,
                shard_by: Some(Field::Title)
            }
        );
        assert!(pools[1].wants(Dataset::Reviews) && pools[1].wants(Dataset::Books));

        assert!(parse_first_pools("results", "", "", "").is_err());
        assert!(parse_first_pools("1.1", "1", "", "movies").is_err());
    }

    // ============================================================
    // GATEWAY IN TESTS
    // ============================================================

    #[tokio::test]
    async fn test_session_acks_and_sends_eof_on_disconnect() {
        let broker = Broker::new();
        let pool = FirstPool {
            destination: Destination::Pool {
                query: 2,
                pool: 1,
                workers: 2,
                shard_by: None,
            },
            datasets: vec![Dataset::Books],
        };
        let ingress = Arc::new(Ingress::new(broker.clone(), vec![pool]).unwrap());
        ingress.declare().await.unwrap();

        let (mut client, server) = socket_pair().await;
        let session = {
            let ingress = ingress.clone();
            tokio::spawn(async move { ingress.serve_session(server).await })
        };

        let lines = vec![
            Record::Line {
                dataset: Dataset::Books,
                text: "Some Book,,['Ann'],,,,1999,,['Poetry'],".to_string(),
            },
            Record::Line {
                dataset: Dataset::Reviews,
                text: "1,Some Book,,u,p,1/1,5.0,0,good,great".to_string(),
            },
        ];
        Batch::new(11, None, 3, lines)
            .write_to(&mut client)
            .await
            .unwrap();
        assert_eq!(client.read_u8().await.unwrap(), ACK_BYTE);
        drop(client);
        session.await.unwrap().unwrap();

        let w0 = QueueHandle(worker_queue(2, 1, 0));
        let w1 = QueueHandle(worker_queue(2, 1, 1));

        // Round robin by sequence number: 3 % 2 lands on member 1.
        let data = broker.consume(&w1, SHORT).await.unwrap().unwrap();
        let data = Batch::decode(&data.body).unwrap();
        assert_eq!(data.sender_id, Some(SenderId::gateway(11)));
        assert_eq!(data.sequence_number, 3);
        assert_eq!(data.records.len(), 1);
        assert_eq!(
            data.records[0].as_message().unwrap().title.as_deref(),
            Some("Some Book")
        );

        for queue in [&w0, &w1] {
            let eof = broker.consume(queue, SHORT).await.unwrap().unwrap();
            let eof = Batch::decode(&eof.body).unwrap();
            assert!(eof.is_eof());
            assert_eq!(eof.sequence_number, 4);
            assert!(broker.consume(queue, SHORT).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_eof_is_sent_when_ack_cannot_be_written() {
        let broker = Broker::new();
        let pool = FirstPool {
            destination: Destination::Pool {
                query: 1,
                pool: 1,
                workers: 1,
                shard_by: None,
            },
            datasets: vec![Dataset::Books],
        };
        let ingress = Ingress::new(broker.clone(), vec![pool]).unwrap();
        ingress.declare().await.unwrap();

        let (mut upload, reader) = tokio::io::duplex(4096);
        let (writer, ack_side) = tokio::io::duplex(64);
        drop(ack_side);

        let line = Record::Line {
            dataset: Dataset::Books,
            text: "Gone,,['Ann'],,,,1999,,['Poetry'],".to_string(),
        };
        Batch::new(21, None, 5, vec![line])
            .write_to(&mut upload)
            .await
            .unwrap();
        drop(upload);

        ingress.serve_upload(reader, writer, "test peer").await.unwrap();

        let queue = QueueHandle(worker_queue(1, 1, 0));
        let data = broker.consume(&queue, SHORT).await.unwrap().unwrap();
        assert_eq!(Batch::decode(&data.body).unwrap().sequence_number, 5);
        let eof = broker.consume(&queue, SHORT).await.unwrap().unwrap();
        let eof = Batch::decode(&eof.body).unwrap();
        assert!(eof.is_eof());
        assert_eq!(eof.sequence_number, 6);
    }

    #[tokio::test]
    async fn test_eof_is_attempted_when_publish_fails() {
        let broker = Broker::new();
        let pools = vec![
            FirstPool {
                destination: Destination::Pool {
                    query: 1,
                    pool: 1,
                    workers: 1,
                    shard_by: None,
                },
                datasets: vec![Dataset::Books],
            },
            FirstPool {
                destination: Destination::Pool {
                    query: 2,
                    pool: 1,
                    workers: 1,
                    shard_by: None,
                },
                datasets: vec![Dataset::Books],
            },
        ];
        let ingress = Ingress::new(broker.clone(), pools.clone()).unwrap();
        // Only the first pool exists, so publishing to the second fails.
        pools[0].destination.declare(&*broker).await.unwrap();

        let (mut upload, reader) = tokio::io::duplex(4096);
        let (writer, _ack_side) = tokio::io::duplex(64);
        let line = Record::Line {
            dataset: Dataset::Books,
            text: "Lost,,['Ann'],,,,1999,,['Poetry'],".to_string(),
        };
        Batch::new(22, None, 0, vec![line])
            .write_to(&mut upload)
            .await
            .unwrap();
        drop(upload);

        assert!(ingress.serve_upload(reader, writer, "test peer").await.is_err());

        let queue = QueueHandle(worker_queue(1, 1, 0));
        let data = broker.consume(&queue, SHORT).await.unwrap().unwrap();
        assert!(!Batch::decode(&data.body).unwrap().is_eof());
        let eof = broker.consume(&queue, SHORT).await.unwrap().unwrap();
        let eof = Batch::decode(&eof.body).unwrap();
        assert!(eof.is_eof());
        assert_eq!(eof.sequence_number, 1);
    }

    // ============================================================
    // GATEWAY OUT TESTS
    // ============================================================

    #[tokio::test]
    async fn test_results_wait_for_client_then_count_down() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Broker::new();
        let (tx, rx) = mpsc::channel(4);
        let mut out = GatewayOut::start(broker.clone(), dir.path(), 2, rx, FailureInjector::Disabled)
            .await
            .unwrap();

        let last_pool = SenderId::new(1, 2, 0);
        let result = Batch::new(7, Some(last_pool), 1, vec![Record::Message(titled("T"))]);
        publish_result(&broker, result.clone()).await;

        assert_eq!(out.step(SHORT).await.unwrap(), BatchOutcome::Held);
        assert_eq!(out.held_count(7), 1);

        let (mut client, server) = socket_pair().await;
        tx.send((7, server)).await.unwrap();
        assert_eq!(out.step(SHORT).await.unwrap(), BatchOutcome::Idle);
        assert!(out.is_registered(7));
        assert_eq!(out.held_count(7), 0);

        let received = read_batch(&mut client).await;
        assert_eq!(received.sender_id, Some(last_pool));
        let mut expected = Message::new(MessageKind::Query(1));
        expected.title = Some("T".to_string());
        expected.authors = Some(vec!["A".to_string()]);
        assert_eq!(received.records, vec![Record::Message(expected)]);

        publish_result(&broker, result).await;
        assert_eq!(out.step(SHORT).await.unwrap(), BatchOutcome::Duplicate);

        publish_result(&broker, Batch::eof(7, Some(last_pool), 2)).await;
        out.step(SHORT).await.unwrap();
        assert_eq!(out.metadata().pending_eof(7), Some(1));

        publish_result(&broker, Batch::eof(7, Some(SenderId::new(4, 3, 1)), 9)).await;
        out.step(SHORT).await.unwrap();

        let terminal = read_batch(&mut client).await;
        assert!(terminal.is_eof());
        assert_eq!(terminal.sender_id, None);
        assert_eq!(out.metadata().pending_eof(7), None);
        assert!(!out.is_registered(7));
    }

    #[tokio::test]
    async fn test_detached_client_does_not_block_others() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Broker::new();
        let (tx, rx) = mpsc::channel(4);
        let mut out = GatewayOut::start(broker.clone(), dir.path(), 1, rx, FailureInjector::Disabled)
            .await
            .unwrap();

        let (mut client8, server8) = socket_pair().await;
        tx.send((8, server8)).await.unwrap();

        let sender = SenderId::new(3, 2, 0);
        publish_result(&broker, Batch::new(7, Some(sender), 1, vec![Record::Message(titled("Seven"))])).await;
        publish_result(&broker, Batch::new(8, Some(sender), 2, vec![Record::Message(titled("Eight"))])).await;
        publish_result(&broker, Batch::eof(7, Some(sender), 3)).await;

        assert_eq!(out.step(SHORT).await.unwrap(), BatchOutcome::Held);
        assert_eq!(
            out.step(SHORT).await.unwrap(),
            BatchOutcome::Processed { forwarded: 1 }
        );
        assert_eq!(out.step(SHORT).await.unwrap(), BatchOutcome::Held);
        assert_eq!(out.held_count(7), 2);

        let eight = read_batch(&mut client8).await;
        assert_eq!(eight.client_id, 8);
        assert_eq!(
            eight.records[0].as_message().unwrap().title.as_deref(),
            Some("Eight")
        );

        let (mut client7, server7) = socket_pair().await;
        tx.send((7, server7)).await.unwrap();
        assert_eq!(out.step(SHORT).await.unwrap(), BatchOutcome::Idle);

        let seven = read_batch(&mut client7).await;
        assert_eq!(seven.sequence_number, 1);
        assert_eq!(
            seven.records[0].as_message().unwrap().title.as_deref(),
            Some("Seven")
        );
        assert!(read_batch(&mut client7).await.is_eof());
        assert_eq!(out.held_count(7), 0);
        assert_eq!(broker.pending_count(&QueueHandle(RESULTS_QUEUE.to_string())).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_held_results_are_redelivered_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Broker::new();
        let sender = SenderId::new(3, 2, 0);
        {
            let (tx, rx) = mpsc::channel(4);
            let mut out =
                GatewayOut::start(broker.clone(), dir.path(), 1, rx, FailureInjector::Disabled)
                    .await
                    .unwrap();
            let (_client8, server8) = socket_pair().await;
            tx.send((8, server8)).await.unwrap();

            publish_result(&broker, Batch::new(7, Some(sender), 1, vec![Record::Message(titled("Seven"))])).await;
            publish_result(&broker, Batch::new(8, Some(sender), 2, vec![Record::Message(titled("Eight"))])).await;
            assert_eq!(out.step(SHORT).await.unwrap(), BatchOutcome::Held);
            assert_eq!(
                out.step(SHORT).await.unwrap(),
                BatchOutcome::Processed { forwarded: 1 }
            );
        }

        let (tx, rx) = mpsc::channel(4);
        let mut out = GatewayOut::start(broker.clone(), dir.path(), 1, rx, FailureInjector::Disabled)
            .await
            .unwrap();
        let (mut client7, server7) = socket_pair().await;
        tx.send((7, server7)).await.unwrap();
        assert_eq!(
            out.step(SHORT).await.unwrap(),
            BatchOutcome::Processed { forwarded: 1 }
        );
        assert_eq!(read_batch(&mut client7).await.sequence_number, 1);
    }

    #[tokio::test]
    async fn test_results_of_unknown_queries_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Broker::new();
        let (tx, rx) = mpsc::channel(4);
        let mut out = GatewayOut::start(broker.clone(), dir.path(), 1, rx, FailureInjector::Disabled)
            .await
            .unwrap();
        let (_client, server) = socket_pair().await;
        tx.send((4, server)).await.unwrap();

        for query in [0, 6, 300] {
            let batch = Batch::new(4, Some(SenderId::new(query, 1, 0)), 1, vec![Record::Message(titled("T"))]);
            publish_result(&broker, batch).await;
            assert_eq!(out.step(SHORT).await.unwrap(), BatchOutcome::Malformed);
        }
    }

    #[tokio::test]
    async fn test_final_eof_resumes_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut metadata, _) =
                MetadataHandler::open(dir.path(), FailureInjector::Disabled).unwrap();
            metadata
                .commit(&[(crate::storage::metadata::pending_eof_key(5), Some(0))])
                .unwrap();
            metadata.log_sent_final_result(5, 1).unwrap();
        }

        let broker = Broker::new();
        let (tx, rx) = mpsc::channel(4);
        let mut out = GatewayOut::start(broker.clone(), dir.path(), 1, rx, FailureInjector::Disabled)
            .await
            .unwrap();

        let (mut client, server) = socket_pair().await;
        tx.send((5, server)).await.unwrap();
        assert_eq!(out.step(SHORT).await.unwrap(), BatchOutcome::Idle);

        assert!(read_batch(&mut client).await.is_eof());
        assert_eq!(out.metadata().pending_eof(5), None);
    }

    #[tokio::test]
    async fn test_finished_client_is_purged_on_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut metadata, _) =
                MetadataHandler::open(dir.path(), FailureInjector::Disabled).unwrap();
            metadata
                .commit(&[(crate::storage::metadata::pending_eof_key(6), Some(0))])
                .unwrap();
            metadata.log_sent_final_result(6, 1).unwrap();
            metadata.log_finished_client(6).unwrap();
        }

        let (_tx, rx) = mpsc::channel(4);
        let out = GatewayOut::start(Broker::new(), dir.path(), 1, rx, FailureInjector::Disabled)
            .await
            .unwrap();
        assert_eq!(out.metadata().pending_eof(6), None);
        assert!(out.metadata().drained_clients().is_empty());
    }

    // ============================================================
    // END TO END
    // ============================================================

    #[tokio::test]
    async fn test_query1_filter_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Broker::new();
        let (stop_tx, stop_rx) = watch::channel(false);

        let worker = Worker::start(
            WorkerConfig {
                id: SenderId::new(1, 1, 0),
                kind: WorkerKind::Filter {
                    field: Field::Categories,
                    predicate: Predicate::Contains("fiction".to_string()),
                },
                eof_to_receive: 1,
                destinations: vec![Destination::Results],
                data_dir: dir.path().join("worker"),
            },
            broker.clone(),
            FailureInjector::Disabled,
        )
        .await
        .unwrap();
        let worker_task = tokio::spawn(worker.run(stop_rx.clone()));

        let clients = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let results = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let clients_addr = clients.local_addr().unwrap();
        let results_addr = results.local_addr().unwrap();
        let config = GatewayConfig {
            first_pools: vec![FirstPool {
                destination: Destination::Pool {
                    query: 1,
                    pool: 1,
                    workers: 1,
                    shard_by: None,
                },
                datasets: vec![Dataset::Books],
            }],
            eof_to_receive: 1,
            data_dir: dir.path().join("gateway"),
        };
        let router: Arc<dyn MessageRouter> = broker.clone();
        let gateway_task = tokio::spawn(run_gateway(
            config,
            router,
            clients,
            results,
            FailureInjector::Disabled,
            stop_rx,
        ));

        let mut result_stream = TcpStream::connect(results_addr).await.unwrap();
        result_stream.write_u32(42).await.unwrap();

        let mut upload = TcpStream::connect(clients_addr).await.unwrap();
        let line = Record::Line {
            dataset: Dataset::Books,
            text: "T1,,['A'],,,,1995,,['fiction'],".to_string(),
        };
        Batch::new(42, None, 0, vec![line])
            .write_to(&mut upload)
            .await
            .unwrap();
        assert_eq!(upload.read_u8().await.unwrap(), ACK_BYTE);
        Batch::eof(42, None, 1).write_to(&mut upload).await.unwrap();

        let first = read_batch(&mut result_stream).await;
        let mut expected = Message::new(MessageKind::Query(1));
        expected.title = Some("T1".to_string());
        expected.authors = Some(vec!["A".to_string()]);
        assert_eq!(first.client_id, 42);
        assert_eq!(first.records, vec![Record::Message(expected)]);

        let last = read_batch(&mut result_stream).await;
        assert!(last.is_eof());

        stop_tx.send(true).unwrap();
        tokio::time::timeout(PATIENCE, worker_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        tokio::time::timeout(PATIENCE, gateway_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
