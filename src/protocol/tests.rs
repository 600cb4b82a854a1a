//! Protocol Module Tests
//!
//! ## Test Scopes
//! - **Codec**: every field-presence combination survives encode/decode, and the
//!   stream reader consumes exactly one record.
//! - **Batch**: header framing, EOF batches with no body, field trimming.

#[cfg(test)]
mod tests {
    use crate::protocol::batch::{Batch, HEADER_LEN};
    use crate::protocol::codec::{self, decode, decode_from_stream, encode_to_vec};
    use crate::protocol::types::*;
    use crate::protocol::CodecError;

    fn full_book() -> Message {
        Message {
            kind: MessageKind::Book,
            year: Some(1995),
            rating: Some(4.5),
            polarity: Some(-0.25),
            title: Some("T1".to_string()),
            authors: Some(vec!["A".to_string(), "B".to_string()]),
            publisher: Some("Pub".to_string()),
            categories: Some(vec!["fiction".to_string()]),
            review_text: Some("great read".to_string()),
        }
    }

    // ============================================================
    // CODEC TESTS
    // ============================================================

    #[test]
    fn test_every_presence_combination_round_trips() {
        let full = full_book();
        for mask in 0u16..=255 {
            let mut msg = full.clone();
            for field in Field::ALL {
                if mask as u8 & field.bit() == 0 {
                    msg.clear(field);
                }
            }
            assert_eq!(msg.presence_mask(), mask as u8);

            let record = Record::Message(msg);
            let bytes = encode_to_vec(&record).unwrap();
            let (decoded, consumed) = decode(&bytes).unwrap();

            assert_eq!(decoded, record, "mask {:#010b} did not round trip", mask);
            assert_eq!(consumed, bytes.len());
        }
    }

    #[test]
    fn test_all_absent_is_two_bytes() {
        let record = Record::Message(Message::new(MessageKind::Review));
        let bytes = encode_to_vec(&record).unwrap();
        assert_eq!(bytes, vec![TAG_REVIEW, 0]);
    }

    #[test]
    fn test_fixed_fields_are_big_endian() {
        let mut msg = Message::new(MessageKind::Book);
        msg.year = Some(0x07CB);
        let bytes = encode_to_vec(&Record::Message(msg)).unwrap();
        assert_eq!(bytes, vec![TAG_BOOK, Field::Year.bit(), 0x07, 0xCB]);
    }

    #[test]
    fn test_line_round_trip() {
        let record = Record::Line {
            dataset: Dataset::Reviews,
            text: "1882931173,Its Only Art If Its Well Hung!,,AVCGYZL8FQQTD".to_string(),
        };
        let bytes = encode_to_vec(&record).unwrap();
        let (decoded, consumed) = decode(&bytes).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn test_every_query_kind_round_trips() {
        for n in 1..=QUERY_COUNT {
            let mut msg = Message::new(MessageKind::Query(n));
            msg.title = Some("T".to_string());
            let record = Record::Message(msg);
            let (decoded, _) = decode(&encode_to_vec(&record).unwrap()).unwrap();
            assert_eq!(decoded, record);
        }
    }

    #[test]
    fn test_query_kinds_without_a_tag_are_rejected() {
        for n in [0, QUERY_COUNT + 1, u8::MAX] {
            let err = encode_to_vec(&Record::Message(Message::new(MessageKind::Query(n))))
                .unwrap_err();
            assert!(matches!(err, CodecError::UnknownKind(MessageKind::Query(k)) if k == n));
        }
        assert_eq!(MessageKind::query(3), Some(MessageKind::Query(3)));
        assert_eq!(MessageKind::query(0), None);
        assert_eq!(MessageKind::query(6), None);
        assert_eq!(MessageKind::query(257), None);
    }

    #[test]
    fn test_single_empty_list_item_reads_back_empty() {
        let mut msg = Message::new(MessageKind::Book);
        msg.authors = Some(vec![String::new()]);
        let (decoded, _) = decode(&encode_to_vec(&Record::Message(msg)).unwrap()).unwrap();
        assert_eq!(decoded.as_message().unwrap().authors, Some(Vec::new()));
    }

    #[test]
    fn test_unknown_tag_is_malformed() {
        let err = decode(&[200, 0]).unwrap_err();
        assert!(matches!(err, CodecError::MalformedRecord(_)));
    }

    #[test]
    fn test_short_input_is_malformed() {
        let bytes = encode_to_vec(&Record::Message(full_book())).unwrap();
        let err = decode(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, CodecError::MalformedRecord(_)));
    }

    #[test]
    fn test_publisher_longer_than_one_byte_prefix_is_rejected() {
        let mut msg = Message::new(MessageKind::Book);
        msg.publisher = Some("p".repeat(256));
        let err = encode_to_vec(&Record::Message(msg)).unwrap_err();
        assert!(matches!(err, CodecError::FieldTooLong { .. }));
    }

    #[test]
    fn test_fixed_block_len_counts_prefixes() {
        let mask = Field::Year.bit() | Field::Rating.bit() | Field::Publisher.bit() | Field::Title.bit();
        // 2 (year) + 4 (rating) + 1 (publisher prefix) + 2 (title prefix)
        assert_eq!(codec::fixed_block_len(mask), 9);
    }

    #[tokio::test]
    async fn test_stream_decode_does_not_over_read() {
        let first = Record::Message(full_book());
        let second = Record::Line {
            dataset: Dataset::Books,
            text: "next".to_string(),
        };
        let mut bytes = encode_to_vec(&first).unwrap();
        bytes.extend(encode_to_vec(&second).unwrap());

        let mut stream = &bytes[..];
        assert_eq!(decode_from_stream(&mut stream).await.unwrap(), first);
        assert_eq!(decode_from_stream(&mut stream).await.unwrap(), second);
        assert!(stream.is_empty());
    }

    // ============================================================
    // BATCH TESTS
    // ============================================================

    #[tokio::test]
    async fn test_batch_stream_framing() {
        for count in [0usize, 1, 7, 255] {
            let records = (0..count)
                .map(|i| {
                    let mut msg = Message::new(MessageKind::Book);
                    msg.title = Some(format!("title {}", i));
                    Record::Message(msg)
                })
                .collect();
            let batch = Batch::new(42, Some(SenderId::new(1, 2, 3)), 9, records);
            let bytes = batch.encode().unwrap();

            let mut stream = &bytes[..];
            let decoded = Batch::decode_from_stream(&mut stream).await.unwrap();
            assert_eq!(decoded, batch);
            assert!(stream.is_empty());
        }
    }

    #[tokio::test]
    async fn test_eof_batch_is_header_only() {
        let eof = Batch::eof(7, Some(SenderId::new(1, 1, 0)), 3);
        let bytes = eof.encode().unwrap();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(bytes[HEADER_LEN - 1], 0);

        let mut stream = &bytes[..];
        let decoded = Batch::decode_from_stream(&mut stream).await.unwrap();
        assert!(decoded.is_eof());
        assert_eq!(decoded, eof);
    }

    #[test]
    fn test_missing_sender_round_trips() {
        let batch = Batch::eof(1, None, 0);
        let decoded = Batch::decode(&batch.encode().unwrap()).unwrap();
        assert_eq!(decoded.sender_id, None);
    }

    #[test]
    fn test_too_many_records_rejected() {
        let records = vec![Record::Message(Message::new(MessageKind::Book)); 256];
        let err = Batch::new(1, None, 1, records).encode().unwrap_err();
        assert!(matches!(err, CodecError::TooManyMessages(256)));
    }

    #[test]
    fn test_copy_keeping_fields() {
        let batch = Batch::new(1, None, 1, vec![Record::Message(full_book())]);
        let trimmed = batch.copy_keeping_fields(&[Field::Title, Field::Authors]);

        let msg = trimmed.records[0].as_message().unwrap();
        assert_eq!(msg.title.as_deref(), Some("T1"));
        assert!(msg.authors.is_some());
        assert!(msg.year.is_none());
        assert!(msg.categories.is_none());
        assert_eq!(msg.presence_mask(), Field::Title.bit() | Field::Authors.bit());
        // the source batch is untouched
        assert!(batch.records[0].as_message().unwrap().year.is_some());
    }

    #[tokio::test]
    async fn test_truncated_stream_is_disconnect() {
        let batch = Batch::new(1, None, 1, vec![Record::Message(full_book())]);
        let bytes = batch.encode().unwrap();
        let mut stream = &bytes[..bytes.len() - 2];
        let err = Batch::decode_from_stream(&mut stream).await.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[test]
    fn test_sender_id_parse() {
        let id: SenderId = "3.2.1".parse().unwrap();
        assert_eq!(id, SenderId::new(3, 2, 1));
        assert_eq!(id.to_string(), "3.2.1");
        assert!("3.2".parse::<SenderId>().is_err());
    }
}
