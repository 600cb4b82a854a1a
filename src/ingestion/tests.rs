//! Ingestion Module Tests
//!
//! ## Test Scopes
//! - **Books**: list columns, year extraction, publisher truncation.
//! - **Reviews**: score and polarity.
//! - **Lines**: quoting survives the client/gateway hop.

#[cfg(test)]
mod tests {
    use crate::ingestion::parser::truncate_bytes;
    use crate::ingestion::{LineParser, ParseError, record_to_line};
    use crate::protocol::{Dataset, MessageKind};

    fn parser() -> LineParser {
        LineParser::new().unwrap()
    }

    #[test]
    fn test_parse_book_line() {
        let line = r#"Dr. Seuss: American Icon,"A biography",['Philip Nel'],http://img,http://prev,A&C Black,2005-01-01,http://info,['Biography & Autobiography'],"""#;
        let msg = parser().parse(Dataset::Books, line).unwrap();

        assert_eq!(msg.kind, MessageKind::Book);
        assert_eq!(msg.title.as_deref(), Some("Dr. Seuss: American Icon"));
        assert_eq!(msg.authors, Some(vec!["Philip Nel".to_string()]));
        assert_eq!(msg.publisher.as_deref(), Some("A&C Black"));
        assert_eq!(msg.year, Some(2005));
        assert_eq!(
            msg.categories,
            Some(vec!["Biography & Autobiography".to_string()])
        );
    }

    #[test]
    fn test_book_with_missing_optionals() {
        let msg = parser()
            .parse(Dataset::Books, "Untitled Notes,,,,,,,,,")
            .unwrap();
        assert_eq!(msg.title.as_deref(), Some("Untitled Notes"));
        assert_eq!(msg.authors, None);
        assert_eq!(msg.year, None);
        assert_eq!(msg.presence_mask().count_ones(), 1);
    }

    #[test]
    fn test_book_without_title_is_rejected() {
        let err = parser().parse(Dataset::Books, ",desc,['A']").unwrap_err();
        assert!(matches!(err, ParseError::MissingColumn("title")));
    }

    #[test]
    fn test_year_and_lists() {
        let p = parser();
        assert_eq!(p.parse_year("1999"), Some(1999));
        assert_eq!(p.parse_year("c. 1850-03"), Some(1850));
        assert_eq!(p.parse_year("unknown"), None);

        assert_eq!(
            p.parse_list(r#"['Ann', "O'Brien", '']"#),
            vec!["Ann".to_string(), "O'Brien".to_string()]
        );
        assert_eq!(p.parse_list("Fiction"), vec!["Fiction".to_string()]);
        assert!(p.parse_list("[]").is_empty());
    }

    #[test]
    fn test_parse_review_line() {
        let line = r#"1882931173,Its Only Art If Its Well Hung!,,AVCGYZL8FQQTD,"Jim of Oz ""jim-of-oz""",7/7,4.0,940636800,Nice collection,"This is a wonderful, great book. Boring cover."#;
        let msg = parser().parse(Dataset::Reviews, line).unwrap();

        assert_eq!(msg.kind, MessageKind::Review);
        assert_eq!(msg.title.as_deref(), Some("Its Only Art If Its Well Hung!"));
        assert_eq!(msg.rating, Some(4.0));
        // nice, wonderful, great against boring
        assert_eq!(msg.polarity, Some(0.5));
        assert_eq!(msg.review_text, None);
    }

    #[test]
    fn test_polarity_bounds() {
        let p = parser();
        assert_eq!(p.polarity("no opinion here"), 0.0);
        assert_eq!(p.polarity("LOVED it, excellent"), 1.0);
        assert_eq!(p.polarity("worst, a waste"), -1.0);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_bytes("abc", 5), "abc");
        assert_eq!(truncate_bytes("ñandú", 2), "ñ");
        assert_eq!(truncate_bytes("ñandú", 1), "");
    }

    #[test]
    fn test_record_to_line_round_trip() {
        let record = csv::StringRecord::from(vec!["A, B", "say \"hi\"", "plain"]);
        let line = record_to_line(&record).unwrap();
        assert_eq!(line, r#""A, B","say ""hi""",plain"#);

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(line.as_bytes());
        let parsed = reader.records().next().unwrap().unwrap();
        assert_eq!(parsed, record);
    }
}
