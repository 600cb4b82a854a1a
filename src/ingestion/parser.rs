use super::ParseError;
use super::types::*;
use crate::protocol::{Dataset, Message, MessageKind};

use regex::Regex;

/// Turns raw dataset lines into messages.
pub struct LineParser {
    year: Regex,
    list_item: Regex,
    word: Regex,
}

impl LineParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            year: Regex::new(r"(\d{4})")?,
            list_item: Regex::new(r#"'([^']*)'|"([^"]*)""#)?,
            word: Regex::new(r"[A-Za-z']+")?,
        })
    }

    pub fn parse(&self, dataset: Dataset, line: &str) -> Result<Message, ParseError> {
        let fields = split_csv_line(line)?;
        match dataset {
            Dataset::Books => self.parse_book(&fields),
            Dataset::Reviews => self.parse_review(&fields),
        }
    }

    fn parse_book(&self, fields: &csv::StringRecord) -> Result<Message, ParseError> {
        let mut msg = Message::new(MessageKind::Book);
        msg.title = Some(required_title(fields, book_columns::TITLE)?);
        msg.authors = non_empty(fields, book_columns::AUTHORS).map(|a| self.parse_list(a));
        msg.publisher = non_empty(fields, book_columns::PUBLISHER)
            .map(|p| truncate_bytes(p, MAX_SHORT_FIELD).to_string());
        msg.year = non_empty(fields, book_columns::PUBLISHED_DATE).and_then(|d| self.parse_year(d));
        msg.categories = non_empty(fields, book_columns::CATEGORIES).map(|c| self.parse_list(c));
        Ok(msg)
    }

    fn parse_review(&self, fields: &csv::StringRecord) -> Result<Message, ParseError> {
        let mut msg = Message::new(MessageKind::Review);
        msg.title = Some(required_title(fields, review_columns::TITLE)?);
        msg.rating = non_empty(fields, review_columns::SCORE).and_then(|s| s.parse::<f32>().ok());

        let summary = fields.get(review_columns::SUMMARY).unwrap_or_default();
        let text = fields.get(review_columns::TEXT).unwrap_or_default();
        if !summary.is_empty() || !text.is_empty() {
            msg.polarity = Some(self.polarity(&format!("{} {}", summary, text)));
        }
        Ok(msg)
    }

    pub fn parse_year(&self, date: &str) -> Option<u16> {
        self.year
            .captures(date)
            .and_then(|cap| cap.get(1))
            .and_then(|m| m.as_str().parse::<u16>().ok())
    }

    /// `['a', 'b']` becomes `["a", "b"]`; an unquoted value is one element.
    pub fn parse_list(&self, value: &str) -> Vec<String> {
        let items: Vec<String> = self
            .list_item
            .captures_iter(value)
            .filter_map(|cap| cap.get(1).or_else(|| cap.get(2)))
            .map(|m| m.as_str().trim().to_string())
            .filter(|item| !item.is_empty())
            .collect();
        if items.is_empty() {
            let bare = value.trim_matches(|c| c == '[' || c == ']').trim();
            if bare.is_empty() {
                return Vec::new();
            }
            return vec![bare.to_string()];
        }
        items
    }

    /// Lexicon polarity in `[-1, 1]`: (positive - negative) / matched words.
    pub fn polarity(&self, text: &str) -> f32 {
        let (mut positive, mut negative) = (0u32, 0u32);
        for word in self.word.find_iter(text) {
            let word = word.as_str().to_lowercase();
            if POSITIVE_WORDS.contains(&word.as_str()) {
                positive += 1;
            } else if NEGATIVE_WORDS.contains(&word.as_str()) {
                negative += 1;
            }
        }
        let matched = positive + negative;
        if matched == 0 {
            return 0.0;
        }
        (positive as f32 - negative as f32) / matched as f32
    }
}

fn split_csv_line(line: &str) -> Result<csv::StringRecord, ParseError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(line.as_bytes());
    let mut record = csv::StringRecord::new();
    if !reader.read_record(&mut record)? {
        return Err(ParseError::Empty);
    }
    Ok(record)
}

fn non_empty(fields: &csv::StringRecord, column: usize) -> Option<&str> {
    fields.get(column).map(str::trim).filter(|v| !v.is_empty())
}

fn required_title(fields: &csv::StringRecord, column: usize) -> Result<String, ParseError> {
    non_empty(fields, column)
        .map(|t| truncate_bytes(t, MAX_LONG_FIELD).to_string())
        .ok_or(ParseError::MissingColumn("title"))
}

/// Longest prefix of `value` within `max` bytes that ends on a char boundary.
pub fn truncate_bytes(value: &str, max: usize) -> &str {
    if value.len() <= max {
        return value;
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// Re-serialises a CSV row as a single line, quoting as needed.
pub fn record_to_line(record: &csv::StringRecord) -> Result<String, ParseError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_record(record)?;
    let bytes = writer
        .into_inner()
        .map_err(|e| ParseError::Io(std::io::Error::other(e.to_string())))?;
    let line = String::from_utf8_lossy(&bytes);
    Ok(line.trim_end_matches('\n').to_string())
}
