use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which dataset a raw line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dataset {
    Books,
    Reviews,
}

/// Shape tag of a decoded message.
///
/// `Book` and `Review` flow between pools; `Query(n)` is only produced by
/// GatewayOut when shaping the result stream for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Book,
    Review,
    Query(u8),
}

impl MessageKind {
    /// The result kind of query `n`, if `n` names one of the queries.
    pub fn query(n: u16) -> Option<Self> {
        u8::try_from(n)
            .ok()
            .filter(|n| (1..=QUERY_COUNT).contains(n))
            .map(MessageKind::Query)
    }

    /// True when `from_tag(tag())` gives this kind back.
    pub fn has_tag(&self) -> bool {
        match self {
            MessageKind::Query(n) => (1..=QUERY_COUNT).contains(n),
            _ => true,
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            MessageKind::Book => TAG_BOOK,
            MessageKind::Review => TAG_REVIEW,
            MessageKind::Query(n) => TAG_QUERY_BASE + n.saturating_sub(1),
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            TAG_BOOK => Some(MessageKind::Book),
            TAG_REVIEW => Some(MessageKind::Review),
            t if (TAG_QUERY_BASE..TAG_QUERY_BASE + QUERY_COUNT).contains(&t) => {
                Some(MessageKind::Query(t - TAG_QUERY_BASE + 1))
            }
            _ => None,
        }
    }
}

pub const TAG_BOOK_LINE: u8 = 0;
pub const TAG_REVIEW_LINE: u8 = 1;
pub const TAG_BOOK: u8 = 2;
pub const TAG_REVIEW: u8 = 3;
pub const TAG_QUERY_BASE: u8 = 4;
pub const QUERY_COUNT: u8 = 5;

/// Optional fields a message may carry.
///
/// The discriminant is the bit position inside the presence mask, and the
/// declaration order is the wire order: fixed-width fields first, then the
/// length-prefixed ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Field {
    Year = 0,
    Rating = 1,
    Polarity = 2,
    Title = 3,
    Authors = 4,
    Publisher = 5,
    Categories = 6,
    ReviewText = 7,
}

impl Field {
    pub const ALL: [Field; 8] = [
        Field::Year,
        Field::Rating,
        Field::Polarity,
        Field::Title,
        Field::Authors,
        Field::Publisher,
        Field::Categories,
        Field::ReviewText,
    ];

    pub fn bit(self) -> u8 {
        1 << (self as u8)
    }

    /// Width in bytes of a fixed field, `None` for variable fields.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            Field::Year => Some(2),
            Field::Rating | Field::Polarity => Some(4),
            _ => None,
        }
    }

    /// Width in bytes of the length prefix of a variable field.
    pub fn prefix_width(self) -> Option<usize> {
        match self {
            Field::Publisher => Some(1),
            Field::Title | Field::Authors | Field::Categories | Field::ReviewText => Some(2),
            _ => None,
        }
    }

    pub fn is_list(self) -> bool {
        matches!(self, Field::Authors | Field::Categories)
    }
}

impl FromStr for Field {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "year" => Ok(Field::Year),
            "rating" => Ok(Field::Rating),
            "polarity" | "mean_sentiment_polarity" => Ok(Field::Polarity),
            "title" => Ok(Field::Title),
            "authors" => Ok(Field::Authors),
            "publisher" => Ok(Field::Publisher),
            "categories" => Ok(Field::Categories),
            "review_text" | "text" => Ok(Field::ReviewText),
            other => Err(format!("unknown field '{}'", other)),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::Year => "year",
            Field::Rating => "rating",
            Field::Polarity => "polarity",
            Field::Title => "title",
            Field::Authors => "authors",
            Field::Publisher => "publisher",
            Field::Categories => "categories",
            Field::ReviewText => "review_text",
        };
        f.write_str(name)
    }
}

/// A book, review or query result. Every field is optional; the presence
/// mask on the wire is derived from which ones are `Some`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub year: Option<u16>,
    pub rating: Option<f32>,
    pub polarity: Option<f32>,
    pub title: Option<String>,
    /// List fields round-trip only when no item contains `LIST_SEPARATOR`
    /// and the list is not a single empty item.
    pub authors: Option<Vec<String>>,
    pub publisher: Option<String>,
    pub categories: Option<Vec<String>>,
    pub review_text: Option<String>,
}

impl Message {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            year: None,
            rating: None,
            polarity: None,
            title: None,
            authors: None,
            publisher: None,
            categories: None,
            review_text: None,
        }
    }

    pub fn presence_mask(&self) -> u8 {
        Field::ALL
            .iter()
            .filter(|field| self.has(**field))
            .fold(0u8, |mask, field| mask | field.bit())
    }

    pub fn has(&self, field: Field) -> bool {
        match field {
            Field::Year => self.year.is_some(),
            Field::Rating => self.rating.is_some(),
            Field::Polarity => self.polarity.is_some(),
            Field::Title => self.title.is_some(),
            Field::Authors => self.authors.is_some(),
            Field::Publisher => self.publisher.is_some(),
            Field::Categories => self.categories.is_some(),
            Field::ReviewText => self.review_text.is_some(),
        }
    }

    pub fn clear(&mut self, field: Field) {
        match field {
            Field::Year => self.year = None,
            Field::Rating => self.rating = None,
            Field::Polarity => self.polarity = None,
            Field::Title => self.title = None,
            Field::Authors => self.authors = None,
            Field::Publisher => self.publisher = None,
            Field::Categories => self.categories = None,
            Field::ReviewText => self.review_text = None,
        }
    }

    /// Textual value of a field, lists joined with the list separator.
    /// Used for sharding and grouping keys.
    pub fn text_of(&self, field: Field) -> Option<String> {
        match field {
            Field::Year => self.year.map(|y| y.to_string()),
            Field::Rating => self.rating.map(|r| r.to_string()),
            Field::Polarity => self.polarity.map(|p| p.to_string()),
            Field::Title => self.title.clone(),
            Field::Authors => self.authors.as_ref().map(|a| a.join(LIST_SEPARATOR)),
            Field::Publisher => self.publisher.clone(),
            Field::Categories => self.categories.as_ref().map(|c| c.join(LIST_SEPARATOR)),
            Field::ReviewText => self.review_text.clone(),
        }
    }

    /// Numeric value of a fixed field.
    pub fn number_of(&self, field: Field) -> Option<f64> {
        match field {
            Field::Year => self.year.map(f64::from),
            Field::Rating => self.rating.map(f64::from),
            Field::Polarity => self.polarity.map(f64::from),
            _ => None,
        }
    }

    /// Copy of the message with every field outside `fields` nulled.
    pub fn keeping_fields(&self, fields: &[Field]) -> Self {
        let mut copy = self.clone();
        for field in Field::ALL {
            if !fields.contains(&field) {
                copy.clear(field);
            }
        }
        copy
    }
}

pub const LIST_SEPARATOR: &str = ",";

/// A unit carried inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Record {
    /// An unparsed dataset line as read by the client.
    Line { dataset: Dataset, text: String },
    Message(Message),
}

impl Record {
    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Record::Message(msg) => Some(msg),
            Record::Line { .. } => None,
        }
    }
}

/// Stable identity of a pool member: `query.pool.index`.
///
/// Query `0` is reserved for gateway sessions, whose index is the client id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SenderId {
    pub query: u16,
    pub pool: u16,
    pub index: u32,
}

impl SenderId {
    pub fn new(query: u16, pool: u16, index: u32) -> Self {
        Self { query, pool, index }
    }

    pub fn gateway(client_id: u32) -> Self {
        Self::new(0, 0, client_id)
    }
}

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.query, self.pool, self.index)
    }
}

impl FromStr for SenderId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(format!("expected query.pool.index, got '{}'", s));
        }
        let parse_err = |e: std::num::ParseIntError| format!("invalid sender id '{}': {}", s, e);
        Ok(Self {
            query: parts[0].parse().map_err(parse_err)?,
            pool: parts[1].parse().map_err(parse_err)?,
            index: parts[2].parse().map_err(parse_err)?,
        })
    }
}

/// Fields each query's result rows keep when sent to the client.
pub fn query_result_fields(query: u8) -> &'static [Field] {
    match query {
        1 => &[Field::Title, Field::Authors, Field::Publisher],
        2 => &[Field::Authors],
        3 => &[Field::Title, Field::Authors],
        4 => &[Field::Title, Field::Rating],
        5 => &[Field::Title],
        _ => &[],
    }
}
