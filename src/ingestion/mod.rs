//! Ingestion Module
//!
//! Parsing of raw dataset lines into pipeline messages.
//!
//! ## Workflow
//! 1. **Client**: reads `books_data.csv` / `Books_rating.csv` row by row and
//!    ships every row as one raw CSV line (`record_to_line`).
//! 2. **Gateway**: parses each line with `LineParser` into a `Book` or
//!    `Review` message; unparseable lines are skipped.
//!
//! Authors and categories arrive as Python-style lists (`['a', 'b']`), the
//! year is the first four-digit run of `publishedDate`, and a review's
//! polarity is scored from its summary and text.

pub mod parser;
pub mod types;

pub use parser::{LineParser, record_to_line};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("empty line")]
    Empty,

    #[error("missing {0}")]
    MissingColumn(&'static str),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests;
