//! Binary record codec.
//!
//! Message layout:
//!
//! ```text
//! tag:1 | mask:1 | fixed fields | length prefixes | variable bytes
//! ```
//!
//! The fixed fields and the length prefixes of every present variable field
//! sit in one block whose size is known from the mask alone, so a stream
//! reader can pull a record in three exact reads without over-reading.
//! Raw lines are `tag:1 | len:4 | utf-8 bytes`.

use super::CodecError;
use super::cursor::ByteReader;
use super::types::*;
use tokio::io::{AsyncRead, AsyncReadExt};

const LINE_PREFIX_WIDTH: usize = 4;

pub fn encode(record: &Record, out: &mut Vec<u8>) -> Result<(), CodecError> {
    match record {
        Record::Line { dataset, text } => {
            let tag = match dataset {
                Dataset::Books => TAG_BOOK_LINE,
                Dataset::Reviews => TAG_REVIEW_LINE,
            };
            let len = u32::try_from(text.len()).map_err(|_| CodecError::FieldTooLong {
                field: "line".to_string(),
                len: text.len(),
            })?;
            out.push(tag);
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(text.as_bytes());
            Ok(())
        }
        Record::Message(msg) => encode_message(msg, out),
    }
}

fn encode_message(msg: &Message, out: &mut Vec<u8>) -> Result<(), CodecError> {
    if !msg.kind.has_tag() {
        return Err(CodecError::UnknownKind(msg.kind));
    }
    out.push(msg.kind.tag());
    out.push(msg.presence_mask());

    if let Some(year) = msg.year {
        out.extend_from_slice(&year.to_be_bytes());
    }
    if let Some(rating) = msg.rating {
        out.extend_from_slice(&rating.to_be_bytes());
    }
    if let Some(polarity) = msg.polarity {
        out.extend_from_slice(&polarity.to_be_bytes());
    }

    let variable: Vec<(Field, String)> = Field::ALL
        .iter()
        .filter(|field| field.prefix_width().is_some())
        .filter_map(|field| msg.text_of(*field).map(|text| (*field, text)))
        .collect();

    for (field, text) in &variable {
        let width = field.prefix_width().unwrap_or(2);
        let max = if width == 1 { u8::MAX as usize } else { u16::MAX as usize };
        if text.len() > max {
            return Err(CodecError::FieldTooLong {
                field: field.to_string(),
                len: text.len(),
            });
        }
        if width == 1 {
            out.push(text.len() as u8);
        } else {
            out.extend_from_slice(&(text.len() as u16).to_be_bytes());
        }
    }
    for (_, text) in &variable {
        out.extend_from_slice(text.as_bytes());
    }

    Ok(())
}

pub fn encode_to_vec(record: &Record) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    encode(record, &mut out)?;
    Ok(out)
}

/// Decodes one record from the front of `bytes`, returning it together with
/// the number of bytes it occupied.
pub fn decode(bytes: &[u8]) -> Result<(Record, usize), CodecError> {
    let mut reader = ByteReader::new(bytes);
    let record = decode_from(&mut reader)?;
    Ok((record, reader.position()))
}

pub fn decode_from(reader: &mut ByteReader<'_>) -> Result<Record, CodecError> {
    let tag = reader.read_u8()?;
    match tag {
        TAG_BOOK_LINE | TAG_REVIEW_LINE => {
            let dataset = if tag == TAG_BOOK_LINE {
                Dataset::Books
            } else {
                Dataset::Reviews
            };
            let len = reader.read_length(LINE_PREFIX_WIDTH)?;
            let text = reader.read_string(len)?;
            Ok(Record::Line { dataset, text })
        }
        _ => {
            let kind = MessageKind::from_tag(tag)
                .ok_or_else(|| CodecError::MalformedRecord(format!("unknown tag {}", tag)))?;
            let mask = reader.read_u8()?;
            decode_message_body(kind, mask, reader).map(Record::Message)
        }
    }
}

fn decode_message_body(
    kind: MessageKind,
    mask: u8,
    reader: &mut ByteReader<'_>,
) -> Result<Message, CodecError> {
    let present = |field: Field| mask & field.bit() != 0;
    let mut msg = Message::new(kind);

    if present(Field::Year) {
        msg.year = Some(reader.read_u16()?);
    }
    if present(Field::Rating) {
        msg.rating = Some(reader.read_f32()?);
    }
    if present(Field::Polarity) {
        msg.polarity = Some(reader.read_f32()?);
    }

    let mut lengths = Vec::new();
    for field in Field::ALL {
        if let Some(width) = field.prefix_width()
            && present(field)
        {
            lengths.push((field, reader.read_length(width)?));
        }
    }

    for (field, len) in lengths {
        let text = reader.read_string(len)?;
        match field {
            Field::Title => msg.title = Some(text),
            Field::Authors => msg.authors = Some(split_list(&text)),
            Field::Publisher => msg.publisher = Some(text),
            Field::Categories => msg.categories = Some(split_list(&text)),
            Field::ReviewText => msg.review_text = Some(text),
            _ => {}
        }
    }

    Ok(msg)
}

/// Lists travel joined by `LIST_SEPARATOR`, so items must not contain it.
/// An empty joined string reads back as an empty list, which means
/// `Some(vec![""])` decodes as `Some(vec![])`.
fn split_list(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    text.split(LIST_SEPARATOR).map(|s| s.to_string()).collect()
}

/// Size of the fixed block (fixed fields plus length prefixes) implied by a mask.
pub fn fixed_block_len(mask: u8) -> usize {
    Field::ALL
        .iter()
        .filter(|field| mask & field.bit() != 0)
        .map(|field| field.fixed_width().or(field.prefix_width()).unwrap_or(0))
        .sum()
}

/// Sum of the variable field lengths announced by the prefixes in `block`.
fn variable_len(mask: u8, block: &[u8]) -> Result<usize, CodecError> {
    let mut reader = ByteReader::new(block);
    let mut total = 0usize;
    for field in Field::ALL {
        if mask & field.bit() == 0 {
            continue;
        }
        if let Some(width) = field.fixed_width() {
            reader.take(width)?;
        } else if let Some(width) = field.prefix_width() {
            total += reader.read_length(width)?;
        }
    }
    Ok(total)
}

/// Reads exactly one record from a stream: header, then the mask-sized
/// fixed block, then the variable bytes the block announces.
pub async fn decode_from_stream<R>(reader: &mut R) -> Result<Record, CodecError>
where
    R: AsyncRead + Unpin,
{
    let tag = reader.read_u8().await?;
    let mut buf = vec![tag];

    if tag == TAG_BOOK_LINE || tag == TAG_REVIEW_LINE {
        let len = reader.read_u32().await?;
        buf.extend_from_slice(&len.to_be_bytes());
        read_into(reader, &mut buf, len as usize).await?;
    } else {
        if MessageKind::from_tag(tag).is_none() {
            return Err(CodecError::MalformedRecord(format!("unknown tag {}", tag)));
        }
        let mask = reader.read_u8().await?;
        buf.push(mask);
        let block_start = buf.len();
        read_into(reader, &mut buf, fixed_block_len(mask)).await?;
        let body = variable_len(mask, &buf[block_start..])?;
        read_into(reader, &mut buf, body).await?;
    }

    let (record, _) = decode(&buf)?;
    Ok(record)
}

async fn read_into<R>(reader: &mut R, buf: &mut Vec<u8>, len: usize) -> Result<(), CodecError>
where
    R: AsyncRead + Unpin,
{
    let start = buf.len();
    buf.resize(start + len, 0);
    reader.read_exact(&mut buf[start..]).await?;
    Ok(())
}
