use super::CodecError;
use super::codec;
use super::cursor::ByteReader;
use super::types::{Field, Record, SenderId};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Wire header: `client_id:4 | query:2 | pool:2 | index:4 | seq:4 | count:1`.
pub const HEADER_LEN: usize = 17;
pub const MAX_RECORDS: usize = u8::MAX as usize;

const NO_SENDER: SenderId = SenderId {
    query: u16::MAX,
    pool: u16::MAX,
    index: u32::MAX,
};

/// Ordered records plus the routing and sequencing metadata that make a batch
/// the unit of acknowledgement and deduplication. No records means EOF.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub client_id: u32,
    pub sender_id: Option<SenderId>,
    pub sequence_number: u32,
    pub records: Vec<Record>,
}

impl Batch {
    pub fn new(
        client_id: u32,
        sender_id: Option<SenderId>,
        sequence_number: u32,
        records: Vec<Record>,
    ) -> Self {
        Self {
            client_id,
            sender_id,
            sequence_number,
            records,
        }
    }

    pub fn eof(client_id: u32, sender_id: Option<SenderId>, sequence_number: u32) -> Self {
        Self::new(client_id, sender_id, sequence_number, Vec::new())
    }

    pub fn is_eof(&self) -> bool {
        self.records.is_empty()
    }

    /// Copy of the batch whose messages only keep the requested fields.
    pub fn copy_keeping_fields(&self, fields: &[Field]) -> Self {
        let records = self
            .records
            .iter()
            .map(|record| match record {
                Record::Message(msg) => Record::Message(msg.keeping_fields(fields)),
                line => line.clone(),
            })
            .collect();
        Self {
            records,
            ..self.clone()
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        if self.records.len() > MAX_RECORDS {
            return Err(CodecError::TooManyMessages(self.records.len()));
        }
        let sender = self.sender_id.unwrap_or(NO_SENDER);

        let mut out = Vec::with_capacity(HEADER_LEN + self.records.len() * 32);
        out.extend_from_slice(&self.client_id.to_be_bytes());
        out.extend_from_slice(&sender.query.to_be_bytes());
        out.extend_from_slice(&sender.pool.to_be_bytes());
        out.extend_from_slice(&sender.index.to_be_bytes());
        out.extend_from_slice(&self.sequence_number.to_be_bytes());
        out.push(self.records.len() as u8);
        for record in &self.records {
            codec::encode(record, &mut out)?;
        }
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = ByteReader::new(bytes);
        let (client_id, sender_id, sequence_number, count) = read_header(&mut reader)?;
        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            records.push(codec::decode_from(&mut reader)?);
        }
        if reader.remaining() != 0 {
            return Err(CodecError::MalformedRecord(format!(
                "{} trailing bytes after batch",
                reader.remaining()
            )));
        }
        Ok(Self::new(client_id, sender_id, sequence_number, records))
    }

    /// Reads one batch from a stream. An EOF batch consumes only the header.
    pub async fn decode_from_stream<R>(reader: &mut R) -> Result<Self, CodecError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header).await?;
        let (client_id, sender_id, sequence_number, count) =
            read_header(&mut ByteReader::new(&header))?;

        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            records.push(codec::decode_from_stream(reader).await?);
        }
        Ok(Self::new(client_id, sender_id, sequence_number, records))
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), CodecError>
    where
        W: AsyncWrite + Unpin,
    {
        let bytes = self.encode()?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }
}

fn read_header(
    reader: &mut ByteReader<'_>,
) -> Result<(u32, Option<SenderId>, u32, usize), CodecError> {
    let client_id = reader.read_u32()?;
    let sender = SenderId {
        query: reader.read_u16()?,
        pool: reader.read_u16()?,
        index: reader.read_u32()?,
    };
    let sequence_number = reader.read_u32()?;
    let count = reader.read_u8()? as usize;
    let sender_id = (sender != NO_SENDER).then_some(sender);
    Ok((client_id, sender_id, sequence_number, count))
}
