//! Explicit read cursor over a byte slice.
//!
//! Decoding walks the presence mask in a fixed order and pulls each field
//! through one of these calls; running past the end of the slice is a
//! `MalformedRecord`, never a panic.

use super::CodecError;

pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::MalformedRecord(format!(
                "needed {} bytes at offset {}, only {} left",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, CodecError> {
        Ok(f32::from_be_bytes(self.array()?))
    }

    /// Reads a big-endian unsigned length of `width` bytes (1, 2 or 4).
    pub fn read_length(&mut self, width: usize) -> Result<usize, CodecError> {
        match width {
            1 => Ok(self.read_u8()? as usize),
            2 => Ok(self.read_u16()? as usize),
            4 => Ok(self.read_u32()? as usize),
            other => Err(CodecError::MalformedRecord(format!(
                "unsupported length prefix width {}",
                other
            ))),
        }
    }

    pub fn read_string(&mut self, len: usize) -> Result<String, CodecError> {
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| CodecError::MalformedRecord(format!("invalid utf-8: {}", e)))
    }
}
