use super::StorageError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved pad byte for fixed strings. Never valid inside UTF-8.
pub const PAD_BYTE: u8 = 0xFF;

/// Declared on-disk shape of one column. Every record in a file has the same
/// width, which is what makes in-place updates possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    /// UTF-8 padded with `PAD_BYTE` up to `n` bytes.
    FixedStr(usize),
    /// Signed big-endian integer of `n` bytes (1, 2, 4 or 8).
    FixedInt(usize),
    /// IEEE-754 float of 4 or 8 bytes.
    FixedFloat(usize),
    /// `count:1 | cap × i32` zero padded to capacity.
    IntList(usize),
}

impl FieldType {
    pub fn width(&self) -> usize {
        match self {
            FieldType::FixedStr(n) | FieldType::FixedInt(n) | FieldType::FixedFloat(n) => *n,
            FieldType::IntList(cap) => 1 + 4 * cap,
        }
    }

    pub fn validate(&self) -> Result<(), StorageError> {
        match self {
            FieldType::FixedInt(1 | 2 | 4 | 8) | FieldType::FixedFloat(4 | 8) => Ok(()),
            FieldType::FixedStr(n) if *n > 0 => Ok(()),
            FieldType::IntList(cap) if *cap <= u8::MAX as usize => Ok(()),
            other => Err(StorageError::UnsupportedType(format!("{:?}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Key {
    Str(String),
    Int(i64),
}

impl Key {
    pub fn to_value(&self) -> Value {
        match self {
            Key::Str(s) => Value::Str(s.clone()),
            Key::Int(i) => Value::Int(*i),
        }
    }

    pub fn from_value(value: Value) -> Result<Self, StorageError> {
        match value {
            Value::Str(s) => Ok(Key::Str(s)),
            Value::Int(i) => Ok(Key::Int(i)),
            other => Err(StorageError::UnsupportedType(format!(
                "{:?} cannot be a key",
                other
            ))),
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Str(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Str(s)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Str(s) => f.write_str(s),
            Key::Int(i) => write!(f, "{}", i),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Str(String),
    Int(i64),
    Float(f64),
    IntList(Vec<i32>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

pub fn encode_field(ty: FieldType, value: &Value, out: &mut Vec<u8>) -> Result<(), StorageError> {
    match (ty, value) {
        (FieldType::FixedStr(n), Value::Str(s)) => {
            if s.len() > n {
                return Err(StorageError::ValueTooLong {
                    len: s.len(),
                    width: n,
                });
            }
            out.extend_from_slice(s.as_bytes());
            out.extend(std::iter::repeat_n(PAD_BYTE, n - s.len()));
        }
        (FieldType::FixedInt(n), Value::Int(i)) => {
            let bits = n * 8;
            if bits < 64 {
                let min = -(1i64 << (bits - 1));
                let max = (1i64 << (bits - 1)) - 1;
                if *i < min || *i > max {
                    return Err(StorageError::ValueTooLong { len: 8, width: n });
                }
            }
            out.extend_from_slice(&i.to_be_bytes()[8 - n..]);
        }
        (FieldType::FixedFloat(4), Value::Float(f)) => {
            out.extend_from_slice(&(*f as f32).to_be_bytes());
        }
        (FieldType::FixedFloat(8), Value::Float(f)) => {
            out.extend_from_slice(&f.to_be_bytes());
        }
        (FieldType::IntList(cap), Value::IntList(items)) => {
            if items.len() > cap {
                return Err(StorageError::TooManyValues {
                    count: items.len(),
                    capacity: cap,
                });
            }
            out.push(items.len() as u8);
            for item in items {
                out.extend_from_slice(&item.to_be_bytes());
            }
            out.extend(std::iter::repeat_n(0u8, 4 * (cap - items.len())));
        }
        (ty, value) => {
            return Err(StorageError::UnsupportedType(format!(
                "{:?} does not fit column {:?}",
                value, ty
            )));
        }
    }
    Ok(())
}

pub fn decode_field(ty: FieldType, bytes: &[u8]) -> Result<Value, StorageError> {
    if bytes.len() != ty.width() {
        return Err(StorageError::InvalidFile(format!(
            "field of {:?} has {} bytes",
            ty,
            bytes.len()
        )));
    }
    match ty {
        FieldType::FixedStr(_) => {
            let end = bytes
                .iter()
                .position(|b| *b == PAD_BYTE)
                .unwrap_or(bytes.len());
            String::from_utf8(bytes[..end].to_vec())
                .map(Value::Str)
                .map_err(|e| StorageError::InvalidFile(format!("bad string: {}", e)))
        }
        FieldType::FixedInt(n) => {
            let fill = if bytes[0] & 0x80 != 0 { 0xFF } else { 0x00 };
            let mut buf = [fill; 8];
            buf[8 - n..].copy_from_slice(bytes);
            Ok(Value::Int(i64::from_be_bytes(buf)))
        }
        FieldType::FixedFloat(4) => {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(bytes);
            Ok(Value::Float(f32::from_be_bytes(buf) as f64))
        }
        FieldType::FixedFloat(_) => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(bytes);
            Ok(Value::Float(f64::from_be_bytes(buf)))
        }
        FieldType::IntList(cap) => {
            let count = bytes[0] as usize;
            if count > cap {
                return Err(StorageError::InvalidFile(format!(
                    "list count {} over capacity {}",
                    count, cap
                )));
            }
            let items = bytes[1..1 + 4 * count]
                .chunks_exact(4)
                .map(|chunk| i32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect();
            Ok(Value::IntList(items))
        }
    }
}
