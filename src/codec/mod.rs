//! Length-tagged, type-tagged binary codec.
//!
//! Every serialized value is `u32 tag_len (LE) | utf8 type tag | payload`.
//! Primitive payloads are fixed-width little-endian; strings and byte
//! arrays are raw. The tag travels with the bytes, so readers can dispatch
//! without out-of-band schema.

pub mod entry;

pub use entry::{LOG_ENTRY_TAG, LogOp, LogRecord};

use crate::errors::DbError;

const TAG_NULL: &str = "null";
const TAG_I32: &str = "i32";
const TAG_I64: &str = "i64";
const TAG_F64: &str = "f64";
const TAG_BOOL: &str = "bool";
const TAG_DATETIME: &str = "datetime";
const TAG_STRING: &str = "string";
const TAG_BYTES: &str = "bytes";

/// A self-describing primitive value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    I32(i32),
    I64(i64),
    F64(f64),
    Bool(bool),
    /// Microseconds since the Unix epoch.
    DateTime(i64),
    Str(String),
    Bytes(Vec<u8>),
}

impl Value {
    #[must_use]
    pub const fn type_tag(&self) -> &'static str {
        match self {
            Self::Null => TAG_NULL,
            Self::I32(_) => TAG_I32,
            Self::I64(_) => TAG_I64,
            Self::F64(_) => TAG_F64,
            Self::Bool(_) => TAG_BOOL,
            Self::DateTime(_) => TAG_DATETIME,
            Self::Str(_) => TAG_STRING,
            Self::Bytes(_) => TAG_BYTES,
        }
    }
}

/// Serialize a value into its tagged frame.
#[must_use]
pub fn serialize(value: &Value) -> Vec<u8> {
    let tag = value.type_tag().as_bytes();
    let payload: Vec<u8> = match value {
        Value::Null => Vec::new(),
        Value::I32(v) => v.to_le_bytes().to_vec(),
        Value::I64(v) | Value::DateTime(v) => v.to_le_bytes().to_vec(),
        Value::F64(v) => v.to_le_bytes().to_vec(),
        Value::Bool(v) => vec![u8::from(*v)],
        Value::Str(s) => s.as_bytes().to_vec(),
        Value::Bytes(b) => b.clone(),
    };
    let mut out = Vec::with_capacity(4 + tag.len() + payload.len());
    out.extend_from_slice(&u32::try_from(tag.len()).expect("short tag").to_le_bytes());
    out.extend_from_slice(tag);
    out.extend_from_slice(&payload);
    out
}

/// Peek the type tag of a serialized frame without decoding the payload.
///
/// # Errors
/// `Corruption` on a truncated frame or non-UTF-8 tag.
pub fn serialized_type(bytes: &[u8]) -> Result<String, DbError> {
    if bytes.is_empty() {
        return Ok(TAG_NULL.to_string());
    }
    let (tag, _) = split_frame(bytes)?;
    Ok(tag.to_string())
}

/// Deserialize a tagged frame. Empty input is `Value::Null`.
///
/// # Errors
/// `Corruption` on a truncated frame, unknown tag, or malformed payload.
pub fn deserialize(bytes: &[u8]) -> Result<Value, DbError> {
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    let (tag, payload) = split_frame(bytes)?;
    match tag {
        TAG_NULL => Ok(Value::Null),
        TAG_I32 => Ok(Value::I32(i32::from_le_bytes(fixed(payload)?))),
        TAG_I64 => Ok(Value::I64(i64::from_le_bytes(fixed(payload)?))),
        TAG_F64 => Ok(Value::F64(f64::from_le_bytes(fixed(payload)?))),
        TAG_DATETIME => Ok(Value::DateTime(i64::from_le_bytes(fixed(payload)?))),
        TAG_BOOL => match payload {
            [0] => Ok(Value::Bool(false)),
            [1] => Ok(Value::Bool(true)),
            _ => Err(DbError::Corruption("bool payload must be one byte 0/1".into())),
        },
        TAG_STRING => {
            let s = std::str::from_utf8(payload)
                .map_err(|e| DbError::Corruption(format!("string payload not UTF-8: {e}")))?;
            Ok(Value::Str(s.to_string()))
        }
        TAG_BYTES => Ok(Value::Bytes(payload.to_vec())),
        other => Err(DbError::Corruption(format!("unknown type tag {other:?}"))),
    }
}

/// Split a frame into `(tag, payload)`.
fn split_frame(bytes: &[u8]) -> Result<(&str, &[u8]), DbError> {
    if bytes.len() < 4 {
        return Err(DbError::Corruption("frame shorter than tag length".into()));
    }
    let tag_len = u32::from_le_bytes(bytes[..4].try_into().expect("4-byte slice")) as usize;
    if tag_len == 0 || tag_len > 64 || bytes.len() < 4 + tag_len {
        return Err(DbError::Corruption(format!("implausible tag length {tag_len}")));
    }
    let tag = std::str::from_utf8(&bytes[4..4 + tag_len])
        .map_err(|e| DbError::Corruption(format!("type tag not UTF-8: {e}")))?;
    Ok((tag, &bytes[4 + tag_len..]))
}

fn fixed<const N: usize>(payload: &[u8]) -> Result<[u8; N], DbError> {
    payload
        .try_into()
        .map_err(|_| DbError::Corruption(format!("expected {N}-byte payload, got {}", payload.len())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_primitives() {
        let values = [
            Value::Null,
            Value::I32(-7),
            Value::I64(1 << 40),
            Value::F64(3.5),
            Value::Bool(true),
            Value::DateTime(1_722_000_000_000_000),
            Value::Str("döcument".into()),
            Value::Bytes(vec![0, 1, 2, 255]),
        ];
        for v in values {
            let bytes = serialize(&v);
            assert_eq!(deserialize(&bytes).unwrap(), v);
            assert_eq!(serialized_type(&bytes).unwrap(), v.type_tag());
        }
    }

    #[test]
    fn empty_input_is_null() {
        assert_eq!(deserialize(&[]).unwrap(), Value::Null);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.extend_from_slice(b"zzzz");
        assert!(matches!(deserialize(&bytes), Err(DbError::Corruption(_))));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut bytes = serialize(&Value::I64(42));
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(deserialize(&bytes), Err(DbError::Corruption(_))));
    }
}
