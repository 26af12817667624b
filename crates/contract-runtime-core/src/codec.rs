//! Key/typed-value parameter codec.
//!
//! Call parameters cross the host/guest boundary as a flat sequence of
//! self-describing items:
//!
//! ```text
//! ┌──────────┬─────────┬─────┬────────────┬───────────┬───────┐
//! │ key_type │ key_len │ key │ value_type │ value_len │ value │
//! │  i32 LE  │ i32 LE  │     │   i32 LE   │  i32 LE   │       │
//! └──────────┴─────────┴─────┴────────────┴───────────┴───────┘
//! ```
//!
//! Items are written in key order so the same parameters always produce the
//! same bytes. Keys starting with `__` are system keys injected by the runtime.

use std::collections::{BTreeMap, HashSet};

use contract_runtime_common::{CodecError, Parameters};

const SYSTEM_KEY_PREFIX: &str = "__";

/// Who owns a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    /// Injected by the runtime.
    System = 0,
    /// Supplied by the caller.
    User = 1,
}

impl KeyType {
    fn of(key: &str) -> Self {
        if key.starts_with(SYSTEM_KEY_PREFIX) {
            Self::System
        } else {
            Self::User
        }
    }

    fn from_tag(tag: i32, offset: usize) -> Result<Self, CodecError> {
        match tag {
            0 => Ok(Self::System),
            1 => Ok(Self::User),
            _ => Err(CodecError::UnknownTag { tag, offset }),
        }
    }
}

/// A typed parameter value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int32(i32),
    String(String),
    Bytes(Vec<u8>),
}

impl Value {
    fn tag(&self) -> i32 {
        match self {
            Self::Int32(_) => 0,
            Self::String(_) => 1,
            Self::Bytes(_) => 2,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Self::Int32(v) => v.to_le_bytes().to_vec(),
            Self::String(s) => s.as_bytes().to_vec(),
            Self::Bytes(b) => b.clone(),
        }
    }

    /// The value's raw bytes; integers as little-endian.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Int32(v) => v.to_le_bytes().to_vec(),
            Self::String(s) => s.into_bytes(),
            Self::Bytes(b) => b,
        }
    }
}

/// One decoded item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key_type: KeyType,
    pub key: String,
    pub value: Value,
}

/// Encode byte-valued parameters.
///
/// # Errors
///
/// Returns [`CodecError::TooLarge`] if a key or value does not fit an `i32`
/// length prefix.
pub fn encode(params: &Parameters) -> Result<Vec<u8>, CodecError> {
    let items: BTreeMap<&str, Value> = params
        .iter()
        .map(|(k, v)| (k.as_str(), Value::Bytes(v.clone())))
        .collect();
    encode_items(&items)
}

/// Encode typed items, keyed by name.
///
/// # Errors
///
/// Returns [`CodecError::TooLarge`] if a key or value does not fit an `i32`
/// length prefix.
pub fn encode_items(items: &BTreeMap<&str, Value>) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    for (key, value) in items {
        let payload = value.payload();
        out.extend_from_slice(&(KeyType::of(key) as i32).to_le_bytes());
        write_chunk(&mut out, key.as_bytes())?;
        out.extend_from_slice(&value.tag().to_le_bytes());
        write_chunk(&mut out, &payload)?;
    }
    Ok(out)
}

/// Decode a payload produced by [`encode`] or [`encode_items`].
///
/// # Errors
///
/// Rejects truncated input, unknown tags, negative lengths, invalid UTF-8 in
/// keys or string values, and duplicate keys.
pub fn decode(bytes: &[u8]) -> Result<Vec<Item>, CodecError> {
    let mut reader = Reader { bytes, offset: 0 };
    let mut items: Vec<Item> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    while !reader.is_empty() {
        let tag_offset = reader.offset;
        let key_type = KeyType::from_tag(reader.read_i32()?, tag_offset)?;
        let key = String::from_utf8(reader.read_chunk()?.to_vec())
            .map_err(|_| CodecError::InvalidUtf8("key"))?;

        let tag_offset = reader.offset;
        let tag = reader.read_i32()?;
        let raw = reader.read_chunk()?;
        let value = match tag {
            0 => {
                let arr: [u8; 4] = raw.try_into().map_err(|_| CodecError::Truncated {
                    offset: reader.offset,
                })?;
                Value::Int32(i32::from_le_bytes(arr))
            }
            1 => Value::String(
                String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8("value"))?,
            ),
            2 => Value::Bytes(raw.to_vec()),
            _ => return Err(CodecError::UnknownTag { tag, offset: tag_offset }),
        };

        if !seen.insert(key.clone()) {
            return Err(CodecError::DuplicateKey(key));
        }
        items.push(Item {
            key_type,
            key,
            value,
        });
    }

    Ok(items)
}

fn write_chunk(out: &mut Vec<u8>, chunk: &[u8]) -> Result<(), CodecError> {
    let len = i32::try_from(chunk.len()).map_err(|_| CodecError::TooLarge { len: chunk.len() })?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(chunk);
    Ok(())
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn is_empty(&self) -> bool {
        self.offset >= self.bytes.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self
            .offset
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(CodecError::Truncated {
                offset: self.offset,
            })?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn read_i32(&mut self) -> Result<i32, CodecError> {
        let offset = self.offset;
        let arr: [u8; 4] = self
            .take(4)?
            .try_into()
            .map_err(|_| CodecError::Truncated { offset })?;
        Ok(i32::from_le_bytes(arr))
    }

    fn read_chunk(&mut self) -> Result<&'a [u8], CodecError> {
        let offset = self.offset;
        let len = self.read_i32()?;
        let len = usize::try_from(len).map_err(|_| CodecError::NegativeLength { len, offset })?;
        self.take(len)
    }
}
