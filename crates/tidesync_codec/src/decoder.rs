//! Canonical CBOR decoder.

use crate::error::{CodecError, CodecResult};
use crate::value::{uint_len, Value};

/// Largest element count accepted for arrays and maps.
const MAX_CONTAINER_ELEMENTS: u64 = 4 * 1024 * 1024;

/// Largest byte or text length accepted.
const MAX_BYTES_LENGTH: u64 = 64 * 1024 * 1024;

/// Decodes exactly one value from `bytes`.
///
/// # Errors
///
/// Fails on malformed or non-canonical input, on floats and
/// indefinite-length items, and when bytes remain after the value.
pub fn from_cbor(bytes: &[u8]) -> CodecResult<Value> {
    let mut decoder = CanonicalDecoder::new(bytes);
    let value = decoder.decode()?;
    if !decoder.is_empty() {
        return Err(CodecError::TrailingBytes {
            remaining: bytes.len() - decoder.pos,
        });
    }
    Ok(value)
}

/// A decoder over a borrowed buffer.
pub struct CanonicalDecoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> CanonicalDecoder<'a> {
    /// Creates a decoder positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Returns true once every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Decodes the next value.
    pub fn decode(&mut self) -> CodecResult<Value> {
        let initial = self.byte()?;
        let major = initial >> 5;
        let info = initial & 0x1f;

        match major {
            0 => {
                let n = self.argument(info)?;
                i64::try_from(n)
                    .map(Value::Integer)
                    .map_err(|_| CodecError::invalid_structure("integer out of range"))
            }
            1 => {
                let n = self.argument(info)?;
                i64::try_from(n)
                    .map(|n| Value::Integer(-1 - n))
                    .map_err(|_| CodecError::invalid_structure("integer out of range"))
            }
            2 => {
                let len = self.length(info, MAX_BYTES_LENGTH)?;
                Ok(Value::Bytes(self.take(len)?.to_vec()))
            }
            3 => {
                let len = self.length(info, MAX_BYTES_LENGTH)?;
                let raw = self.take(len)?;
                let text = std::str::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8)?;
                Ok(Value::Text(text.to_string()))
            }
            4 => {
                let len = self.length(info, MAX_CONTAINER_ELEMENTS)?;
                let mut items = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    items.push(self.decode()?);
                }
                Ok(Value::Array(items))
            }
            5 => self.map(info),
            6 => Err(CodecError::invalid_structure("tagged values are not supported")),
            _ => match info {
                20 => Ok(Value::Bool(false)),
                21 => Ok(Value::Bool(true)),
                22 | 23 => Ok(Value::Null),
                25..=27 => Err(CodecError::FloatForbidden),
                31 => Err(CodecError::IndefiniteLength),
                other => Err(CodecError::invalid_structure(format!(
                    "unsupported simple value {other}"
                ))),
            },
        }
    }

    fn map(&mut self, info: u8) -> CodecResult<Value> {
        let len = self.length(info, MAX_CONTAINER_ELEMENTS)?;
        let mut pairs: Vec<(Value, Value)> = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            let key = self.decode()?;
            if let Some((prev, _)) = pairs.last() {
                if prev.cmp_canonical(&key) != std::cmp::Ordering::Less {
                    return Err(CodecError::invalid_structure("map keys out of canonical order"));
                }
            }
            let value = self.decode()?;
            pairs.push((key, value));
        }
        Ok(Value::Map(pairs))
    }

    fn byte(&mut self) -> CodecResult<u8> {
        let b = *self.data.get(self.pos).ok_or(CodecError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(CodecError::UnexpectedEof)?;
        let slice = self.data.get(self.pos..end).ok_or(CodecError::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }

    fn length(&mut self, info: u8, limit: u64) -> CodecResult<usize> {
        let claimed = self.argument(info)?;
        if claimed > limit {
            return Err(CodecError::SizeLimitExceeded { claimed, limit });
        }
        usize::try_from(claimed).map_err(|_| CodecError::SizeLimitExceeded { claimed, limit })
    }

    fn argument(&mut self, info: u8) -> CodecResult<u64> {
        let n = match info {
            0..=23 => return Ok(u64::from(info)),
            24 => u64::from(self.byte()?),
            25 => {
                let b = self.take(2)?;
                u64::from(u16::from_be_bytes([b[0], b[1]]))
            }
            26 => {
                let b = self.take(4)?;
                u64::from(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            }
            27 => {
                let b = self.take(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                u64::from_be_bytes(raw)
            }
            31 => return Err(CodecError::IndefiniteLength),
            _ => return Err(CodecError::invalid_structure("reserved additional info")),
        };
        let expected = match info {
            24 => 2,
            25 => 3,
            26 => 5,
            _ => 9,
        };
        if uint_len(n) != expected {
            return Err(CodecError::invalid_structure(
                "non-canonical: argument has a shorter encoding",
            ));
        }
        Ok(n)
    }
}
