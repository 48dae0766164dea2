//! Canonical CBOR encoder.

use crate::value::{uint_len, unsigned_argument, Value};

/// Encodes a value to canonical CBOR bytes.
///
/// Integers and lengths use their shortest head and map entries are
/// written in canonical key order, so equal values always produce equal
/// bytes.
pub fn to_canonical_cbor(value: &Value) -> Vec<u8> {
    let mut encoder = CanonicalEncoder::with_capacity(encoded_len(value));
    encoder.encode(value);
    encoder.into_bytes()
}

/// Returns the exact number of bytes [`to_canonical_cbor`] produces for
/// `value`, without allocating the encoding.
pub fn encoded_len(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) => 1,
        Value::Integer(n) => uint_len(unsigned_argument(*n)),
        Value::Text(s) => uint_len(s.len() as u64) + s.len(),
        Value::Bytes(b) => uint_len(b.len() as u64) + b.len(),
        Value::Array(items) => {
            uint_len(items.len() as u64) + items.iter().map(encoded_len).sum::<usize>()
        }
        Value::Map(pairs) => {
            uint_len(pairs.len() as u64)
                + pairs
                    .iter()
                    .map(|(k, v)| encoded_len(k) + encoded_len(v))
                    .sum::<usize>()
        }
    }
}

/// A canonical CBOR encoder writing into an owned buffer.
#[derive(Debug, Default)]
pub struct CanonicalEncoder {
    buffer: Vec<u8>,
}

impl CanonicalEncoder {
    /// Creates an empty encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an encoder with a preallocated buffer.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Appends one value.
    pub fn encode(&mut self, value: &Value) {
        match value {
            Value::Null => self.buffer.push(0xf6),
            Value::Bool(b) => self.buffer.push(if *b { 0xf5 } else { 0xf4 }),
            Value::Integer(n) => {
                let major = if *n >= 0 { 0 } else { 1 };
                self.head(major, unsigned_argument(*n));
            }
            Value::Bytes(b) => {
                self.head(2, b.len() as u64);
                self.buffer.extend_from_slice(b);
            }
            Value::Text(s) => {
                self.head(3, s.len() as u64);
                self.buffer.extend_from_slice(s.as_bytes());
            }
            Value::Array(items) => {
                self.head(4, items.len() as u64);
                for item in items {
                    self.encode(item);
                }
            }
            Value::Map(pairs) => {
                self.head(5, pairs.len() as u64);
                let mut order: Vec<&(Value, Value)> = pairs.iter().collect();
                order.sort_by(|a, b| a.0.cmp_canonical(&b.0));
                for (k, v) in order {
                    self.encode(k);
                    self.encode(v);
                }
            }
        }
    }

    /// Returns the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    #[allow(clippy::cast_possible_truncation)]
    fn head(&mut self, major: u8, n: u64) {
        let mt = major << 5;
        match uint_len(n) {
            1 => self.buffer.push(mt | n as u8),
            2 => self.buffer.extend_from_slice(&[mt | 24, n as u8]),
            3 => {
                self.buffer.push(mt | 25);
                self.buffer.extend_from_slice(&(n as u16).to_be_bytes());
            }
            5 => {
                self.buffer.push(mt | 26);
                self.buffer.extend_from_slice(&(n as u32).to_be_bytes());
            }
            _ => {
                self.buffer.push(mt | 27);
                self.buffer.extend_from_slice(&n.to_be_bytes());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_values() {
        assert_eq!(to_canonical_cbor(&Value::Null), vec![0xf6]);
        assert_eq!(to_canonical_cbor(&Value::Bool(false)), vec![0xf4]);
        assert_eq!(to_canonical_cbor(&Value::Bool(true)), vec![0xf5]);
    }

    #[test]
    fn integers_use_shortest_head() {
        assert_eq!(to_canonical_cbor(&Value::Integer(23)), vec![0x17]);
        assert_eq!(to_canonical_cbor(&Value::Integer(24)), vec![0x18, 24]);
        assert_eq!(to_canonical_cbor(&Value::Integer(256)), vec![0x19, 0x01, 0x00]);
        assert_eq!(to_canonical_cbor(&Value::Integer(-1)), vec![0x20]);
        assert_eq!(to_canonical_cbor(&Value::Integer(-25)), vec![0x38, 24]);
    }

    #[test]
    fn text_and_bytes() {
        assert_eq!(to_canonical_cbor(&Value::from("ab")), vec![0x62, b'a', b'b']);
        assert_eq!(to_canonical_cbor(&Value::Bytes(vec![9])), vec![0x41, 9]);
    }

    #[test]
    fn unsorted_map_is_written_sorted() {
        let unsorted = Value::Map(vec![
            (Value::from("bb"), Value::Integer(1)),
            (Value::from("a"), Value::Integer(2)),
        ]);
        let sorted = Value::map(vec![
            (Value::from("a"), Value::Integer(2)),
            (Value::from("bb"), Value::Integer(1)),
        ]);
        assert_eq!(to_canonical_cbor(&unsorted), to_canonical_cbor(&sorted));
    }

    #[test]
    fn encoded_len_matches_encoding() {
        let value = Value::text_map([
            ("table", Value::from("Contact")),
            ("tick", Value::Integer(70_000)),
            (
                "record",
                Value::Array(vec![Value::Null, Value::Integer(-300), Value::Bytes(vec![0; 40])]),
            ),
        ]);
        assert_eq!(encoded_len(&value), to_canonical_cbor(&value).len());
    }
}
