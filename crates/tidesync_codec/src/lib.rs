//! # tidesync codec
//!
//! Dynamic values and canonical CBOR encoding for tidesync.
//!
//! Every wire message of the sync protocol is built as a [`Value`] tree and
//! written with [`to_canonical_cbor`]. Canonical form matters for more than
//! interoperability: the request pipeline bounds its offline buffer by the
//! exact encoded size of each pending request ([`encoded_len`]), so two
//! clients holding the same mutations account the same number of bytes.
//!
//! ## Canonical rules
//!
//! - Integers and lengths use the shortest head
//! - Map keys are ordered by their encoding (length first, then bytes)
//! - No floats, no tags, no indefinite-length items
//!
//! ## Usage
//!
//! ```
//! use tidesync_codec::{from_cbor, to_canonical_cbor, Value};
//!
//! let value = Value::text_map([("table", Value::from("Contact"))]);
//! let bytes = to_canonical_cbor(&value);
//! assert_eq!(from_cbor(&bytes).unwrap(), value);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod encoder;
mod error;
mod fields;
mod value;

pub use decoder::{from_cbor, CanonicalDecoder};
pub use encoder::{encoded_len, to_canonical_cbor, CanonicalEncoder};
pub use error::{CodecError, CodecResult};
pub use fields::Fields;
pub use value::Value;

/// A type with a wire representation as a [`Value`] tree.
pub trait WireEncode {
    /// Builds the value tree.
    fn to_value(&self) -> Value;

    /// Encodes to canonical CBOR bytes.
    fn encode(&self) -> Vec<u8> {
        to_canonical_cbor(&self.to_value())
    }

    /// Exact size of [`WireEncode::encode`]'s output.
    fn encoded_len(&self) -> usize {
        encoded_len(&self.to_value())
    }
}

/// A type that can be rebuilt from its wire [`Value`] tree.
pub trait WireDecode: Sized {
    /// Rebuilds from a value tree.
    fn from_value(value: &Value) -> CodecResult<Self>;

    /// Decodes from canonical CBOR bytes.
    fn decode(bytes: &[u8]) -> CodecResult<Self> {
        Self::from_value(&from_cbor(bytes)?)
    }
}

impl WireEncode for Value {
    fn to_value(&self) -> Value {
        self.clone()
    }

    fn encoded_len(&self) -> usize {
        encoded_len(self)
    }
}

impl WireDecode for Value {
    fn from_value(value: &Value) -> CodecResult<Self> {
        Ok(value.clone())
    }
}
