// SPDX-License-Identifier: MIT OR Apache-2.0

//! Encoding of persisted records and wire blobs in [CBOR] format.
//!
//! [CBOR]: https://cbor.io/
use ciborium::de::Error as DeserializeError;
use ciborium::ser::Error as SerializeError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Serializes a value into CBOR format.
pub fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, CborError> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes).map_err(|err| match err {
        SerializeError::Io(err) => CborError::Io(err.to_string()),
        SerializeError::Value(err) => CborError::Value(err),
    })?;
    Ok(bytes)
}

/// Deserializes a value which was formatted in CBOR.
pub fn decode_cbor<T: for<'a> Deserialize<'a>>(bytes: &[u8]) -> Result<T, CborError> {
    ciborium::from_reader::<T, _>(bytes).map_err(|err| match err {
        DeserializeError::Io(err) => CborError::Io(err.to_string()),
        DeserializeError::Syntax(offset) => CborError::Syntax(offset),
        DeserializeError::Semantic(_, err) => CborError::Value(err),
        DeserializeError::RecursionLimitExceeded => CborError::RecursionLimitExceeded,
    })
}

#[derive(Debug, Error)]
pub enum CborError {
    #[error("an error occurred while reading or writing bytes: {0}")]
    Io(String),

    #[error("an error occurred while parsing bytes at position {0}")]
    Syntax(usize),

    #[error("invalid value: {0}")]
    Value(String),

    #[error("recursion limit exceeded while decoding")]
    RecursionLimitExceeded,
}
