// SPDX-License-Identifier: MIT OR Apache-2.0

//! CBOR-encoded records on top of a [`KeyValueStore`].
use parley_encryption::cbor::{CborError, decode_cbor, encode_cbor};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::traits::KeyValueStore;

pub(crate) async fn load_record<S, T>(store: &S, key: &str) -> Result<Option<T>, RecordError>
where
    S: KeyValueStore,
    T: DeserializeOwned,
{
    let Some(bytes) = store
        .get(key)
        .await
        .map_err(|err| RecordError::Store(format!("{err:?}")))?
    else {
        return Ok(None);
    };
    Ok(Some(decode_cbor(&bytes)?))
}

pub(crate) async fn store_record<S, T>(store: &S, key: &str, value: &T) -> Result<(), RecordError>
where
    S: KeyValueStore,
    T: Serialize,
{
    let bytes = encode_cbor(value)?;
    store
        .set(key, bytes)
        .await
        .map_err(|err| RecordError::Store(format!("{err:?}")))
}

pub(crate) async fn delete_record<S>(store: &S, key: &str) -> Result<(), RecordError>
where
    S: KeyValueStore,
{
    store
        .delete(key)
        .await
        .map_err(|err| RecordError::Store(format!("{err:?}")))
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("key-value store failed: {0}")]
    Store(String),

    #[error("invalid record encoding: {0}")]
    Cbor(#[from] CborError),
}
