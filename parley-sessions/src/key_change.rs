// SPDX-License-Identifier: MIT OR Apache-2.0

//! Detection of changed identity keys of contacts.
//!
//! The first key seen for a contact is trusted silently (trust on first use). A later,
//! different key raises a [`KeyChangeEvent`] and stays untrusted until the user acknowledges
//! it, ideally after comparing [safety numbers](parley_encryption::SafetyNumber).
use base64::prelude::{BASE64_STANDARD, Engine as _};
use parley_encryption::crypto::x25519::PublicKey;
use thiserror::Error;
use tracing::{debug, warn};

use crate::record::{RecordError, load_record, store_record};
use crate::traits::{IdentityTrustService, KeyValueStore};

fn known_key(contact_id: &str) -> String {
    format!("known_identity_keys/{contact_id}")
}

/// A contact's identity key differs from the one seen before.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyChangeEvent {
    pub contact_id: String,
    pub display_name: String,
    pub identity_key: PublicKey,
}

pub struct KeyChangeDetector<S, T> {
    store: S,
    trust: T,
}

impl<S, T> KeyChangeDetector<S, T>
where
    S: KeyValueStore,
    T: IdentityTrustService,
{
    pub fn new(store: S, trust: T) -> Self {
        Self { store, trust }
    }

    /// Compares a freshly fetched identity key with the last known one.
    pub async fn check(
        &self,
        contact_id: &str,
        display_name: &str,
        identity_key: &PublicKey,
    ) -> Result<Option<KeyChangeEvent>, KeyChangeError> {
        let encoded = BASE64_STANDARD.encode(identity_key.as_bytes());

        match self.known_identity_key_encoded(contact_id).await? {
            None => {
                self.trust
                    .update_known_identity_key(contact_id, identity_key)
                    .await
                    .map_err(|err| KeyChangeError::Network(format!("{err:?}")))?;
                store_record(&self.store, &known_key(contact_id), &encoded).await?;
                debug!(contact = contact_id, "trusting identity key on first use");
                Ok(None)
            }
            Some(known) if known == encoded => Ok(None),
            Some(_) => {
                warn!(contact = contact_id, "identity key changed");
                Ok(Some(KeyChangeEvent {
                    contact_id: contact_id.to_owned(),
                    display_name: display_name.to_owned(),
                    identity_key: *identity_key,
                }))
            }
        }
    }

    /// Accepts a contact's new identity key.
    ///
    /// `verified` marks that the user compared safety numbers, the server then records the key
    /// as verified instead of only as known.
    pub async fn acknowledge(
        &self,
        contact_id: &str,
        identity_key: &PublicKey,
        verified: bool,
    ) -> Result<(), KeyChangeError> {
        let encoded = BASE64_STANDARD.encode(identity_key.as_bytes());
        store_record(&self.store, &known_key(contact_id), &encoded).await?;

        let result = if verified {
            self.trust.verify_identity_key(contact_id, identity_key).await
        } else {
            self.trust
                .update_known_identity_key(contact_id, identity_key)
                .await
        };
        result.map_err(|err| KeyChangeError::Network(format!("{err:?}")))?;

        debug!(contact = contact_id, verified, "acknowledged identity key");
        Ok(())
    }

    /// Last known identity key of a contact.
    pub async fn known_identity_key(
        &self,
        contact_id: &str,
    ) -> Result<Option<PublicKey>, KeyChangeError> {
        let Some(encoded) = self.known_identity_key_encoded(contact_id).await? else {
            return Ok(None);
        };
        let bytes = BASE64_STANDARD
            .decode(&encoded)
            .map_err(|_| KeyChangeError::InvalidKnownKey(contact_id.to_owned()))?;
        let identity_key = PublicKey::try_from(bytes.as_slice())
            .map_err(|_| KeyChangeError::InvalidKnownKey(contact_id.to_owned()))?;
        Ok(Some(identity_key))
    }

    async fn known_identity_key_encoded(
        &self,
        contact_id: &str,
    ) -> Result<Option<String>, KeyChangeError> {
        Ok(load_record(&self.store, &known_key(contact_id)).await?)
    }
}

#[derive(Debug, Error)]
pub enum KeyChangeError {
    #[error(transparent)]
    Record(#[from] RecordError),

    #[error("identity trust service failed: {0}")]
    Network(String),

    #[error("stored identity key of {0} is not a valid key")]
    InvalidKnownKey(String),
}
