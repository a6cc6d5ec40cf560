// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::ed25519::{SignatureError, VerifyingKey};
use crate::crypto::x25519::PublicKey;
use crate::key_bundle::{OneTimePreKey, SignedPreKey};

/// Public keys of a device uploaded to the key-bundle service.
///
/// Contains a batch of one-time pre-keys, the service hands out at most one of them per fetched
/// bundle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyBundle {
    pub identity_key: PublicKey,
    pub signing_key: VerifyingKey,
    pub signed_prekey: SignedPreKey,
    pub onetime_prekeys: Vec<OneTimePreKey>,
}

impl PublicKeyBundle {
    /// Projection of this bundle as another peer would fetch it, optionally with one of the
    /// one-time pre-keys.
    pub fn to_received(&self, onetime_prekey: Option<OneTimePreKey>) -> ReceivedKeyBundle {
        ReceivedKeyBundle {
            identity_key: self.identity_key,
            signing_key: self.signing_key,
            signed_prekey: self.signed_prekey,
            onetime_prekey,
        }
    }
}

/// Key bundle of another peer as fetched from the key-bundle service.
///
/// The one-time pre-key is missing when the peer's pool was exhausted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedKeyBundle {
    pub identity_key: PublicKey,
    pub signing_key: VerifyingKey,
    pub signed_prekey: SignedPreKey,
    pub onetime_prekey: Option<OneTimePreKey>,
}

impl ReceivedKeyBundle {
    /// Checks that the signed pre-key was signed by the identity of this bundle.
    pub fn verify(&self) -> Result<(), KeyBundleError> {
        self.signing_key.verify(
            self.signed_prekey.key.as_bytes(),
            &self.signed_prekey.signature,
        )?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum KeyBundleError {
    #[error("invalid signed pre-key signature: {0}")]
    Signature(#[from] SignatureError),
}
