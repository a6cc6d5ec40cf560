// SPDX-License-Identifier: MIT OR Apache-2.0

//! Extended Triple Diffie-Hellman (X3DH) key agreement protocol as specified by Signal.
//!
//! X3DH establishes a shared secret between two parties who mutually authenticate each other
//! based on public keys. It is designed for asynchronous settings where the responder ("Bob") is
//! offline but has published a key bundle to a server. The initiator ("Alice") uses that bundle to
//! derive the secret and sends the information Bob needs to derive the same secret along with her
//! first message (see [`X3dhHeader`]).
//!
//! The handshake is stateless, both functions are pure.
//!
//! <https://signal.org/docs/specifications/x3dh/>
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::crypto::Secret;
use crate::crypto::hkdf::{HkdfError, hkdf};
use crate::crypto::x25519::{PublicKey, SHARED_SECRET_SIZE, SecretKey, X25519Error};
use crate::key_bundle::{
    IdentityKeyPair, KeyBundleError, OneTimePreKeyId, OneTimePreKeyRecord, PreKeyId,
    ReceivedKeyBundle, SignedPreKeyRecord,
};

/// ASCII string identifying the application as specified in X3DH used for KDF.
const KDF_INFO: &[u8] = b"parley_x3dh";

/// "Discontinuity bytes" prepended to the DH outputs before deriving the secret.
const KDF_PADDING: [u8; 32] = [0xFF; 32];

/// Secret both parties derive from the handshake, input for the root key of a Double Ratchet.
pub type X3dhSecret = Secret<SHARED_SECRET_SIZE>;

/// Session-initiation information attached to the first message of a new session.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct X3dhHeader {
    pub sender_identity_key: PublicKey,
    pub ephemeral_key: PublicKey,
    #[serde(rename = "usedSignedPreKeyId")]
    pub used_signed_prekey_id: PreKeyId,
    #[serde(rename = "usedOneTimePreKeyId")]
    pub used_onetime_prekey_id: Option<OneTimePreKeyId>,
}

/// Result of the initiating side of X3DH.
#[derive(Debug)]
pub struct X3dhInitiated {
    pub shared_secret: X3dhSecret,
    pub header: X3dhHeader,
}

/// Derives the shared secret as initiator from our identity, a fresh ephemeral key and the
/// other party's key bundle.
///
/// The signature of their signed pre-key is verified first. A bundle without one-time pre-key
/// is valid, the handshake then runs with one Diffie-Hellman term less.
pub fn x3dh_initiate(
    our_identity: &IdentityKeyPair,
    our_ephemeral_secret: &SecretKey,
    their_bundle: &ReceivedKeyBundle,
) -> Result<X3dhInitiated, X3dhError> {
    their_bundle.verify()?;

    let mut ikm = Vec::with_capacity(32 * 5);
    ikm.extend_from_slice(&KDF_PADDING);

    // DH1 = DH(IKA, SPKB)
    let dh1 = our_identity
        .secret()
        .calculate_agreement(&their_bundle.signed_prekey.key)?;
    ikm.extend_from_slice(dh1.as_bytes());

    // DH2 = DH(EKA, IKB)
    let dh2 = our_ephemeral_secret.calculate_agreement(&their_bundle.identity_key)?;
    ikm.extend_from_slice(dh2.as_bytes());

    // DH3 = DH(EKA, SPKB)
    let dh3 = our_ephemeral_secret.calculate_agreement(&their_bundle.signed_prekey.key)?;
    ikm.extend_from_slice(dh3.as_bytes());

    // DH4 = DH(EKA, OPKB)
    match &their_bundle.onetime_prekey {
        Some(onetime_prekey) => {
            let dh4 = our_ephemeral_secret.calculate_agreement(&onetime_prekey.key)?;
            ikm.extend_from_slice(dh4.as_bytes());
        }
        None => debug!("x3dh initiated without one-time pre-key"),
    }

    let shared_secret = derive_secret(ikm)?;

    Ok(X3dhInitiated {
        shared_secret,
        header: X3dhHeader {
            sender_identity_key: *our_identity.identity_key(),
            ephemeral_key: our_ephemeral_secret.public_key(),
            used_signed_prekey_id: their_bundle.signed_prekey.id,
            used_onetime_prekey_id: their_bundle.onetime_prekey.map(|key| key.id),
        },
    })
}

/// Derives the shared secret as responder, using our locally held pre-key secrets referenced by
/// the initiator's header.
///
/// Fails when the header refers to a signed pre-key we don't hold (anymore) or to a one-time
/// pre-key which is unknown or was already consumed.
pub fn x3dh_respond(
    our_identity: &IdentityKeyPair,
    our_signed_prekey: &SignedPreKeyRecord,
    our_onetime_prekey: Option<&OneTimePreKeyRecord>,
    their_header: &X3dhHeader,
) -> Result<X3dhSecret, X3dhError> {
    if their_header.used_signed_prekey_id != our_signed_prekey.id() {
        return Err(X3dhError::SignedPreKeyMismatch {
            expected: our_signed_prekey.id(),
            received: their_header.used_signed_prekey_id,
        });
    }

    let onetime_secret = match their_header.used_onetime_prekey_id {
        Some(id) => match our_onetime_prekey {
            Some(record) if record.id() == id => Some(record.secret()),
            _ => return Err(X3dhError::UnknownOneTimePreKey(id)),
        },
        None => {
            debug!("x3dh responding without one-time pre-key");
            None
        }
    };

    let mut ikm = Vec::with_capacity(32 * 5);
    ikm.extend_from_slice(&KDF_PADDING);

    // DH1 = DH(IKA, SPKB)
    let dh1 = our_signed_prekey
        .secret()
        .calculate_agreement(&their_header.sender_identity_key)?;
    ikm.extend_from_slice(dh1.as_bytes());

    // DH2 = DH(EKA, IKB)
    let dh2 = our_identity
        .secret()
        .calculate_agreement(&their_header.ephemeral_key)?;
    ikm.extend_from_slice(dh2.as_bytes());

    // DH3 = DH(EKA, SPKB)
    let dh3 = our_signed_prekey
        .secret()
        .calculate_agreement(&their_header.ephemeral_key)?;
    ikm.extend_from_slice(dh3.as_bytes());

    // DH4 = DH(EKA, OPKB)
    if let Some(onetime_secret) = onetime_secret {
        let dh4 = onetime_secret.calculate_agreement(&their_header.ephemeral_key)?;
        ikm.extend_from_slice(dh4.as_bytes());
    }

    derive_secret(ikm)
}

fn derive_secret(mut ikm: Vec<u8>) -> Result<X3dhSecret, X3dhError> {
    let salt = [0u8; 32];
    let secret: Result<[u8; SHARED_SECRET_SIZE], HkdfError> = hkdf(&salt, &ikm, Some(KDF_INFO));
    zeroize::Zeroize::zeroize(&mut ikm);
    Ok(Secret::from_bytes(secret?))
}

#[derive(Debug, Error)]
pub enum X3dhError {
    #[error(transparent)]
    Hkdf(#[from] HkdfError),

    #[error(transparent)]
    X25519(#[from] X25519Error),

    #[error(transparent)]
    KeyBundle(#[from] KeyBundleError),

    #[error("signed pre-key {received} was used but we hold {expected}")]
    SignedPreKeyMismatch { expected: PreKeyId, received: PreKeyId },

    #[error("one-time pre-key {0} is unknown or was already used")]
    UnknownOneTimePreKey(OneTimePreKeyId),
}
