// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};

use crate::crypto::ed25519::{Signature, SigningKey, VerifyingKey};
use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::crypto::{Rng, RngError};

/// Identifier of a signed pre-key.
pub type PreKeyId = u64;

/// Identifier of a one-time pre-key, monotonically increasing per device.
pub type OneTimePreKeyId = u64;

/// Long-term identity of a device: an X25519 key pair for X3DH and an Ed25519 key pair for
/// signing pre-keys.
///
/// Created once and never rotated. The secret halves never leave the device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKeyPair {
    secret: SecretKey,
    identity_key: PublicKey,
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl IdentityKeyPair {
    pub fn generate(rng: &Rng) -> Result<Self, RngError> {
        let secret = SecretKey::generate(rng)?;
        let signing_key = SigningKey::generate(rng)?;
        Ok(Self {
            identity_key: secret.public_key(),
            verifying_key: signing_key.verifying_key(),
            secret,
            signing_key,
        })
    }

    /// Public X25519 identity key.
    pub fn identity_key(&self) -> &PublicKey {
        &self.identity_key
    }

    /// Public Ed25519 key verifying signatures over our pre-keys.
    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    pub fn sign(&self, bytes: &[u8]) -> Signature {
        self.signing_key.sign(bytes)
    }
}

/// Medium-term X25519 key pair, signed by the identity signing key.
///
/// Exactly one record is active per device. It changes only through explicit rotation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKeyRecord {
    id: PreKeyId,
    secret: SecretKey,
    public_key: PublicKey,
    signature: Signature,
}

impl SignedPreKeyRecord {
    pub fn generate(id: PreKeyId, identity: &IdentityKeyPair, rng: &Rng) -> Result<Self, RngError> {
        let secret = SecretKey::generate(rng)?;
        let public_key = secret.public_key();
        let signature = identity.sign(public_key.as_bytes());
        Ok(Self {
            id,
            secret,
            public_key,
            signature,
        })
    }

    pub fn id(&self) -> PreKeyId {
        self.id
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    pub fn to_public(&self) -> SignedPreKey {
        SignedPreKey {
            id: self.id,
            key: self.public_key,
            signature: self.signature,
        }
    }
}

/// Single-use X25519 key pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKeyRecord {
    id: OneTimePreKeyId,
    secret: SecretKey,
    public_key: PublicKey,
}

impl OneTimePreKeyRecord {
    pub fn generate(id: OneTimePreKeyId, rng: &Rng) -> Result<Self, RngError> {
        let secret = SecretKey::generate(rng)?;
        Ok(Self {
            id,
            public_key: secret.public_key(),
            secret,
        })
    }

    pub fn id(&self) -> OneTimePreKeyId {
        self.id
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    pub fn to_public(&self) -> OneTimePreKey {
        OneTimePreKey {
            id: self.id,
            key: self.public_key,
        }
    }
}

/// Public part of a signed pre-key as published on the key-bundle service.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKey {
    pub id: PreKeyId,
    pub key: PublicKey,
    pub signature: Signature,
}

/// Public part of a one-time pre-key as published on the key-bundle service.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKey {
    pub id: OneTimePreKeyId,
    pub key: PublicKey,
}

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;

    use super::{IdentityKeyPair, OneTimePreKeyRecord, SignedPreKeyRecord};

    #[test]
    fn signed_prekey_is_signed_by_identity() {
        let rng = Rng::from_seed([1; 32]);

        let identity = IdentityKeyPair::generate(&rng).unwrap();
        let signed_prekey = SignedPreKeyRecord::generate(1, &identity, &rng).unwrap();

        assert_eq!(signed_prekey.id(), 1);
        assert_eq!(signed_prekey.public_key(), &signed_prekey.secret().public_key());
        assert!(
            identity
                .verifying_key()
                .verify(signed_prekey.public_key().as_bytes(), signed_prekey.signature())
                .is_ok()
        );
    }

    #[test]
    fn public_projection() {
        let rng = Rng::from_seed([1; 32]);

        let onetime_prekey = OneTimePreKeyRecord::generate(7, &rng).unwrap();
        let public = onetime_prekey.to_public();
        assert_eq!(public.id, 7);
        assert_eq!(&public.key, onetime_prekey.public_key());
    }
}
