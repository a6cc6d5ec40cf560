// SPDX-License-Identifier: MIT OR Apache-2.0

//! AES-256-GCM authenticated encryption with associated data (AEAD), 256-bit key, 128-bit tag
//! and 96-bit nonce.
//!
//! `aead_seal` and `aead_open` manage the nonce for the caller: a random nonce is drawn for every
//! encryption and prepended to the ciphertext.
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use thiserror::Error;

use crate::crypto::{Rng, RngError};

pub const AEAD_KEY_SIZE: usize = 32;

pub const AEAD_NONCE_SIZE: usize = 12;

pub const AEAD_TAG_SIZE: usize = 16;

pub type AeadKey = [u8; AEAD_KEY_SIZE];

pub type AeadNonce = [u8; AEAD_NONCE_SIZE];

pub fn aead_encrypt(
    key: &AeadKey,
    plaintext: &[u8],
    nonce: AeadNonce,
    aad: Option<&[u8]>,
) -> Result<Vec<u8>, AeadError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: aad.unwrap_or_default(),
            },
        )
        .map_err(|_| AeadError::Encrypt)
}

pub fn aead_decrypt(
    key: &AeadKey,
    ciphertext_tag: &[u8],
    nonce: AeadNonce,
    aad: Option<&[u8]>,
) -> Result<Vec<u8>, AeadError> {
    if ciphertext_tag.len() < AEAD_TAG_SIZE {
        return Err(AeadError::InvalidLength(ciphertext_tag.len()));
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: ciphertext_tag,
                aad: aad.unwrap_or_default(),
            },
        )
        .map_err(|_| AeadError::Decrypt)
}

/// Encrypts with a fresh random nonce and returns `nonce || ciphertext || tag`.
pub fn aead_seal(
    key: &AeadKey,
    plaintext: &[u8],
    aad: Option<&[u8]>,
    rng: &Rng,
) -> Result<Vec<u8>, AeadError> {
    let nonce: AeadNonce = rng.random_array()?;
    let ciphertext = aead_encrypt(key, plaintext, nonce, aad)?;

    let mut sealed = Vec::with_capacity(AEAD_NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypts bytes produced by `aead_seal`.
pub fn aead_open(key: &AeadKey, sealed: &[u8], aad: Option<&[u8]>) -> Result<Vec<u8>, AeadError> {
    if sealed.len() < AEAD_NONCE_SIZE + AEAD_TAG_SIZE {
        return Err(AeadError::InvalidLength(sealed.len()));
    }

    let (nonce, ciphertext_tag) = sealed.split_at(AEAD_NONCE_SIZE);
    let nonce: AeadNonce = nonce
        .try_into()
        .expect("split at exact nonce size");
    aead_decrypt(key, ciphertext_tag, nonce, aad)
}

#[derive(Debug, Error)]
pub enum AeadError {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error("ciphertext of {0} bytes is too short")]
    InvalidLength(usize),

    #[error("could not encrypt with aead")]
    Encrypt,

    #[error("could not decrypt with aead, authentication tag mismatch")]
    Decrypt,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::crypto::Rng;

    use super::{AeadError, AeadKey, aead_open, aead_seal};

    #[test]
    fn seal_open() {
        let rng = Rng::from_seed([1; 32]);
        let key: AeadKey = rng.random_array().unwrap();

        let sealed = aead_seal(&key, b"Hello, Bob!", Some(b"header"), &rng).unwrap();
        let plaintext = aead_open(&key, &sealed, Some(b"header")).unwrap();
        assert_eq!(plaintext, b"Hello, Bob!");
    }

    #[test]
    fn nonce_is_fresh() {
        let rng = Rng::from_seed([1; 32]);
        let key: AeadKey = rng.random_array().unwrap();

        let sealed_1 = aead_seal(&key, b"Hello, Bob!", None, &rng).unwrap();
        let sealed_2 = aead_seal(&key, b"Hello, Bob!", None, &rng).unwrap();
        assert_ne!(sealed_1, sealed_2);
    }

    #[test]
    fn tampering_fails() {
        let rng = Rng::from_seed([1; 32]);
        let key: AeadKey = rng.random_array().unwrap();
        let sealed = aead_seal(&key, b"Hello, Bob!", Some(b"header"), &rng).unwrap();

        let mut tampered = sealed.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 1;
        assert_matches!(aead_open(&key, &tampered, Some(b"header")), Err(AeadError::Decrypt));

        assert_matches!(aead_open(&key, &sealed, Some(b"other")), Err(AeadError::Decrypt));

        let invalid_key: AeadKey = rng.random_array().unwrap();
        assert_matches!(aead_open(&invalid_key, &sealed, Some(b"header")), Err(AeadError::Decrypt));

        assert_matches!(aead_open(&key, &sealed[..10], None), Err(AeadError::InvalidLength(10)));
    }
}
