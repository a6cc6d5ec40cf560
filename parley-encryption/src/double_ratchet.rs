// SPDX-License-Identifier: MIT OR Apache-2.0

//! Double Ratchet algorithm for per-conversation message encryption.
//!
//! Every message is encrypted with its own key, derived from a symmetric "chain" which moves
//! forward with each message (forward secrecy). Whenever a party receives a new ratchet public
//! key from the other side, both chains are re-seeded through a Diffie-Hellman step mixed into
//! the root key (post-compromise recovery).
//!
//! All methods are pure functions over [`DoubleRatchetState`], returning the updated state. A
//! failed operation returns an error and no state, callers keep using the state they passed in.
//! This makes sure a failed decryption never advances or corrupts a chain.
//!
//! Messages can arrive out-of-order or get lost. Keys of skipped messages are kept (bounded by
//! [`MAX_SKIP`] per jump and [`MAX_SKIPPED_MESSAGE_KEYS`] in total) until the late message
//! arrives:
//!
//! ```text
//! 0
//! 1 <- Current receiving chain "height"
//! 2    (key kept)
//! 3    (key kept)
//! 4 <- New chain "height" after decrypting message 4
//! ```
//!
//! <https://signal.org/docs/specifications/doubleratchet/>
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::crypto::aead::{AeadError, aead_open, aead_seal};
use crate::crypto::hkdf::{HkdfError, hkdf};
use crate::crypto::x25519::{PublicKey, SecretKey, X25519Error};
use crate::crypto::{Rng, RngError, Secret};
use crate::key_bundle::SignedPreKeyRecord;
use crate::x3dh::{X3dhHeader, X3dhSecret};

/// Maximum number of message keys derived ahead in a single receiving chain jump.
pub const MAX_SKIP: u64 = 1000;

/// Maximum number of retained keys of skipped messages, oldest are evicted first.
pub const MAX_SKIPPED_MESSAGE_KEYS: usize = 2000;

pub const CHAIN_KEY_SIZE: usize = 32;

/// Number of finished ratchet keys of the other party which are remembered to recognise late
/// re-deliveries.
const MAX_PREVIOUS_RATCHET_KEYS: usize = 32;

const ROOT_KDF_INFO: &[u8] = b"parley_ratchet_root";

const CHAIN_KEY_INFO: &[u8] = b"parley_ratchet_chain_key";

const MESSAGE_KEY_INFO: &[u8] = b"parley_ratchet_message_key";

type ChainKey = Secret<CHAIN_KEY_SIZE>;

type MessageKey = Secret<CHAIN_KEY_SIZE>;

pub struct DoubleRatchet;

/// Serializable state of one conversation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DoubleRatchetState {
    root_key: Secret<CHAIN_KEY_SIZE>,
    our_ratchet_secret: SecretKey,
    our_ratchet_key: PublicKey,
    their_ratchet_key: Option<PublicKey>,
    sending_chain_key: Option<ChainKey>,
    receiving_chain_key: Option<ChainKey>,
    send_message_index: u64,
    receive_message_index: u64,
    previous_chain_length: u64,
    skipped_message_keys: VecDeque<SkippedMessageKey>,
    #[serde(default)]
    previous_ratchet_keys: VecDeque<PublicKey>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SkippedMessageKey {
    ratchet_key: PublicKey,
    message_index: u64,
    message_key: MessageKey,
}

impl DoubleRatchetState {
    pub fn our_ratchet_key(&self) -> &PublicKey {
        &self.our_ratchet_key
    }

    pub fn their_ratchet_key(&self) -> Option<&PublicKey> {
        self.their_ratchet_key.as_ref()
    }

    pub fn has_sending_chain(&self) -> bool {
        self.sending_chain_key.is_some()
    }

    pub fn has_receiving_chain(&self) -> bool {
        self.receiving_chain_key.is_some()
    }

    pub fn send_message_index(&self) -> u64 {
        self.send_message_index
    }

    pub fn receive_message_index(&self) -> u64 {
        self.receive_message_index
    }

    pub fn previous_chain_length(&self) -> u64 {
        self.previous_chain_length
    }

    pub fn skipped_message_keys(&self) -> usize {
        self.skipped_message_keys.len()
    }
}

/// Encrypted message of a Double Ratchet session.
///
/// The first message of a new session additionally carries the X3DH header the receiver needs
/// to establish the session on their end.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedPayload {
    /// AEAD output: `nonce || ciphertext || tag`.
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,

    /// Sender's current ratchet public key.
    pub ratchet_key: PublicKey,

    /// Position of this message in the sender's current sending chain.
    pub message_index: u64,

    /// Length of the sender's previous sending chain.
    pub previous_chain_length: u64,

    /// X3DH header, only present on the first message of a session.
    #[serde(flatten)]
    pub initiation: Option<X3dhHeader>,
}

impl EncryptedPayload {
    /// Bytes authenticated together with the ciphertext.
    fn associated_data(&self) -> Vec<u8> {
        associated_data(
            &self.ratchet_key,
            self.message_index,
            self.previous_chain_length,
        )
    }
}

fn associated_data(ratchet_key: &PublicKey, message_index: u64, previous_chain_length: u64) -> Vec<u8> {
    let mut ad = Vec::with_capacity(32 + 8 + 8);
    ad.extend_from_slice(ratchet_key.as_bytes());
    ad.extend_from_slice(&message_index.to_be_bytes());
    ad.extend_from_slice(&previous_chain_length.to_be_bytes());
    ad
}

impl DoubleRatchet {
    /// Initialises the session of the party who ran X3DH as initiator.
    ///
    /// Their signed pre-key acts as the first received ratchet key, one root-key step runs
    /// immediately so the session can send right away.
    pub fn init_initiator(
        shared_secret: &X3dhSecret,
        their_signed_prekey: &PublicKey,
        rng: &Rng,
    ) -> Result<DoubleRatchetState, DoubleRatchetError> {
        let our_ratchet_secret = SecretKey::generate(rng)?;
        let dh = our_ratchet_secret.calculate_agreement(their_signed_prekey)?;
        let (root_key, sending_chain_key) = kdf_root(shared_secret, &dh)?;

        Ok(DoubleRatchetState {
            root_key,
            our_ratchet_key: our_ratchet_secret.public_key(),
            our_ratchet_secret,
            their_ratchet_key: Some(*their_signed_prekey),
            sending_chain_key: Some(sending_chain_key),
            receiving_chain_key: None,
            send_message_index: 0,
            receive_message_index: 0,
            previous_chain_length: 0,
            skipped_message_keys: VecDeque::new(),
            previous_ratchet_keys: VecDeque::new(),
        })
    }

    /// Initialises the session of the party who responded to X3DH.
    ///
    /// Our signed pre-key is the first ratchet key pair. There are no chains until the first
    /// message of the initiator arrives, so the responder can't send before that.
    pub fn init_responder(
        shared_secret: &X3dhSecret,
        our_signed_prekey: &SignedPreKeyRecord,
    ) -> DoubleRatchetState {
        DoubleRatchetState {
            root_key: shared_secret.clone(),
            our_ratchet_secret: our_signed_prekey.secret().clone(),
            our_ratchet_key: *our_signed_prekey.public_key(),
            their_ratchet_key: None,
            sending_chain_key: None,
            receiving_chain_key: None,
            send_message_index: 0,
            receive_message_index: 0,
            previous_chain_length: 0,
            skipped_message_keys: VecDeque::new(),
            previous_ratchet_keys: VecDeque::new(),
        }
    }

    pub fn encrypt(
        mut y: DoubleRatchetState,
        plaintext: &[u8],
        rng: &Rng,
    ) -> Result<(DoubleRatchetState, EncryptedPayload), DoubleRatchetError> {
        let Some(chain_key) = y.sending_chain_key.as_ref() else {
            return Err(DoubleRatchetError::NoSendingChain);
        };
        let (next_chain_key, message_key) = kdf_chain(chain_key)?;

        let message_index = y.send_message_index;
        let ad = associated_data(&y.our_ratchet_key, message_index, y.previous_chain_length);
        let ciphertext = aead_seal(message_key.as_bytes(), plaintext, Some(&ad), rng)?;

        let payload = EncryptedPayload {
            ciphertext,
            ratchet_key: y.our_ratchet_key,
            message_index,
            previous_chain_length: y.previous_chain_length,
            initiation: None,
        };

        y.sending_chain_key = Some(next_chain_key);
        y.send_message_index += 1;

        Ok((y, payload))
    }

    pub fn decrypt(
        mut y: DoubleRatchetState,
        payload: &EncryptedPayload,
        rng: &Rng,
    ) -> Result<(DoubleRatchetState, Vec<u8>), DoubleRatchetError> {
        // Message "from the past" we've kept a key for.
        if let Some(position) = y.skipped_message_keys.iter().position(|skipped| {
            skipped.ratchet_key == payload.ratchet_key
                && skipped.message_index == payload.message_index
        }) {
            let plaintext = aead_open(
                y.skipped_message_keys[position].message_key.as_bytes(),
                &payload.ciphertext,
                Some(&payload.associated_data()),
            )?;
            y.skipped_message_keys.remove(position);
            return Ok((y, plaintext));
        }

        if y.their_ratchet_key.as_ref() != Some(&payload.ratchet_key) {
            // Chain we already left behind and hold no key for anymore.
            if y.previous_ratchet_keys.contains(&payload.ratchet_key) {
                return Err(DoubleRatchetError::DuplicateMessage(payload.message_index));
            }

            // Keep keys of messages of the previous chain which didn't arrive yet.
            y = Self::skip_message_keys(y, payload.previous_chain_length)?;
            y = Self::dh_ratchet(y, &payload.ratchet_key, rng)?;
        }

        if payload.message_index < y.receive_message_index {
            return Err(DoubleRatchetError::DuplicateMessage(payload.message_index));
        }

        y = Self::skip_message_keys(y, payload.message_index)?;

        let Some(chain_key) = y.receiving_chain_key.as_ref() else {
            return Err(DoubleRatchetError::NoReceivingChain);
        };
        let (next_chain_key, message_key) = kdf_chain(chain_key)?;

        let plaintext = aead_open(
            message_key.as_bytes(),
            &payload.ciphertext,
            Some(&payload.associated_data()),
        )?;

        y.receiving_chain_key = Some(next_chain_key);
        y.receive_message_index += 1;

        Ok((y, plaintext))
    }

    fn dh_ratchet(
        mut y: DoubleRatchetState,
        their_ratchet_key: &PublicKey,
        rng: &Rng,
    ) -> Result<DoubleRatchetState, DoubleRatchetError> {
        trace!(
            previous_chain_length = y.send_message_index,
            "diffie-hellman ratchet step"
        );

        y.previous_chain_length = y.send_message_index;
        y.send_message_index = 0;
        y.receive_message_index = 0;
        if let Some(previous) = y.their_ratchet_key.replace(*their_ratchet_key) {
            y.previous_ratchet_keys.push_back(previous);
            if y.previous_ratchet_keys.len() > MAX_PREVIOUS_RATCHET_KEYS {
                y.previous_ratchet_keys.pop_front();
            }
        }

        let dh = y.our_ratchet_secret.calculate_agreement(their_ratchet_key)?;
        let (root_key, receiving_chain_key) = kdf_root(&y.root_key, &dh)?;
        y.root_key = root_key;
        y.receiving_chain_key = Some(receiving_chain_key);

        let our_ratchet_secret = SecretKey::generate(rng)?;
        let dh = our_ratchet_secret.calculate_agreement(their_ratchet_key)?;
        let (root_key, sending_chain_key) = kdf_root(&y.root_key, &dh)?;
        y.root_key = root_key;
        y.sending_chain_key = Some(sending_chain_key);
        y.our_ratchet_key = our_ratchet_secret.public_key();
        y.our_ratchet_secret = our_ratchet_secret;

        Ok(y)
    }

    /// Derives and keeps the keys of the current receiving chain up to (excluding) `until`.
    fn skip_message_keys(
        mut y: DoubleRatchetState,
        until: u64,
    ) -> Result<DoubleRatchetState, DoubleRatchetError> {
        let (Some(mut chain_key), Some(ratchet_key)) =
            (y.receiving_chain_key.clone(), y.their_ratchet_key)
        else {
            return Ok(y);
        };

        if until <= y.receive_message_index {
            return Ok(y);
        }

        if until - y.receive_message_index > MAX_SKIP {
            return Err(DoubleRatchetError::TooManySkippedMessages(
                until - y.receive_message_index,
            ));
        }

        while y.receive_message_index < until {
            let (next_chain_key, message_key) = kdf_chain(&chain_key)?;
            y.skipped_message_keys.push_back(SkippedMessageKey {
                ratchet_key,
                message_index: y.receive_message_index,
                message_key,
            });
            chain_key = next_chain_key;
            y.receive_message_index += 1;
        }
        y.receiving_chain_key = Some(chain_key);

        while y.skipped_message_keys.len() > MAX_SKIPPED_MESSAGE_KEYS {
            y.skipped_message_keys.pop_front();
        }

        Ok(y)
    }
}

/// Mixes a Diffie-Hellman output into the root key, returning the new root and chain key.
fn kdf_root(
    root_key: &Secret<CHAIN_KEY_SIZE>,
    dh: &Secret<CHAIN_KEY_SIZE>,
) -> Result<(Secret<CHAIN_KEY_SIZE>, ChainKey), HkdfError> {
    let okm: [u8; CHAIN_KEY_SIZE * 2] =
        hkdf(root_key.as_bytes(), dh.as_bytes(), Some(ROOT_KDF_INFO))?;
    let mut root_key = [0u8; CHAIN_KEY_SIZE];
    let mut chain_key = [0u8; CHAIN_KEY_SIZE];
    root_key.copy_from_slice(&okm[..CHAIN_KEY_SIZE]);
    chain_key.copy_from_slice(&okm[CHAIN_KEY_SIZE..]);
    Ok((Secret::from_bytes(root_key), Secret::from_bytes(chain_key)))
}

/// Moves a chain one step forward, returning the next chain key and the message key.
pub(crate) fn kdf_chain(chain_key: &ChainKey) -> Result<(ChainKey, MessageKey), HkdfError> {
    let next_chain_key = hkdf(&[], chain_key.as_bytes(), Some(CHAIN_KEY_INFO))?;
    let message_key = hkdf(&[], chain_key.as_bytes(), Some(MESSAGE_KEY_INFO))?;
    Ok((
        Secret::from_bytes(next_chain_key),
        Secret::from_bytes(message_key),
    ))
}

#[derive(Debug, Error)]
pub enum DoubleRatchetError {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    Hkdf(#[from] HkdfError),

    #[error(transparent)]
    X25519(#[from] X25519Error),

    #[error(transparent)]
    Aead(#[from] AeadError),

    #[error("no sending chain established yet, a message needs to be received first")]
    NoSendingChain,

    #[error("no receiving chain established yet")]
    NoReceivingChain,

    #[error("message {0} was already decrypted or its key was dropped")]
    DuplicateMessage(u64),

    #[error("message would skip {0} keys, more than allowed")]
    TooManySkippedMessages(u64),
}
