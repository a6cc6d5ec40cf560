// SPDX-License-Identifier: MIT OR Apache-2.0

//! Symmetric hash ratchet used to encrypt group messages with one key per sender.
//!
//! Every group member owns a sender key: a chain key which moves forward with each message and
//! an Ed25519 key pair signing every ciphertext. The owner hands the chain key and the public
//! signing key to the other members through their pairwise sessions, from then on a group
//! message is encrypted once for all recipients.
//!
//! Receivers only ever move forward. Messages can skip ahead (bounded by
//! [`MAX_SENDER_KEY_JUMP`]) but a message older than the current chain position is rejected.
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::aead::{AeadError, aead_open, aead_seal};
use crate::crypto::ed25519::{Signature, SignatureError, SigningKey, VerifyingKey};
use crate::crypto::hkdf::{HkdfError, hkdf};
use crate::crypto::{Rng, RngError, Secret};

/// Maximum number of iterations a received message may lie ahead of the known chain position.
pub const MAX_SENDER_KEY_JUMP: u64 = 2000;

pub const SENDER_CHAIN_KEY_SIZE: usize = 32;

const CHAIN_KEY_INFO: &[u8] = b"parley_sender_chain_key";

const MESSAGE_KEY_INFO: &[u8] = b"parley_sender_message_key";

type ChainKey = Secret<SENDER_CHAIN_KEY_SIZE>;

pub type SenderKeyIteration = u64;

/// Sender key of the local member, able to encrypt and sign.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnSenderKey {
    chain_key: ChainKey,
    signing_key: SigningKey,
    iteration: SenderKeyIteration,
}

impl OwnSenderKey {
    /// Next iteration this key will encrypt with.
    pub fn iteration(&self) -> SenderKeyIteration {
        self.iteration
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Message handing the current chain position to another member.
    ///
    /// Must only be sent through an encrypted pairwise session.
    pub fn distribution(&self, group_id: &str, sender_user_id: &str) -> SenderKeyDistribution {
        SenderKeyDistribution {
            group_id: group_id.to_owned(),
            sender_user_id: sender_user_id.to_owned(),
            chain_key: self.chain_key.clone(),
            signing_key: self.signing_key.verifying_key(),
            iteration: self.iteration,
        }
    }
}

/// Sender key of another member, able to verify and decrypt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSenderKey {
    chain_key: ChainKey,
    verifying_key: VerifyingKey,
    iteration: SenderKeyIteration,
}

impl RemoteSenderKey {
    pub fn from_distribution(distribution: &SenderKeyDistribution) -> Self {
        Self {
            chain_key: distribution.chain_key.clone(),
            verifying_key: distribution.signing_key,
            iteration: distribution.iteration,
        }
    }

    /// Next iteration this key expects.
    pub fn iteration(&self) -> SenderKeyIteration {
        self.iteration
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }
}

/// Chain key and public signing key of a member's sender key, sent to every other member.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderKeyDistribution {
    pub group_id: String,
    pub sender_user_id: String,
    pub chain_key: Secret<SENDER_CHAIN_KEY_SIZE>,
    #[serde(rename = "signingKeyPublic")]
    pub signing_key: VerifyingKey,
    pub iteration: SenderKeyIteration,
}

/// Encrypted and signed group message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderKeyMessage {
    pub group_id: String,
    pub sender_user_id: String,

    /// AEAD output: `nonce || ciphertext || tag`.
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,

    pub iteration: SenderKeyIteration,

    /// Signature over `ciphertext` by the sender's signing key.
    pub signature: Signature,
}

pub struct SenderKey;

impl SenderKey {
    pub fn generate(rng: &Rng) -> Result<OwnSenderKey, SenderKeyError> {
        Ok(OwnSenderKey {
            chain_key: Secret::from_bytes(rng.random_array()?),
            signing_key: SigningKey::generate(rng)?,
            iteration: 0,
        })
    }

    pub fn encrypt(
        mut y: OwnSenderKey,
        group_id: &str,
        sender_user_id: &str,
        plaintext: &[u8],
        rng: &Rng,
    ) -> Result<(OwnSenderKey, SenderKeyMessage), SenderKeyError> {
        let (next_chain_key, message_key) = kdf_chain(&y.chain_key)?;

        let ad = associated_data(group_id, sender_user_id, y.iteration);
        let ciphertext = aead_seal(message_key.as_bytes(), plaintext, Some(&ad), rng)?;
        let signature = y.signing_key.sign(&ciphertext);

        let message = SenderKeyMessage {
            group_id: group_id.to_owned(),
            sender_user_id: sender_user_id.to_owned(),
            ciphertext,
            iteration: y.iteration,
            signature,
        };

        y.chain_key = next_chain_key;
        y.iteration += 1;

        Ok((y, message))
    }

    /// Verifies and decrypts a group message.
    ///
    /// The signature is checked before any key is derived. On success the chain moves past the
    /// message's iteration, keys of skipped iterations are not kept.
    pub fn decrypt(
        mut y: RemoteSenderKey,
        message: &SenderKeyMessage,
    ) -> Result<(RemoteSenderKey, Vec<u8>), SenderKeyError> {
        y.verifying_key
            .verify(&message.ciphertext, &message.signature)?;

        if message.iteration < y.iteration {
            return Err(SenderKeyError::StaleIteration {
                iteration: message.iteration,
                current: y.iteration,
            });
        }

        if message.iteration - y.iteration > MAX_SENDER_KEY_JUMP {
            return Err(SenderKeyError::TooFarAhead {
                iteration: message.iteration,
                current: y.iteration,
            });
        }

        let mut chain_key = y.chain_key.clone();
        for _ in y.iteration..message.iteration {
            let (next_chain_key, _) = kdf_chain(&chain_key)?;
            chain_key = next_chain_key;
        }
        let (next_chain_key, message_key) = kdf_chain(&chain_key)?;

        let ad = associated_data(&message.group_id, &message.sender_user_id, message.iteration);
        let plaintext = aead_open(message_key.as_bytes(), &message.ciphertext, Some(&ad))?;

        y.chain_key = next_chain_key;
        y.iteration = message.iteration + 1;

        Ok((y, plaintext))
    }
}

fn kdf_chain(chain_key: &ChainKey) -> Result<(ChainKey, ChainKey), HkdfError> {
    let next_chain_key = hkdf(&[], chain_key.as_bytes(), Some(CHAIN_KEY_INFO))?;
    let message_key = hkdf(&[], chain_key.as_bytes(), Some(MESSAGE_KEY_INFO))?;
    Ok((
        Secret::from_bytes(next_chain_key),
        Secret::from_bytes(message_key),
    ))
}

fn associated_data(group_id: &str, sender_user_id: &str, iteration: SenderKeyIteration) -> Vec<u8> {
    let mut ad = Vec::with_capacity(4 + group_id.len() + 4 + sender_user_id.len() + 8);
    for value in [group_id, sender_user_id] {
        ad.extend_from_slice(&(value.len() as u32).to_be_bytes());
        ad.extend_from_slice(value.as_bytes());
    }
    ad.extend_from_slice(&iteration.to_be_bytes());
    ad
}

#[derive(Debug, Error)]
pub enum SenderKeyError {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    Hkdf(#[from] HkdfError),

    #[error(transparent)]
    Aead(#[from] AeadError),

    #[error("invalid sender key signature: {0}")]
    InvalidSignature(#[from] SignatureError),

    #[error("message iteration {iteration} is older than current iteration {current}")]
    StaleIteration {
        iteration: SenderKeyIteration,
        current: SenderKeyIteration,
    },

    #[error("message iteration {iteration} is too far ahead of current iteration {current}")]
    TooFarAhead {
        iteration: SenderKeyIteration,
        current: SenderKeyIteration,
    },
}
