// SPDX-License-Identifier: MIT OR Apache-2.0

//! Group messaging with sender keys.
//!
//! Every member encrypts group messages with their own sender key. Before sending, the key is
//! handed to every member who doesn't have it yet, encrypted through the pairwise session with
//! that member. Receivers fetch pending distributions when they see a sender for the first time
//! or when a sender's signature stops verifying (the sender rotated).
//!
//! Removing a member rotates the own key, the removed member can't read any later message.
use parley_encryption::cbor::{CborError, decode_cbor, encode_cbor};
use parley_encryption::{
    EncryptedPayload, RemoteSenderKey, SenderKey, SenderKeyDistribution, SenderKeyError,
    SenderKeyMessage,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::locks::KeyedLocks;
use crate::record::RecordError;
use crate::sender_key_store::{OwnSenderKeyRecord, SenderKeyStore};
use crate::session::{SessionError, SessionManager};
use crate::traits::{
    EncryptedSenderKey, KeyBundleService, KeyValueStore, PendingSenderKey,
    SenderKeyDistributionService,
};

pub struct GroupManager<S, B, D> {
    user_id: String,
    sessions: SessionManager<S, B>,
    sender_keys: SenderKeyStore<S>,
    distribution: D,
    locks: KeyedLocks<String, ()>,
}

impl<S, B, D> GroupManager<S, B, D>
where
    S: KeyValueStore + Clone,
    B: KeyBundleService,
    D: SenderKeyDistributionService,
{
    pub fn new(user_id: &str, store: S, sessions: SessionManager<S, B>, distribution: D) -> Self {
        Self {
            user_id: user_id.to_owned(),
            sessions,
            sender_keys: SenderKeyStore::new(store),
            distribution,
            locks: KeyedLocks::new(),
        }
    }

    /// Encrypts a message for all members of a group.
    ///
    /// Creates the own sender key on first use and distributes it to members who didn't receive
    /// it yet. `members` may include the local user.
    pub async fn encrypt(
        &self,
        group_id: &str,
        members: &[&str],
        plaintext: &[u8],
    ) -> Result<SenderKeyMessage, GroupError> {
        let _guard = self.locks.lock(&group_id.to_owned()).await;

        let mut record = match self.sender_keys.own_sender_key(group_id).await? {
            Some(record) => record,
            None => {
                let record =
                    OwnSenderKeyRecord::new(SenderKey::generate(self.sessions.rng())?);
                self.sender_keys.set_own_sender_key(group_id, &record).await?;
                debug!(group = group_id, "created own sender key");
                record
            }
        };

        self.distribute(group_id, &mut record, members).await?;

        let (sender_key, message) = SenderKey::encrypt(
            record.sender_key,
            group_id,
            &self.user_id,
            plaintext,
            self.sessions.rng(),
        )?;
        record.sender_key = sender_key;
        self.sender_keys.set_own_sender_key(group_id, &record).await?;

        Ok(message)
    }

    /// Verifies and decrypts a message of another group member.
    pub async fn decrypt(&self, message: &SenderKeyMessage) -> Result<Vec<u8>, GroupError> {
        let group_id = message.group_id.as_str();
        let sender_user_id = message.sender_user_id.as_str();
        let _guard = self.locks.lock(&message.group_id).await;

        let sender_key = match self
            .sender_keys
            .remote_sender_key(group_id, sender_user_id)
            .await?
        {
            Some(sender_key) => sender_key,
            None => {
                self.process_pending(group_id).await?;
                self.sender_keys
                    .remote_sender_key(group_id, sender_user_id)
                    .await?
                    .ok_or_else(|| GroupError::UnknownSenderKey {
                        group_id: group_id.to_owned(),
                        sender_user_id: sender_user_id.to_owned(),
                    })?
            }
        };

        let result = match SenderKey::decrypt(sender_key.clone(), message) {
            Err(SenderKeyError::InvalidSignature(err)) => {
                // The sender might have rotated, look for a new distribution once.
                debug!(
                    group = group_id,
                    sender = sender_user_id,
                    "signature did not verify, checking for new sender key"
                );
                self.process_pending(group_id).await?;
                match self
                    .sender_keys
                    .remote_sender_key(group_id, sender_user_id)
                    .await?
                {
                    Some(updated) if updated != sender_key => SenderKey::decrypt(updated, message),
                    _ => Err(SenderKeyError::InvalidSignature(err)),
                }
            }
            result => result,
        };

        let (sender_key, plaintext) = match result {
            Ok(result) => result,
            Err(err) => {
                warn!(
                    group = group_id,
                    sender = sender_user_id,
                    iteration = message.iteration,
                    "could not decrypt group message: {err}"
                );
                return Err(err.into());
            }
        };

        self.sender_keys
            .set_remote_sender_key(group_id, sender_user_id, &sender_key)
            .await?;

        Ok(plaintext)
    }

    /// Replaces the own sender key of a group and distributes the new one to `members`.
    ///
    /// Distributions of the old key are revoked on the server.
    pub async fn rotate(&self, group_id: &str, members: &[&str]) -> Result<(), GroupError> {
        let _guard = self.locks.lock(&group_id.to_owned()).await;
        self.rotate_locked(group_id, members).await
    }

    /// Removes a member: forgets their sender key and rotates the own key among the remaining
    /// members.
    pub async fn remove_member(
        &self,
        group_id: &str,
        removed_user_id: &str,
        remaining_members: &[&str],
    ) -> Result<(), GroupError> {
        let _guard = self.locks.lock(&group_id.to_owned()).await;
        self.sender_keys
            .delete_remote_sender_key(group_id, removed_user_id)
            .await?;
        debug!(group = group_id, removed = removed_user_id, "removed member");

        let remaining: Vec<&str> = remaining_members
            .iter()
            .copied()
            .filter(|member| *member != removed_user_id)
            .collect();
        self.rotate_locked(group_id, &remaining).await
    }

    async fn rotate_locked(&self, group_id: &str, members: &[&str]) -> Result<(), GroupError> {
        self.distribution
            .revoke_own(group_id)
            .await
            .map_err(|err| GroupError::Network(format!("{err:?}")))?;
        self.sender_keys.delete_own_sender_key(group_id).await?;

        let mut record = OwnSenderKeyRecord::new(SenderKey::generate(self.sessions.rng())?);
        self.sender_keys.set_own_sender_key(group_id, &record).await?;
        debug!(group = group_id, "rotated own sender key");

        self.distribute(group_id, &mut record, members).await
    }

    /// Sends the own sender key to every member who didn't get it yet.
    ///
    /// Encrypted distributions stay in the outbox of the record until the server accepted them,
    /// a retry sends them again unchanged.
    async fn distribute(
        &self,
        group_id: &str,
        record: &mut OwnSenderKeyRecord,
        members: &[&str],
    ) -> Result<(), GroupError> {
        let recipients: Vec<&str> = members
            .iter()
            .copied()
            .filter(|member| *member != self.user_id && record.needs_distribution(member))
            .collect();

        if !recipients.is_empty() {
            let distribution =
                encode_cbor(&record.sender_key.distribution(group_id, &self.user_id))?;

            let mut failure = None;
            for recipient in recipients {
                match self.encrypt_distribution(recipient, &distribution).await {
                    Ok(item) => record.outbox.push(item),
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }

            // Keep what was encrypted so far, the sessions already moved on.
            self.sender_keys.set_own_sender_key(group_id, record).await?;
            if let Some(err) = failure {
                return Err(err);
            }
        }

        let keys: Vec<EncryptedSenderKey> = record
            .outbox
            .iter()
            .filter(|item| members.contains(&item.recipient_user_id.as_str()))
            .cloned()
            .collect();
        if keys.is_empty() {
            return Ok(());
        }

        self.distribution
            .distribute(group_id, keys.clone())
            .await
            .map_err(|err| GroupError::Network(format!("{err:?}")))?;

        let count = keys.len();
        record.outbox.retain(|item| !keys.contains(item));
        record
            .distributed_to
            .extend(keys.into_iter().map(|item| item.recipient_user_id));
        self.sender_keys.set_own_sender_key(group_id, record).await?;
        debug!(group = group_id, recipients = count, "distributed own sender key");

        Ok(())
    }

    async fn encrypt_distribution(
        &self,
        recipient: &str,
        distribution: &[u8],
    ) -> Result<EncryptedSenderKey, GroupError> {
        let payload = self.sessions.encrypt(recipient, distribution).await?;
        Ok(EncryptedSenderKey {
            recipient_user_id: recipient.to_owned(),
            encrypted_key: encode_cbor(&payload)?,
        })
    }

    /// Installs all sender keys waiting for us in this group.
    ///
    /// A distribution which can't be decrypted is skipped, it doesn't block the others.
    async fn process_pending(&self, group_id: &str) -> Result<usize, GroupError> {
        let pending = self
            .distribution
            .fetch_pending(group_id)
            .await
            .map_err(|err| GroupError::Network(format!("{err:?}")))?;

        let mut installed = 0;
        for item in pending {
            match self.install(group_id, &item).await {
                Ok(true) => installed += 1,
                Ok(false) => (),
                Err(err) => warn!(
                    group = group_id,
                    sender = %item.sender_user_id,
                    "could not install sender key: {err}"
                ),
            }
        }

        Ok(installed)
    }

    async fn install(&self, group_id: &str, item: &PendingSenderKey) -> Result<bool, GroupError> {
        let payload: EncryptedPayload = decode_cbor(&item.encrypted_key)?;
        let bytes = self
            .sessions
            .decrypt(&item.sender_user_id, &payload)
            .await?;
        let distribution: SenderKeyDistribution = decode_cbor(&bytes)?;

        if distribution.group_id != group_id || distribution.sender_user_id != item.sender_user_id
        {
            return Err(GroupError::DistributionMismatch {
                group_id: group_id.to_owned(),
                sender_user_id: item.sender_user_id.clone(),
            });
        }

        let sender_key = RemoteSenderKey::from_distribution(&distribution);

        // Never move a known chain backwards.
        if let Some(current) = self
            .sender_keys
            .remote_sender_key(group_id, &item.sender_user_id)
            .await?
        {
            if current.verifying_key() == sender_key.verifying_key()
                && current.iteration() >= sender_key.iteration()
            {
                return Ok(false);
            }
        }

        self.sender_keys
            .set_remote_sender_key(group_id, &item.sender_user_id, &sender_key)
            .await?;
        debug!(
            group = group_id,
            sender = %item.sender_user_id,
            iteration = sender_key.iteration(),
            "installed sender key"
        );

        Ok(true)
    }
}

#[derive(Debug, Error)]
pub enum GroupError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    SenderKey(#[from] SenderKeyError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Cbor(#[from] CborError),

    #[error("sender key distribution service failed: {0}")]
    Network(String),

    #[error("no sender key of {sender_user_id} in group {group_id}")]
    UnknownSenderKey {
        group_id: String,
        sender_user_id: String,
    },

    #[error("distribution from {sender_user_id} was not meant for group {group_id}")]
    DistributionMismatch {
        group_id: String,
        sender_user_id: String,
    },
}

impl GroupError {
    /// Returns `true` for transient failures of a remote service.
    pub fn is_retryable(&self) -> bool {
        match self {
            GroupError::Network(_) => true,
            GroupError::Session(err) => err.is_retryable(),
            _ => false,
        }
    }
}
