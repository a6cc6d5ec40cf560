// SPDX-License-Identifier: MIT OR Apache-2.0

//! Persisted sender keys, one own key per group and one received key per (group, sender).
use std::collections::BTreeSet;

use base64::prelude::{BASE64_URL_SAFE_NO_PAD, Engine as _};
use parley_encryption::{OwnSenderKey, RemoteSenderKey};
use serde::{Deserialize, Serialize};

use crate::record::{RecordError, delete_record, load_record, store_record};
use crate::traits::{EncryptedSenderKey, KeyValueStore};

// Ids are encoded so they can't contain the `/` separator.
fn own_key(group_id: &str) -> String {
    format!("sender_keys/own/{}", BASE64_URL_SAFE_NO_PAD.encode(group_id))
}

fn remote_key(group_id: &str, sender_user_id: &str) -> String {
    format!(
        "sender_keys/remote/{}/{}",
        BASE64_URL_SAFE_NO_PAD.encode(group_id),
        BASE64_URL_SAFE_NO_PAD.encode(sender_user_id)
    )
}

/// Own sender key of a group and the members it was already distributed to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnSenderKeyRecord {
    pub sender_key: OwnSenderKey,
    pub distributed_to: BTreeSet<String>,

    /// Distributions which are encrypted for a member but not yet accepted by the server.
    ///
    /// Encrypting moves the pairwise session forward and the first message of a new session
    /// carries the only copy of its X3DH header, so these are resent as they are instead of
    /// being encrypted again.
    #[serde(default)]
    pub outbox: Vec<EncryptedSenderKey>,
}

impl OwnSenderKeyRecord {
    pub fn new(sender_key: OwnSenderKey) -> Self {
        Self {
            sender_key,
            distributed_to: BTreeSet::new(),
            outbox: Vec::new(),
        }
    }

    fn is_pending(&self, user_id: &str) -> bool {
        self.outbox
            .iter()
            .any(|item| item.recipient_user_id == user_id)
    }

    /// Returns `true` if the key still has to be encrypted for this member.
    pub fn needs_distribution(&self, user_id: &str) -> bool {
        !self.distributed_to.contains(user_id) && !self.is_pending(user_id)
    }
}

#[derive(Clone, Debug)]
pub struct SenderKeyStore<S> {
    store: S,
}

impl<S> SenderKeyStore<S>
where
    S: KeyValueStore,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub async fn own_sender_key(
        &self,
        group_id: &str,
    ) -> Result<Option<OwnSenderKeyRecord>, RecordError> {
        load_record(&self.store, &own_key(group_id)).await
    }

    pub async fn set_own_sender_key(
        &self,
        group_id: &str,
        record: &OwnSenderKeyRecord,
    ) -> Result<(), RecordError> {
        store_record(&self.store, &own_key(group_id), record).await
    }

    pub async fn delete_own_sender_key(&self, group_id: &str) -> Result<(), RecordError> {
        delete_record(&self.store, &own_key(group_id)).await
    }

    pub async fn remote_sender_key(
        &self,
        group_id: &str,
        sender_user_id: &str,
    ) -> Result<Option<RemoteSenderKey>, RecordError> {
        load_record(&self.store, &remote_key(group_id, sender_user_id)).await
    }

    pub async fn set_remote_sender_key(
        &self,
        group_id: &str,
        sender_user_id: &str,
        sender_key: &RemoteSenderKey,
    ) -> Result<(), RecordError> {
        store_record(&self.store, &remote_key(group_id, sender_user_id), sender_key).await
    }

    pub async fn delete_remote_sender_key(
        &self,
        group_id: &str,
        sender_user_id: &str,
    ) -> Result<(), RecordError> {
        delete_record(&self.store, &remote_key(group_id, sender_user_id)).await
    }
}
