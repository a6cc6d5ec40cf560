// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interfaces to persistence and the services of the messaging server.
//!
//! The server is untrusted transport: it stores public key bundles, relays encrypted sender keys
//! and keeps trust markers, but never sees private keys or plaintext.
use std::fmt::Debug;

use parley_encryption::crypto::x25519::PublicKey;
use parley_encryption::{OneTimePreKey, PublicKeyBundle, ReceivedKeyBundle};
use serde::{Deserialize, Serialize};

/// String-keyed durable storage for all local records.
///
/// Holds private key material, implementations need to protect it at rest.
pub trait KeyValueStore {
    type Error: Debug;

    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>, Self::Error>>;

    fn set(&self, key: &str, value: Vec<u8>) -> impl Future<Output = Result<(), Self::Error>>;

    fn delete(&self, key: &str) -> impl Future<Output = Result<(), Self::Error>>;
}

/// Server-side directory of published key bundles.
pub trait KeyBundleService {
    type Error: Debug;

    /// Publishes identity key, signed pre-key and a batch of one-time pre-keys of the local user.
    fn upload_bundle(
        &self,
        bundle: &PublicKeyBundle,
    ) -> impl Future<Output = Result<(), Self::Error>>;

    /// Number of one-time pre-keys of the local user the server still holds.
    fn onetime_prekey_count(&self) -> impl Future<Output = Result<usize, Self::Error>>;

    /// Fetches another user's bundle.
    ///
    /// The server atomically hands out and deletes at most one of their one-time pre-keys.
    fn key_bundle(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<ReceivedKeyBundle, Self::Error>>;

    fn replenish_onetime_prekeys(
        &self,
        prekeys: &[OneTimePreKey],
    ) -> impl Future<Output = Result<(), Self::Error>>;
}

/// Sender key encrypted towards one recipient through their pairwise session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedSenderKey {
    pub recipient_user_id: String,
    pub encrypted_key: Vec<u8>,
}

/// Sender key of another member waiting for the local user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSenderKey {
    pub sender_user_id: String,
    pub encrypted_key: Vec<u8>,
}

/// Server-side relay of sender key distributions.
pub trait SenderKeyDistributionService {
    type Error: Debug;

    fn distribute(
        &self,
        group_id: &str,
        keys: Vec<EncryptedSenderKey>,
    ) -> impl Future<Output = Result<(), Self::Error>>;

    fn fetch_pending(
        &self,
        group_id: &str,
    ) -> impl Future<Output = Result<Vec<PendingSenderKey>, Self::Error>>;

    /// Withdraws all distributions of the local user's current sender key in this group.
    fn revoke_own(&self, group_id: &str) -> impl Future<Output = Result<(), Self::Error>>;
}

/// Server-side markers of which identity key the local user has seen or verified for a contact.
pub trait IdentityTrustService {
    type Error: Debug;

    fn update_known_identity_key(
        &self,
        contact_id: &str,
        identity_key: &PublicKey,
    ) -> impl Future<Output = Result<(), Self::Error>>;

    fn verify_identity_key(
        &self,
        contact_id: &str,
        identity_key: &PublicKey,
    ) -> impl Future<Output = Result<(), Self::Error>>;
}
