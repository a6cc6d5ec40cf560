// SPDX-License-Identifier: MIT OR Apache-2.0

//! Long- and medium-term key material of the local device.
//!
//! Owns the identity key pair, the active signed pre-key and the pool of one-time pre-keys. Keys
//! are generated lazily on first use and persisted right away, later calls return the stored
//! records.
use std::collections::BTreeMap;
use std::sync::Arc;

use parley_encryption::{
    IdentityKeyPair, OneTimePreKeyId, OneTimePreKeyRecord, PreKeyId, PublicKeyBundle, Rng,
    RngError, SignedPreKeyRecord,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::record::{RecordError, load_record, store_record};
use crate::traits::KeyValueStore;

const IDENTITY_KEY: &str = "keys/identity";

const SIGNED_PREKEY_KEY: &str = "keys/signed_prekey";

const ONETIME_PREKEYS_KEY: &str = "keys/onetime_prekeys";

/// Id of the first signed- and one-time pre-key.
const FIRST_PREKEY_ID: u64 = 1;

/// Locally held one-time pre-keys and the id the next generated key will get.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct OneTimePreKeyPool {
    next_id: OneTimePreKeyId,
    prekeys: BTreeMap<OneTimePreKeyId, OneTimePreKeyRecord>,
}

/// Key material of the local device over a [`KeyValueStore`].
///
/// Clones share the same write lock, read-modify-write cycles on the records are never
/// interleaved.
#[derive(Clone, Debug)]
pub struct KeyStore<S> {
    store: S,
    write_lock: Arc<Mutex<()>>,
}

impl<S> KeyStore<S>
where
    S: KeyValueStore,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Returns the identity key pair, generating it on the very first call.
    pub async fn identity_key_pair(&self, rng: &Rng) -> Result<IdentityKeyPair, KeyStoreError> {
        let _guard = self.write_lock.lock().await;
        if let Some(identity) = self.existing_identity_key_pair().await? {
            return Ok(identity);
        }

        let identity = IdentityKeyPair::generate(rng)?;
        store_record(&self.store, IDENTITY_KEY, &identity).await?;
        debug!("generated identity key pair");
        Ok(identity)
    }

    pub async fn existing_identity_key_pair(
        &self,
    ) -> Result<Option<IdentityKeyPair>, KeyStoreError> {
        Ok(load_record(&self.store, IDENTITY_KEY).await?)
    }

    /// Returns the active signed pre-key, generating one with id 1 when there is none yet.
    ///
    /// Fails when no identity exists to sign it with.
    pub async fn signed_prekey(&self, rng: &Rng) -> Result<SignedPreKeyRecord, KeyStoreError> {
        let _guard = self.write_lock.lock().await;
        if let Some(signed_prekey) = load_record(&self.store, SIGNED_PREKEY_KEY).await? {
            return Ok(signed_prekey);
        }

        let identity = self
            .existing_identity_key_pair()
            .await?
            .ok_or(KeyStoreError::IdentityMissing)?;
        let signed_prekey = SignedPreKeyRecord::generate(FIRST_PREKEY_ID, &identity, rng)?;
        store_record(&self.store, SIGNED_PREKEY_KEY, &signed_prekey).await?;
        debug!(id = signed_prekey.id(), "generated signed pre-key");
        Ok(signed_prekey)
    }

    /// Replaces the active signed pre-key with a new one under the next id.
    ///
    /// Sessions initiated against the old key can't be answered afterwards.
    pub async fn rotate_signed_prekey(
        &self,
        rng: &Rng,
    ) -> Result<SignedPreKeyRecord, KeyStoreError> {
        let _guard = self.write_lock.lock().await;
        let identity = self
            .existing_identity_key_pair()
            .await?
            .ok_or(KeyStoreError::IdentityMissing)?;
        let current: Option<SignedPreKeyRecord> =
            load_record(&self.store, SIGNED_PREKEY_KEY).await?;
        let id: PreKeyId = current.map_or(FIRST_PREKEY_ID, |record| record.id() + 1);

        let signed_prekey = SignedPreKeyRecord::generate(id, &identity, rng)?;
        store_record(&self.store, SIGNED_PREKEY_KEY, &signed_prekey).await?;
        debug!(id, "rotated signed pre-key");
        Ok(signed_prekey)
    }

    /// Appends `count` fresh one-time pre-keys to the local pool and returns them.
    pub async fn generate_onetime_prekeys(
        &self,
        count: usize,
        rng: &Rng,
    ) -> Result<Vec<OneTimePreKeyRecord>, KeyStoreError> {
        let _guard = self.write_lock.lock().await;
        let mut pool = self.onetime_prekey_pool().await?;

        let mut generated = Vec::with_capacity(count);
        for _ in 0..count {
            let record = OneTimePreKeyRecord::generate(pool.next_id, rng)?;
            pool.prekeys.insert(record.id(), record.clone());
            generated.push(record);
            pool.next_id += 1;
        }

        store_record(&self.store, ONETIME_PREKEYS_KEY, &pool).await?;
        debug!(count, next_id = pool.next_id, "generated one-time pre-keys");
        Ok(generated)
    }

    /// Returns a one-time pre-key, `None` when it is unknown or was already consumed.
    pub async fn onetime_prekey(
        &self,
        id: OneTimePreKeyId,
    ) -> Result<Option<OneTimePreKeyRecord>, KeyStoreError> {
        let pool = self.onetime_prekey_pool().await?;
        Ok(pool.prekeys.get(&id).cloned())
    }

    /// Forgets a consumed one-time pre-key.
    pub async fn remove_onetime_prekey(&self, id: OneTimePreKeyId) -> Result<(), KeyStoreError> {
        let _guard = self.write_lock.lock().await;
        let mut pool = self.onetime_prekey_pool().await?;
        if pool.prekeys.remove(&id).is_some() {
            store_record(&self.store, ONETIME_PREKEYS_KEY, &pool).await?;
        }
        Ok(())
    }

    pub async fn onetime_prekey_count(&self) -> Result<usize, KeyStoreError> {
        Ok(self.onetime_prekey_pool().await?.prekeys.len())
    }

    /// Composes a bundle for upload, creating identity and signed pre-key where needed and
    /// minting `onetime_prekey_count` new one-time pre-keys.
    pub async fn public_key_bundle(
        &self,
        onetime_prekey_count: usize,
        rng: &Rng,
    ) -> Result<PublicKeyBundle, KeyStoreError> {
        let identity = self.identity_key_pair(rng).await?;
        let signed_prekey = self.signed_prekey(rng).await?;
        let onetime_prekeys = self
            .generate_onetime_prekeys(onetime_prekey_count, rng)
            .await?;

        Ok(PublicKeyBundle {
            identity_key: *identity.identity_key(),
            signing_key: *identity.verifying_key(),
            signed_prekey: signed_prekey.to_public(),
            onetime_prekeys: onetime_prekeys
                .iter()
                .map(OneTimePreKeyRecord::to_public)
                .collect(),
        })
    }

    /// Bundle of the currently stored keys without generating anything, for re-uploading after
    /// the server lost its copy.
    ///
    /// Returns `None` when there is no identity or signed pre-key yet.
    pub async fn existing_public_bundle(&self) -> Result<Option<PublicKeyBundle>, KeyStoreError> {
        let Some(identity) = self.existing_identity_key_pair().await? else {
            return Ok(None);
        };
        let Some(signed_prekey) =
            load_record::<_, SignedPreKeyRecord>(&self.store, SIGNED_PREKEY_KEY).await?
        else {
            return Ok(None);
        };
        let pool = self.onetime_prekey_pool().await?;

        Ok(Some(PublicKeyBundle {
            identity_key: *identity.identity_key(),
            signing_key: *identity.verifying_key(),
            signed_prekey: signed_prekey.to_public(),
            onetime_prekeys: pool
                .prekeys
                .values()
                .map(OneTimePreKeyRecord::to_public)
                .collect(),
        }))
    }

    async fn onetime_prekey_pool(&self) -> Result<OneTimePreKeyPool, KeyStoreError> {
        let pool = load_record(&self.store, ONETIME_PREKEYS_KEY)
            .await?
            .unwrap_or_else(|| OneTimePreKeyPool {
                next_id: FIRST_PREKEY_ID,
                prekeys: BTreeMap::new(),
            });
        Ok(pool)
    }
}

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error("identity key pair needs to exist before a signed pre-key can be created")]
    IdentityMissing,
}
