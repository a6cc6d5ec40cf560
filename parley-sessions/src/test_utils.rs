// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory messaging server and peers for tests.
use std::collections::HashMap;
use std::sync::Arc;

use parley_encryption::crypto::x25519::PublicKey;
use parley_encryption::{OneTimePreKey, PublicKeyBundle, ReceivedKeyBundle, Rng};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::group::GroupManager;
use crate::key_change::KeyChangeDetector;
use crate::memory::MemoryStore;
use crate::session::SessionManager;
use crate::traits::{
    EncryptedSenderKey, IdentityTrustService, KeyBundleService, PendingSenderKey,
    SenderKeyDistributionService,
};

pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

#[derive(Debug, Error)]
pub enum TestServerError {
    #[error("server is not reachable")]
    Offline,

    #[error("no key bundle published for {0}")]
    UnknownUser(String),
}

type GroupRecipient = (String, String);

#[derive(Debug, Default)]
struct TestServerInner {
    offline: bool,
    bundles: HashMap<String, PublicKeyBundle>,
    pending: HashMap<GroupRecipient, Vec<PendingSenderKey>>,
    known_keys: HashMap<(String, String), PublicKey>,
    verified_keys: HashMap<(String, String), PublicKey>,
}

/// Shared state of a messaging server, hand out [`TestClient`]s to let users talk to it.
#[derive(Clone, Debug, Default)]
pub struct TestServer {
    inner: Arc<RwLock<TestServerInner>>,
}

impl TestServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(&self, user_id: &str) -> TestClient {
        TestClient {
            user_id: user_id.to_owned(),
            server: self.clone(),
        }
    }

    /// Makes every following request fail until switched back.
    pub async fn set_offline(&self, offline: bool) {
        self.inner.write().await.offline = offline;
    }

    pub async fn onetime_prekeys(&self, user_id: &str) -> usize {
        self.inner
            .read()
            .await
            .bundles
            .get(user_id)
            .map(|bundle| bundle.onetime_prekeys.len())
            .unwrap_or_default()
    }

    pub async fn clear_onetime_prekeys(&self, user_id: &str) {
        if let Some(bundle) = self.inner.write().await.bundles.get_mut(user_id) {
            bundle.onetime_prekeys.clear();
        }
    }

    pub async fn forget_bundle(&self, user_id: &str) {
        self.inner.write().await.bundles.remove(user_id);
    }

    pub async fn pending_count(&self, group_id: &str, recipient_user_id: &str) -> usize {
        self.inner
            .read()
            .await
            .pending
            .get(&(group_id.to_owned(), recipient_user_id.to_owned()))
            .map(Vec::len)
            .unwrap_or_default()
    }

    pub async fn known_identity_key(&self, user_id: &str, contact_id: &str) -> Option<PublicKey> {
        self.inner
            .read()
            .await
            .known_keys
            .get(&(user_id.to_owned(), contact_id.to_owned()))
            .copied()
    }

    pub async fn verified_identity_key(
        &self,
        user_id: &str,
        contact_id: &str,
    ) -> Option<PublicKey> {
        self.inner
            .read()
            .await
            .verified_keys
            .get(&(user_id.to_owned(), contact_id.to_owned()))
            .copied()
    }
}

/// Connection of one user to the [`TestServer`].
#[derive(Clone, Debug)]
pub struct TestClient {
    user_id: String,
    server: TestServer,
}

impl TestClient {
    async fn write(
        &self,
    ) -> Result<tokio::sync::RwLockWriteGuard<'_, TestServerInner>, TestServerError> {
        let inner = self.server.inner.write().await;
        if inner.offline {
            return Err(TestServerError::Offline);
        }
        Ok(inner)
    }
}

impl KeyBundleService for TestClient {
    type Error = TestServerError;

    async fn upload_bundle(&self, bundle: &PublicKeyBundle) -> Result<(), Self::Error> {
        let mut inner = self.write().await?;
        inner.bundles.insert(self.user_id.clone(), bundle.clone());
        Ok(())
    }

    async fn onetime_prekey_count(&self) -> Result<usize, Self::Error> {
        let inner = self.write().await?;
        Ok(inner
            .bundles
            .get(&self.user_id)
            .map(|bundle| bundle.onetime_prekeys.len())
            .unwrap_or_default())
    }

    async fn key_bundle(&self, user_id: &str) -> Result<ReceivedKeyBundle, Self::Error> {
        let mut inner = self.write().await?;
        let bundle = inner
            .bundles
            .get_mut(user_id)
            .ok_or_else(|| TestServerError::UnknownUser(user_id.to_owned()))?;
        let onetime_prekey = if bundle.onetime_prekeys.is_empty() {
            None
        } else {
            Some(bundle.onetime_prekeys.remove(0))
        };
        Ok(bundle.to_received(onetime_prekey))
    }

    async fn replenish_onetime_prekeys(&self, prekeys: &[OneTimePreKey]) -> Result<(), Self::Error> {
        let mut inner = self.write().await?;
        let bundle = inner
            .bundles
            .get_mut(&self.user_id)
            .ok_or_else(|| TestServerError::UnknownUser(self.user_id.clone()))?;
        bundle.onetime_prekeys.extend_from_slice(prekeys);
        Ok(())
    }
}

impl SenderKeyDistributionService for TestClient {
    type Error = TestServerError;

    async fn distribute(
        &self,
        group_id: &str,
        keys: Vec<EncryptedSenderKey>,
    ) -> Result<(), Self::Error> {
        let mut inner = self.write().await?;
        for key in keys {
            inner
                .pending
                .entry((group_id.to_owned(), key.recipient_user_id))
                .or_default()
                .push(PendingSenderKey {
                    sender_user_id: self.user_id.clone(),
                    encrypted_key: key.encrypted_key,
                });
        }
        Ok(())
    }

    async fn fetch_pending(&self, group_id: &str) -> Result<Vec<PendingSenderKey>, Self::Error> {
        let mut inner = self.write().await?;
        Ok(inner
            .pending
            .remove(&(group_id.to_owned(), self.user_id.clone()))
            .unwrap_or_default())
    }

    async fn revoke_own(&self, group_id: &str) -> Result<(), Self::Error> {
        let mut inner = self.write().await?;
        for ((group, _), items) in inner.pending.iter_mut() {
            if group == group_id {
                items.retain(|item| item.sender_user_id != self.user_id);
            }
        }
        Ok(())
    }
}

impl IdentityTrustService for TestClient {
    type Error = TestServerError;

    async fn update_known_identity_key(
        &self,
        contact_id: &str,
        identity_key: &PublicKey,
    ) -> Result<(), Self::Error> {
        let mut inner = self.write().await?;
        inner
            .known_keys
            .insert((self.user_id.clone(), contact_id.to_owned()), *identity_key);
        Ok(())
    }

    async fn verify_identity_key(
        &self,
        contact_id: &str,
        identity_key: &PublicKey,
    ) -> Result<(), Self::Error> {
        let mut inner = self.write().await?;
        let key = (self.user_id.clone(), contact_id.to_owned());
        inner.known_keys.insert(key.clone(), *identity_key);
        inner.verified_keys.insert(key, *identity_key);
        Ok(())
    }
}

pub type TestSessionManager = SessionManager<MemoryStore, TestClient>;

pub type TestGroupManager = GroupManager<MemoryStore, TestClient, TestClient>;

pub type TestKeyChangeDetector = KeyChangeDetector<MemoryStore, TestClient>;

/// User with their own store and managers, connected to a [`TestServer`].
pub struct TestPeer {
    pub user_id: String,
    pub store: MemoryStore,
    pub sessions: TestSessionManager,
    pub groups: TestGroupManager,
    pub key_changes: TestKeyChangeDetector,
}

impl TestPeer {
    /// Creates a peer with a fresh store and publishes its key bundle.
    pub async fn new(user_id: &str, server: &TestServer, seed: u8) -> Self {
        let peer = Self::from_store(user_id, MemoryStore::new(), server, seed);
        peer.sessions
            .publish_key_bundle()
            .await
            .expect("publish key bundle");
        peer
    }

    /// Drops all in-memory state and starts over from what was persisted.
    pub fn restart(self, server: &TestServer, seed: u8) -> Self {
        Self::from_store(&self.user_id, self.store, server, seed)
    }

    fn from_store(user_id: &str, store: MemoryStore, server: &TestServer, seed: u8) -> Self {
        let config = Config {
            onetime_prekey_batch_size: 5,
            onetime_prekey_min_count: 2,
            ..Config::default()
        };
        let client = server.client(user_id);
        let sessions = SessionManager::new(
            store.clone(),
            client.clone(),
            config,
            Rng::from_seed([seed; 32]),
        );
        let groups = GroupManager::new(user_id, store.clone(), sessions.clone(), client.clone());
        let key_changes = KeyChangeDetector::new(store.clone(), client);

        Self {
            user_id: user_id.to_owned(),
            store,
            sessions,
            groups,
            key_changes,
        }
    }
}
