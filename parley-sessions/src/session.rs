// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pairwise encrypted sessions with other users.
//!
//! [`SessionManager`] runs X3DH exactly once per new peer, then routes all traffic through the
//! Double Ratchet state of that conversation. Each conversation has its own exclusive lock which
//! also guards the cached session record: encrypt and decrypt for one peer never interleave,
//! different peers proceed in parallel.
//!
//! A session record is persisted after every successful operation, before the result is handed
//! to the caller. Failed operations leave the cached and persisted record untouched.
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parley_encryption::crypto::sha2::{SHA256_DIGEST_SIZE, sha2_256};
use parley_encryption::crypto::x25519::{PublicKey, SecretKey};
use parley_encryption::{
    DoubleRatchet, DoubleRatchetError, DoubleRatchetState, EncryptedPayload, OneTimePreKeyId,
    Rng, RngError, X3dhError, X3dhHeader, x3dh_initiate, x3dh_respond,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::Config;
use crate::key_store::{KeyStore, KeyStoreError};
use crate::locks::KeyedLocks;
use crate::record::{RecordError, delete_record, load_record, store_record};
use crate::traits::{KeyBundleService, KeyValueStore};

fn session_key(peer_id: &str) -> String {
    format!("sessions/{peer_id}")
}

/// Persisted state of the session with one peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRecord {
    ratchet: DoubleRatchetState,

    /// Identity key of the peer this session was established with.
    peer_identity_key: PublicKey,

    /// Ephemeral key of the X3DH header this session was created from, when we responded.
    ///
    /// A header carrying the same key again is a re-delivery of the initial message and must
    /// not replace the session.
    initiation_ephemeral_key: Option<PublicKey>,
}

impl SessionRecord {
    pub fn ratchet(&self) -> &DoubleRatchetState {
        &self.ratchet
    }

    pub fn peer_identity_key(&self) -> &PublicKey {
        &self.peer_identity_key
    }
}

/// Session ready to encrypt with, together with the X3DH header for the first outgoing message
/// when it was just established.
#[derive(Debug)]
struct EstablishResult {
    session: SessionRecord,
    header: Option<X3dhHeader>,
}

/// Orchestrates X3DH and Double Ratchet sessions with all peers of the local user.
///
/// Cheap to clone, clones share caches and locks.
pub struct SessionManager<S, B> {
    inner: Arc<SessionManagerInner<S, B>>,
}

struct SessionManagerInner<S, B> {
    store: S,
    key_store: KeyStore<S>,
    bundles: B,
    config: Config,
    rng: Rng,
    sessions: KeyedLocks<String, Option<SessionRecord>>,
    decrypt_cache: Mutex<DecryptCache>,
}

impl<S, B> Clone for SessionManager<S, B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S, B> SessionManager<S, B>
where
    S: KeyValueStore + Clone,
    B: KeyBundleService,
{
    pub fn new(store: S, bundles: B, config: Config, rng: Rng) -> Self {
        let decrypt_cache = DecryptCache::new(config.decrypt_cache_capacity);
        Self {
            inner: Arc::new(SessionManagerInner {
                key_store: KeyStore::new(store.clone()),
                store,
                bundles,
                config,
                rng,
                sessions: KeyedLocks::new(),
                decrypt_cache: Mutex::new(decrypt_cache),
            }),
        }
    }

    pub fn key_store(&self) -> &KeyStore<S> {
        &self.inner.key_store
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub(crate) fn rng(&self) -> &Rng {
        &self.inner.rng
    }

    /// Identity key of the local user, generated on first use.
    pub async fn own_identity_key(&self) -> Result<PublicKey, SessionError> {
        let identity = self.inner.key_store.identity_key_pair(&self.inner.rng).await?;
        Ok(*identity.identity_key())
    }

    /// Uploads identity key, signed pre-key and a fresh batch of one-time pre-keys.
    pub async fn publish_key_bundle(&self) -> Result<(), SessionError> {
        let bundle = self
            .inner
            .key_store
            .public_key_bundle(self.inner.config.onetime_prekey_batch_size, &self.inner.rng)
            .await?;
        self.inner
            .bundles
            .upload_bundle(&bundle)
            .await
            .map_err(|err| SessionError::Network(format!("{err:?}")))?;
        debug!(
            onetime_prekeys = bundle.onetime_prekeys.len(),
            "published key bundle"
        );
        Ok(())
    }

    /// Uploads a new batch of one-time pre-keys when the server's pool runs low.
    ///
    /// Returns the number of uploaded keys.
    pub async fn replenish_onetime_prekeys(&self) -> Result<usize, SessionError> {
        let count = self
            .inner
            .bundles
            .onetime_prekey_count()
            .await
            .map_err(|err| SessionError::Network(format!("{err:?}")))?;
        if count >= self.inner.config.onetime_prekey_min_count {
            return Ok(0);
        }

        let prekeys: Vec<_> = self
            .inner
            .key_store
            .generate_onetime_prekeys(self.inner.config.onetime_prekey_batch_size, &self.inner.rng)
            .await?
            .iter()
            .map(|record| record.to_public())
            .collect();
        self.inner
            .bundles
            .replenish_onetime_prekeys(&prekeys)
            .await
            .map_err(|err| SessionError::Network(format!("{err:?}")))?;
        debug!(count, uploaded = prekeys.len(), "replenished one-time pre-keys");
        Ok(prekeys.len())
    }

    /// Uploads the stored keys again without generating new ones, for when the server lost
    /// them.
    ///
    /// Returns `false` if there was nothing to upload yet.
    pub async fn reupload_key_bundle(&self) -> Result<bool, SessionError> {
        let Some(bundle) = self.inner.key_store.existing_public_bundle().await? else {
            return Ok(false);
        };
        self.inner
            .bundles
            .upload_bundle(&bundle)
            .await
            .map_err(|err| SessionError::Network(format!("{err:?}")))?;
        debug!("re-uploaded existing key bundle");
        Ok(true)
    }

    pub async fn has_session(&self, peer_id: &str) -> Result<bool, SessionError> {
        let mut slot = self.inner.sessions.lock(&peer_id.to_owned()).await;
        Ok(self.load(peer_id, &mut slot).await?.is_some())
    }

    /// Identity key of the peer as used in the current session.
    pub async fn identity_key(&self, peer_id: &str) -> Result<Option<PublicKey>, SessionError> {
        let mut slot = self.inner.sessions.lock(&peer_id.to_owned()).await;
        Ok(self
            .load(peer_id, &mut slot)
            .await?
            .map(|session| session.peer_identity_key))
    }

    /// Drops the session with a peer, the next message runs X3DH again.
    pub async fn delete_session(&self, peer_id: &str) -> Result<(), SessionError> {
        let mut slot = self.inner.sessions.lock(&peer_id.to_owned()).await;
        delete_record(&self.inner.store, &session_key(peer_id)).await?;
        *slot = None;
        debug!(peer = peer_id, "deleted session");
        Ok(())
    }

    /// Encrypts a message for a peer, establishing a session first if there is none.
    ///
    /// The first message of a new session carries the X3DH header.
    pub async fn encrypt(
        &self,
        peer_id: &str,
        plaintext: &[u8],
    ) -> Result<EncryptedPayload, SessionError> {
        let mut slot = self.inner.sessions.lock(&peer_id.to_owned()).await;

        let EstablishResult {
            mut session,
            header,
        } = self.establish(peer_id, &mut slot).await?;

        let (ratchet, mut payload) =
            DoubleRatchet::encrypt(session.ratchet.clone(), plaintext, &self.inner.rng)?;
        payload.initiation = header;
        session.ratchet = ratchet;

        self.persist(peer_id, &mut slot, session).await?;

        Ok(payload)
    }

    /// Decrypts a message of a peer.
    ///
    /// A message carrying an X3DH header replaces any existing session with that peer (they
    /// re-initiated, for example after re-installing), unless it's a re-delivery of the message
    /// our current session was created from. Messages without header require a session.
    ///
    /// The same ciphertext delivered twice returns the cached plaintext instead of advancing the
    /// ratchet a second time.
    pub async fn decrypt(
        &self,
        peer_id: &str,
        payload: &EncryptedPayload,
    ) -> Result<Vec<u8>, SessionError> {
        let cache_key = sha2_256(&[peer_id.as_bytes(), &[0], &payload.ciphertext]);
        if let Some(plaintext) = self.cached_plaintext(&cache_key).await {
            return Ok(plaintext);
        }

        let mut slot = self.inner.sessions.lock(&peer_id.to_owned()).await;

        // Another delivery path might have decrypted the same message while we were waiting.
        if let Some(plaintext) = self.cached_plaintext(&cache_key).await {
            return Ok(plaintext);
        }

        let existing = self.load(peer_id, &mut slot).await?;
        let (session, consumed_prekey) = match (&payload.initiation, existing) {
            (Some(header), Some(existing))
                if existing.initiation_ephemeral_key == Some(header.ephemeral_key) =>
            {
                (existing, None)
            }
            (Some(header), existing) => {
                if existing.is_some() {
                    debug!(peer = peer_id, "peer re-initiated session, replacing it");
                }
                let session = self.respond(peer_id, header).await?;
                (session, header.used_onetime_prekey_id)
            }
            (None, Some(existing)) => (existing, None),
            (None, None) => return Err(SessionError::NoSession(peer_id.to_owned())),
        };

        let (ratchet, plaintext) =
            match DoubleRatchet::decrypt(session.ratchet.clone(), payload, &self.inner.rng) {
                Ok(result) => result,
                Err(err) => {
                    warn!(
                        peer = peer_id,
                        message_index = payload.message_index,
                        "could not decrypt message: {err}"
                    );
                    return Err(err.into());
                }
            };

        let mut session = session;
        session.ratchet = ratchet;
        self.persist(peer_id, &mut slot, session).await?;

        self.inner
            .decrypt_cache
            .lock()
            .await
            .insert(cache_key, plaintext.clone());

        // The session is stored already, a failure only leaves the used pre-key behind.
        if let Some(id) = consumed_prekey {
            if let Err(err) = self.remove_consumed_prekey(id).await {
                warn!(id, "could not remove consumed one-time pre-key: {err}");
            }
        }

        Ok(plaintext)
    }

    async fn establish(
        &self,
        peer_id: &str,
        slot: &mut Option<SessionRecord>,
    ) -> Result<EstablishResult, SessionError> {
        if let Some(session) = self.load(peer_id, slot).await? {
            return Ok(EstablishResult {
                session,
                header: None,
            });
        }

        let bundle = self
            .inner
            .bundles
            .key_bundle(peer_id)
            .await
            .map_err(|err| SessionError::Network(format!("{err:?}")))?;

        let identity = self.inner.key_store.identity_key_pair(&self.inner.rng).await?;
        let ephemeral_secret = SecretKey::generate(&self.inner.rng)?;
        let initiated = x3dh_initiate(&identity, &ephemeral_secret, &bundle)?;

        let ratchet = DoubleRatchet::init_initiator(
            &initiated.shared_secret,
            &bundle.signed_prekey.key,
            &self.inner.rng,
        )?;

        debug!(
            peer = peer_id,
            onetime_prekey = bundle.onetime_prekey.is_some(),
            "established session as initiator"
        );

        Ok(EstablishResult {
            session: SessionRecord {
                ratchet,
                peer_identity_key: bundle.identity_key,
                initiation_ephemeral_key: None,
            },
            header: Some(initiated.header),
        })
    }

    async fn respond(
        &self,
        peer_id: &str,
        header: &X3dhHeader,
    ) -> Result<SessionRecord, SessionError> {
        let identity = self
            .inner
            .key_store
            .existing_identity_key_pair()
            .await?
            .ok_or(KeyStoreError::IdentityMissing)?;
        let signed_prekey = self.inner.key_store.signed_prekey(&self.inner.rng).await?;
        let onetime_prekey = match header.used_onetime_prekey_id {
            Some(id) => self.inner.key_store.onetime_prekey(id).await?,
            None => None,
        };

        let shared_secret =
            x3dh_respond(&identity, &signed_prekey, onetime_prekey.as_ref(), header)?;
        let ratchet = DoubleRatchet::init_responder(&shared_secret, &signed_prekey);

        debug!(
            peer = peer_id,
            onetime_prekey = header.used_onetime_prekey_id.is_some(),
            "established session as responder"
        );

        Ok(SessionRecord {
            ratchet,
            peer_identity_key: header.sender_identity_key,
            initiation_ephemeral_key: Some(header.ephemeral_key),
        })
    }

    /// Session from cache, falling back to the store.
    async fn load(
        &self,
        peer_id: &str,
        slot: &mut Option<SessionRecord>,
    ) -> Result<Option<SessionRecord>, SessionError> {
        if slot.is_none() {
            *slot = load_record(&self.inner.store, &session_key(peer_id)).await?;
        }
        Ok(slot.clone())
    }

    async fn persist(
        &self,
        peer_id: &str,
        slot: &mut Option<SessionRecord>,
        session: SessionRecord,
    ) -> Result<(), SessionError> {
        store_record(&self.inner.store, &session_key(peer_id), &session).await?;
        *slot = Some(session);
        Ok(())
    }

    async fn remove_consumed_prekey(&self, id: OneTimePreKeyId) -> Result<(), SessionError> {
        self.inner.key_store.remove_onetime_prekey(id).await?;
        debug!(id, "removed consumed one-time pre-key");
        Ok(())
    }

    async fn cached_plaintext(&self, cache_key: &CacheKey) -> Option<Vec<u8>> {
        let plaintext = self.inner.decrypt_cache.lock().await.get(cache_key);
        if plaintext.is_some() {
            debug!("message was already decrypted, returning cached result");
        }
        plaintext
    }
}

type CacheKey = [u8; SHA256_DIGEST_SIZE];

/// Bounded map of recently decrypted ciphertexts (by hash) to their plaintext, oldest entries
/// are evicted first.
#[derive(Debug)]
struct DecryptCache {
    capacity: usize,
    entries: HashMap<CacheKey, Vec<u8>>,
    order: VecDeque<CacheKey>,
}

impl DecryptCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: CacheKey, plaintext: Vec<u8>) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.insert(key, plaintext).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    X3dh(#[from] X3dhError),

    #[error(transparent)]
    DoubleRatchet(#[from] DoubleRatchetError),

    #[error("no session with {0} and the message does not initiate one")]
    NoSession(String),

    #[error("key bundle service failed: {0}")]
    Network(String),
}

impl SessionError {
    /// Returns `true` for transient failures of a remote service, the operation can be
    /// retried as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::Network(_))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use assert_matches::assert_matches;
    use parley_encryption::{DoubleRatchetError, Rng};

    use crate::config::Config;
    use crate::memory::MemoryStore;
    use crate::test_utils::{TestPeer, TestServer, setup_logging};
    use crate::traits::KeyValueStore;

    use super::{DecryptCache, SessionError, SessionManager};

    /// Store which refuses writes to the one-time pre-key pool when asked to.
    #[derive(Clone, Debug, Default)]
    struct ReadOnlyPreKeysStore {
        store: MemoryStore,
        read_only: Arc<AtomicBool>,
    }

    impl KeyValueStore for ReadOnlyPreKeysStore {
        type Error = &'static str;

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Self::Error> {
            Ok(self.store.get(key).await.unwrap())
        }

        async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), Self::Error> {
            if key == "keys/onetime_prekeys" && self.read_only.load(Ordering::SeqCst) {
                return Err("pre-keys are read-only");
            }
            self.store.set(key, value).await.unwrap();
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<(), Self::Error> {
            self.store.delete(key).await.unwrap();
            Ok(())
        }
    }

    #[test]
    fn decrypt_cache_evicts_oldest() {
        let mut cache = DecryptCache::new(2);
        cache.insert([1; 32], b"one".to_vec());
        cache.insert([2; 32], b"two".to_vec());
        cache.insert([1; 32], b"one".to_vec());
        assert_eq!(cache.order.len(), 2);

        cache.insert([3; 32], b"three".to_vec());
        assert_eq!(cache.get(&[1; 32]), None);
        assert_eq!(cache.get(&[2; 32]), Some(b"two".to_vec()));
        assert_eq!(cache.get(&[3; 32]), Some(b"three".to_vec()));

        let mut disabled = DecryptCache::new(0);
        disabled.insert([1; 32], b"one".to_vec());
        assert_eq!(disabled.get(&[1; 32]), None);
    }

    #[tokio::test]
    async fn first_message_carries_header() {
        setup_logging();
        let server = TestServer::new();
        let alice = TestPeer::new("alice", &server, 1).await;
        let bob = TestPeer::new("bob", &server, 2).await;

        assert!(!alice.sessions.has_session("bob").await.unwrap());

        let payload_1 = alice.sessions.encrypt("bob", b"Hello, Bob!").await.unwrap();
        let header = payload_1.initiation.expect("first message initiates session");
        assert_eq!(
            header.sender_identity_key,
            alice.sessions.own_identity_key().await.unwrap()
        );
        assert!(alice.sessions.has_session("bob").await.unwrap());

        // Until Bob answers, further messages don't repeat the header.
        let payload_2 = alice.sessions.encrypt("bob", b"Are you there?").await.unwrap();
        assert!(payload_2.initiation.is_none());

        assert_eq!(
            bob.sessions.decrypt("alice", &payload_1).await.unwrap(),
            b"Hello, Bob!"
        );
        assert_eq!(
            bob.sessions.decrypt("alice", &payload_2).await.unwrap(),
            b"Are you there?"
        );
    }

    #[tokio::test]
    async fn message_without_session() {
        let server = TestServer::new();
        let alice = TestPeer::new("alice", &server, 1).await;
        let bob = TestPeer::new("bob", &server, 2).await;
        let charlie = TestPeer::new("charlie", &server, 3).await;

        let _ = alice.sessions.encrypt("bob", b"Hello, Bob!").await.unwrap();
        let payload = alice.sessions.encrypt("bob", b"Hello again").await.unwrap();

        // Bob missed the initial message.
        assert_matches!(
            bob.sessions.decrypt("alice", &payload).await,
            Err(SessionError::NoSession(peer)) if peer == "alice"
        );

        // Message from someone else's session.
        let payload = charlie.sessions.encrypt("bob", b"Hi").await.unwrap();
        assert!(bob.sessions.decrypt("charlie", &payload).await.is_ok());
        assert_matches!(
            alice.sessions.decrypt("charlie", &payload).await,
            Err(SessionError::X3dh(_) | SessionError::DoubleRatchet(_))
        );
    }

    #[tokio::test]
    async fn tampered_message_keeps_session() {
        let server = TestServer::new();
        let alice = TestPeer::new("alice", &server, 1).await;
        let bob = TestPeer::new("bob", &server, 2).await;

        let payload = alice.sessions.encrypt("bob", b"Hello, Bob!").await.unwrap();
        bob.sessions.decrypt("alice", &payload).await.unwrap();

        let payload = alice.sessions.encrypt("bob", b"Second").await.unwrap();
        let mut tampered = payload.clone();
        tampered.ciphertext[20] ^= 1;
        assert_matches!(
            bob.sessions.decrypt("alice", &tampered).await,
            Err(SessionError::DoubleRatchet(DoubleRatchetError::Aead(_)))
        );

        assert_eq!(bob.sessions.decrypt("alice", &payload).await.unwrap(), b"Second");
    }

    #[tokio::test]
    async fn delete_session() {
        let server = TestServer::new();
        let alice = TestPeer::new("alice", &server, 1).await;
        let bob = TestPeer::new("bob", &server, 2).await;

        let payload = alice.sessions.encrypt("bob", b"Hello, Bob!").await.unwrap();
        bob.sessions.decrypt("alice", &payload).await.unwrap();

        alice.sessions.delete_session("bob").await.unwrap();
        assert!(!alice.sessions.has_session("bob").await.unwrap());
        assert!(alice.sessions.identity_key("bob").await.unwrap().is_none());

        // Next message starts over with a new X3DH which Bob accepts.
        let payload = alice.sessions.encrypt("bob", b"Fresh start").await.unwrap();
        assert!(payload.initiation.is_some());
        assert_eq!(
            bob.sessions.decrypt("alice", &payload).await.unwrap(),
            b"Fresh start"
        );
    }

    #[tokio::test]
    async fn session_survives_restart() {
        let server = TestServer::new();
        let alice = TestPeer::new("alice", &server, 1).await;
        let bob = TestPeer::new("bob", &server, 2).await;

        let payload = alice.sessions.encrypt("bob", b"Hello, Bob!").await.unwrap();
        bob.sessions.decrypt("alice", &payload).await.unwrap();

        // New manager over the same store has no cache and loads the persisted session.
        let bob = bob.restart(&server, 3);
        let payload = bob.sessions.encrypt("alice", b"Hi Alice").await.unwrap();
        assert!(payload.initiation.is_none());
        assert_eq!(
            alice.sessions.decrypt("bob", &payload).await.unwrap(),
            b"Hi Alice"
        );
    }

    #[tokio::test]
    async fn failed_prekey_removal_keeps_plaintext() {
        let server = TestServer::new();
        let alice = TestPeer::new("alice", &server, 1).await;

        let store = ReadOnlyPreKeysStore::default();
        let bob = SessionManager::new(
            store.clone(),
            server.client("bob"),
            Config::default(),
            Rng::from_seed([2; 32]),
        );
        bob.publish_key_bundle().await.unwrap();
        store.read_only.store(true, Ordering::SeqCst);

        let payload = alice.sessions.encrypt("bob", b"Hello, Bob!").await.unwrap();
        assert!(payload.initiation.is_some());
        assert_eq!(
            bob.decrypt("alice", &payload).await.unwrap(),
            b"Hello, Bob!"
        );
        assert!(bob.has_session("alice").await.unwrap());

        // Delivered again, answered from the cache.
        assert_eq!(
            bob.decrypt("alice", &payload).await.unwrap(),
            b"Hello, Bob!"
        );

        let reply = bob.encrypt("alice", b"Hi Alice").await.unwrap();
        assert_eq!(
            alice.sessions.decrypt("bob", &reply).await.unwrap(),
            b"Hi Alice"
        );
    }
}
