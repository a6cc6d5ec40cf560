// SPDX-License-Identifier: MIT OR Apache-2.0

use assert_matches::assert_matches;
use parley_encryption::{DoubleRatchetError, Rng, SafetyNumber, SenderKeyError};

use crate::config::Config;
use crate::group::GroupError;
use crate::memory::MemoryStore;
use crate::session::{SessionError, SessionManager};
use crate::test_utils::{TestPeer, TestServer, setup_logging};

const GROUP: &str = "book-club";

#[tokio::test]
async fn conversation() {
    setup_logging();
    let server = TestServer::new();
    let alice = TestPeer::new("alice", &server, 1).await;
    let bob = TestPeer::new("bob", &server, 2).await;

    let payload = alice.sessions.encrypt("bob", b"Hello, Bob!").await.unwrap();
    assert!(payload.initiation.is_some());
    assert_eq!(
        bob.sessions.decrypt("alice", &payload).await.unwrap(),
        b"Hello, Bob!"
    );

    let payload = bob.sessions.encrypt("alice", b"Hello, Alice!").await.unwrap();
    assert!(payload.initiation.is_none());
    assert_eq!(
        alice.sessions.decrypt("bob", &payload).await.unwrap(),
        b"Hello, Alice!"
    );

    for round in 0..3 {
        let text = format!("Alice, round {round}");
        let payload = alice.sessions.encrypt("bob", text.as_bytes()).await.unwrap();
        assert!(payload.initiation.is_none());
        assert_eq!(
            bob.sessions.decrypt("alice", &payload).await.unwrap(),
            text.as_bytes()
        );

        let text = format!("Bob, round {round}");
        let payload = bob.sessions.encrypt("alice", text.as_bytes()).await.unwrap();
        assert_eq!(
            alice.sessions.decrypt("bob", &payload).await.unwrap(),
            text.as_bytes()
        );
    }

    // Both sides see each other's real identity key.
    assert_eq!(
        alice.sessions.identity_key("bob").await.unwrap(),
        Some(bob.sessions.own_identity_key().await.unwrap())
    );
    assert_eq!(
        bob.sessions.identity_key("alice").await.unwrap(),
        Some(alice.sessions.own_identity_key().await.unwrap())
    );
}

#[tokio::test]
async fn duplicate_delivery() {
    let server = TestServer::new();
    let alice = TestPeer::new("alice", &server, 1).await;
    let bob = TestPeer::new("bob", &server, 2).await;

    let payload = alice.sessions.encrypt("bob", b"Hello, Bob!").await.unwrap();

    // Push notification and websocket deliver the same message at the same time.
    let (result_1, result_2) = tokio::join!(
        bob.sessions.decrypt("alice", &payload),
        bob.sessions.decrypt("alice", &payload),
    );
    assert_eq!(result_1.unwrap(), b"Hello, Bob!");
    assert_eq!(result_2.unwrap(), b"Hello, Bob!");

    // Session is intact and advanced exactly once.
    let payload = alice.sessions.encrypt("bob", b"Second").await.unwrap();
    assert_eq!(bob.sessions.decrypt("alice", &payload).await.unwrap(), b"Second");
    assert_eq!(bob.sessions.decrypt("alice", &payload).await.unwrap(), b"Second");
}

#[tokio::test]
async fn onetime_prekeys() {
    let server = TestServer::new();
    let alice = TestPeer::new("alice", &server, 1).await;
    let bob = TestPeer::new("bob", &server, 2).await;
    let charlie = TestPeer::new("charlie", &server, 3).await;

    assert_eq!(server.onetime_prekeys("bob").await, 5);
    assert_eq!(bob.sessions.key_store().onetime_prekey_count().await.unwrap(), 5);

    // Fetching Bob's bundle consumes one of his one-time pre-keys on the server, decrypting
    // the initial message deletes it locally.
    let payload = alice.sessions.encrypt("bob", b"Hello, Bob!").await.unwrap();
    let used_id = payload
        .initiation
        .as_ref()
        .and_then(|header| header.used_onetime_prekey_id)
        .expect("one-time pre-key was used");
    assert_eq!(server.onetime_prekeys("bob").await, 4);
    bob.sessions.decrypt("alice", &payload).await.unwrap();
    assert_eq!(bob.sessions.key_store().onetime_prekey_count().await.unwrap(), 4);
    assert!(
        bob.sessions
            .key_store()
            .onetime_prekey(used_id)
            .await
            .unwrap()
            .is_none()
    );

    // Enough keys left, nothing to do.
    assert_eq!(bob.sessions.replenish_onetime_prekeys().await.unwrap(), 0);

    // Exhausted pool still allows establishing a session.
    server.clear_onetime_prekeys("bob").await;
    let payload = charlie.sessions.encrypt("bob", b"Hi Bob").await.unwrap();
    assert_eq!(
        payload
            .initiation
            .as_ref()
            .map(|header| header.used_onetime_prekey_id),
        Some(None)
    );
    assert_eq!(bob.sessions.decrypt("charlie", &payload).await.unwrap(), b"Hi Bob");

    assert_eq!(bob.sessions.replenish_onetime_prekeys().await.unwrap(), 5);
    assert_eq!(server.onetime_prekeys("bob").await, 5);
    assert_eq!(bob.sessions.key_store().onetime_prekey_count().await.unwrap(), 9);
}

#[tokio::test]
async fn reupload_lost_bundle() {
    let server = TestServer::new();
    let alice = TestPeer::new("alice", &server, 1).await;
    let bob = TestPeer::new("bob", &server, 2).await;
    let bob_key = bob.sessions.own_identity_key().await.unwrap();

    server.forget_bundle("bob").await;
    let err = alice.sessions.encrypt("bob", b"Hello, Bob!").await.unwrap_err();
    assert_matches!(err, SessionError::Network(_));
    assert!(err.is_retryable());
    assert!(!alice.sessions.has_session("bob").await.unwrap());

    // Same keys as before, no new identity.
    assert!(bob.sessions.reupload_key_bundle().await.unwrap());
    assert_eq!(server.onetime_prekeys("bob").await, 5);

    let payload = alice.sessions.encrypt("bob", b"Hello, Bob!").await.unwrap();
    assert_eq!(alice.sessions.identity_key("bob").await.unwrap(), Some(bob_key));
    assert_eq!(
        bob.sessions.decrypt("alice", &payload).await.unwrap(),
        b"Hello, Bob!"
    );

    // A device which never published has nothing to re-upload.
    let sessions = SessionManager::new(
        MemoryStore::new(),
        server.client("dave"),
        Config::default(),
        Rng::from_seed([4; 32]),
    );
    assert!(!sessions.reupload_key_bundle().await.unwrap());
    assert_eq!(server.onetime_prekeys("dave").await, 0);
}

#[tokio::test]
async fn offline_server() {
    let server = TestServer::new();
    let alice = TestPeer::new("alice", &server, 1).await;
    let bob = TestPeer::new("bob", &server, 2).await;

    server.set_offline(true).await;
    let err = alice.sessions.encrypt("bob", b"Hello, Bob!").await.unwrap_err();
    assert!(err.is_retryable());
    assert!(!alice.sessions.has_session("bob").await.unwrap());

    let err = alice
        .groups
        .encrypt(GROUP, &["alice", "bob"], b"Hello, group!")
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    server.set_offline(false).await;
    let payload = alice.sessions.encrypt("bob", b"Hello, Bob!").await.unwrap();
    assert!(payload.initiation.is_some());
    assert_eq!(
        bob.sessions.decrypt("alice", &payload).await.unwrap(),
        b"Hello, Bob!"
    );
}

#[tokio::test]
async fn reinstall_changes_identity() {
    setup_logging();
    let server = TestServer::new();
    let alice = TestPeer::new("alice", &server, 1).await;
    let bob = TestPeer::new("bob", &server, 2).await;
    let alice_key = alice.sessions.own_identity_key().await.unwrap();
    let bob_key = bob.sessions.own_identity_key().await.unwrap();

    let payload = alice.sessions.encrypt("bob", b"Hello, Bob!").await.unwrap();
    bob.sessions.decrypt("alice", &payload).await.unwrap();
    assert_eq!(
        alice.key_changes.check("bob", "Bob", &bob_key).await.unwrap(),
        None
    );

    // Bob lost his device and starts over with a new identity.
    drop(bob);
    let bob = TestPeer::new("bob", &server, 9).await;
    let bob_new_key = bob.sessions.own_identity_key().await.unwrap();
    assert_ne!(bob_key, bob_new_key);

    let payload = bob.sessions.encrypt("alice", b"I'm back").await.unwrap();
    assert!(payload.initiation.is_some());
    assert_eq!(alice.sessions.decrypt("bob", &payload).await.unwrap(), b"I'm back");
    assert_eq!(
        alice.sessions.identity_key("bob").await.unwrap(),
        Some(bob_new_key)
    );

    let event = alice
        .key_changes
        .check("bob", "Bob", &bob_new_key)
        .await
        .unwrap()
        .expect("identity key changed");
    assert_eq!(event.identity_key, bob_new_key);

    // Both compare safety numbers before accepting the new key.
    let alice_view = SafetyNumber::generate("alice", &alice_key, "bob", &bob_new_key);
    let bob_view = SafetyNumber::generate(
        "bob",
        &bob_new_key,
        "alice",
        &bob.sessions.identity_key("alice").await.unwrap().unwrap(),
    );
    assert_eq!(alice_view, bob_view);
    assert_ne!(
        alice_view,
        SafetyNumber::generate("alice", &alice_key, "bob", &bob_key)
    );

    alice
        .key_changes
        .acknowledge("bob", &bob_new_key, true)
        .await
        .unwrap();
    assert_eq!(
        server.verified_identity_key("alice", "bob").await,
        Some(bob_new_key)
    );
    assert_eq!(
        alice.key_changes.check("bob", "Bob", &bob_new_key).await.unwrap(),
        None
    );

    // The replaced session works in both directions.
    let payload = alice.sessions.encrypt("bob", b"Welcome back").await.unwrap();
    assert!(payload.initiation.is_none());
    assert_eq!(
        bob.sessions.decrypt("alice", &payload).await.unwrap(),
        b"Welcome back"
    );
}

#[tokio::test]
async fn redelivered_initial_message_keeps_session() {
    let server = TestServer::new();
    let alice = TestPeer::new("alice", &server, 1).await;
    let bob = TestPeer::new("bob", &server, 2).await;

    let initial = alice.sessions.encrypt("bob", b"Hello, Bob!").await.unwrap();
    bob.sessions.decrypt("alice", &initial).await.unwrap();
    let payload = alice.sessions.encrypt("bob", b"Second").await.unwrap();
    bob.sessions.decrypt("alice", &payload).await.unwrap();

    // After a restart the decrypt cache is gone, the header must not reset the session.
    let bob = bob.restart(&server, 3);
    assert_matches!(
        bob.sessions.decrypt("alice", &initial).await,
        Err(SessionError::DoubleRatchet(DoubleRatchetError::DuplicateMessage(0)))
    );

    let payload = alice.sessions.encrypt("bob", b"Third").await.unwrap();
    assert_eq!(bob.sessions.decrypt("alice", &payload).await.unwrap(), b"Third");
}

#[tokio::test]
async fn group_messages() {
    setup_logging();
    let server = TestServer::new();
    let alice = TestPeer::new("alice", &server, 1).await;
    let bob = TestPeer::new("bob", &server, 2).await;
    let charlie = TestPeer::new("charlie", &server, 3).await;
    let members = ["alice", "bob", "charlie"];

    // First message distributes Alice's sender key to everyone else.
    let message = alice
        .groups
        .encrypt(GROUP, &members, b"Welcome to the book club")
        .await
        .unwrap();
    assert_eq!(server.pending_count(GROUP, "bob").await, 1);
    assert_eq!(server.pending_count(GROUP, "charlie").await, 1);
    assert_eq!(server.pending_count(GROUP, "alice").await, 0);

    assert_eq!(
        bob.groups.decrypt(&message).await.unwrap(),
        b"Welcome to the book club"
    );
    assert_eq!(
        charlie.groups.decrypt(&message).await.unwrap(),
        b"Welcome to the book club"
    );
    assert_eq!(server.pending_count(GROUP, "bob").await, 0);

    // Later messages need no new distribution.
    let message = alice
        .groups
        .encrypt(GROUP, &members, b"First book?")
        .await
        .unwrap();
    assert_eq!(server.pending_count(GROUP, "bob").await, 0);
    assert_eq!(bob.groups.decrypt(&message).await.unwrap(), b"First book?");
    assert_eq!(charlie.groups.decrypt(&message).await.unwrap(), b"First book?");

    // Replays are rejected.
    assert_matches!(
        bob.groups.decrypt(&message).await,
        Err(GroupError::SenderKey(SenderKeyError::StaleIteration { .. }))
    );

    // Bob answers with his own sender key.
    let message = bob
        .groups
        .encrypt(GROUP, &members, b"Dune!")
        .await
        .unwrap();
    assert_eq!(alice.groups.decrypt(&message).await.unwrap(), b"Dune!");
    assert_eq!(charlie.groups.decrypt(&message).await.unwrap(), b"Dune!");
}

#[tokio::test]
async fn group_distribution_after_failure() {
    setup_logging();
    let server = TestServer::new();
    let alice = TestPeer::new("alice", &server, 1).await;
    let bob = TestPeer::new("bob", &server, 2).await;
    let charlie = TestPeer::new("charlie", &server, 3).await;

    // Zed never published a bundle, the distribution for Bob was encrypted already.
    let err = alice
        .groups
        .encrypt(GROUP, &["alice", "bob", "zed"], b"Welcome")
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_matches!(err, GroupError::Session(SessionError::Network(_)));
    assert_eq!(server.pending_count(GROUP, "bob").await, 0);

    // Retry sends the same distribution, including the start of the session with Bob.
    let message = alice
        .groups
        .encrypt(GROUP, &["alice", "bob"], b"Welcome, Bob")
        .await
        .unwrap();
    assert_eq!(server.pending_count(GROUP, "bob").await, 1);
    assert_eq!(bob.groups.decrypt(&message).await.unwrap(), b"Welcome, Bob");

    // Charlie has a session with Alice, the server is down when the key is handed over.
    let hello = alice.sessions.encrypt("charlie", b"Hi Charlie").await.unwrap();
    charlie.sessions.decrypt("alice", &hello).await.unwrap();

    let members = ["alice", "bob", "charlie"];
    server.set_offline(true).await;
    assert_matches!(
        alice.groups.encrypt(GROUP, &members, b"Welcome, Charlie").await,
        Err(GroupError::Network(_))
    );
    server.set_offline(false).await;

    let message = alice
        .groups
        .encrypt(GROUP, &members, b"Welcome, Charlie")
        .await
        .unwrap();
    assert_eq!(server.pending_count(GROUP, "charlie").await, 1);
    assert_eq!(server.pending_count(GROUP, "bob").await, 0);
    assert_eq!(
        charlie.groups.decrypt(&message).await.unwrap(),
        b"Welcome, Charlie"
    );
    assert_eq!(
        bob.groups.decrypt(&message).await.unwrap(),
        b"Welcome, Charlie"
    );
}

#[tokio::test]
async fn group_new_member() {
    let server = TestServer::new();
    let alice = TestPeer::new("alice", &server, 1).await;
    let bob = TestPeer::new("bob", &server, 2).await;
    let dave = TestPeer::new("dave", &server, 4).await;

    let early = alice
        .groups
        .encrypt(GROUP, &["alice", "bob"], b"Before Dave")
        .await
        .unwrap();
    bob.groups.decrypt(&early).await.unwrap();

    // Only the new member receives the key.
    let message = alice
        .groups
        .encrypt(GROUP, &["alice", "bob", "dave"], b"Hi Dave")
        .await
        .unwrap();
    assert_eq!(server.pending_count(GROUP, "bob").await, 0);
    assert_eq!(server.pending_count(GROUP, "dave").await, 1);

    assert_eq!(dave.groups.decrypt(&message).await.unwrap(), b"Hi Dave");
    assert_eq!(bob.groups.decrypt(&message).await.unwrap(), b"Hi Dave");

    // Dave got the key at its current iteration and can't read history.
    assert_matches!(
        dave.groups.decrypt(&early).await,
        Err(GroupError::SenderKey(SenderKeyError::StaleIteration { .. }))
    );
}

#[tokio::test]
async fn group_remove_member() {
    setup_logging();
    let server = TestServer::new();
    let alice = TestPeer::new("alice", &server, 1).await;
    let bob = TestPeer::new("bob", &server, 2).await;
    let charlie = TestPeer::new("charlie", &server, 3).await;
    let members = ["alice", "bob", "charlie"];

    let message = alice
        .groups
        .encrypt(GROUP, &members, b"Hello everyone")
        .await
        .unwrap();
    bob.groups.decrypt(&message).await.unwrap();
    charlie.groups.decrypt(&message).await.unwrap();

    alice
        .groups
        .remove_member(GROUP, "charlie", &members)
        .await
        .unwrap();
    assert_eq!(server.pending_count(GROUP, "bob").await, 1);
    assert_eq!(server.pending_count(GROUP, "charlie").await, 0);

    let message = alice
        .groups
        .encrypt(GROUP, &["alice", "bob"], b"Charlie is gone")
        .await
        .unwrap();
    assert_eq!(server.pending_count(GROUP, "bob").await, 1);

    // Bob's stored key fails the signature check, he fetches the rotated one.
    assert_eq!(
        bob.groups.decrypt(&message).await.unwrap(),
        b"Charlie is gone"
    );

    // Charlie never gets the new key.
    assert_matches!(
        charlie.groups.decrypt(&message).await,
        Err(GroupError::SenderKey(SenderKeyError::InvalidSignature(_)))
    );
}

#[tokio::test]
async fn group_message_from_unknown_sender() {
    let server = TestServer::new();
    let alice = TestPeer::new("alice", &server, 1).await;
    let _bob = TestPeer::new("bob", &server, 2).await;
    let charlie = TestPeer::new("charlie", &server, 3).await;

    // Charlie wasn't a member when Alice sent this.
    let message = alice
        .groups
        .encrypt(GROUP, &["alice", "bob"], b"Secret plans")
        .await
        .unwrap();
    assert_matches!(
        charlie.groups.decrypt(&message).await,
        Err(GroupError::UnknownSenderKey { sender_user_id, .. }) if sender_user_id == "alice"
    );
}
