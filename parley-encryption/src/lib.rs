// SPDX-License-Identifier: MIT OR Apache-2.0

//! `parley-encryption` provides the cryptographic protocols of an end-to-end encrypted messenger:
//! asynchronous session establishment, per-conversation ratcheting, group fan-out keying and
//! human-verifiable fingerprints.
//!
//! The crate is free of I/O. Every protocol is expressed as pure functions over plain,
//! serializable state which the caller persists wherever it likes; see `parley-sessions` for
//! the orchestration layer tying them to storage and network services.
//!
//! ## Protocols
//!
//! - [X3DH](crate::x3dh): derive a shared secret with a peer who is offline, using their
//!   published [key bundle](crate::key_bundle). Works with and without a one-time pre-key.
//! - [Double Ratchet](crate::double_ratchet): fresh key for every 1:1 message, forward secrecy
//!   and post-compromise recovery. Out-of-order and lost messages are tolerated within bounds.
//! - [SenderKey](crate::sender_key): one signed hash-ratchet per group member, distributed over
//!   the 1:1 sessions, so a group message is encrypted once for all recipients.
//! - [Safety Numbers](crate::safety_number): 60-digit fingerprint two parties compare
//!   out-of-band to detect a man-in-the-middle.
//!
//! ## State handling
//!
//! Ratchets follow a functional style: each operation takes the current state by value and
//! returns the next state together with its output. A failed operation returns an error and
//! nothing else, the caller simply keeps the previous state. This makes it impossible to
//! persist a half-advanced chain after a failed decryption.
//!
//! ## Security
//!
//! Secret key material is zeroized on drop, compared in constant time and never shows up in
//! debug output. Nothing in this crate logs keys or plaintext.
//!
//! Our implementation follows Signal's [X3DH](https://signal.org/docs/specifications/x3dh) and
//! [Double Ratchet](https://signal.org/docs/specifications/doubleratchet/) specifications.
pub mod cbor;
pub mod crypto;
pub mod double_ratchet;
pub mod key_bundle;
pub mod safety_number;
pub mod sender_key;
pub mod x3dh;

pub use crypto::{Rng, RngError};
pub use double_ratchet::{DoubleRatchet, DoubleRatchetError, DoubleRatchetState, EncryptedPayload};
pub use key_bundle::{
    IdentityKeyPair, KeyBundleError, OneTimePreKey, OneTimePreKeyId, OneTimePreKeyRecord,
    PreKeyId, PublicKeyBundle, ReceivedKeyBundle, SignedPreKey, SignedPreKeyRecord,
};
pub use safety_number::SafetyNumber;
pub use sender_key::{
    OwnSenderKey, RemoteSenderKey, SenderKey, SenderKeyDistribution, SenderKeyError,
    SenderKeyMessage,
};
pub use x3dh::{X3dhError, X3dhHeader, X3dhInitiated, X3dhSecret, x3dh_initiate, x3dh_respond};
