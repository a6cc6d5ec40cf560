// SPDX-License-Identifier: MIT OR Apache-2.0

//! `parley-sessions` ties the protocols of `parley-encryption` to storage and to the services of
//! a messaging server.
//!
//! - [`SessionManager`] establishes X3DH sessions on demand and encrypts / decrypts 1:1
//!   messages through the Double Ratchet, one exclusive lock per conversation.
//! - [`GroupManager`] encrypts group messages with sender keys and distributes them through the
//!   1:1 sessions.
//! - [`KeyChangeDetector`] notices when a contact's identity key changed.
//! - [`KeyStore`] holds the local identity and pre-keys.
//!
//! All state lives in a [`KeyValueStore`] supplied by the application, the network is reached
//! through the service traits in [`traits`]. Errors of these collaborators are reported as
//! retryable.
pub mod config;
pub mod group;
pub mod key_change;
pub mod key_store;
mod locks;
pub mod memory;
mod record;
pub mod sender_key_store;
pub mod session;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
#[cfg(test)]
mod tests;
pub mod traits;

pub use config::Config;
pub use group::{GroupError, GroupManager};
pub use key_change::{KeyChangeDetector, KeyChangeError, KeyChangeEvent};
pub use key_store::{KeyStore, KeyStoreError};
pub use memory::MemoryStore;
pub use record::RecordError;
pub use sender_key_store::{OwnSenderKeyRecord, SenderKeyStore};
pub use session::{SessionError, SessionManager, SessionRecord};
pub use traits::{
    EncryptedSenderKey, IdentityTrustService, KeyBundleService, KeyValueStore, PendingSenderKey,
    SenderKeyDistributionService,
};
