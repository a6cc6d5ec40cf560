// SPDX-License-Identifier: MIT OR Apache-2.0

//! Long- and medium-term key material of a device and its public projections ("key bundles")
//! which are published to the key-bundle service for X3DH.
#[allow(clippy::module_inception)]
mod key_bundle;
mod prekey;

pub use key_bundle::{KeyBundleError, PublicKeyBundle, ReceivedKeyBundle};
pub use prekey::{
    IdentityKeyPair, OneTimePreKey, OneTimePreKeyId, OneTimePreKeyRecord, PreKeyId, SignedPreKey,
    SignedPreKeyRecord,
};
