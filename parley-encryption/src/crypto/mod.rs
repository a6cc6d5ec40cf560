// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cryptographic building blocks used by the key-agreement and ratchet protocols.
pub mod aead;
pub mod ed25519;
pub mod hkdf;
mod rng;
mod secret;
pub mod sha2;
pub mod x25519;

pub use rng::{Rng, RngError};
pub use secret::Secret;
