// SPDX-License-Identifier: MIT OR Apache-2.0

//! Human-comparable fingerprint of two identities.
//!
//! Both parties derive the same 60-digit number from their user ids and identity keys,
//! independent of who is "local". Comparing it out-of-band (reading it aloud, scanning it)
//! confirms nobody sits in the middle of the conversation.
use std::fmt;

use crate::crypto::sha2::{SHA256_DIGEST_SIZE, sha2_256};
use crate::crypto::x25519::PublicKey;

const FINGERPRINT_VERSION: u8 = 0;

const FINGERPRINT_ITERATIONS: usize = 5200;

const GROUPS: usize = 12;

const DIGITS_PER_GROUP: usize = 5;

/// Length of the formatted number: 12 groups of 5 digits separated by single spaces.
pub const SAFETY_NUMBER_LEN: usize = GROUPS * DIGITS_PER_GROUP + GROUPS - 1;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SafetyNumber(String);

impl SafetyNumber {
    pub fn generate(
        local_user_id: &str,
        local_identity_key: &PublicKey,
        remote_user_id: &str,
        remote_identity_key: &PublicKey,
    ) -> Self {
        let local = fingerprint(local_user_id, local_identity_key);
        let remote = fingerprint(remote_user_id, remote_identity_key);

        let mut combined = [0u8; SHA256_DIGEST_SIZE];
        for (index, byte) in combined.iter_mut().enumerate() {
            *byte = local[index] ^ remote[index];
        }

        Self(format_digits(&combined))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SafetyNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn fingerprint(user_id: &str, identity_key: &PublicKey) -> [u8; SHA256_DIGEST_SIZE] {
    let mut digest = sha2_256(&[
        &[FINGERPRINT_VERSION],
        identity_key.as_bytes(),
        user_id.as_bytes(),
    ]);
    for _ in 1..FINGERPRINT_ITERATIONS {
        digest = sha2_256(&[&digest, identity_key.as_bytes()]);
    }
    digest
}

/// Reads 12 overlapping 24-bit big-endian windows, every 2.5 bytes, as 5 decimal digits each.
fn format_digits(digest: &[u8; SHA256_DIGEST_SIZE]) -> String {
    (0..GROUPS)
        .map(|group| {
            let offset = group * 5 / 2;
            let value = u32::from_be_bytes([
                0,
                digest[offset],
                digest[offset + 1],
                digest[offset + 2],
            ]);
            format!("{:05}", value % 100_000)
        })
        .collect::<Vec<_>>()
        .join(" ")
}
