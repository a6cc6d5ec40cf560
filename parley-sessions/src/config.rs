// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};

/// Number of one-time pre-keys minted per upload.
pub const DEFAULT_ONETIME_PREKEY_BATCH_SIZE: usize = 100;

/// Server pool size below which new one-time pre-keys are uploaded.
pub const DEFAULT_ONETIME_PREKEY_MIN_COUNT: usize = 20;

/// Number of decrypted messages remembered to answer re-deliveries of the same ciphertext.
pub const DEFAULT_DECRYPT_CACHE_CAPACITY: usize = 256;

/// Configuration for session orchestration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Number of one-time pre-keys generated when publishing or replenishing.
    pub onetime_prekey_batch_size: usize,

    /// Replenish the server's one-time pre-key pool when it holds less than this.
    pub onetime_prekey_min_count: usize,

    /// Capacity of the ciphertext de-duplication cache.
    ///
    /// Two code paths delivering the same message (history fetch racing a live push) must not
    /// both advance the ratchet.
    pub decrypt_cache_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            onetime_prekey_batch_size: DEFAULT_ONETIME_PREKEY_BATCH_SIZE,
            onetime_prekey_min_count: DEFAULT_ONETIME_PREKEY_MIN_COUNT,
            decrypt_cache_capacity: DEFAULT_DECRYPT_CACHE_CAPACITY,
        }
    }
}
