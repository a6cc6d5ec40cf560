// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;
use std::hash::Hash;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;

type Entry<V> = Arc<tokio::sync::Mutex<V>>;

/// Exclusive async locks keyed by conversation, each guarding a value of its own.
///
/// Operations on different keys run concurrently, operations on the same key are serialized.
/// An entry exists while a guard for its key is held or awaited, the last released guard
/// removes it. Guarded values are caches and start over from their default afterwards.
#[derive(Debug)]
pub(crate) struct KeyedLocks<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K, V> KeyedLocks<K, V>
where
    K: Clone + Eq + Hash,
    V: Default,
{
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Waits for exclusive access to the value of `key`.
    pub async fn lock(&self, key: &K) -> KeyedGuard<'_, K, V> {
        let entry = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.entry(key.clone()).or_default().clone()
        };
        KeyedGuard {
            locks: self,
            key: key.clone(),
            guard: entry.lock_owned().await,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Exclusive access to the value of one key of [`KeyedLocks`].
pub(crate) struct KeyedGuard<'a, K, V>
where
    K: Eq + Hash,
{
    locks: &'a KeyedLocks<K, V>,
    key: K,
    guard: OwnedMutexGuard<V>,
}

impl<K, V> Deref for KeyedGuard<'_, K, V>
where
    K: Eq + Hash,
{
    type Target = V;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<K, V> DerefMut for KeyedGuard<'_, K, V>
where
    K: Eq + Hash,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl<K, V> Drop for KeyedGuard<'_, K, V>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        let mut entries = self
            .locks
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Only the map and this guard still point at the entry, nobody is waiting for it.
        let unused = entries
            .get(&self.key)
            .is_some_and(|entry| Arc::strong_count(entry) <= 2);
        if unused {
            entries.remove(&self.key);
        }
    }
}
