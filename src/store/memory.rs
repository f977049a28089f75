use super::{InvalidPattern, LockStore, StoreError};
use async_trait::async_trait;
use glob::Pattern;
use snafu::ResultExt;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::Instant;

/// Keeps limit state in process memory, with the same semantics as Redis
/// hashes: empty hashes disappear and a key with a passed TTL is gone.
///
/// Cloning shares the underlying state.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
}

#[derive(Debug)]
struct Entry {
    holders: HashMap<String, String>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> T {
        let mut entries = self.inner.lock().expect("MemoryStore mutex is poisoned");
        let now = Instant::now();
        entries.retain(|_, entry| !entry.is_expired(now) && !entry.holders.is_empty());
        f(&mut entries)
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn count(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self.with_entries(|entries| entries.get(key).map_or(0, |entry| entry.holders.len())))
    }

    async fn register(
        &self,
        key: &str,
        id: &str,
        expires_at: i64,
        ttl: Duration,
    ) -> Result<usize, StoreError> {
        Ok(self.with_entries(|entries| {
            let entry = entries.entry(key.to_owned()).or_insert_with(|| Entry {
                holders: HashMap::new(),
                expires_at: None,
            });
            entry.holders.insert(id.to_owned(), expires_at.to_string());
            // A TTL too far out to represent never expires.
            entry.expires_at = Instant::now().checked_add(ttl);
            entry.holders.len()
        }))
    }

    async fn unregister(&self, key: &str, id: &str) -> Result<usize, StoreError> {
        Ok(self.with_entries(|entries| {
            let removed = entries
                .get_mut(key)
                .and_then(|entry| entry.holders.remove(id))
                .map_or(0, |_| 1);
            if entries.get(key).map_or(false, |entry| entry.holders.is_empty()) {
                entries.remove(key);
            }
            removed
        }))
    }

    async fn holders(&self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
        Ok(self.with_entries(|entries| {
            entries
                .get(key)
                .map(|entry| {
                    entry
                        .holders
                        .iter()
                        .map(|(id, value)| (id.clone(), value.clone()))
                        .collect()
                })
                .unwrap_or_default()
        }))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let pattern = Pattern::new(pattern).context(InvalidPattern { pattern })?;
        Ok(self.with_entries(|entries| {
            let mut keys = entries
                .keys()
                .filter(|key| pattern.matches(key))
                .cloned()
                .collect::<Vec<_>>();
            keys.sort();
            keys
        }))
    }
}

impl MemoryStore {
    /// Writes a raw holder value, bypassing the expiry bookkeeping of
    /// [`LockStore::register`].
    #[cfg(test)]
    pub(crate) fn insert_raw(&self, key: &str, id: &str, value: &str) {
        self.with_entries(|entries| {
            entries
                .entry(key.to_owned())
                .or_insert_with(|| Entry {
                    holders: HashMap::new(),
                    expires_at: None,
                })
                .holders
                .insert(id.to_owned(), value.to_owned());
        })
    }
}
