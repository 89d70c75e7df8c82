use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{CounterStore, StoreError};
use crate::clock::{Clock, SystemClock};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<u64>,
}

/// In-process [`CounterStore`] with real TTL semantics, driven by an injected
/// clock. Backs the test suites and the single-instance development mode.
pub struct MemoryCounterStore {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl std::fmt::Debug for MemoryCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCounterStore").finish_non_exhaustive()
    }
}

impl MemoryCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn now(&self) -> u64 {
        self.clock.now_epoch_seconds()
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

fn expired(entry: &Entry, now: u64) -> bool {
    matches!(entry.expires_at, Some(expires_at) if now >= expires_at)
}

fn drop_if_expired(entries: &mut HashMap<String, Entry>, key: &str, now: u64) {
    if entries.get(key).is_some_and(|entry| expired(entry, now)) {
        entries.remove(key);
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.now();
        let mut entries = self.entries.lock().await;
        drop_if_expired(&mut entries, key, now);
        Ok(entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.incr_by(key, 1).await
    }

    async fn incr_by(&self, key: &str, amount: i64) -> Result<i64, StoreError> {
        let now = self.now();
        let mut entries = self.entries.lock().await;
        drop_if_expired(&mut entries, key, now);
        let (current, expires_at) = match entries.get(key) {
            Some(entry) => {
                let parsed = entry.value.parse::<i64>().map_err(|_| {
                    StoreError::InvalidResponse(format!(
                        "key {key:?} holds non-integer {:?}",
                        entry.value
                    ))
                })?;
                (parsed, entry.expires_at)
            }
            None => (0, None),
        };
        let next = current.saturating_add(amount);
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<bool, StoreError> {
        let now = self.now();
        let mut entries = self.entries.lock().await;
        drop_if_expired(&mut entries, key, now);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(now.saturating_add(ttl_seconds)),
            },
        );
        Ok(true)
    }

    async fn set_if_present_keep_ttl(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let now = self.now();
        let mut entries = self.entries.lock().await;
        drop_if_expired(&mut entries, key, now);
        match entries.get_mut(key) {
            Some(entry) => {
                entry.value = value.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn expire_if_no_ttl(&self, key: &str, seconds: u64) -> Result<bool, StoreError> {
        let now = self.now();
        let mut entries = self.entries.lock().await;
        drop_if_expired(&mut entries, key, now);
        match entries.get_mut(key) {
            Some(entry) if entry.expires_at.is_none() => {
                entry.expires_at = Some(now.saturating_add(seconds));
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
