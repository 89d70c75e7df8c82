//! Shared-counter storage.
//!
//! Everything stateful in the crate (sessions, rate limits, the monthly
//! budget) is a small set of string keys behind [`CounterStore`]. Callers
//! never retry; they map a [`StoreError`] to their own degraded policy.

mod memory;
mod rest;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryCounterStore;
pub use rest::RestCounterStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("counter store is not configured")]
    Disabled,
    #[error("store http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("store api error ({status}): {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("store returned unexpected response: {0}")]
    InvalidResponse(String),
}

/// The six primitives the product needs from its counter store. All writes
/// are single-key; cross-key atomicity is deliberately not part of the seam.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    async fn incr_by(&self, key: &str, amount: i64) -> Result<i64, StoreError>;

    /// Writes `value` only when `key` does not exist yet, attaching a TTL.
    /// Returns whether this call created the key.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<bool, StoreError>;

    /// Overwrites `value` only when `key` already exists, preserving its
    /// remaining TTL. Returns whether the write happened.
    async fn set_if_present_keep_ttl(&self, key: &str, value: &str) -> Result<bool, StoreError>;

    /// Attaches a TTL only when `key` has none yet. Returns whether the TTL
    /// was applied by this call.
    async fn expire_if_no_ttl(&self, key: &str, seconds: u64) -> Result<bool, StoreError>;
}

/// Store used when no backend is configured: every call fails with
/// [`StoreError::Disabled`], which sends each caller down the same degraded
/// path a live outage would.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledCounterStore;

#[async_trait]
impl CounterStore for DisabledCounterStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Err(StoreError::Disabled)
    }

    async fn incr(&self, _key: &str) -> Result<i64, StoreError> {
        Err(StoreError::Disabled)
    }

    async fn incr_by(&self, _key: &str, _amount: i64) -> Result<i64, StoreError> {
        Err(StoreError::Disabled)
    }

    async fn set_if_absent(
        &self,
        _key: &str,
        _value: &str,
        _ttl_seconds: u64,
    ) -> Result<bool, StoreError> {
        Err(StoreError::Disabled)
    }

    async fn set_if_present_keep_ttl(&self, _key: &str, _value: &str) -> Result<bool, StoreError> {
        Err(StoreError::Disabled)
    }

    async fn expire_if_no_ttl(&self, _key: &str, _seconds: u64) -> Result<bool, StoreError> {
        Err(StoreError::Disabled)
    }
}

pub fn disabled() -> Arc<dyn CounterStore> {
    Arc::new(DisabledCounterStore)
}
