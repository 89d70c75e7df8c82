//! Free-tier daily rate limiting.
//!
//! The shared counter is authoritative; when it cannot be reached the
//! limiter degrades to a per-process map rather than letting free traffic
//! run unmetered. The local map is not shared across instances, so under
//! outage each instance enforces its own window. That looser ceiling is the
//! designed behavior, not a bug to paper over.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::clock::{Clock, seconds_until_next_kst_day};
use crate::config::RateLimitProvider;
use crate::store::{CounterStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitSource {
    Remote,
    Local,
}

impl LimitSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::Local => "local",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeTierDecision {
    pub allowed: bool,
    pub retry_after_seconds: u64,
    pub source: LimitSource,
}

#[derive(Debug, Clone, Copy)]
struct LocalUsage {
    count: u32,
    reset_at: u64,
}

/// Process-local usage counts keyed like the remote limiter keys. Expired
/// windows are pruned on every hit.
#[derive(Debug, Default)]
pub struct LocalUsageMap {
    entries: Mutex<HashMap<String, LocalUsage>>,
}

impl LocalUsageMap {
    /// Counts one hit against `key`, opening a window of `window_seconds`
    /// when none is live. Returns the allow verdict and seconds until the
    /// window resets.
    pub async fn hit(&self, key: &str, now: u64, window_seconds: u64, limit: u32) -> (bool, u64) {
        let mut entries = self.entries.lock().await;
        entries.retain(|_, usage| now < usage.reset_at);
        match entries.get_mut(key) {
            Some(usage) => {
                usage.count += 1;
                let retry_after = usage.reset_at.saturating_sub(now).max(1);
                (usage.count <= limit, retry_after)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    LocalUsage {
                        count: 1,
                        reset_at: now.saturating_add(window_seconds),
                    },
                );
                (1 <= limit, window_seconds)
            }
        }
    }
}

pub struct FreeTierLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    provider: RateLimitProvider,
    daily_limit: u32,
    local: Arc<LocalUsageMap>,
}

impl FreeTierLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        provider: RateLimitProvider,
        daily_limit: u32,
    ) -> Self {
        Self {
            store,
            clock,
            provider,
            daily_limit,
            local: Arc::new(LocalUsageMap::default()),
        }
    }

    pub fn with_local_map(mut self, local: Arc<LocalUsageMap>) -> Self {
        self.local = local;
        self
    }

    /// One free reading attempt from `ip` on the given KST day. The counter
    /// window always ends at the next KST midnight, so `retry_after_seconds`
    /// is recomputed from the clock on every call.
    pub async fn check(&self, ip: &str, day_stamp: &str) -> FreeTierDecision {
        let now = self.clock.now_epoch_seconds();
        let window = seconds_until_next_kst_day(now);
        let key = format!("rl:free:{day_stamp}:{ip}");

        if self.provider == RateLimitProvider::Remote {
            match self.check_remote(&key, window).await {
                Ok(allowed) => {
                    return FreeTierDecision {
                        allowed,
                        retry_after_seconds: window,
                        source: LimitSource::Remote,
                    };
                }
                Err(err) => {
                    tracing::warn!(
                        degraded_mode = true,
                        error = %err,
                        "free limiter falling back to local counts"
                    );
                }
            }
        }

        let (allowed, retry_after_seconds) =
            self.local.hit(&key, now, window, self.daily_limit).await;
        FreeTierDecision {
            allowed,
            retry_after_seconds,
            source: LimitSource::Local,
        }
    }

    async fn check_remote(&self, key: &str, window: u64) -> Result<bool, StoreError> {
        let count = self.store.incr(key).await?;
        if count == 1 {
            self.store.expire_if_no_ttl(key, window).await?;
        }
        Ok(count <= i64::from(self.daily_limit))
    }
}
