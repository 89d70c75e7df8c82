//! Paid-session quota metering.
//!
//! A paid session is one JSON record under `sess:{sid}` holding the
//! remaining question and detail allowances. Reads that fail for any reason
//! grant optimistically with the degraded flag set: a paying user is never
//! turned away because the counter store is unhealthy. The price is that a
//! store outage can hand out extra readings, which is accepted.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::store::{CounterStore, StoreError};

/// Stored session state. Field names are part of the persisted format;
/// absent counters read as zero so a truncated record fails closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaidSessionRecord {
    #[serde(default)]
    pub q: i64,
    #[serde(default)]
    pub d: i64,
    #[serde(default)]
    pub oid: String,
    #[serde(default, rename = "createdAt")]
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuestionGrant {
    pub allowed: bool,
    pub degraded_mode: bool,
    pub question_number: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetailGrant {
    pub allowed: bool,
    pub degraded_mode: bool,
}

pub struct PaidSessionMeter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    question_quota: u32,
    detail_quota: u32,
    session_ttl_seconds: u64,
}

impl PaidSessionMeter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        question_quota: u32,
        detail_quota: u32,
        session_ttl_seconds: u64,
    ) -> Self {
        Self {
            store,
            clock,
            question_quota,
            detail_quota,
            session_ttl_seconds,
        }
    }

    /// Creates the session record with full quotas unless one already
    /// exists. A replayed payment callback therefore cannot refresh a spent
    /// session.
    pub async fn init_session(&self, session_id: &str, order_id: &str) -> Result<(), StoreError> {
        let record = PaidSessionRecord {
            q: i64::from(self.question_quota),
            d: i64::from(self.detail_quota),
            oid: order_id.to_string(),
            created_at: self.clock.now_epoch_seconds(),
        };
        let payload = serde_json::to_string(&record)
            .map_err(|err| StoreError::InvalidResponse(format!("session record: {err}")))?;
        self.store
            .set_if_absent(&self.key(session_id), &payload, self.session_ttl_seconds)
            .await?;
        Ok(())
    }

    pub async fn consume_question(&self, session_id: &str) -> QuestionGrant {
        let key = self.key(session_id);
        let Some(record) = self.read_record(&key).await else {
            return QuestionGrant {
                allowed: true,
                degraded_mode: true,
                question_number: 1,
            };
        };

        if record.q <= 0 {
            return QuestionGrant {
                allowed: false,
                degraded_mode: false,
                question_number: self.question_quota,
            };
        }

        let quota = i64::from(self.question_quota);
        let question_number = (quota + 1 - record.q).clamp(1, quota) as u32;
        let updated = PaidSessionRecord {
            q: record.q - 1,
            ..record
        };
        self.write_back(&key, &updated).await;

        QuestionGrant {
            allowed: true,
            degraded_mode: false,
            question_number,
        }
    }

    pub async fn consume_detail(&self, session_id: &str) -> DetailGrant {
        let key = self.key(session_id);
        let Some(record) = self.read_record(&key).await else {
            return DetailGrant {
                allowed: true,
                degraded_mode: true,
            };
        };

        if record.d <= 0 {
            return DetailGrant {
                allowed: false,
                degraded_mode: false,
            };
        }

        let updated = PaidSessionRecord {
            d: record.d - 1,
            ..record
        };
        self.write_back(&key, &updated).await;

        DetailGrant {
            allowed: true,
            degraded_mode: false,
        }
    }

    fn key(&self, session_id: &str) -> String {
        format!("sess:{session_id}")
    }

    async fn read_record(&self, key: &str) -> Option<PaidSessionRecord> {
        let raw = match self.store.get(key).await {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(
                    degraded_mode = true,
                    error = %err,
                    "session read failed, granting optimistically"
                );
                return None;
            }
        };
        let Some(raw) = raw else {
            tracing::warn!(degraded_mode = true, "session record missing, granting optimistically");
            return None;
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(err) => {
                tracing::warn!(
                    degraded_mode = true,
                    error = %err,
                    "session record unparsable, granting optimistically"
                );
                None
            }
        }
    }

    /// The decrement is optimistic: the grant already happened, so a write
    /// failure only means the next call sees a stale count.
    async fn write_back(&self, key: &str, record: &PaidSessionRecord) {
        match serde_json::to_string(record) {
            Ok(payload) => {
                if let Err(err) = self.store.set_if_present_keep_ttl(key, &payload).await {
                    tracing::warn!(error = %err, "session decrement not persisted");
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "session record serialization failed");
            }
        }
    }
}
