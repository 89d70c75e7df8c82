//! Monthly spend ceiling.
//!
//! One integer KRW counter per KST calendar month. The guard only ever
//! advises: a store outage fails open and spend keeps flowing, because
//! blocking live traffic over a bookkeeping counter is the worse trade.

use std::sync::Arc;

use crate::clock::{Clock, kst_month_stamp};
use crate::store::CounterStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetStatus {
    pub total_spent: i64,
    pub budget_exhausted: bool,
}

pub struct BudgetGuard {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    monthly_budget_krw: i64,
}

impl BudgetGuard {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        monthly_budget_krw: i64,
    ) -> Self {
        Self {
            store,
            clock,
            monthly_budget_krw,
        }
    }

    pub async fn status(&self) -> BudgetStatus {
        let Some(key) = self.ledger_key() else {
            return BudgetStatus {
                total_spent: 0,
                budget_exhausted: false,
            };
        };
        match self.store.get(&key).await {
            Ok(value) => {
                let total_spent = value
                    .as_deref()
                    .and_then(|raw| raw.trim().parse::<i64>().ok())
                    .unwrap_or(0);
                BudgetStatus {
                    total_spent,
                    budget_exhausted: total_spent >= self.monthly_budget_krw,
                }
            }
            Err(err) => {
                tracing::warn!(
                    degraded_mode = true,
                    error = %err,
                    "budget read failed, failing open"
                );
                BudgetStatus {
                    total_spent: 0,
                    budget_exhausted: false,
                }
            }
        }
    }

    /// Adds to the month's ledger. Failures are logged and swallowed; spend
    /// recording must never take down a request that already succeeded.
    pub async fn record_spend(&self, amount_krw: i64) {
        if amount_krw <= 0 {
            return;
        }
        let Some(key) = self.ledger_key() else {
            return;
        };
        if let Err(err) = self.store.incr_by(&key, amount_krw).await {
            tracing::warn!(
                degraded_mode = true,
                error = %err,
                amount_krw,
                "budget spend not recorded"
            );
        }
    }

    fn ledger_key(&self) -> Option<String> {
        match kst_month_stamp(self.clock.now_epoch_seconds()) {
            Ok(month) => Some(format!("budget:month:{month}")),
            Err(err) => {
                tracing::warn!(
                    degraded_mode = true,
                    error = %err,
                    "budget month stamp unavailable, failing open"
                );
                None
            }
        }
    }
}
