//! Token-usage costing in KRW.
//!
//! Spend tracking only needs a budget-grade estimate, so rates are plain
//! USD-per-million-token numbers converted at a fixed exchange rate and
//! floored to whole won.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Low,
    High,
}

impl ModelTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierRates {
    pub input_usd_per_million: f64,
    pub output_usd_per_million: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricingConfig {
    pub low: TierRates,
    pub high: TierRates,
    pub usd_to_krw: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            low: TierRates {
                input_usd_per_million: 0.15,
                output_usd_per_million: 0.60,
            },
            high: TierRates {
                input_usd_per_million: 3.00,
                output_usd_per_million: 12.00,
            },
            usd_to_krw: 1_320.0,
        }
    }
}

impl PricingConfig {
    /// Whole-won cost of a request, floored. Degenerate arithmetic (overflow
    /// to infinity, NaN rates) collapses to zero so a bad pricing value can
    /// never poison the spend counter.
    pub fn estimate_krw(&self, tier: ModelTier, usage: TokenUsage) -> i64 {
        let rates = self.rates(tier);
        let usd = (usage.input_tokens as f64 / 1_000_000.0) * rates.input_usd_per_million
            + (usage.output_tokens as f64 / 1_000_000.0) * rates.output_usd_per_million;
        let krw = usd * self.usd_to_krw;
        if !krw.is_finite() || krw < 0.0 {
            return 0;
        }
        krw.floor() as i64
    }

    fn rates(&self, tier: ModelTier) -> &TierRates {
        match tier {
            ModelTier::Low => &self.low,
            ModelTier::High => &self.high,
        }
    }
}
