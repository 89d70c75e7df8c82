use std::collections::BTreeMap;

use crate::costing::PricingConfig;
use crate::{HaetaeError, Result};

pub const DEFAULT_FREE_DAILY_LIMIT: u32 = 5;
pub const DEFAULT_QUESTION_QUOTA: u32 = 3;
pub const DEFAULT_DETAIL_QUOTA: u32 = 1;
pub const DEFAULT_SESSION_TTL_SECONDS: u64 = 86_400;
pub const DEFAULT_MONTHLY_BUDGET_KRW: i64 = 100_000;

/// Environment view used for configuration: values from a dotenv file shadow
/// process environment variables.
#[derive(Debug, Clone, Default)]
pub struct Env {
    pub dotenv: BTreeMap<String, String>,
}

impl Env {
    pub fn parse_dotenv(contents: &str) -> Self {
        Self {
            dotenv: parse_dotenv(contents),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.dotenv.get(key) {
            return Some(value.clone());
        }
        std::env::var(key)
            .ok()
            .filter(|value| !value.trim().is_empty())
    }
}

pub fn parse_dotenv(contents: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::<String, String>::new();

    for raw_line in contents.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line = line.strip_prefix("export ").unwrap_or(line).trim();
        let Some((raw_key, raw_value)) = line.split_once('=') else {
            continue;
        };
        let key = raw_key.trim();
        if key.is_empty() {
            continue;
        }

        let mut value = raw_value.trim().to_string();
        if let Some(stripped) = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        {
            value = stripped.to_string();
        }

        if value.trim().is_empty() {
            continue;
        }

        out.insert(key.to_string(), value);
    }

    out
}

#[derive(Clone)]
pub struct CounterStoreConfig {
    pub base_url: String,
    pub token: String,
}

impl std::fmt::Debug for CounterStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterStoreConfig")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitProvider {
    Remote,
    Local,
}

#[derive(Clone)]
pub enum PaymentConfig {
    Stub {
        paid_order_ids: Vec<String>,
    },
    Remote {
        verify_url: String,
        verify_secret: Option<String>,
    },
}

impl std::fmt::Debug for PaymentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stub { paid_order_ids } => f
                .debug_struct("Stub")
                .field("paid_order_ids", paid_order_ids)
                .finish(),
            Self::Remote {
                verify_url,
                verify_secret,
            } => f
                .debug_struct("Remote")
                .field("verify_url", verify_url)
                .field("verify_secret", &verify_secret.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

/// Deployment configuration, built once at startup and handed to every
/// component constructor. Quotas and the budget ceiling are product constants
/// carried as fields so tests can shrink them.
#[derive(Clone)]
pub struct CoreConfig {
    pub token_secret: String,
    pub counter_store: Option<CounterStoreConfig>,
    pub rate_limit_provider: RateLimitProvider,
    pub payment: PaymentConfig,
    pub reading_url: Option<String>,
    pub pricing: PricingConfig,
    pub free_daily_limit: u32,
    pub question_quota: u32,
    pub detail_quota: u32,
    pub session_ttl_seconds: u64,
    pub monthly_budget_krw: i64,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("token_secret", &"<redacted>")
            .field("counter_store", &self.counter_store)
            .field("rate_limit_provider", &self.rate_limit_provider)
            .field("payment", &self.payment)
            .field("reading_url", &self.reading_url)
            .field("pricing", &self.pricing)
            .field("free_daily_limit", &self.free_daily_limit)
            .field("question_quota", &self.question_quota)
            .field("detail_quota", &self.detail_quota)
            .field("session_ttl_seconds", &self.session_ttl_seconds)
            .field("monthly_budget_krw", &self.monthly_budget_krw)
            .finish()
    }
}

impl CoreConfig {
    /// Recognized keys: `HAETAE_TOKEN_SECRET` (required),
    /// `HAETAE_COUNTER_URL`/`HAETAE_COUNTER_TOKEN`,
    /// `HAETAE_RATE_LIMIT_PROVIDER` (`remote`/`local`),
    /// `HAETAE_PAYMENT_MODE` (`stub`/`remote`) with
    /// `HAETAE_PAYMENT_STUB_PAID_ORDERS` or
    /// `HAETAE_PAYMENT_VERIFY_URL`/`HAETAE_PAYMENT_VERIFY_SECRET`,
    /// `HAETAE_READING_URL`, `HAETAE_USD_TO_KRW`, and
    /// `HAETAE_{LOW,HIGH}_{INPUT,OUTPUT}_USD_PER_1M`.
    ///
    /// Malformed values are startup errors rather than silent fallbacks.
    pub fn from_env(env: &Env) -> Result<Self> {
        let token_secret = env
            .get("HAETAE_TOKEN_SECRET")
            .ok_or_else(|| HaetaeError::Config("HAETAE_TOKEN_SECRET is required".to_string()))?;

        let counter_store = match (
            env.get("HAETAE_COUNTER_URL"),
            env.get("HAETAE_COUNTER_TOKEN"),
        ) {
            (Some(base_url), Some(token)) => Some(CounterStoreConfig {
                base_url: base_url.trim_end_matches('/').to_string(),
                token,
            }),
            (None, None) => None,
            (Some(_), None) => {
                return Err(HaetaeError::Config(
                    "HAETAE_COUNTER_URL is set but HAETAE_COUNTER_TOKEN is missing".to_string(),
                ));
            }
            (None, Some(_)) => {
                return Err(HaetaeError::Config(
                    "HAETAE_COUNTER_TOKEN is set but HAETAE_COUNTER_URL is missing".to_string(),
                ));
            }
        };

        let rate_limit_provider = match env
            .get("HAETAE_RATE_LIMIT_PROVIDER")
            .map(|raw| raw.trim().to_ascii_lowercase())
            .as_deref()
        {
            None | Some("remote") => RateLimitProvider::Remote,
            Some("local") => RateLimitProvider::Local,
            Some(other) => {
                return Err(HaetaeError::Config(format!(
                    "HAETAE_RATE_LIMIT_PROVIDER must be `remote` or `local`, got {other:?}"
                )));
            }
        };

        let payment = match env
            .get("HAETAE_PAYMENT_MODE")
            .map(|raw| raw.trim().to_ascii_lowercase())
            .as_deref()
        {
            None | Some("stub") => PaymentConfig::Stub {
                paid_order_ids: parse_csv(
                    env.get("HAETAE_PAYMENT_STUB_PAID_ORDERS")
                        .as_deref()
                        .unwrap_or_default(),
                ),
            },
            Some("remote") => {
                let verify_url = env.get("HAETAE_PAYMENT_VERIFY_URL").ok_or_else(|| {
                    HaetaeError::Config(
                        "HAETAE_PAYMENT_VERIFY_URL is required when HAETAE_PAYMENT_MODE=remote"
                            .to_string(),
                    )
                })?;
                PaymentConfig::Remote {
                    verify_url,
                    verify_secret: env.get("HAETAE_PAYMENT_VERIFY_SECRET"),
                }
            }
            Some(other) => {
                return Err(HaetaeError::Config(format!(
                    "HAETAE_PAYMENT_MODE must be `stub` or `remote`, got {other:?}"
                )));
            }
        };

        let defaults = PricingConfig::default();
        let pricing = PricingConfig {
            low: crate::costing::TierRates {
                input_usd_per_million: parse_rate(
                    env,
                    "HAETAE_LOW_INPUT_USD_PER_1M",
                    defaults.low.input_usd_per_million,
                )?,
                output_usd_per_million: parse_rate(
                    env,
                    "HAETAE_LOW_OUTPUT_USD_PER_1M",
                    defaults.low.output_usd_per_million,
                )?,
            },
            high: crate::costing::TierRates {
                input_usd_per_million: parse_rate(
                    env,
                    "HAETAE_HIGH_INPUT_USD_PER_1M",
                    defaults.high.input_usd_per_million,
                )?,
                output_usd_per_million: parse_rate(
                    env,
                    "HAETAE_HIGH_OUTPUT_USD_PER_1M",
                    defaults.high.output_usd_per_million,
                )?,
            },
            usd_to_krw: parse_rate(env, "HAETAE_USD_TO_KRW", defaults.usd_to_krw)?,
        };

        Ok(Self {
            token_secret,
            counter_store,
            rate_limit_provider,
            payment,
            reading_url: env.get("HAETAE_READING_URL"),
            pricing,
            free_daily_limit: DEFAULT_FREE_DAILY_LIMIT,
            question_quota: DEFAULT_QUESTION_QUOTA,
            detail_quota: DEFAULT_DETAIL_QUOTA,
            session_ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
            monthly_budget_krw: DEFAULT_MONTHLY_BUDGET_KRW,
        })
    }
}

fn parse_rate(env: &Env, key: &str, default: f64) -> Result<f64> {
    let Some(raw) = env.get(key) else {
        return Ok(default);
    };
    let value = raw
        .trim()
        .parse::<f64>()
        .map_err(|_| HaetaeError::Config(format!("{key} must be a number, got {raw:?}")))?;
    if !value.is_finite() || value < 0.0 {
        return Err(HaetaeError::Config(format!(
            "{key} must be a non-negative finite number"
        )));
    }
    Ok(value)
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}
