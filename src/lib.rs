mod error;

pub mod budget;
pub mod clock;
pub mod config;
pub mod costing;
pub mod entitlement;
pub mod payment;
pub mod ratelimit;
pub mod reading;
pub mod session;
pub mod store;
pub mod utils;

#[cfg(feature = "server")]
pub mod http;

pub use error::{HaetaeError, Result};

pub use budget::{BudgetGuard, BudgetStatus};
pub use clock::{
    Clock, SECONDS_PER_DAY, SystemClock, kst_day_stamp, kst_month_stamp,
    seconds_until_next_kst_day,
};
pub use config::{
    CoreConfig, CounterStoreConfig, Env, PaymentConfig, RateLimitProvider, parse_dotenv,
};
pub use costing::{ModelTier, PricingConfig, TierRates, TokenUsage};
pub use entitlement::{
    EntitlementClaims, EntitlementCodec, TOKEN_TTL_SECONDS, VerifyError, derive_session_id,
};
pub use payment::{
    PaymentVerification, PaymentVerifier, RemotePaymentVerifier, StubPaymentVerifier,
};
pub use ratelimit::{FreeTierDecision, FreeTierLimiter, LimitSource, LocalUsageMap};
pub use reading::{HttpReadingBackend, ReadingBackend, ReadingKind, ReadingOutput, ReadingRequest};
pub use session::{DetailGrant, PaidSessionMeter, PaidSessionRecord, QuestionGrant};
pub use store::{
    CounterStore, DisabledCounterStore, MemoryCounterStore, RestCounterStore, StoreError,
};

#[cfg(feature = "server")]
pub use http::{HaetaeHttpState, router};
