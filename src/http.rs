//! HTTP request surface.
//!
//! Thin axum handlers over the metering components. Every gate order here is
//! a product decision: budget before rate limit on the free route, quota
//! consumption before question validation on the paid routes. Error bodies
//! use one `{"error":{"code","message"}}` envelope; the codes are the
//! client-facing contract and never change with the message text.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::budget::BudgetGuard;
use crate::clock::{Clock, kst_day_stamp};
use crate::config::CoreConfig;
use crate::costing::PricingConfig;
use crate::entitlement::{EntitlementClaims, EntitlementCodec, derive_session_id};
use crate::payment::{self, PaymentVerifier};
use crate::ratelimit::FreeTierLimiter;
use crate::reading::{ReadingBackend, ReadingKind, ReadingOutput, ReadingRequest};
use crate::session::PaidSessionMeter;
use crate::store::CounterStore;

#[derive(Clone)]
pub struct HaetaeHttpState {
    clock: Arc<dyn Clock>,
    codec: EntitlementCodec,
    meter: Arc<PaidSessionMeter>,
    limiter: Arc<FreeTierLimiter>,
    budget: Arc<BudgetGuard>,
    payment: Arc<dyn PaymentVerifier>,
    reading: Arc<dyn ReadingBackend>,
    pricing: PricingConfig,
}

impl HaetaeHttpState {
    /// Wires every component from one config plus the injectable seams. The
    /// same store and clock feed the meter, the limiter and the budget guard
    /// so their views of time and state never diverge.
    pub fn new(
        config: &CoreConfig,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        reading: Arc<dyn ReadingBackend>,
    ) -> Result<Self> {
        let codec = EntitlementCodec::new(&config.token_secret)?;
        let payment = payment::from_config(&config.payment)?;
        Ok(Self {
            clock: clock.clone(),
            codec,
            meter: Arc::new(PaidSessionMeter::new(
                store.clone(),
                clock.clone(),
                config.question_quota,
                config.detail_quota,
                config.session_ttl_seconds,
            )),
            limiter: Arc::new(FreeTierLimiter::new(
                store.clone(),
                clock.clone(),
                config.rate_limit_provider,
                config.free_daily_limit,
            )),
            budget: Arc::new(BudgetGuard::new(store, clock, config.monthly_budget_krw)),
            payment,
            reading,
            pricing: config.pricing,
        })
    }

    pub fn with_payment_verifier(mut self, payment: Arc<dyn PaymentVerifier>) -> Self {
        self.payment = payment;
        self
    }

    async fn settle_reading(
        &self,
        request: &ReadingRequest,
    ) -> std::result::Result<ReadingOutput, (StatusCode, HeaderMap, Json<ErrorResponse>)> {
        let output = self.reading.generate(request).await.map_err(|err| {
            tracing::warn!(kind = request.kind.as_str(), error = %err, "reading backend failed");
            error_response(
                StatusCode::BAD_GATEWAY,
                "READING_FAILED",
                "reading generation failed",
            )
        })?;
        let cost_krw = self.pricing.estimate_krw(request.kind.tier(), output.usage);
        self.budget.record_spend(cost_krw).await;
        Ok(output)
    }
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct BootstrapResponse {
    today: String,
    budget_exhausted: bool,
    maintenance_mode: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VerifyPaymentRequest {
    order_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct VerifyPaymentResponse {
    paid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    payment_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entitlement_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_init_status: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    degraded_mode: Option<bool>,
}

impl VerifyPaymentResponse {
    fn unpaid(payment_status: String) -> Self {
        Self {
            paid: false,
            payment_status: Some(payment_status),
            sid: None,
            entitlement_token: None,
            session_init_status: None,
            degraded_mode: None,
        }
    }

    fn paid(sid: String, entitlement_token: String, session_init_status: &'static str) -> Self {
        Self {
            paid: true,
            payment_status: None,
            sid: Some(sid),
            entitlement_token: Some(entitlement_token),
            session_init_status: Some(session_init_status),
            degraded_mode: Some(session_init_status == "degraded"),
        }
    }
}

/// Prompt fields shared by the reading endpoints. Bodies are parsed
/// tolerantly; a missing or malformed body reads as all-empty and each route
/// decides which fields it actually requires.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ReadingRequestBody {
    question: Option<String>,
    category: Option<String>,
    user_context: Option<String>,
    summary_hint: Option<String>,
}

impl ReadingRequestBody {
    fn trimmed_question(&self) -> Option<String> {
        non_empty(self.question.as_deref())
    }
}

#[derive(Debug, Serialize)]
struct FreeReadingResponse {
    reading: String,
}

#[derive(Debug, Serialize)]
struct SummaryReadingResponse {
    reading: String,
    question_number: u32,
    degraded_mode: bool,
}

#[derive(Debug, Serialize)]
struct DetailReadingResponse {
    reading: String,
    degraded_mode: bool,
}

pub fn router(state: HaetaeHttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/bootstrap", get(bootstrap))
        .route("/api/verify-payment", post(handle_verify_payment))
        .route("/api/reading/free", post(handle_free_reading))
        .route("/api/reading/paid-summary", post(handle_paid_summary))
        .route("/api/reading/paid-detail", post(handle_paid_detail))
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn bootstrap(
    State(state): State<HaetaeHttpState>,
) -> std::result::Result<Json<BootstrapResponse>, (StatusCode, HeaderMap, Json<ErrorResponse>)> {
    let budget = state.budget.status().await;
    let today = kst_day_stamp(state.clock.now_epoch_seconds()).map_err(internal_error)?;
    Ok(Json(BootstrapResponse {
        today,
        budget_exhausted: budget.budget_exhausted,
        maintenance_mode: false,
    }))
}

async fn handle_verify_payment(
    State(state): State<HaetaeHttpState>,
    body: Option<Json<VerifyPaymentRequest>>,
) -> std::result::Result<Json<VerifyPaymentResponse>, (StatusCode, HeaderMap, Json<ErrorResponse>)>
{
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let Some(order_id) = non_empty(body.order_id.as_deref()) else {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_ORDER",
            "order id must not be empty",
        ));
    };

    let verification = state.payment.verify(&order_id).await.map_err(|err| {
        tracing::warn!(oid = %order_id, error = %err, "payment verification unavailable");
        error_response(
            StatusCode::BAD_GATEWAY,
            "PAYMENT_UNAVAILABLE",
            "payment verification unavailable",
        )
    })?;
    if !verification.paid {
        return Ok(Json(VerifyPaymentResponse::unpaid(verification.raw_status)));
    }

    let sid = derive_session_id(&order_id);
    let token = state
        .codec
        .issue(&sid, &order_id, state.clock.now_epoch_seconds())
        .map_err(internal_error)?;

    // The paid verdict and the token never depend on the session write: a
    // customer who paid gets credentials even while the store is down.
    let mut session_init_status = "ok";
    if let Err(err) = state.meter.init_session(&sid, &order_id).await {
        session_init_status = "degraded";
        tracing::warn!(
            degraded_mode = true,
            sid = %sid,
            oid = %order_id,
            error = %err,
            "session init failed"
        );
    }

    Ok(Json(VerifyPaymentResponse::paid(
        sid,
        token,
        session_init_status,
    )))
}

async fn handle_free_reading(
    State(state): State<HaetaeHttpState>,
    headers: HeaderMap,
    body: Option<Json<ReadingRequestBody>>,
) -> std::result::Result<Json<FreeReadingResponse>, (StatusCode, HeaderMap, Json<ErrorResponse>)> {
    let budget = state.budget.status().await;
    if budget.budget_exhausted {
        return Err(error_response(
            StatusCode::FORBIDDEN,
            "BUDGET_EXHAUSTED",
            "monthly budget exhausted",
        ));
    }

    let today = kst_day_stamp(state.clock.now_epoch_seconds()).map_err(internal_error)?;
    let ip = client_ip(&headers);
    let decision = state.limiter.check(&ip, &today).await;
    if !decision.allowed {
        return Err(rate_limited_response(decision.retry_after_seconds));
    }

    let body = body.map(|Json(body)| body).unwrap_or_default();
    let Some(question) = body.trimmed_question() else {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_QUESTION",
            "question must not be empty",
        ));
    };

    let mut request = ReadingRequest::new(ReadingKind::Free);
    request.question = Some(question);
    request.category = body.category;
    request.user_context = body.user_context;

    let output = state.settle_reading(&request).await?;
    Ok(Json(FreeReadingResponse {
        reading: output.text,
    }))
}

async fn handle_paid_summary(
    State(state): State<HaetaeHttpState>,
    headers: HeaderMap,
    body: Option<Json<ReadingRequestBody>>,
) -> std::result::Result<Json<SummaryReadingResponse>, (StatusCode, HeaderMap, Json<ErrorResponse>)>
{
    let claims = authorize_session(&state, &headers)?;

    // Consumption happens before the question is validated; an empty
    // question still burns the credit it reserved.
    let grant = state.meter.consume_question(&claims.sid).await;
    if !grant.allowed {
        return Err(error_response(
            StatusCode::FORBIDDEN,
            "QUESTION_EXHAUSTED",
            "no summary questions remaining",
        ));
    }

    let body = body.map(|Json(body)| body).unwrap_or_default();
    let Some(question) = body.trimmed_question() else {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_QUESTION",
            "question must not be empty",
        ));
    };

    let mut request = ReadingRequest::new(ReadingKind::PaidSummary);
    request.question = Some(question);
    request.category = body.category;
    request.user_context = body.user_context;
    request.question_number = Some(grant.question_number);

    let output = state.settle_reading(&request).await?;
    Ok(Json(SummaryReadingResponse {
        reading: output.text,
        question_number: grant.question_number,
        degraded_mode: grant.degraded_mode,
    }))
}

async fn handle_paid_detail(
    State(state): State<HaetaeHttpState>,
    headers: HeaderMap,
    body: Option<Json<ReadingRequestBody>>,
) -> std::result::Result<Json<DetailReadingResponse>, (StatusCode, HeaderMap, Json<ErrorResponse>)>
{
    let claims = authorize_session(&state, &headers)?;

    let grant = state.meter.consume_detail(&claims.sid).await;
    if !grant.allowed {
        return Err(error_response(
            StatusCode::FORBIDDEN,
            "DETAIL_EXHAUSTED",
            "no detail expansions remaining",
        ));
    }

    // The detail prompt rides on the earlier summary; no field is required.
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let mut request = ReadingRequest::new(ReadingKind::PaidDetail);
    request.question = body.trimmed_question();
    request.summary_hint = non_empty(body.summary_hint.as_deref());

    let output = state.settle_reading(&request).await?;
    Ok(Json(DetailReadingResponse {
        reading: output.text,
        degraded_mode: grant.degraded_mode,
    }))
}

/// Missing bearer and rejected bearer are both surfaced as a dissolved
/// session, distinguished only by status code so the client renders one
/// "unlock again" path.
fn authorize_session(
    state: &HaetaeHttpState,
    headers: &HeaderMap,
) -> std::result::Result<EntitlementClaims, (StatusCode, HeaderMap, Json<ErrorResponse>)> {
    let Some(token) = extract_bearer(headers) else {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "SESSION_DISSOLVED",
            "missing entitlement token",
        ));
    };
    state
        .codec
        .verify(&token, state.clock.now_epoch_seconds())
        .map_err(|err| {
            tracing::warn!(reason = err.as_str(), "entitlement token rejected");
            error_response(
                StatusCode::FORBIDDEN,
                "SESSION_DISSOLVED",
                "entitlement token rejected",
            )
        })
}

fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let auth = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())?
        .trim()
        .to_string();
    let rest = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?;
    let token = rest.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = extract_header(headers, "x-forwarded-for") {
        if let Some(first) = forwarded
            .split(',')
            .map(str::trim)
            .find(|entry| !entry.is_empty())
        {
            return first.to_string();
        }
    }
    extract_header(headers, "x-real-ip").unwrap_or_else(|| "unknown".to_string())
}

fn non_empty(value: Option<&str>) -> Option<String> {
    let trimmed = value.unwrap_or_default().trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn error_response(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> (StatusCode, HeaderMap, Json<ErrorResponse>) {
    (
        status,
        HeaderMap::new(),
        Json(ErrorResponse {
            error: ErrorDetail {
                code,
                message: message.into(),
            },
        }),
    )
}

fn rate_limited_response(retry_after_seconds: u64) -> (StatusCode, HeaderMap, Json<ErrorResponse>) {
    let (status, _, body) = error_response(
        StatusCode::TOO_MANY_REQUESTS,
        "FREE_RATE_LIMITED",
        "daily free limit reached",
    );
    let mut headers = HeaderMap::new();
    if let Ok(value) = axum::http::HeaderValue::from_str(&retry_after_seconds.to_string()) {
        headers.insert("retry-after", value);
    }
    (status, headers, body)
}

fn internal_error(err: impl std::fmt::Display) -> (StatusCode, HeaderMap, Json<ErrorResponse>) {
    tracing::error!(error = %err, "request failed internally");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL",
        "internal error",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            let name = axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap();
            headers.insert(name, value.parse().unwrap());
        }
        headers
    }

    #[test]
    fn client_ip_prefers_first_forwarded_entry() {
        let headers = header_map(&[
            ("x-forwarded-for", "203.0.113.9, 10.0.0.1"),
            ("x-real-ip", "198.51.100.2"),
        ]);
        assert_eq!(client_ip(&headers), "203.0.113.9");
    }

    #[test]
    fn client_ip_falls_back_to_real_ip_then_unknown() {
        let headers = header_map(&[("x-real-ip", "198.51.100.2")]);
        assert_eq!(client_ip(&headers), "198.51.100.2");
        assert_eq!(client_ip(&HeaderMap::new()), "unknown");
    }

    #[test]
    fn client_ip_skips_empty_forwarded_entries() {
        let headers = header_map(&[("x-forwarded-for", " , 203.0.113.9")]);
        assert_eq!(client_ip(&headers), "203.0.113.9");
    }

    #[test]
    fn bearer_extraction_tolerates_case_and_padding() {
        let headers = header_map(&[("authorization", "bearer   abc.def.ghi ")]);
        assert_eq!(extract_bearer(&headers).as_deref(), Some("abc.def.ghi"));

        let headers = header_map(&[("authorization", "Basic abc")]);
        assert_eq!(extract_bearer(&headers), None);

        let headers = header_map(&[("authorization", "Bearer ")]);
        assert_eq!(extract_bearer(&headers), None);
    }

    #[test]
    fn rate_limited_response_carries_retry_after() {
        let (status, headers, Json(body)) = rate_limited_response(1234);
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            headers.get("retry-after").and_then(|v| v.to_str().ok()),
            Some("1234")
        );
        assert_eq!(body.error.code, "FREE_RATE_LIMITED");
    }

    #[test]
    fn verify_payment_paid_shape_reflects_init_status() {
        let ok = VerifyPaymentResponse::paid("sid".into(), "token".into(), "ok");
        assert_eq!(ok.degraded_mode, Some(false));

        let degraded = VerifyPaymentResponse::paid("sid".into(), "token".into(), "degraded");
        assert_eq!(degraded.degraded_mode, Some(true));

        let unpaid = VerifyPaymentResponse::unpaid("CANCELLED".into());
        assert!(!unpaid.paid);
        assert_eq!(unpaid.payment_status.as_deref(), Some("CANCELLED"));
        assert!(unpaid.entitlement_token.is_none());
    }
}
