#![cfg(feature = "server")]

//! End-to-end tests over the HTTP router with in-memory counters, a manual
//! clock and canned reading/payment backends.

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::util::ServiceExt;

use haetae::utils::test_support::ManualClock;
use haetae::{
    CoreConfig, CounterStore, HaetaeError, HaetaeHttpState, MemoryCounterStore, PaymentConfig,
    PaymentVerification, PaymentVerifier, PricingConfig, RateLimitProvider, ReadingBackend,
    ReadingOutput, ReadingRequest, TOKEN_TTL_SECONDS, TokenUsage, derive_session_id, router,
};

// 2023-11-15 07:13:20 KST.
const NOW: u64 = 1_700_000_000;
const TODAY: &str = "2023-11-15";
const MONTH_KEY: &str = "budget:month:2023-11";
const WINDOW_AT_NOW: u64 = 60_400;

const READING_TEXT: &str = "The cards counsel patience.";

struct FixedReadingBackend;

#[async_trait]
impl ReadingBackend for FixedReadingBackend {
    async fn generate(&self, _request: &ReadingRequest) -> haetae::Result<ReadingOutput> {
        Ok(ReadingOutput {
            text: READING_TEXT.to_string(),
            usage: TokenUsage {
                input_tokens: 1_000_000,
                output_tokens: 500_000,
            },
        })
    }
}

struct FailingReadingBackend;

#[async_trait]
impl ReadingBackend for FailingReadingBackend {
    async fn generate(&self, _request: &ReadingRequest) -> haetae::Result<ReadingOutput> {
        Err(HaetaeError::InvalidResponse(
            "model returned no text".to_string(),
        ))
    }
}

struct UnreachableVerifier;

#[async_trait]
impl PaymentVerifier for UnreachableVerifier {
    async fn verify(&self, _order_id: &str) -> haetae::Result<PaymentVerification> {
        Err(HaetaeError::InvalidResponse(
            "payment gateway unreachable".to_string(),
        ))
    }
}

fn base_config() -> CoreConfig {
    CoreConfig {
        token_secret: "0123456789abcdef0123456789abcdef".to_string(),
        counter_store: None,
        rate_limit_provider: RateLimitProvider::Remote,
        payment: PaymentConfig::Stub {
            paid_order_ids: vec!["vip-1".to_string()],
        },
        reading_url: None,
        pricing: PricingConfig::default(),
        free_daily_limit: 5,
        question_quota: 3,
        detail_quota: 1,
        session_ttl_seconds: 86_400,
        monthly_budget_krw: 100_000,
    }
}

struct TestGateway {
    app: Router,
    store: Arc<MemoryCounterStore>,
    clock: Arc<ManualClock>,
}

fn gateway_with_backend(backend: Arc<dyn ReadingBackend>) -> TestGateway {
    let clock = Arc::new(ManualClock::at(NOW));
    let store = Arc::new(MemoryCounterStore::new(clock.clone()));
    let state = HaetaeHttpState::new(&base_config(), store.clone(), clock.clone(), backend)
        .expect("state");
    TestGateway {
        app: router(state),
        store,
        clock,
    }
}

fn gateway() -> TestGateway {
    gateway_with_backend(Arc::new(FixedReadingBackend))
}

fn degraded_app() -> Router {
    let clock = Arc::new(ManualClock::at(NOW));
    let state = HaetaeHttpState::new(
        &base_config(),
        haetae::store::disabled(),
        clock,
        Arc::new(FixedReadingBackend),
    )
    .expect("state");
    router(state)
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn post_empty(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post_json_from(uri: &str, ip: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-forwarded-for", ip)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post_json_bearer(uri: &str, token: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {token}"))
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post_empty_bearer(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, body)
}

async fn issue_token(app: &Router, order_id: &str) -> String {
    let (status, body) = send(
        app,
        post_json("/api/verify-payment", json!({ "order_id": order_id })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["paid"], true);
    body["entitlement_token"]
        .as_str()
        .expect("entitlement token")
        .to_string()
}

#[tokio::test]
async fn health_reports_ok() {
    let gw = gateway();
    let (status, body) = send(&gw.app, get_request("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn bootstrap_reports_the_kst_day_and_budget_state() {
    let gw = gateway();
    let (status, body) = send(&gw.app, get_request("/api/bootstrap")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["today"], TODAY);
    assert_eq!(body["budget_exhausted"], false);
    assert_eq!(body["maintenance_mode"], false);

    gw.store.incr_by(MONTH_KEY, 100_000).await.expect("prime ledger");
    let (_, body) = send(&gw.app, get_request("/api/bootstrap")).await;
    assert_eq!(body["budget_exhausted"], true);
}

#[tokio::test]
async fn verify_payment_issues_credentials_and_seeds_the_session() {
    let gw = gateway();
    let (status, body) = send(
        &gw.app,
        post_json("/api/verify-payment", json!({ "order_id": "paid_order-77" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["paid"], true);
    assert_eq!(body["session_init_status"], "ok");
    assert_eq!(body["degraded_mode"], false);
    assert!(body.get("payment_status").is_none());

    let sid = body["sid"].as_str().expect("sid");
    assert_eq!(sid, derive_session_id("paid_order-77"));
    let token = body["entitlement_token"].as_str().expect("token");
    assert_eq!(token.split('.').count(), 3);

    let raw = gw
        .store
        .get(&format!("sess:{sid}"))
        .await
        .expect("get")
        .expect("session record");
    let record: Value = serde_json::from_str(&raw).expect("session json");
    assert_eq!(record["q"], 3);
    assert_eq!(record["d"], 1);
    assert_eq!(record["oid"], "paid_order-77");
    assert_eq!(record["createdAt"], NOW);
}

#[tokio::test]
async fn verify_payment_requires_an_order_id() {
    let gw = gateway();

    let (status, body) = send(&gw.app, post_empty("/api/verify-payment")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_ORDER");

    let (status, body) = send(
        &gw.app,
        post_json("/api/verify-payment", json!({ "order_id": "   " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_ORDER");

    let garbage = Request::builder()
        .method("POST")
        .uri("/api/verify-payment")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&gw.app, garbage).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_ORDER");
}

#[tokio::test]
async fn unpaid_orders_report_the_gateway_status() {
    let gw = gateway();
    let (status, body) = send(
        &gw.app,
        post_json("/api/verify-payment", json!({ "order_id": "order-55" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["paid"], false);
    assert_eq!(body["payment_status"], "FAILED");
    assert!(body.get("sid").is_none());
    assert!(body.get("entitlement_token").is_none());

    let (_, body) = send(
        &gw.app,
        post_json("/api/verify-payment", json!({ "order_id": "vip-1" })),
    )
    .await;
    assert_eq!(body["paid"], true);
}

#[tokio::test]
async fn paid_summaries_count_down_and_then_exhaust() {
    let gw = gateway();
    let token = issue_token(&gw.app, "paid_order-1").await;

    for expected in 1..=3u32 {
        let (status, body) = send(
            &gw.app,
            post_json_bearer(
                "/api/reading/paid-summary",
                &token,
                json!({ "question": "What changes this winter?" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["question_number"], expected);
        assert_eq!(body["degraded_mode"], false);
        assert_eq!(body["reading"], READING_TEXT);
    }

    let (status, body) = send(
        &gw.app,
        post_json_bearer(
            "/api/reading/paid-summary",
            &token,
            json!({ "question": "One more?" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "QUESTION_EXHAUSTED");
}

#[tokio::test]
async fn the_single_detail_expansion_is_metered() {
    let gw = gateway();
    let token = issue_token(&gw.app, "paid_order-2").await;

    // No field is required on the detail route.
    let (status, body) = send(
        &gw.app,
        post_json_bearer("/api/reading/paid-detail", &token, json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reading"], READING_TEXT);
    assert_eq!(body["degraded_mode"], false);

    let (status, body) = send(
        &gw.app,
        post_json_bearer(
            "/api/reading/paid-detail",
            &token,
            json!({ "question": "Expand on the Tower", "summary_hint": "upheaval" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "DETAIL_EXHAUSTED");
}

#[tokio::test]
async fn an_empty_question_still_burns_its_credit() {
    let gw = gateway();
    let token = issue_token(&gw.app, "paid_order-8").await;

    let (status, body) = send(
        &gw.app,
        post_json_bearer(
            "/api/reading/paid-summary",
            &token,
            json!({ "question": "   " }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_QUESTION");

    let (status, body) = send(
        &gw.app,
        post_json_bearer(
            "/api/reading/paid-summary",
            &token,
            json!({ "question": "Still with me?" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["question_number"], 2);

    let (status, _) = send(
        &gw.app,
        post_empty_bearer("/api/reading/paid-summary", &token),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &gw.app,
        post_json_bearer(
            "/api/reading/paid-summary",
            &token,
            json!({ "question": "Anything left?" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "QUESTION_EXHAUSTED");
}

#[tokio::test]
async fn missing_or_invalid_tokens_dissolve_the_session() {
    let gw = gateway();

    let (status, body) = send(
        &gw.app,
        post_json("/api/reading/paid-summary", json!({ "question": "Q" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "SESSION_DISSOLVED");

    let (status, body) = send(
        &gw.app,
        post_json_bearer(
            "/api/reading/paid-summary",
            "not.a.token",
            json!({ "question": "Q" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "SESSION_DISSOLVED");
}

#[tokio::test]
async fn expired_tokens_dissolve_the_session() {
    let gw = gateway();
    let token = issue_token(&gw.app, "paid_order-9").await;

    gw.clock.advance(TOKEN_TTL_SECONDS);
    let (status, body) = send(
        &gw.app,
        post_json_bearer(
            "/api/reading/paid-summary",
            &token,
            json!({ "question": "Too late?" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "SESSION_DISSOLVED");
}

#[tokio::test]
async fn free_readings_are_limited_per_ip_per_day() {
    let gw = gateway();
    for _ in 0..5 {
        let (status, body) = send(
            &gw.app,
            post_json_from(
                "/api/reading/free",
                "203.0.113.7",
                json!({ "question": "One card please" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reading"], READING_TEXT);
    }

    let response = gw
        .app
        .clone()
        .oneshot(post_json_from(
            "/api/reading/free",
            "203.0.113.7",
            json!({ "question": "One card please" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after = response
        .headers()
        .get("retry-after")
        .expect("retry-after header")
        .to_str()
        .expect("ascii header");
    assert_eq!(retry_after, WINDOW_AT_NOW.to_string());
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).expect("json body");
    assert_eq!(body["error"]["code"], "FREE_RATE_LIMITED");

    // Another address still has its own allowance.
    let (status, _) = send(
        &gw.app,
        post_json_from(
            "/api/reading/free",
            "198.51.100.2",
            json!({ "question": "And for me?" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn the_free_window_resets_at_kst_midnight() {
    let gw = gateway();
    for _ in 0..5 {
        let (status, _) = send(
            &gw.app,
            post_json_from("/api/reading/free", "203.0.113.7", json!({ "question": "Q" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, _) = send(
        &gw.app,
        post_json_from("/api/reading/free", "203.0.113.7", json!({ "question": "Q" })),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    gw.clock.advance(WINDOW_AT_NOW);
    let (status, _) = send(
        &gw.app,
        post_json_from("/api/reading/free", "203.0.113.7", json!({ "question": "Q" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn free_readings_require_a_question() {
    let gw = gateway();

    let (status, body) = send(
        &gw.app,
        post_json_from("/api/reading/free", "203.0.113.7", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_QUESTION");

    let garbage = Request::builder()
        .method("POST")
        .uri("/api/reading/free")
        .header("content-type", "application/json")
        .header("x-forwarded-for", "203.0.113.7")
        .body(Body::from("]["))
        .unwrap();
    let (status, body) = send(&gw.app, garbage).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_QUESTION");
}

#[tokio::test]
async fn budget_exhaustion_gates_free_but_not_paid() {
    let gw = gateway();
    gw.store.incr_by(MONTH_KEY, 100_000).await.expect("prime ledger");

    let (status, body) = send(
        &gw.app,
        post_json_from("/api/reading/free", "203.0.113.7", json!({ "question": "Q" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "BUDGET_EXHAUSTED");

    let token = issue_token(&gw.app, "paid_order-3").await;
    let (status, _) = send(
        &gw.app,
        post_json_bearer(
            "/api/reading/paid-summary",
            &token,
            json!({ "question": "Paid still works?" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn reading_spend_lands_in_the_monthly_ledger() {
    let gw = gateway();

    let (status, _) = send(
        &gw.app,
        post_json_from("/api/reading/free", "203.0.113.7", json!({ "question": "Q" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let token = issue_token(&gw.app, "paid_order-4").await;
    let (status, _) = send(
        &gw.app,
        post_json_bearer("/api/reading/paid-detail", &token, json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // 594 KRW from the low-tier free reading plus 11,880 from the high tier.
    let total = gw
        .store
        .get(MONTH_KEY)
        .await
        .expect("get")
        .expect("ledger value");
    assert_eq!(total, "12474");
}

#[tokio::test]
async fn backend_failures_surface_after_the_credit_burns() {
    let gw = gateway_with_backend(Arc::new(FailingReadingBackend));

    let (status, body) = send(
        &gw.app,
        post_json_from("/api/reading/free", "203.0.113.7", json!({ "question": "Q" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"]["code"], "READING_FAILED");

    let token = issue_token(&gw.app, "paid_order-5").await;
    let (status, body) = send(
        &gw.app,
        post_json_bearer(
            "/api/reading/paid-summary",
            &token,
            json!({ "question": "Q" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"]["code"], "READING_FAILED");

    // The question was consumed before the backend ran.
    let sid = derive_session_id("paid_order-5");
    let raw = gw
        .store
        .get(&format!("sess:{sid}"))
        .await
        .expect("get")
        .expect("session record");
    let record: Value = serde_json::from_str(&raw).expect("session json");
    assert_eq!(record["q"], 2);

    // No spend was recorded for the failed generations.
    assert_eq!(gw.store.get(MONTH_KEY).await.expect("get"), None);
}

#[tokio::test]
async fn payment_outages_are_a_gateway_error() {
    let clock = Arc::new(ManualClock::at(NOW));
    let store = Arc::new(MemoryCounterStore::new(clock.clone()));
    let state = HaetaeHttpState::new(
        &base_config(),
        store,
        clock,
        Arc::new(FixedReadingBackend),
    )
    .expect("state")
    .with_payment_verifier(Arc::new(UnreachableVerifier));
    let app = router(state);

    let (status, body) = send(
        &app,
        post_json("/api/verify-payment", json!({ "order_id": "paid_order-6" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"]["code"], "PAYMENT_UNAVAILABLE");
}

#[tokio::test]
async fn a_store_outage_degrades_paid_service_instead_of_refusing_it() {
    let app = degraded_app();

    let (status, body) = send(
        &app,
        post_json("/api/verify-payment", json!({ "order_id": "paid_order-7" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["paid"], true);
    assert_eq!(body["session_init_status"], "degraded");
    assert_eq!(body["degraded_mode"], true);
    let token = body["entitlement_token"]
        .as_str()
        .expect("token")
        .to_string();

    // Without a readable record every summary grants as question one.
    for _ in 0..2 {
        let (status, body) = send(
            &app,
            post_json_bearer(
                "/api/reading/paid-summary",
                &token,
                json!({ "question": "Q" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["question_number"], 1);
        assert_eq!(body["degraded_mode"], true);
    }

    let (status, body) = send(
        &app,
        post_json_bearer("/api/reading/paid-detail", &token, json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["degraded_mode"], true);
}

#[tokio::test]
async fn free_limiting_survives_a_store_outage_locally() {
    let app = degraded_app();

    for _ in 0..5 {
        let (status, _) = send(
            &app,
            post_json_from("/api/reading/free", "203.0.113.7", json!({ "question": "Q" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let response = app
        .clone()
        .oneshot(post_json_from(
            "/api/reading/free",
            "203.0.113.7",
            json!({ "question": "Q" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after = response
        .headers()
        .get("retry-after")
        .expect("retry-after header")
        .to_str()
        .expect("ascii header");
    assert_eq!(retry_after, WINDOW_AT_NOW.to_string());
}
