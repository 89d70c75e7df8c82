//! Payment verification seam.
//!
//! The gateway integration is reduced to one question per order id: settled
//! or not. Anything the provider reports beyond that travels opaquely in
//! `raw_status` for the client to display.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::PaymentConfig;
use crate::{HaetaeError, Result};

const VERIFY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentVerification {
    pub paid: bool,
    pub raw_status: String,
}

/// Transport failures bubble up as errors; a reachable provider that says
/// "not paid" is a normal `Ok` verification.
#[async_trait]
pub trait PaymentVerifier: Send + Sync {
    async fn verify(&self, order_id: &str) -> Result<PaymentVerification>;
}

pub fn from_config(config: &PaymentConfig) -> Result<std::sync::Arc<dyn PaymentVerifier>> {
    match config {
        PaymentConfig::Stub { paid_order_ids } => Ok(std::sync::Arc::new(
            StubPaymentVerifier::new(paid_order_ids.clone()),
        )),
        PaymentConfig::Remote {
            verify_url,
            verify_secret,
        } => Ok(std::sync::Arc::new(RemotePaymentVerifier::new(
            verify_url.clone(),
            verify_secret.clone(),
        )?)),
    }
}

/// Development verifier: a configured allowlist plus the `paid_` order-id
/// prefix convention used by local clients.
#[derive(Debug, Clone, Default)]
pub struct StubPaymentVerifier {
    paid_order_ids: Vec<String>,
}

impl StubPaymentVerifier {
    pub fn new(paid_order_ids: Vec<String>) -> Self {
        Self { paid_order_ids }
    }
}

#[async_trait]
impl PaymentVerifier for StubPaymentVerifier {
    async fn verify(&self, order_id: &str) -> Result<PaymentVerification> {
        let paid =
            order_id.starts_with("paid_") || self.paid_order_ids.iter().any(|id| id == order_id);
        Ok(PaymentVerification {
            paid,
            raw_status: if paid { "PAID" } else { "FAILED" }.to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct RemoteStatusBody {
    #[serde(default)]
    status: Option<String>,
}

/// Calls the configured verification endpoint with the order id. Only an
/// explicit `PAID` status settles; every other reachable outcome is unpaid.
#[derive(Clone)]
pub struct RemotePaymentVerifier {
    verify_url: String,
    verify_secret: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for RemotePaymentVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotePaymentVerifier")
            .field("verify_url", &self.verify_url)
            .field(
                "verify_secret",
                &self.verify_secret.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl RemotePaymentVerifier {
    pub fn new(verify_url: String, verify_secret: Option<String>) -> Result<Self> {
        if verify_url.trim().is_empty() {
            return Err(HaetaeError::Config(
                "payment verify url must not be empty".to_string(),
            ));
        }
        let client = reqwest::Client::builder().timeout(VERIFY_TIMEOUT).build()?;
        Ok(Self {
            verify_url,
            verify_secret,
            client,
        })
    }
}

#[async_trait]
impl PaymentVerifier for RemotePaymentVerifier {
    async fn verify(&self, order_id: &str) -> Result<PaymentVerification> {
        let mut req = self
            .client
            .post(&self.verify_url)
            .json(&serde_json::json!({ "order_id": order_id }));
        if let Some(secret) = &self.verify_secret {
            req = req.bearer_auth(secret);
        }

        let response = req.send().await?;
        if !response.status().is_success() {
            return Ok(PaymentVerification {
                paid: false,
                raw_status: "FAILED".to_string(),
            });
        }

        let body = match response.json::<RemoteStatusBody>().await {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(error = %err, "payment status response unparsable");
                return Ok(PaymentVerification {
                    paid: false,
                    raw_status: "FAILED".to_string(),
                });
            }
        };

        let paid = body
            .status
            .as_deref()
            .map(|status| status.trim().eq_ignore_ascii_case("PAID"))
            .unwrap_or(false);
        Ok(PaymentVerification {
            paid,
            raw_status: body.status.unwrap_or_else(|| "FAILED".to_string()),
        })
    }
}
