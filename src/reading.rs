//! Reading generation seam.
//!
//! The generative model lives behind an HTTP service owned elsewhere; this
//! crate only ships a prompt-shaped request and consumes text plus token
//! counts. Tier selection is fixed per reading kind so costing never depends
//! on what the backend actually ran.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::costing::{ModelTier, TokenUsage};
use crate::utils::http::send_checked_json;
use crate::{HaetaeError, Result};

const READING_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingKind {
    Free,
    PaidSummary,
    PaidDetail,
}

impl ReadingKind {
    pub fn tier(self) -> ModelTier {
        match self {
            Self::Free | Self::PaidSummary => ModelTier::Low,
            Self::PaidDetail => ModelTier::High,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::PaidSummary => "paid_summary",
            Self::PaidDetail => "paid_detail",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadingRequest {
    pub kind: ReadingKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question_number: Option<u32>,
}

impl ReadingRequest {
    pub fn new(kind: ReadingKind) -> Self {
        Self {
            kind,
            question: None,
            category: None,
            user_context: None,
            summary_hint: None,
            question_number: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadingOutput {
    pub text: String,
    pub usage: TokenUsage,
}

#[async_trait]
pub trait ReadingBackend: Send + Sync {
    async fn generate(&self, request: &ReadingRequest) -> Result<ReadingOutput>;
}

#[derive(Debug, Deserialize)]
struct BackendReadingBody {
    #[serde(default)]
    reading: String,
    #[serde(default)]
    usage: TokenUsage,
}

/// POSTs the request to a reading service and decodes `{reading, usage}`.
/// The generous timeout covers slow model generations; callers treat any
/// error here as a failed reading, never as a reason to retry.
#[derive(Debug, Clone)]
pub struct HttpReadingBackend {
    url: String,
    client: reqwest::Client,
}

impl HttpReadingBackend {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(HaetaeError::Config(
                "reading backend url must not be empty".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(READING_TIMEOUT)
            .build()?;
        Ok(Self { url, client })
    }
}

#[async_trait]
impl ReadingBackend for HttpReadingBackend {
    async fn generate(&self, request: &ReadingRequest) -> Result<ReadingOutput> {
        let body: BackendReadingBody =
            send_checked_json(self.client.post(&self.url).json(request)).await?;
        if body.reading.trim().is_empty() {
            return Err(HaetaeError::InvalidResponse(
                "reading backend returned empty text".to_string(),
            ));
        }
        Ok(ReadingOutput {
            text: body.reading,
            usage: body.usage,
        })
    }
}
