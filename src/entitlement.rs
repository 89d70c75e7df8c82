//! Signed paid-session entitlements.
//!
//! Tokens are compact HS256 JWTs carrying the session id and the order that
//! paid for it. Verification is offline: any instance holding the shared
//! secret can check a token without a store round trip.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{HaetaeError, Result};

pub const TOKEN_TTL_SECONDS: u64 = 86_400;

const TOKEN_SCOPE: &str = "paid_session";
const MIN_SECRET_BYTES: usize = 32;

type HmacSha256 = Hmac<Sha256>;

#[derive(Serialize)]
struct TokenHeader<'a> {
    alg: &'a str,
    typ: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntitlementClaims {
    pub scope: String,
    pub sid: String,
    pub oid: String,
    pub iat: u64,
    pub exp: u64,
}

/// Why a token failed verification. `as_str` yields the stable name used in
/// logs; callers collapse all variants into one client-facing rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("token is not of the form header.payload.signature")]
    InvalidFormat,
    #[error("token signature mismatch")]
    InvalidSignature,
    #[error("token segments are not valid base64url json")]
    InvalidJson,
    #[error("token algorithm is not HS256")]
    InvalidAlg,
    #[error("token claims are missing or malformed")]
    InvalidPayload,
    #[error("token is expired")]
    Expired,
}

impl VerifyError {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidFormat => "INVALID_FORMAT",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::InvalidJson => "INVALID_JSON",
            Self::InvalidAlg => "INVALID_ALG",
            Self::InvalidPayload => "INVALID_PAYLOAD",
            Self::Expired => "EXPIRED",
        }
    }
}

/// Issues and verifies entitlement tokens with a shared HMAC secret.
///
/// The secret length is enforced here so a weak or missing secret fails at
/// startup instead of surfacing as a per-request signing error.
#[derive(Clone)]
pub struct EntitlementCodec {
    mac: HmacSha256,
}

impl std::fmt::Debug for EntitlementCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntitlementCodec")
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl EntitlementCodec {
    pub fn new(secret: &str) -> Result<Self> {
        if secret.len() < MIN_SECRET_BYTES {
            return Err(HaetaeError::Config(format!(
                "token secret must be at least {MIN_SECRET_BYTES} bytes"
            )));
        }
        let mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| HaetaeError::Config("token secret rejected by hmac".to_string()))?;
        Ok(Self { mac })
    }

    pub fn issue(&self, session_id: &str, order_id: &str, now: u64) -> Result<String> {
        let header = TokenHeader {
            alg: "HS256",
            typ: "JWT",
        };
        let claims = EntitlementClaims {
            scope: TOKEN_SCOPE.to_string(),
            sid: session_id.to_string(),
            oid: order_id.to_string(),
            iat: now,
            exp: now + TOKEN_TTL_SECONDS,
        };

        let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
        let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
        let signing_input = format!("{header_b64}.{payload_b64}");
        let signature_b64 = URL_SAFE_NO_PAD.encode(self.sign(&signing_input));
        Ok(format!("{signing_input}.{signature_b64}"))
    }

    /// Checks are ordered so the signature is validated before any claim is
    /// trusted; an attacker probing malformed payloads learns nothing past
    /// the signature gate.
    pub fn verify(
        &self,
        token: &str,
        now: u64,
    ) -> std::result::Result<EntitlementClaims, VerifyError> {
        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 3 {
            return Err(VerifyError::InvalidFormat);
        }
        let (header_b64, payload_b64, signature_b64) = (parts[0], parts[1], parts[2]);

        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| VerifyError::InvalidSignature)?;
        let signing_input = format!("{header_b64}.{payload_b64}");
        let mut mac = self.mac.clone();
        mac.update(signing_input.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| VerifyError::InvalidSignature)?;

        let header_bytes = URL_SAFE_NO_PAD
            .decode(header_b64)
            .map_err(|_| VerifyError::InvalidJson)?;
        let payload_bytes = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| VerifyError::InvalidJson)?;
        let header: serde_json::Value =
            serde_json::from_slice(&header_bytes).map_err(|_| VerifyError::InvalidJson)?;
        let payload: serde_json::Value =
            serde_json::from_slice(&payload_bytes).map_err(|_| VerifyError::InvalidJson)?;

        if header.get("alg").and_then(serde_json::Value::as_str) != Some("HS256") {
            return Err(VerifyError::InvalidAlg);
        }

        let scope = payload.get("scope").and_then(serde_json::Value::as_str);
        let sid = payload
            .get("sid")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let oid = payload
            .get("oid")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let exp = payload
            .get("exp")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(0.0);
        if scope != Some(TOKEN_SCOPE) || sid.is_empty() || oid.is_empty() || exp <= 0.0 {
            return Err(VerifyError::InvalidPayload);
        }
        if exp <= now as f64 {
            return Err(VerifyError::Expired);
        }

        Ok(EntitlementClaims {
            scope: TOKEN_SCOPE.to_string(),
            sid: sid.to_string(),
            oid: oid.to_string(),
            iat: payload
                .get("iat")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0),
            exp: exp as u64,
        })
    }

    fn sign(&self, signing_input: &str) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(signing_input.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }
}

/// Derives the stable session id for an order: the first 24 base64url
/// characters of `sha256("sid:{order_id}")`. Re-verifying the same order
/// always lands on the same session, so a duplicate payment callback cannot
/// mint a second quota.
pub fn derive_session_id(order_id: &str) -> String {
    let digest = Sha256::digest(format!("sid:{order_id}").as_bytes());
    let encoded = URL_SAFE_NO_PAD.encode(digest);
    encoded[..24].to_string()
}
