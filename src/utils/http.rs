use futures_util::StreamExt;
use serde::de::DeserializeOwned;

use crate::{HaetaeError, Result};

const MAX_CAPTURED_BODY_BYTES: usize = 64 * 1024;

/// Collects a response body for error reporting, capped so a misbehaving
/// upstream cannot make us buffer unbounded output.
pub(crate) async fn response_text_truncated(response: reqwest::Response) -> String {
    let mut out = Vec::<u8>::new();
    let mut truncated = false;

    let mut stream = response.bytes_stream();
    while let Some(next) = stream.next().await {
        let Ok(chunk) = next else {
            break;
        };
        let remaining = MAX_CAPTURED_BODY_BYTES.saturating_sub(out.len());
        if remaining == 0 {
            truncated = true;
            break;
        }
        if chunk.len() <= remaining {
            out.extend_from_slice(chunk.as_ref());
        } else {
            out.extend_from_slice(&chunk.as_ref()[..remaining]);
            truncated = true;
            break;
        }
    }

    let mut body = String::from_utf8_lossy(&out).to_string();
    if truncated {
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str("...(truncated)");
    }
    body
}

pub(crate) async fn send_checked(req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
    let response = req.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response_text_truncated(response).await;
        return Err(HaetaeError::Api { status, body });
    }
    Ok(response)
}

pub(crate) async fn send_checked_json<T: DeserializeOwned>(
    req: reqwest::RequestBuilder,
) -> Result<T> {
    let response = send_checked(req).await?;
    Ok(response.json::<T>().await?)
}
