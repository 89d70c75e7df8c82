use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;

use super::{CounterStore, StoreError};
use crate::HaetaeError;
use crate::config::CounterStoreConfig;
use crate::utils::http::response_text_truncated;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// REST client for an Upstash-style counter service: one command per
/// request, bearer-token auth, and a `{"result": ...}` envelope. Timeouts
/// are short because every caller has a degraded path to fall back on.
#[derive(Clone)]
pub struct RestCounterStore {
    base: Url,
    token: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for RestCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestCounterStore")
            .field("base", &self.base.as_str())
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct CommandResponse {
    result: serde_json::Value,
}

impl RestCounterStore {
    pub fn new(config: &CounterStoreConfig) -> Result<Self, HaetaeError> {
        let base = Url::parse(&config.base_url).map_err(|err| {
            HaetaeError::Config(format!(
                "invalid counter store url {:?}: {err}",
                config.base_url
            ))
        })?;
        if base.cannot_be_a_base() {
            return Err(HaetaeError::Config(format!(
                "counter store url {:?} cannot carry command paths",
                config.base_url
            )));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base,
            token: config.token.clone(),
            client,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        // `new` rejects cannot-be-a-base urls, so this never fails.
        if let Ok(mut path) = url.path_segments_mut() {
            path.extend(segments);
        }
        url
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<serde_json::Value, StoreError> {
        let response = req.bearer_auth(&self.token).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response_text_truncated(response).await;
            return Err(StoreError::Api { status, body });
        }
        let parsed = response.json::<CommandResponse>().await?;
        Ok(parsed.result)
    }
}

#[async_trait]
impl CounterStore for RestCounterStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let url = self.endpoint(&["get", key]);
        match self.send(self.client.get(url)).await? {
            serde_json::Value::Null => Ok(None),
            serde_json::Value::String(value) => Ok(Some(value)),
            other => Ok(Some(other.to_string())),
        }
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let url = self.endpoint(&["incr", key]);
        parse_integer(&self.send(self.client.post(url)).await?)
    }

    async fn incr_by(&self, key: &str, amount: i64) -> Result<i64, StoreError> {
        let url = self.endpoint(&["incrby", key, &amount.to_string()]);
        parse_integer(&self.send(self.client.post(url)).await?)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<bool, StoreError> {
        let mut url = self.endpoint(&["set", key, value]);
        url.query_pairs_mut()
            .append_pair("NX", "true")
            .append_pair("EX", &ttl_seconds.to_string());
        let result = self.send(self.client.post(url)).await?;
        Ok(is_simple_ok(&result))
    }

    async fn set_if_present_keep_ttl(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut url = self.endpoint(&["set", key, value]);
        url.query_pairs_mut()
            .append_pair("XX", "true")
            .append_pair("KEEPTTL", "true");
        let result = self.send(self.client.post(url)).await?;
        Ok(is_simple_ok(&result))
    }

    async fn expire_if_no_ttl(&self, key: &str, seconds: u64) -> Result<bool, StoreError> {
        let url = self.endpoint(&["expire", key, &seconds.to_string(), "NX"]);
        let result = self.send(self.client.post(url)).await?;
        Ok(parse_integer(&result)? == 1)
    }
}

fn is_simple_ok(result: &serde_json::Value) -> bool {
    matches!(result, serde_json::Value::String(text) if text == "OK")
}

fn parse_integer(result: &serde_json::Value) -> Result<i64, StoreError> {
    match result {
        serde_json::Value::Number(number) => number.as_i64().ok_or_else(|| {
            StoreError::InvalidResponse(format!("non-integer counter: {number}"))
        }),
        serde_json::Value::String(raw) => raw
            .parse::<i64>()
            .map_err(|_| StoreError::InvalidResponse(format!("non-integer counter: {raw:?}"))),
        other => Err(StoreError::InvalidResponse(format!(
            "unexpected counter result: {other}"
        ))),
    }
}
