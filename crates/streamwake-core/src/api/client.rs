use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;

use super::UpstreamApi;
use crate::constants::{DEFAULT_RATE_LIMIT_DELAY, MAX_RATE_LIMIT_DELAY, RATE_LIMIT_MAX_ATTEMPTS};
use crate::models::credential::TokenResponse;
use crate::models::json_utils::unwrap_data;
use crate::models::{AgentIdentity, ChannelDescriptor, StreamCredential};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{operation} request failed: {source}")]
    Request {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{operation} failed with status {status}: {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },

    #[error("{operation} still rate limited after {attempts} attempts")]
    RateLimited {
        operation: &'static str,
        attempts: usize,
    },

    #[error("failed to decode {operation} response: {message}")]
    Decode {
        operation: &'static str,
        message: String,
    },
}

/// Authenticated client for the upstream REST API
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    max_attempts: usize,
}

impl ApiClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self, ApiError> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("streamwake/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|source| ApiError::Request {
                operation: "client setup",
                source,
            })?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.trim().to_string(),
            max_attempts: RATE_LIMIT_MAX_ATTEMPTS,
        })
    }

    /// Override how many times a rate-limited request is attempted
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// GET `path` and decode the body as JSON, waiting out 429 responses.
    ///
    /// The retry is a bounded loop: each 429 sleeps for the server's hint
    /// (`Retry-After` header or a `retryAfter` body field, in seconds, capped
    /// at five minutes) or the default delay, then repeats the same request.
    async fn get_json(
        &self,
        operation: &'static str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Value, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0_usize;
        loop {
            attempt += 1;
            let response = self
                .http
                .get(&url)
                .bearer_auth(&self.token)
                .query(query)
                .send()
                .await
                .map_err(|source| ApiError::Request { operation, source })?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                let header_hint = parse_retry_after(response.headers());
                let body = response.text().await.unwrap_or_default();
                let delay = rate_limit_delay(header_hint, &body);
                if attempt >= self.max_attempts {
                    return Err(ApiError::RateLimited {
                        operation,
                        attempts: attempt,
                    });
                }
                tracing::warn!(
                    "{} rate limited, retrying in {:?} (attempt {}/{})",
                    operation,
                    delay,
                    attempt,
                    self.max_attempts
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ApiError::Status {
                    operation,
                    status: status.as_u16(),
                    body: truncate_for_error(&body, 400),
                });
            }

            return response.json::<Value>().await.map_err(|e| ApiError::Decode {
                operation,
                message: e.to_string(),
            });
        }
    }
}

#[async_trait]
impl UpstreamApi for ApiClient {
    async fn fetch_identity(&self) -> Result<AgentIdentity, ApiError> {
        let value = self.get_json("identity fetch", "/users/@me", &[]).await?;
        AgentIdentity::from_json(&value).ok_or_else(|| ApiError::Decode {
            operation: "identity fetch",
            message: "response carries no user id".to_string(),
        })
    }

    async fn fetch_channels(&self, server_id: &str) -> Result<Vec<ChannelDescriptor>, ApiError> {
        let path = format!("/servers/{}/channels", server_id);
        let value = self.get_json("channel listing", &path, &[]).await?;
        Ok(ChannelDescriptor::list_from_json(&value))
    }

    async fn issue_token(
        &self,
        channels: &BTreeSet<String>,
        ttl_secs: u64,
    ) -> Result<StreamCredential, ApiError> {
        let joined = channels.iter().cloned().collect::<Vec<_>>().join(",");
        let query = [("channels", joined), ("ttl", ttl_secs.to_string())];
        let value = self.get_json("token issuance", "/events/token", &query).await?;
        let response: TokenResponse = serde_json::from_value(unwrap_data(&value).clone())
            .map_err(|e| ApiError::Decode {
                operation: "token issuance",
                message: e.to_string(),
            })?;
        Ok(StreamCredential::from_response(response, channels, ttl_secs))
    }
}

fn rate_limit_delay(header_hint: Option<Duration>, body: &str) -> Duration {
    header_hint
        .or_else(|| retry_after_from_body(body))
        .unwrap_or(DEFAULT_RATE_LIMIT_DELAY)
        .min(MAX_RATE_LIMIT_DELAY)
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let raw = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    parse_delay_secs(raw.trim())
}

fn retry_after_from_body(body: &str) -> Option<Duration> {
    let value: Value = serde_json::from_str(body).ok()?;
    let hint = value
        .get("retryAfter")
        .or_else(|| value.get("retry_after"))?;
    match hint {
        Value::Number(n) => n.as_f64().and_then(secs_to_duration),
        Value::String(s) => parse_delay_secs(s.trim()),
        _ => None,
    }
}

fn parse_delay_secs(raw: &str) -> Option<Duration> {
    raw.parse::<f64>().ok().and_then(secs_to_duration)
}

fn secs_to_duration(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}

fn truncate_for_error(body: &str, max_chars: usize) -> String {
    if body.chars().count() <= max_chars {
        return body.to_string();
    }
    let mut truncated: String = body.chars().take(max_chars).collect();
    truncated.push_str("...");
    truncated
}
