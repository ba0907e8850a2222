use std::collections::BTreeSet;
use std::time::Duration;

use serde::Deserialize;

/// Short-lived token scoped to a fixed set of subscription keys.
/// Superseded on every refresh, never merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCredential {
    pub token: String,
    pub scoped_channels: BTreeSet<String>,
    pub endpoint: String,
    pub ttl: Duration,
}

/// Wire shape of `GET /events/token`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TokenResponse {
    pub token: String,
    #[serde(default)]
    pub channels: Vec<String>,
    pub endpoint: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl StreamCredential {
    pub(crate) fn from_response(response: TokenResponse, requested: &BTreeSet<String>, ttl_secs: u64) -> Self {
        // Servers that echo nothing are taken to have granted exactly what was asked.
        let scoped_channels = if response.channels.is_empty() {
            requested.clone()
        } else {
            response.channels.into_iter().collect()
        };
        Self {
            token: response.token,
            scoped_channels,
            endpoint: response.endpoint,
            ttl: Duration::from_secs(response.expires_in.unwrap_or(ttl_secs)),
        }
    }
}
