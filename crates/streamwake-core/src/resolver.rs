//! Identity and channel resolution.
//!
//! Wraps the REST API calls that describe *who* we are and *where* we listen,
//! and keeps the channel id → `#name` map used to label events.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use regex::Regex;

use crate::api::{ApiError, UpstreamApi};
use crate::models::{AgentIdentity, ChannelDescriptor};

fn key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:private-)?(channel|thread|user|server)\.(\d+)$")
            .expect("subscription key pattern is valid")
    })
}

/// Map a subscription key to a display label.
///
/// `channel`/`thread` ids are looked up in `labels` (falling back to `#<id>`),
/// `user` keys are `DM`, `server` keys are `server`, anything else is returned
/// unchanged.
pub fn resolve_label(key: &str, labels: &HashMap<String, String>) -> String {
    let Some(caps) = key_pattern().captures(key) else {
        return key.to_string();
    };
    let id = &caps[2];
    match &caps[1] {
        "user" => "DM".to_string(),
        "server" => "server".to_string(),
        _ => labels
            .get(id)
            .cloned()
            .unwrap_or_else(|| format!("#{}", id)),
    }
}

/// Shared channel label cache. Entries are only ever added or overwritten;
/// stale labels are harmless.
#[derive(Debug, Clone, Default)]
pub struct ChannelLabels {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl ChannelLabels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, channels: &[ChannelDescriptor]) {
        let mut labels = self.inner.write();
        for channel in channels {
            labels.insert(channel.id.clone(), channel.label());
        }
    }

    pub fn insert(&self, id: impl Into<String>, label: impl Into<String>) {
        self.inner.write().insert(id.into(), label.into());
    }

    pub fn resolve(&self, key: &str) -> String {
        resolve_label(key, &self.inner.read())
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.read().len()
    }
}

#[derive(Clone)]
pub struct Resolver {
    api: Arc<dyn UpstreamApi>,
    server_id: String,
    labels: ChannelLabels,
}

impl Resolver {
    pub fn new(api: Arc<dyn UpstreamApi>, server_id: impl Into<String>, labels: ChannelLabels) -> Self {
        Self {
            api,
            server_id: server_id.into(),
            labels,
        }
    }

    pub async fn fetch_identity(&self) -> Result<AgentIdentity, ApiError> {
        self.api.fetch_identity().await
    }

    /// Fetch the server's channels and refresh the label map.
    /// Callers decide whether a failure is fatal.
    pub async fn fetch_channels(&self) -> Result<Vec<ChannelDescriptor>, ApiError> {
        let channels = self.api.fetch_channels(&self.server_id).await?;
        self.labels.update(&channels);
        tracing::debug!(
            "Channel listing: {} channels, {} labels known",
            channels.len(),
            self.labels.len()
        );
        Ok(channels)
    }

    /// Keys to monitor at startup: personal stream, server stream and
    /// every non-DM channel.
    pub fn initial_keys(&self, identity: &AgentIdentity, channels: &[ChannelDescriptor]) -> Vec<String> {
        let mut keys = vec![
            format!("user.{}", identity.id),
            format!("server.{}", self.server_id),
        ];
        keys.extend(
            channels
                .iter()
                .filter(|c| !c.is_dm())
                .map(|c| c.subscription_key()),
        );
        keys
    }
}
