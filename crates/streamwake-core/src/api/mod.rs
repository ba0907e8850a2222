//! REST API access: identity, channel listing and stream credentials.

mod client;

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::models::{AgentIdentity, ChannelDescriptor, StreamCredential};

pub use client::{ApiClient, ApiError};

/// The upstream REST surface the listener depends on.
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    async fn fetch_identity(&self) -> Result<AgentIdentity, ApiError>;

    async fn fetch_channels(&self, server_id: &str) -> Result<Vec<ChannelDescriptor>, ApiError>;

    /// Issue a stream credential scoped to exactly `channels`
    async fn issue_token(
        &self,
        channels: &BTreeSet<String>,
        ttl_secs: u64,
    ) -> Result<StreamCredential, ApiError>;
}
