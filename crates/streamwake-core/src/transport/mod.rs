//! Pub/sub transport.
//!
//! The listener drives the transport through the [`Transport`] trait and
//! receives publications as [`Delivery`] values on an mpsc channel. The
//! transport owns its own reconnect loop and asks [`CredentialRefresh`] for a
//! fresh credential whenever the server wants re-authentication.

mod client;
pub mod protocol;

use async_trait::async_trait;
use serde_json::Value;

use crate::models::StreamCredential;

pub use client::WsTransport;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,

    #[error("server rejected {command}: {message} (code={code})")]
    Rejected {
        command: &'static str,
        code: u32,
        message: String,
    },

    #[error("websocket error: {0}")]
    WebSocket(String),
}

/// One publication received on a subscription
#[derive(Debug, Clone)]
pub struct Delivery {
    pub channel: String,
    pub data: Value,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Subscribe to `channel`. Subscribing twice is a no-op.
    async fn subscribe(&self, channel: &str) -> Result<(), TransportError>;

    async fn unsubscribe(&self, channel: &str) -> Result<(), TransportError>;

    /// Hand a newly issued credential to the live session so channels it
    /// covers can be subscribed without waiting for the next reconnect.
    async fn update_credential(&self, credential: &StreamCredential) -> Result<(), TransportError>;

    /// Close the connection and stop reconnecting
    async fn close(&self);
}

/// Supplies a fresh credential when the transport has to (re)authenticate.
#[async_trait]
pub trait CredentialRefresh: Send + Sync {
    async fn refresh(&self) -> anyhow::Result<StreamCredential>;
}
