//! Subscription registry.
//!
//! Tracks two key sets with `requested ⊇ active`. `requested` is everything
//! the listener has decided to monitor and is what every credential is
//! scoped to; `active` is what the transport is actually subscribed to.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::api::ApiError;
use crate::constants::SHUTDOWN_STEP_TIMEOUT;
use crate::credentials::CredentialManager;
use crate::models::StreamCredential;
use crate::transport::{CredentialRefresh, Transport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("failed to reissue credential for {key}: {source}")]
    Credential {
        key: String,
        #[source]
        source: ApiError,
    },

    #[error("issued credential does not cover {key}")]
    NotCovered { key: String },

    #[error("failed to subscribe to {key}: {source}")]
    Transport {
        key: String,
        #[source]
        source: TransportError,
    },
}

/// The `requested` key set, shared with the credential refresher
#[derive(Debug, Clone, Default)]
pub struct RequestedKeys {
    inner: Arc<Mutex<BTreeSet<String>>>,
}

impl RequestedKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic check+insert; true when the key was not requested yet
    pub fn insert(&self, key: &str) -> bool {
        self.inner.lock().insert(key.to_string())
    }

    pub fn extend<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.lock().extend(keys.into_iter().map(Into::into));
    }

    pub fn remove(&self, key: &str) -> bool {
        self.inner.lock().remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().contains(key)
    }

    pub fn snapshot(&self) -> BTreeSet<String> {
        self.inner.lock().clone()
    }
}

/// Credential-refresh callback handed to the transport: always issues for
/// the full `requested` set as it stands at call time.
pub struct ScopedRefresher {
    credentials: Arc<CredentialManager>,
    requested: RequestedKeys,
}

impl ScopedRefresher {
    pub fn new(credentials: Arc<CredentialManager>, requested: RequestedKeys) -> Self {
        Self {
            credentials,
            requested,
        }
    }
}

#[async_trait]
impl CredentialRefresh for ScopedRefresher {
    async fn refresh(&self) -> anyhow::Result<StreamCredential> {
        let scope = self.requested.snapshot();
        tracing::debug!("Transport requested a fresh credential ({} keys)", scope.len());
        self.credentials
            .issue(&scope)
            .await
            .context("Failed to issue stream credential for transport refresh")
    }
}

pub struct SubscriptionRegistry {
    requested: RequestedKeys,
    active: Mutex<BTreeSet<String>>,
    credentials: Arc<CredentialManager>,
    transport: Arc<dyn Transport>,
}

impl SubscriptionRegistry {
    pub fn new(
        requested: RequestedKeys,
        credentials: Arc<CredentialManager>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            requested,
            active: Mutex::new(BTreeSet::new()),
            credentials,
            transport,
        }
    }

    pub fn requested(&self) -> &RequestedKeys {
        &self.requested
    }

    pub fn is_requested(&self, key: &str) -> bool {
        self.requested.contains(key)
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.active.lock().contains(key)
    }

    pub fn active_keys(&self) -> BTreeSet<String> {
        self.active.lock().clone()
    }

    /// Start monitoring `key`.
    ///
    /// Returns `Ok(false)` when the key was already requested. A failure
    /// anywhere after the insert removes the key from `requested` again so
    /// a later discovery pass or event can retry it.
    pub async fn add_channel(&self, key: &str) -> Result<bool, SubscribeError> {
        if !self.requested.insert(key) {
            tracing::debug!("Skipping duplicate subscription for {}", key);
            return Ok(false);
        }

        match self.reissue_and_subscribe(key).await {
            Ok(()) => {
                tracing::info!("Subscribed to {}", key);
                Ok(true)
            }
            Err(e) => {
                self.requested.remove(key);
                Err(e)
            }
        }
    }

    async fn reissue_and_subscribe(&self, key: &str) -> Result<(), SubscribeError> {
        let scope = self.requested.snapshot();
        let credential = self
            .credentials
            .issue(&scope)
            .await
            .map_err(|source| SubscribeError::Credential {
                key: key.to_string(),
                source,
            })?;
        if !credential.scoped_channels.contains(key) {
            return Err(SubscribeError::NotCovered {
                key: key.to_string(),
            });
        }
        self.transport
            .update_credential(&credential)
            .await
            .map_err(|source| SubscribeError::Transport {
                key: key.to_string(),
                source,
            })?;
        self.subscribe_active(key).await
    }

    /// Create the transport subscription unless one already exists
    async fn subscribe_active(&self, key: &str) -> Result<(), SubscribeError> {
        let is_new = self.active.lock().insert(key.to_string());
        if !is_new {
            return Ok(());
        }
        if let Err(source) = self.transport.subscribe(key).await {
            self.active.lock().remove(key);
            return Err(SubscribeError::Transport {
                key: key.to_string(),
                source,
            });
        }
        Ok(())
    }

    /// Subscribe the keys covered by the startup credential without
    /// reissuing it. Failures are logged and the key is dropped from
    /// `requested`. Returns the number of keys now active.
    pub async fn bootstrap_initial(&self, keys: &[String]) -> usize {
        self.requested.extend(keys.iter().cloned());
        for key in keys {
            match self.subscribe_active(key).await {
                Ok(()) => tracing::debug!("Subscribed to {}", key),
                Err(e) => {
                    tracing::warn!("Initial subscription failed: {}", e);
                    self.requested.remove(key);
                }
            }
        }
        let active = self.active.lock().len();
        tracing::info!("Monitoring {} of {} initial keys", active, keys.len());
        active
    }

    /// Best-effort unsubscribe of every active key, each bounded by the
    /// shutdown step timeout. Returns how many succeeded.
    pub async fn unsubscribe_all(&self) -> usize {
        let keys: Vec<String> = std::mem::take(&mut *self.active.lock()).into_iter().collect();
        let mut done = 0;
        for key in &keys {
            match tokio::time::timeout(SHUTDOWN_STEP_TIMEOUT, self.transport.unsubscribe(key)).await {
                Ok(Ok(())) => done += 1,
                Ok(Err(e)) => tracing::debug!("Unsubscribe from {} failed: {}", key, e),
                Err(_) => tracing::debug!("Unsubscribe from {} timed out", key),
            }
        }
        tracing::debug!("Unsubscribed {}/{} keys", done, keys.len());
        done
    }
}
