//! Stream credential issuance.
//!
//! Credentials are scoped to the exact key set requested at issuance time.
//! Issuance is serialized and every request is stamped with a sequence
//! number on entry. A completion that is older than the installed
//! credential and covers a strict subset of its scope is discarded, so a
//! late, stale refresh can never narrow what the transport may receive.
//! A newer request always wins, even when its scope is narrower.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::api::{ApiError, UpstreamApi};
use crate::models::StreamCredential;

struct Installed {
    seq: u64,
    credential: StreamCredential,
}

pub struct CredentialManager {
    api: Arc<dyn UpstreamApi>,
    ttl_secs: u64,
    installed: RwLock<Option<Installed>>,
    /// Held for the duration of one issuance request
    issue_lock: Mutex<()>,
    next_seq: AtomicU64,
    generation: AtomicU64,
}

impl CredentialManager {
    pub fn new(api: Arc<dyn UpstreamApi>, ttl_secs: u64) -> Self {
        Self {
            api,
            ttl_secs,
            installed: RwLock::new(None),
            issue_lock: Mutex::new(()),
            next_seq: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        }
    }

    /// Issue a credential for `keys` and install it.
    ///
    /// Returns the credential that is installed afterwards, which is the
    /// previous one when this completion turned out to be stale.
    pub async fn issue(&self, keys: &BTreeSet<String>) -> Result<StreamCredential, ApiError> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = self.issue_lock.lock().await;
        tracing::debug!("Issuing stream credential #{} for {} keys", seq, keys.len());
        let credential = self.api.issue_token(keys, self.ttl_secs).await?;
        Ok(self.install(seq, credential))
    }

    fn install(&self, seq: u64, credential: StreamCredential) -> StreamCredential {
        let mut installed = self.installed.write();
        if let Some(current) = installed.as_ref() {
            let scope = &current.credential.scoped_channels;
            let stale = seq < current.seq
                && credential.scoped_channels.is_subset(scope)
                && credential.scoped_channels.len() < scope.len();
            if stale {
                tracing::debug!(
                    "Ignoring stale credential request #{} ({} keys); #{} covers {}",
                    seq,
                    credential.scoped_channels.len(),
                    current.seq,
                    scope.len()
                );
                return current.credential.clone();
            }
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(
            "Installed stream credential #{} ({} keys, ttl {:?})",
            generation,
            credential.scoped_channels.len(),
            credential.ttl
        );
        *installed = Some(Installed {
            seq,
            credential: credential.clone(),
        });
        credential
    }

    #[cfg(test)]
    pub(crate) fn current(&self) -> Option<StreamCredential> {
        self.installed.read().as_ref().map(|i| i.credential.clone())
    }

    /// Number of credentials installed so far
    #[cfg(test)]
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}
