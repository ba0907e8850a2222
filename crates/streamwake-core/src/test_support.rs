//! In-memory fakes shared by unit tests.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use crate::api::{ApiError, UpstreamApi};
use crate::models::{AgentIdentity, ChannelDescriptor, ChannelKind, StreamCredential};
use crate::transport::{CredentialRefresh, Transport, TransportError};
use crate::wake::{NotifyError, WakeSink};

pub fn keys(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

pub fn channel(id: &str, name: &str, kind: ChannelKind) -> ChannelDescriptor {
    ChannelDescriptor {
        id: id.to_string(),
        name: name.to_string(),
        kind,
    }
}

pub fn agent() -> AgentIdentity {
    AgentIdentity {
        id: "7".to_string(),
        display_name: "helper".to_string(),
        is_agent: true,
    }
}

fn decode_failure(operation: &'static str) -> ApiError {
    ApiError::Decode {
        operation,
        message: "forced failure".to_string(),
    }
}

pub struct FakeApi {
    identity: Mutex<Option<AgentIdentity>>,
    channels: Mutex<Vec<ChannelDescriptor>>,
    fail_channels: AtomicBool,
    fail_tokens: AtomicBool,
    token_delay: Mutex<Duration>,
    channel_delay: Mutex<Duration>,
    token_calls: AtomicUsize,
    channel_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    issued: Mutex<Vec<BTreeSet<String>>>,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            identity: Mutex::new(Some(agent())),
            channels: Mutex::new(vec![
                channel("1", "general", ChannelKind::Standard),
                channel("2", "random", ChannelKind::Standard),
                channel("3", "bob", ChannelKind::Dm),
            ]),
            fail_channels: AtomicBool::new(false),
            fail_tokens: AtomicBool::new(false),
            token_delay: Mutex::new(Duration::ZERO),
            channel_delay: Mutex::new(Duration::ZERO),
            token_calls: AtomicUsize::new(0),
            channel_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            issued: Mutex::new(Vec::new()),
        })
    }

    pub fn set_identity(&self, identity: Option<AgentIdentity>) {
        *self.identity.lock() = identity;
    }

    pub fn set_channels(&self, channels: Vec<ChannelDescriptor>) {
        *self.channels.lock() = channels;
    }

    pub fn fail_channels(&self, fail: bool) {
        self.fail_channels.store(fail, Ordering::SeqCst);
    }

    pub fn fail_tokens(&self, fail: bool) {
        self.fail_tokens.store(fail, Ordering::SeqCst);
    }

    pub fn set_token_delay(&self, delay: Duration) {
        *self.token_delay.lock() = delay;
    }

    pub fn set_channel_delay(&self, delay: Duration) {
        *self.channel_delay.lock() = delay;
    }

    pub fn token_calls(&self) -> usize {
        self.token_calls.load(Ordering::SeqCst)
    }

    pub fn channel_calls(&self) -> usize {
        self.channel_calls.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_token_calls(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Key sets of every issuance request, in order
    pub fn issued(&self) -> Vec<BTreeSet<String>> {
        self.issued.lock().clone()
    }
}

#[async_trait]
impl UpstreamApi for FakeApi {
    async fn fetch_identity(&self) -> Result<AgentIdentity, ApiError> {
        self.identity
            .lock()
            .clone()
            .ok_or_else(|| decode_failure("identity fetch"))
    }

    async fn fetch_channels(&self, _server_id: &str) -> Result<Vec<ChannelDescriptor>, ApiError> {
        self.channel_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.channel_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_channels.load(Ordering::SeqCst) {
            return Err(decode_failure("channel listing"));
        }
        Ok(self.channels.lock().clone())
    }

    async fn issue_token(
        &self,
        channels: &BTreeSet<String>,
        ttl_secs: u64,
    ) -> Result<StreamCredential, ApiError> {
        let call = self.token_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        self.issued.lock().push(channels.clone());

        let delay = *self.token_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_tokens.load(Ordering::SeqCst) {
            return Err(decode_failure("token issuance"));
        }
        Ok(StreamCredential {
            token: format!("token-{}", call),
            scoped_channels: channels.clone(),
            endpoint: "ws://127.0.0.1:9/connection/websocket".to_string(),
            ttl: Duration::from_secs(ttl_secs),
        })
    }
}

/// Hands out `refreshed-<n>` tokens for a fixed endpoint
pub struct StaticRefresher {
    endpoint: String,
    calls: AtomicUsize,
    delay: Mutex<Duration>,
}

impl StaticRefresher {
    pub fn new(endpoint: &str) -> Arc<Self> {
        Arc::new(Self {
            endpoint: endpoint.to_string(),
            calls: AtomicUsize::new(0),
            delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialRefresh for StaticRefresher {
    async fn refresh(&self) -> anyhow::Result<StreamCredential> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(StreamCredential {
            token: format!("refreshed-{}", call),
            scoped_channels: BTreeSet::new(),
            endpoint: self.endpoint.clone(),
            ttl: Duration::from_secs(60),
        })
    }
}

#[derive(Default)]
pub struct FakeTransport {
    subscribed: Mutex<Vec<String>>,
    unsubscribed: Mutex<Vec<String>>,
    rejected: Mutex<HashSet<String>>,
    tokens: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reject(&self, channel: &str) {
        self.rejected.lock().insert(channel.to_string());
    }

    /// Subscribe calls that succeeded, in order
    pub fn subscribed(&self) -> Vec<String> {
        self.subscribed.lock().clone()
    }

    pub fn unsubscribed(&self) -> Vec<String> {
        self.unsubscribed.lock().clone()
    }

    /// Tokens handed over through `update_credential`
    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn subscribe(&self, channel: &str) -> Result<(), TransportError> {
        if self.rejected.lock().contains(channel) {
            return Err(TransportError::Rejected {
                command: "subscribe",
                code: 103,
                message: "permission denied".to_string(),
            });
        }
        self.subscribed.lock().push(channel.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), TransportError> {
        self.unsubscribed.lock().push(channel.to_string());
        Ok(())
    }

    async fn update_credential(&self, credential: &StreamCredential) -> Result<(), TransportError> {
        self.tokens.lock().push(credential.token.clone());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<String>>,
    fail: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl WakeSink for RecordingSink {
    async fn notify(&self, message: &str) -> Result<(), NotifyError> {
        self.messages.lock().push(message.to_string());
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError::Exit { code: Some(1) });
        }
        Ok(())
    }
}

/// Publication data as the stream would carry it
pub fn publication(event: &str, payload: serde_json::Value) -> serde_json::Value {
    json!({"event": event, "payload": payload})
}

/// Cloneable in-memory writer standing in for stdout
#[derive(Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.inner.lock())
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl std::io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
