use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::protocol::{parse_frame, ClientCommand, CommandBody, Incoming, SessionResult};
use super::{CredentialRefresh, Delivery, Transport, TransportError};
use crate::constants::{RECONNECT_BASE_DELAY, RECONNECT_MAX_DELAY, TOKEN_EXPIRED_CODE};
use crate::models::StreamCredential;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;
type RefreshFuture = Pin<Box<dyn Future<Output = anyhow::Result<StreamCredential>> + Send>>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// How long before expiry the session token is refreshed
const REFRESH_MARGIN: Duration = Duration::from_secs(10);
const REFRESH_RETRY_DELAY: Duration = Duration::from_secs(10);
const COMMAND_BUFFER: usize = 64;

enum Command {
    Subscribe {
        channel: String,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    Unsubscribe {
        channel: String,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    UpdateCredential {
        credential: StreamCredential,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

enum Pending {
    Subscribe {
        channel: String,
        reply: Option<oneshot::Sender<Result<(), TransportError>>>,
    },
    Unsubscribe {
        channel: String,
    },
    Refresh,
}

enum SessionEnd {
    Shutdown,
    /// The server rejected the token as expired
    Expired,
    Lost(String),
}

/// Websocket transport with its own reconnect loop.
///
/// All socket I/O happens on one background task; the handle only queues
/// commands. The subscribed set survives reconnects and is re-sent after
/// every successful connect.
pub struct WsTransport {
    commands: mpsc::Sender<Command>,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl WsTransport {
    /// Spawn the connection worker. Connecting happens in the background, so
    /// this never fails; connection problems surface as log lines and retries.
    pub fn start(
        credential: StreamCredential,
        refresher: Arc<dyn CredentialRefresh>,
        deliveries: mpsc::Sender<Delivery>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let worker = Worker {
            endpoint: credential.endpoint,
            token: credential.token,
            refresher,
            deliveries,
            commands: rx,
            desired: BTreeSet::new(),
            next_id: 0,
            backoff: RECONNECT_BASE_DELAY,
            expired_retry: false,
        };
        let handle = tokio::spawn(worker.run());
        Self {
            commands: tx,
            worker: parking_lot::Mutex::new(Some(handle)),
        }
    }

    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<(), TransportError>>) -> Command,
    ) -> Result<(), TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| TransportError::Closed)?;
        reply_rx.await.map_err(|_| TransportError::Closed)?
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn subscribe(&self, channel: &str) -> Result<(), TransportError> {
        let channel = channel.to_string();
        self.request(|reply| Command::Subscribe { channel, reply }).await
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), TransportError> {
        let channel = channel.to_string();
        self.request(|reply| Command::Unsubscribe { channel, reply })
            .await
    }

    async fn update_credential(&self, credential: &StreamCredential) -> Result<(), TransportError> {
        let credential = credential.clone();
        self.request(|reply| Command::UpdateCredential { credential, reply })
            .await
    }

    async fn close(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(Command::Close { done: done_tx }).await.is_ok() {
            let _ = done_rx.await;
        }
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
    }
}

struct Worker {
    endpoint: String,
    token: String,
    refresher: Arc<dyn CredentialRefresh>,
    deliveries: mpsc::Sender<Delivery>,
    commands: mpsc::Receiver<Command>,
    /// Channels that should be subscribed whenever a session is up
    desired: BTreeSet<String>,
    next_id: u32,
    backoff: Duration,
    /// Set after an immediate reconnect for an expired token, cleared once a
    /// session is established
    expired_retry: bool,
}

impl Worker {
    async fn run(mut self) {
        let mut first_attempt = true;
        loop {
            if !first_attempt {
                self.reauthenticate().await;
            }
            first_attempt = false;

            let delay = self.backoff;
            match self.run_session().await {
                SessionEnd::Shutdown => break,
                SessionEnd::Expired if !self.expired_retry => {
                    tracing::info!("Stream token expired, reconnecting with a fresh credential");
                    self.expired_retry = true;
                    continue;
                }
                SessionEnd::Expired => {
                    tracing::warn!("Stream token still expired after refresh, reconnecting in {:?}", delay);
                }
                SessionEnd::Lost(reason) => {
                    tracing::warn!("Stream connection lost ({}), reconnecting in {:?}", reason, delay);
                }
            }
            if !self.wait_offline(delay).await {
                break;
            }
            self.backoff = (self.backoff * 2).min(RECONNECT_MAX_DELAY);
        }
        tracing::debug!("Stream transport stopped");
    }

    /// Fetch a fresh credential before reconnecting. On failure the previous
    /// token is kept and the connect attempt decides what happens next.
    async fn reauthenticate(&mut self) {
        match self.refresher.refresh().await {
            Ok(credential) => {
                self.endpoint = credential.endpoint;
                self.token = credential.token;
            }
            Err(e) => tracing::warn!("Failed to refresh stream credential: {:#}", e),
        }
    }

    /// Sleep through the backoff delay while still answering commands.
    /// Returns false when the transport should stop.
    async fn wait_offline(&mut self, delay: Duration) -> bool {
        let deadline = tokio::time::sleep(delay);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return true,
                command = self.commands.recv() => match command {
                    None => return false,
                    Some(Command::Close { done }) => {
                        let _ = done.send(());
                        return false;
                    }
                    Some(Command::Subscribe { channel, reply }) => {
                        self.desired.insert(channel);
                        let _ = reply.send(Ok(()));
                    }
                    Some(Command::Unsubscribe { channel, reply }) => {
                        self.desired.remove(&channel);
                        let _ = reply.send(Ok(()));
                    }
                    Some(Command::UpdateCredential { credential, reply }) => {
                        self.endpoint = credential.endpoint;
                        self.token = credential.token;
                        let _ = reply.send(Ok(()));
                    }
                },
            }
        }
    }

    fn next_id(&mut self) -> u32 {
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.next_id
    }

    async fn send(&mut self, sink: &mut WsSink, body: CommandBody) -> Result<u32, String> {
        let id = self.next_id();
        let command = ClientCommand { id, body };
        sink.send(WsMessage::text(command.encode()))
            .await
            .map_err(|e| format!("failed to send {}: {}", command.body.name(), e))?;
        Ok(id)
    }

    async fn run_session(&mut self) -> SessionEnd {
        tracing::debug!("Connecting to stream endpoint {}", self.endpoint);
        let (stream, _response) = match connect_async(self.endpoint.as_str()).await {
            Ok(connected) => connected,
            Err(e) => return SessionEnd::Lost(format!("connect failed: {}", e)),
        };
        let (mut sink, mut source) = stream.split();

        let session = match self.handshake(&mut sink, &mut source).await {
            Ok(session) => session,
            Err(end) => return end,
        };
        self.backoff = RECONNECT_BASE_DELAY;
        self.expired_retry = false;
        tracing::info!(
            "Stream connected{} ({} subscriptions to restore)",
            session
                .client
                .as_deref()
                .map(|c| format!(" as {}", c))
                .unwrap_or_default(),
            self.desired.len()
        );

        let mut pending: HashMap<u32, Pending> = HashMap::new();
        let restore: Vec<String> = self.desired.iter().cloned().collect();
        for channel in restore {
            match self
                .send(&mut sink, CommandBody::Subscribe { channel: channel.clone() })
                .await
            {
                Ok(id) => {
                    pending.insert(id, Pending::Subscribe { channel, reply: None });
                }
                Err(reason) => return SessionEnd::Lost(reason),
            }
        }

        let mut refresh_at = session.refresh_after().map(refresh_deadline);
        // Credential requests run alongside socket reads so pings and
        // publications keep flowing while the API call is in flight.
        let mut refreshing: Option<RefreshFuture> = None;
        loop {
            tokio::select! {
                frame = source.next() => {
                    let text = match frame {
                        None => return SessionEnd::Lost("connection closed".to_string()),
                        Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                        Some(Ok(WsMessage::Close(frame))) => {
                            let reason = frame
                                .map(|f| format!("closed by server: {} {}", u16::from(f.code), f.reason.as_str()))
                                .unwrap_or_else(|| "closed by server".to_string());
                            return SessionEnd::Lost(reason);
                        }
                        Some(Ok(WsMessage::Text(text))) => text,
                        Some(Ok(_)) => continue,
                    };
                    for incoming in parse_frame(text.as_str()) {
                        if let Some(end) = self
                            .handle_incoming(incoming, &mut sink, &mut pending, &mut refresh_at)
                            .await
                        {
                            return end;
                        }
                    }
                }
                command = self.commands.recv() => {
                    if let Some(end) = self.handle_command(command, &mut sink, &mut pending).await {
                        return end;
                    }
                }
                _ = sleep_until_opt(refresh_at), if refreshing.is_none() => {
                    refresh_at = None;
                    let refresher = self.refresher.clone();
                    refreshing = Some(Box::pin(async move { refresher.refresh().await }));
                }
                result = await_refresh(&mut refreshing) => {
                    refreshing = None;
                    match result {
                        Ok(credential) => {
                            self.token = credential.token;
                            self.endpoint = credential.endpoint;
                            let body = CommandBody::Refresh { token: self.token.clone() };
                            match self.send(&mut sink, body).await {
                                Ok(id) => {
                                    pending.insert(id, Pending::Refresh);
                                }
                                Err(reason) => return SessionEnd::Lost(reason),
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Stream token refresh failed: {:#}", e);
                            refresh_at = Some(Instant::now() + REFRESH_RETRY_DELAY);
                        }
                    }
                }
            }
        }
    }

    async fn handshake(&mut self, sink: &mut WsSink, source: &mut WsSource) -> Result<SessionResult, SessionEnd> {
        let connect_id = self
            .send(sink, CommandBody::Connect { token: self.token.clone() })
            .await
            .map_err(SessionEnd::Lost)?;

        let wait = async {
            while let Some(frame) = source.next().await {
                let text = match frame {
                    Ok(WsMessage::Text(text)) => text,
                    Ok(WsMessage::Close(_)) => return Err(SessionEnd::Lost("closed during handshake".to_string())),
                    Ok(_) => continue,
                    Err(e) => return Err(SessionEnd::Lost(e.to_string())),
                };
                for incoming in parse_frame(text.as_str()) {
                    match incoming {
                        Incoming::Reply { id, result } if id == connect_id => {
                            return match result {
                                Ok(session) => Ok(session.unwrap_or_default()),
                                Err(e) if e.code == TOKEN_EXPIRED_CODE => Err(SessionEnd::Expired),
                                Err(e) => Err(SessionEnd::Lost(format!(
                                    "connect rejected: {} (code={})",
                                    e.message, e.code
                                ))),
                            };
                        }
                        Incoming::Ping => {
                            if let Err(e) = sink.send(WsMessage::text("{}".to_string())).await {
                                return Err(SessionEnd::Lost(e.to_string()));
                            }
                        }
                        other => tracing::debug!("Ignoring message before connect reply: {:?}", other),
                    }
                }
            }
            Err(SessionEnd::Lost("connection closed during handshake".to_string()))
        };

        tokio::time::timeout(HANDSHAKE_TIMEOUT, wait)
            .await
            .map_err(|_| SessionEnd::Lost("timed out waiting for connect reply".to_string()))?
    }

    async fn handle_incoming(
        &mut self,
        incoming: Incoming,
        sink: &mut WsSink,
        pending: &mut HashMap<u32, Pending>,
        refresh_at: &mut Option<Instant>,
    ) -> Option<SessionEnd> {
        match incoming {
            Incoming::Ping => {
                if let Err(e) = sink.send(WsMessage::text("{}".to_string())).await {
                    return Some(SessionEnd::Lost(e.to_string()));
                }
            }
            Incoming::Publication { channel, data } => {
                if self.deliveries.send(Delivery { channel, data }).await.is_err() {
                    tracing::debug!("Delivery receiver dropped, stopping transport");
                    return Some(SessionEnd::Shutdown);
                }
            }
            Incoming::Disconnect(info) if !info.reconnect => {
                tracing::warn!(
                    "Server ended the stream without reconnect: {} (code={})",
                    info.reason,
                    info.code
                );
                let _ = sink.close().await;
                return Some(SessionEnd::Shutdown);
            }
            Incoming::Disconnect(info) => {
                return Some(SessionEnd::Lost(format!(
                    "server disconnect: {} (code={})",
                    info.reason, info.code
                )));
            }
            Incoming::Reply { id, result } => match pending.remove(&id) {
                Some(Pending::Subscribe { channel, reply }) => match result {
                    Ok(_) => {
                        tracing::debug!("Subscribed to {}", channel);
                        if let Some(reply) = reply {
                            let _ = reply.send(Ok(()));
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Subscription to {} rejected: {} (code={})", channel, e.message, e.code);
                        self.desired.remove(&channel);
                        if let Some(reply) = reply {
                            let _ = reply.send(Err(TransportError::Rejected {
                                command: "subscribe",
                                code: e.code,
                                message: e.message,
                            }));
                        }
                    }
                },
                Some(Pending::Unsubscribe { channel }) => {
                    if let Err(e) = result {
                        tracing::debug!("Unsubscribe from {} rejected: {}", channel, e.message);
                    }
                }
                Some(Pending::Refresh) => match result {
                    Ok(session) => {
                        *refresh_at = session.and_then(|s| s.refresh_after()).map(refresh_deadline);
                        tracing::debug!("Stream token refreshed");
                    }
                    Err(e) if e.code == TOKEN_EXPIRED_CODE => {
                        return Some(SessionEnd::Expired);
                    }
                    Err(e) => {
                        tracing::warn!("Token refresh rejected: {} (code={})", e.message, e.code);
                        *refresh_at = Some(Instant::now() + REFRESH_RETRY_DELAY);
                    }
                },
                None => tracing::debug!("Reply for unknown command id {}", id),
            },
            Incoming::Unknown(raw) => tracing::debug!("Ignoring unrecognized stream message: {}", raw),
        }
        None
    }

    async fn handle_command(
        &mut self,
        command: Option<Command>,
        sink: &mut WsSink,
        pending: &mut HashMap<u32, Pending>,
    ) -> Option<SessionEnd> {
        match command {
            None => {
                let _ = sink.close().await;
                Some(SessionEnd::Shutdown)
            }
            Some(Command::Close { done }) => {
                let _ = sink.close().await;
                let _ = done.send(());
                Some(SessionEnd::Shutdown)
            }
            Some(Command::Subscribe { channel, reply }) => {
                if !self.desired.insert(channel.clone()) {
                    let _ = reply.send(Ok(()));
                    return None;
                }
                match self
                    .send(sink, CommandBody::Subscribe { channel: channel.clone() })
                    .await
                {
                    Ok(id) => {
                        pending.insert(id, Pending::Subscribe { channel, reply: Some(reply) });
                        None
                    }
                    Err(reason) => {
                        // Kept in the desired set; restored after reconnect.
                        let _ = reply.send(Ok(()));
                        Some(SessionEnd::Lost(reason))
                    }
                }
            }
            Some(Command::UpdateCredential { credential, reply }) => {
                self.endpoint = credential.endpoint;
                self.token = credential.token;
                // Commands are processed in order, so a subscribe queued
                // after this is sent after the refresh.
                match self
                    .send(sink, CommandBody::Refresh { token: self.token.clone() })
                    .await
                {
                    Ok(id) => {
                        pending.insert(id, Pending::Refresh);
                        let _ = reply.send(Ok(()));
                        None
                    }
                    Err(reason) => {
                        let _ = reply.send(Ok(()));
                        Some(SessionEnd::Lost(reason))
                    }
                }
            }
            Some(Command::Unsubscribe { channel, reply }) => {
                if !self.desired.remove(&channel) {
                    let _ = reply.send(Ok(()));
                    return None;
                }
                match self
                    .send(sink, CommandBody::Unsubscribe { channel: channel.clone() })
                    .await
                {
                    Ok(id) => {
                        pending.insert(id, Pending::Unsubscribe { channel });
                        let _ = reply.send(Ok(()));
                        None
                    }
                    Err(reason) => {
                        let _ = reply.send(Err(TransportError::WebSocket(reason.clone())));
                        Some(SessionEnd::Lost(reason))
                    }
                }
            }
        }
    }
}

fn refresh_deadline(ttl_secs: u64) -> Instant {
    let ttl = Duration::from_secs(ttl_secs);
    let lead = ttl.saturating_sub(REFRESH_MARGIN).max(Duration::from_secs(1));
    Instant::now() + lead
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending::<()>().await,
    }
}

async fn await_refresh(refreshing: &mut Option<RefreshFuture>) -> anyhow::Result<StreamCredential> {
    match refreshing {
        Some(refresh) => refresh.as_mut().await,
        None => futures::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{keys, StaticRefresher};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;

    type ServerSocket = WebSocketStream<TcpStream>;

    async fn accept(listener: &TcpListener) -> ServerSocket {
        let (stream, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    }

    async fn next_command(ws: &mut ServerSocket) -> Value {
        loop {
            match ws.next().await.unwrap().unwrap() {
                WsMessage::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                _ => continue,
            }
        }
    }

    async fn send_json(ws: &mut ServerSocket, value: Value) {
        ws.send(WsMessage::text(value.to_string())).await.unwrap();
    }

    async fn accept_connect(ws: &mut ServerSocket, expected_token: &str) {
        let cmd = next_command(ws).await;
        assert_eq!(cmd["connect"]["token"], expected_token);
        send_json(ws, json!({"id": cmd["id"], "connect": {"client": "c1"}})).await;
    }

    async fn listener() -> (TcpListener, StreamCredential) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let credential = StreamCredential {
            token: "t1".to_string(),
            scoped_channels: keys(&["channel.1"]),
            endpoint: format!("ws://{}", listener.local_addr().unwrap()),
            ttl: Duration::from_secs(60),
        };
        (listener, credential)
    }

    #[tokio::test]
    async fn test_subscribe_and_receive_publication() {
        let (listener, credential) = listener().await;
        let endpoint = credential.endpoint.clone();
        let (tx, mut rx) = mpsc::channel(8);
        let transport = Arc::new(WsTransport::start(credential, StaticRefresher::new(&endpoint), tx));

        let subscribing = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.subscribe("channel.1").await })
        };

        let mut ws = accept(&listener).await;
        accept_connect(&mut ws, "t1").await;
        let sub = next_command(&mut ws).await;
        assert_eq!(sub["subscribe"]["channel"], "channel.1");
        send_json(&mut ws, json!({"id": sub["id"], "subscribe": {}})).await;
        subscribing.await.unwrap().unwrap();

        ws.send(WsMessage::text(
            "{}\n{\"push\":{\"channel\":\"channel.1\",\"pub\":{\"data\":{\"event\":\"MessageSent\"}}}}"
                .to_string(),
        ))
        .await
        .unwrap();

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.channel, "channel.1");
        assert_eq!(delivery.data["event"], "MessageSent");

        // The ping in the same frame is answered with an empty object.
        assert_eq!(next_command(&mut ws).await, json!({}));
    }

    #[tokio::test]
    async fn test_rejected_subscription_reports_error() {
        let (listener, credential) = listener().await;
        let endpoint = credential.endpoint.clone();
        let (tx, _rx) = mpsc::channel(8);
        let transport = Arc::new(WsTransport::start(credential, StaticRefresher::new(&endpoint), tx));

        let subscribing = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.subscribe("thread.9").await })
        };

        let mut ws = accept(&listener).await;
        accept_connect(&mut ws, "t1").await;
        let sub = next_command(&mut ws).await;
        send_json(
            &mut ws,
            json!({"id": sub["id"], "error": {"code": 103, "message": "permission denied"}}),
        )
        .await;

        let err = subscribing.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::Rejected { code: 103, .. }));
    }

    #[tokio::test]
    async fn test_reconnect_uses_fresh_credential_and_restores_subscriptions() {
        let (listener, credential) = listener().await;
        let endpoint = credential.endpoint.clone();
        let refresher = StaticRefresher::new(&endpoint);
        let (tx, _rx) = mpsc::channel(8);
        let transport = Arc::new(WsTransport::start(credential, refresher.clone(), tx));

        let subscribing = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.subscribe("channel.1").await })
        };

        let mut ws = accept(&listener).await;
        accept_connect(&mut ws, "t1").await;
        let sub = next_command(&mut ws).await;
        send_json(&mut ws, json!({"id": sub["id"], "subscribe": {}})).await;
        subscribing.await.unwrap().unwrap();

        send_json(
            &mut ws,
            json!({"push": {"disconnect": {"code": 3001, "reason": "restart", "reconnect": true}}}),
        )
        .await;
        drop(ws);

        let mut ws = accept(&listener).await;
        accept_connect(&mut ws, "refreshed-1").await;
        let restored = next_command(&mut ws).await;
        assert_eq!(restored["subscribe"]["channel"], "channel.1");
        assert_eq!(refresher.calls(), 1);

        transport.close().await;
    }

    #[tokio::test]
    async fn test_update_credential_sends_refresh() {
        let (listener, credential) = listener().await;
        let endpoint = credential.endpoint.clone();
        let (tx, _rx) = mpsc::channel(8);
        let transport = Arc::new(WsTransport::start(credential.clone(), StaticRefresher::new(&endpoint), tx));

        let mut ws = accept(&listener).await;
        accept_connect(&mut ws, "t1").await;

        let updated = StreamCredential {
            token: "t2".to_string(),
            scoped_channels: keys(&["channel.1", "thread.5"]),
            ..credential
        };
        transport.update_credential(&updated).await.unwrap();

        let refresh = next_command(&mut ws).await;
        assert_eq!(refresh["refresh"]["token"], "t2");
        transport.close().await;
    }

    #[tokio::test]
    async fn test_session_ttl_triggers_token_refresh() {
        let (listener, credential) = listener().await;
        let endpoint = credential.endpoint.clone();
        let refresher = StaticRefresher::new(&endpoint);
        let (tx, _rx) = mpsc::channel(8);
        let transport = WsTransport::start(credential, refresher.clone(), tx);

        let mut ws = accept(&listener).await;
        let cmd = next_command(&mut ws).await;
        send_json(&mut ws, json!({"id": cmd["id"], "connect": {"client": "c1", "expires": true, "ttl": 1}})).await;

        let refresh = tokio::time::timeout(Duration::from_secs(5), next_command(&mut ws))
            .await
            .unwrap();
        assert_eq!(refresh["refresh"]["token"], "refreshed-1");
        assert_eq!(refresher.calls(), 1);
        transport.close().await;
    }

    #[tokio::test]
    async fn test_pings_are_answered_while_refresh_is_in_flight() {
        let (listener, credential) = listener().await;
        let endpoint = credential.endpoint.clone();
        let refresher = StaticRefresher::new(&endpoint);
        refresher.set_delay(Duration::from_secs(2));
        let (tx, _rx) = mpsc::channel(8);
        let transport = WsTransport::start(credential, refresher.clone(), tx);

        let mut ws = accept(&listener).await;
        let cmd = next_command(&mut ws).await;
        send_json(&mut ws, json!({"id": cmd["id"], "connect": {"expires": true, "ttl": 1}})).await;

        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert_eq!(refresher.calls(), 1);
        send_json(&mut ws, json!({})).await;
        let pong = tokio::time::timeout(Duration::from_millis(500), next_command(&mut ws))
            .await
            .unwrap();
        assert_eq!(pong, json!({}));

        let refresh = tokio::time::timeout(Duration::from_secs(5), next_command(&mut ws))
            .await
            .unwrap();
        assert_eq!(refresh["refresh"]["token"], "refreshed-1");
        transport.close().await;
    }

    #[tokio::test]
    async fn test_expired_token_reconnects_without_backoff() {
        let (listener, credential) = listener().await;
        let endpoint = credential.endpoint.clone();
        let refresher = StaticRefresher::new(&endpoint);
        let (tx, _rx) = mpsc::channel(8);
        let transport = WsTransport::start(credential, refresher.clone(), tx);

        let mut ws = accept(&listener).await;
        let cmd = next_command(&mut ws).await;
        assert_eq!(cmd["connect"]["token"], "t1");
        let rejected_at = std::time::Instant::now();
        send_json(
            &mut ws,
            json!({"id": cmd["id"], "error": {"code": 109, "message": "token expired"}}),
        )
        .await;

        let mut ws = accept(&listener).await;
        assert!(rejected_at.elapsed() < Duration::from_millis(900));
        accept_connect(&mut ws, "refreshed-1").await;
        assert_eq!(refresher.calls(), 1);
        transport.close().await;
    }

    #[tokio::test]
    async fn test_disconnect_without_reconnect_stops_transport() {
        let (listener, credential) = listener().await;
        let endpoint = credential.endpoint.clone();
        let (tx, mut rx) = mpsc::channel(8);
        let _transport = WsTransport::start(credential, StaticRefresher::new(&endpoint), tx);

        let mut ws = accept(&listener).await;
        accept_connect(&mut ws, "t1").await;
        send_json(
            &mut ws,
            json!({"push": {"disconnect": {"code": 3500, "reason": "banned", "reconnect": false}}}),
        )
        .await;

        let ended = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert!(ended.is_none());
        assert!(tokio::time::timeout(Duration::from_millis(1500), listener.accept())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_close_completes_after_receiver_dropped_with_full_buffer() {
        let (listener, credential) = listener().await;
        let endpoint = credential.endpoint.clone();
        let (tx, rx) = mpsc::channel(1);
        let transport = WsTransport::start(credential, StaticRefresher::new(&endpoint), tx);

        let mut ws = accept(&listener).await;
        accept_connect(&mut ws, "t1").await;
        let publication = r#"{"push":{"channel":"channel.1","pub":{"data":{"event":"MessageSent"}}}}"#;
        ws.send(WsMessage::text([publication; 3].join("\n")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        drop(rx);
        tokio::time::timeout(Duration::from_secs(5), transport.close())
            .await
            .unwrap();
        assert!(matches!(
            transport.subscribe("channel.1").await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_stops_worker() {
        let (listener, credential) = listener().await;
        let endpoint = credential.endpoint.clone();
        let (tx, _rx) = mpsc::channel(8);
        let transport = WsTransport::start(credential, StaticRefresher::new(&endpoint), tx);

        let mut ws = accept(&listener).await;
        accept_connect(&mut ws, "t1").await;

        tokio::time::timeout(Duration::from_secs(5), transport.close())
            .await
            .unwrap();
        assert!(matches!(
            transport.subscribe("channel.1").await,
            Err(TransportError::Closed)
        ));
    }
}
