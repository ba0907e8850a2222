//! Listener lifecycle: bootstrap, the event loop and shutdown.
//!
//! Startup resolves identity → channels → initial keys → credential →
//! transport → initial subscriptions. Every step is fatal. After that the
//! loop processes deliveries in order, runs channel discovery in the
//! background on a timer and exits on SIGINT/SIGTERM. Steady-state failures
//! are logged and never end the loop.

use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};

use crate::api::{ApiClient, UpstreamApi};
use crate::config::ListenerConfig;
use crate::constants::SHUTDOWN_STEP_TIMEOUT;
use crate::credentials::CredentialManager;
use crate::gate::{CooldownTable, DedupWindow};
use crate::models::{NormalizedEvent, StreamCredential};
use crate::normalizer::{DropReason, Normalizer, Outcome};
use crate::registry::{RequestedKeys, ScopedRefresher, SubscriptionRegistry};
use crate::resolver::{ChannelLabels, Resolver};
use crate::stats::SharedEventStats;
use crate::transport::{CredentialRefresh, Delivery, Transport, WsTransport};
use crate::wake::{format_wake_message, CommandWakeSink, WakeSink};

const DELIVERY_BUFFER: usize = 256;

/// Owns every piece of steady-state listener state
pub struct Dispatcher {
    resolver: Resolver,
    registry: Arc<SubscriptionRegistry>,
    transport: Arc<dyn Transport>,
    normalizer: Normalizer,
    dedup: DedupWindow,
    cooldown: CooldownTable,
    wake: Option<Arc<dyn WakeSink>>,
    stats: SharedEventStats,
    refresh_interval: Duration,
    output: Box<dyn Write + Send>,
    /// Auto-subscribe, wake and discovery tasks
    background: JoinSet<()>,
    /// The discovery pass in flight, if any
    discovery: Option<AbortHandle>,
}

/// Run the listener until a termination signal arrives
pub async fn run_listener(config: ListenerConfig) -> Result<()> {
    let client = ApiClient::new(&config.base_url, &config.token).context("Failed to create API client")?;
    let api: Arc<dyn UpstreamApi> = Arc::new(client);

    let wake: Option<Arc<dyn WakeSink>> = match (&config.wake_command, config.wake_enabled) {
        (Some(command), true) => {
            let sink = CommandWakeSink::from_command_line(command, config.wake_timeout)
                .context("Failed to parse wake command")?;
            tracing::info!("Wake enabled via '{}' (cooldown {:?})", sink.program(), config.wake_cooldown);
            let sink: Arc<dyn WakeSink> = Arc::new(sink);
            Some(sink)
        }
        _ => None,
    };

    let (dispatcher, deliveries) = bootstrap(&config, api, wake, |credential, refresher, tx| {
        Arc::new(WsTransport::start(credential, refresher, tx)) as Arc<dyn Transport>
    })
    .await?;

    dispatcher.run(deliveries, shutdown_signal()).await
}

/// Startup sequence. `connect` builds the transport from the startup
/// credential, the refresh callback and the delivery sender.
pub async fn bootstrap<F>(
    config: &ListenerConfig,
    api: Arc<dyn UpstreamApi>,
    wake: Option<Arc<dyn WakeSink>>,
    connect: F,
) -> Result<(Dispatcher, mpsc::Receiver<Delivery>)>
where
    F: FnOnce(StreamCredential, Arc<dyn CredentialRefresh>, mpsc::Sender<Delivery>) -> Arc<dyn Transport>,
{
    let labels = ChannelLabels::new();
    let resolver = Resolver::new(api.clone(), config.server_id.clone(), labels.clone());

    let identity = resolver
        .fetch_identity()
        .await
        .context("Failed to fetch agent identity")?;
    tracing::info!("Listening as {} (id={})", identity.display_name, identity.id);

    let channels = resolver
        .fetch_channels()
        .await
        .context("Failed to list server channels")?;
    let initial = resolver.initial_keys(&identity, &channels);

    let requested = RequestedKeys::new();
    requested.extend(initial.iter().cloned());
    let credentials = Arc::new(CredentialManager::new(api, config.token_ttl_secs));
    let credential = credentials
        .issue(&requested.snapshot())
        .await
        .context("Failed to issue stream credential")?;

    let (covered, uncovered): (Vec<String>, Vec<String>) = initial
        .into_iter()
        .partition(|key| credential.scoped_channels.contains(key));
    for key in &uncovered {
        tracing::warn!("Stream credential does not cover {}, skipping", key);
        requested.remove(key);
    }

    let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
    let refresher: Arc<dyn CredentialRefresh> = Arc::new(ScopedRefresher::new(credentials.clone(), requested.clone()));
    let transport = connect(credential, refresher, tx);

    let registry = Arc::new(SubscriptionRegistry::new(requested, credentials, transport.clone()));
    registry.bootstrap_initial(&covered).await;

    let dispatcher = Dispatcher {
        normalizer: Normalizer::new(identity.id.clone(), labels),
        resolver,
        registry,
        transport,
        dedup: DedupWindow::default(),
        cooldown: CooldownTable::new(config.wake_cooldown),
        wake,
        stats: SharedEventStats::new(),
        refresh_interval: config.refresh_interval,
        output: Box::new(std::io::stdout()),
        background: JoinSet::new(),
        discovery: None,
    };
    Ok((dispatcher, rx))
}

impl Dispatcher {
    /// Replace stdout as the event output
    pub fn with_output(mut self, output: Box<dyn Write + Send>) -> Self {
        self.output = output;
        self
    }

    pub fn stats(&self) -> &SharedEventStats {
        &self.stats
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub async fn run(mut self, mut deliveries: mpsc::Receiver<Delivery>, shutdown: impl Future<Output = ()>) -> Result<()> {
        let mut discovery = tokio::time::interval_at(Instant::now() + self.refresh_interval, self.refresh_interval);
        discovery.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested");
                    break;
                }
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => {
                        self.handle_delivery(delivery);
                    }
                    None => {
                        tracing::warn!("Transport stopped delivering events");
                        break;
                    }
                },
                _ = discovery.tick() => {
                    self.start_discovery();
                }
                Some(result) = self.background.join_next(), if !self.background.is_empty() => {
                    if let Err(e) = result {
                        if e.is_panic() {
                            tracing::warn!("Background task panicked: {}", e);
                        }
                    }
                }
            }
        }

        // Unblocks a transport worker waiting on a full delivery buffer
        drop(deliveries);
        self.shutdown().await;
        Ok(())
    }

    /// Normalize, dedup, emit and maybe wake for one delivery.
    /// Returns the emitted event, if any.
    pub fn handle_delivery(&mut self, delivery: Delivery) -> Option<NormalizedEvent> {
        let outcome = self.normalizer.normalize_publication(&delivery.channel, &delivery.data);
        let event = match outcome {
            Outcome::Dropped { event, reason } => {
                let name = event.as_str();
                if reason == DropReason::UnknownType {
                    tracing::debug!("Unhandled event type '{}' on {}", name, delivery.channel);
                }
                self.stats.update(|s| {
                    s.record_received(name);
                    s.record_dropped(name, reason);
                });
                return None;
            }
            Outcome::Emit(event) => event,
        };

        let name = event.event.as_str();
        if self.dedup.is_duplicate(&event) {
            tracing::debug!("Dropping duplicate {} from {} on {}", name, event.author, delivery.channel);
            self.stats.update(|s| {
                s.record_received(name);
                s.record_duplicate(name);
            });
            return None;
        }

        self.emit(&event);
        self.stats.update(|s| {
            s.record_received(name);
            s.record_emitted(name);
        });
        self.maybe_wake(&event);

        if let Some(target) = &event.auto_subscribe {
            self.spawn_add_channel(target.clone());
        }
        Some(event)
    }

    fn emit(&mut self, event: &NormalizedEvent) {
        let line = match event.to_json_line() {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Failed to serialize {} event: {}", event.event, e);
                return;
            }
        };
        let written = writeln!(self.output, "{}", line).and_then(|_| self.output.flush());
        if let Err(e) = written {
            tracing::warn!("Failed to write event to output: {}", e);
        }
    }

    fn maybe_wake(&mut self, event: &NormalizedEvent) {
        let Some(sink) = self.wake.clone() else {
            return;
        };
        if !self.cooldown.should_wake(event) {
            tracing::debug!("Wake for {} on {} suppressed by cooldown", event.event, event.channel);
            self.stats.update(|s| s.wakes_suppressed += 1);
            return;
        }

        self.stats.update(|s| s.wakes_triggered += 1);
        let message = format_wake_message(event);
        let stats = self.stats.clone();
        self.background.spawn(async move {
            tracing::debug!("Waking: {}", message);
            if let Err(e) = sink.notify(&message).await {
                tracing::warn!("Wake failed: {}", e);
                stats.update(|s| s.wakes_failed += 1);
            }
        });
    }

    fn spawn_add_channel(&mut self, key: String) {
        if self.registry.is_requested(&key) {
            return;
        }
        let registry = self.registry.clone();
        self.background.spawn(async move {
            match registry.add_channel(&key).await {
                Ok(true) => tracing::info!("Auto-subscribed to {}", key),
                Ok(false) => {}
                Err(e) => tracing::warn!("Could not subscribe to {}: {}", key, e),
            }
        });
    }

    /// Start a discovery pass in the background unless one is still running.
    /// Returns whether a pass was started.
    pub fn start_discovery(&mut self) -> bool {
        if let Some(handle) = &self.discovery {
            if !handle.is_finished() {
                tracing::debug!("Previous channel refresh still running, skipping tick");
                return false;
            }
        }
        let pass = discovery_pass(self.resolver.clone(), self.registry.clone(), self.stats.clone());
        self.discovery = Some(self.background.spawn(pass));
        true
    }

    /// Wait for in-flight auto-subscribe and wake tasks
    pub async fn settle(&mut self) {
        while self.background.join_next().await.is_some() {}
    }

    async fn shutdown(&mut self) {
        self.background.abort_all();

        let unsubscribed = self.registry.unsubscribe_all().await;
        if tokio::time::timeout(SHUTDOWN_STEP_TIMEOUT, self.transport.close())
            .await
            .is_err()
        {
            tracing::warn!("Transport did not close within {:?}", SHUTDOWN_STEP_TIMEOUT);
        }

        tracing::info!(
            "Stopped after unsubscribing {} keys. Event summary: {}",
            unsubscribed,
            self.stats.snapshot().summary()
        );
    }
}

/// One discovery pass. Listing failures are retried on the next tick.
async fn discovery_pass(resolver: Resolver, registry: Arc<SubscriptionRegistry>, stats: SharedEventStats) {
    match resolver.fetch_channels().await {
        Ok(channels) => {
            for channel in channels.iter().filter(|c| !c.is_dm()) {
                let key = channel.subscription_key();
                if registry.is_requested(&key) {
                    continue;
                }
                tracing::info!("Discovered new channel {} ({})", channel.label(), key);
                if let Err(e) = registry.add_channel(&key).await {
                    tracing::warn!("Could not subscribe to {}: {}", key, e);
                }
            }
        }
        Err(e) => tracing::warn!("Channel refresh failed, retrying next tick: {}", e),
    }
    tracing::debug!("Event stats: {}", stats.snapshot().summary());
}

/// Resolves on SIGINT, or SIGTERM on unix
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!("Could not install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Could not listen for ctrl-c: {}", e);
        futures::future::pending::<()>().await;
    }
}
