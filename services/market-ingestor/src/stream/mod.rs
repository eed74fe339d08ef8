//! Live stream manager
//!
//! Owns one upstream connection and drives it through an explicit state
//! machine:
//!
//! ```text
//! Disconnected -> Connecting -> Authenticating -> Subscribing -> Streaming
//!      ^              |               |               |             |
//!      +--------------+---------------+---------------+-------------+   (error)
//! any state -> ShuttingDown
//! ```
//!
//! Subscriptions always track the registry's current Active Set. Registry
//! diffs are applied incrementally; on reconnect the manager subscribes to
//! whatever the Active Set is at that moment.

pub mod backoff;
pub mod protocol;

use crate::clock::MonotonicClock;
use crate::health::ComponentStats;
use crate::registry::{ActiveSet, MarketRegistry, RegistryDiff};
use crate::session::SessionCache;
use crate::sink::EventSink;
use crate::supervisor::Shutdown;
use crate::upstream::{Channel, StreamCommand, StreamConnection, StreamConnector, StreamFrame, with_timeout};
use backoff::Backoff;
use chrono::Utc;
use parking_lot::Mutex;
use protocol::Inbound;
use serde::{Deserialize, Serialize};
use services_common::constants::stream as defaults;
use services_common::{EventSource, IngestError, IngestResult, TypedEvent};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    /// No connection
    Disconnected,
    /// Obtaining a session
    Connecting,
    /// Opening the socket with the session
    Authenticating,
    /// Sending subscriptions for the Active Set
    Subscribing,
    /// Receiving frames
    Streaming,
    /// Terminal
    ShuttingDown,
}

impl StreamState {
    /// Transition table
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use StreamState::{
            Authenticating, Connecting, Disconnected, ShuttingDown, Streaming, Subscribing,
        };
        match (self, next) {
            (ShuttingDown, _) => false,
            (_, ShuttingDown) => true,
            (Disconnected, Connecting)
            | (Connecting, Authenticating)
            | (Authenticating, Subscribing)
            | (Subscribing, Streaming)
            | (Connecting | Authenticating | Subscribing | Streaming, Disconnected) => true,
            _ => false,
        }
    }
}

/// Stream settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Channels subscribed for every market
    pub channels: Vec<Channel>,
    /// Keepalive ping interval
    pub keepalive_secs: u64,
    /// Silence tolerated before reconnecting
    pub idle_timeout_secs: u64,
    /// First reconnect delay
    pub backoff_base_ms: u64,
    /// Reconnect delay ceiling
    pub backoff_max_ms: u64,
    /// Attempts before reporting degraded and cooling down
    pub max_reconnect_attempts: u32,
    /// Pause after exhausting attempts
    pub degraded_cooldown_secs: u64,
    /// Tickers per subscribe command
    pub subscribe_batch_size: usize,
    /// Deadline for connect and send calls
    pub request_timeout_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            channels: Channel::ALL.to_vec(),
            keepalive_secs: defaults::DEFAULT_KEEPALIVE_SECS,
            idle_timeout_secs: defaults::DEFAULT_IDLE_TIMEOUT_SECS,
            backoff_base_ms: defaults::DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: defaults::DEFAULT_BACKOFF_MAX_MS,
            max_reconnect_attempts: defaults::DEFAULT_MAX_RECONNECT_ATTEMPTS,
            degraded_cooldown_secs: defaults::DEFAULT_DEGRADED_COOLDOWN_SECS,
            subscribe_batch_size: defaults::DEFAULT_SUBSCRIBE_BATCH,
            request_timeout_secs: 10,
        }
    }
}

/// Why a streaming session ended without error
#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    Reconnect(&'static str),
}

/// Maintains the live connection and turns frames into events
pub struct StreamManager {
    connector: Arc<dyn StreamConnector>,
    sessions: Arc<SessionCache>,
    registry: Arc<MarketRegistry>,
    sink: EventSink,
    stats: Arc<ComponentStats>,
    config: StreamConfig,
    clock: MonotonicClock,
    state: Mutex<StreamState>,
    subscribed: Mutex<BTreeSet<String>>,
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamManager")
            .field("state", &self.state())
            .field("subscribed", &self.subscribed.lock().len())
            .finish()
    }
}

impl StreamManager {
    /// Build a manager; nothing connects until `run`
    #[must_use]
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        sessions: Arc<SessionCache>,
        registry: Arc<MarketRegistry>,
        sink: EventSink,
        stats: Arc<ComponentStats>,
        config: StreamConfig,
        clock: MonotonicClock,
    ) -> Self {
        Self {
            connector,
            sessions,
            registry,
            sink,
            stats,
            config,
            clock,
            state: Mutex::new(StreamState::Disconnected),
            subscribed: Mutex::new(BTreeSet::new()),
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> StreamState {
        *self.state.lock()
    }

    /// Tickers currently subscribed on the live connection
    #[must_use]
    pub fn subscribed(&self) -> BTreeSet<String> {
        self.subscribed.lock().clone()
    }

    fn transition(&self, next: StreamState) {
        let mut state = self.state.lock();
        if *state == next {
            return;
        }
        if !state.can_transition_to(next) {
            error!(from = ?*state, to = ?next, "Rejected stream state transition");
            return;
        }
        debug!(from = ?*state, to = ?next, "Stream state");
        *state = next;
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs.max(1))
    }

    /// Connect, stream and reconnect until shutdown
    pub async fn run(self: Arc<Self>, shutdown: Shutdown) -> IngestResult<()> {
        // A supervised restart may find the previous run's state
        *self.state.lock() = StreamState::Disconnected;
        self.subscribed.lock().clear();

        // Subscribe before the first snapshot so no diff is missed
        let mut diffs = self.registry.subscribe_diffs();
        let mut backoff = Backoff::new(
            Duration::from_millis(self.config.backoff_base_ms),
            Duration::from_millis(self.config.backoff_max_ms),
        );

        loop {
            if shutdown.is_triggered() {
                break;
            }

            match self.connect_once(&mut diffs, &mut backoff, &shutdown).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Reconnect(reason)) => {
                    info!(reason, "Stream reconnecting");
                }
                Err(e) => {
                    warn!(error = %e, attempt = backoff.attempt() + 1, "Stream connection failed");
                    self.stats.record_failure();
                    if e.is_auth() {
                        self.stats.incr("auth_rejections");
                        self.sessions.invalidate().await;
                    }
                }
            }
            self.transition(StreamState::Disconnected);
            self.subscribed.lock().clear();

            let delay = if backoff.attempt() >= self.config.max_reconnect_attempts {
                error!(
                    attempts = backoff.attempt(),
                    cooldown_secs = self.config.degraded_cooldown_secs,
                    "Stream reconnect attempts exhausted, cooling down"
                );
                self.stats.set_degraded(true);
                backoff.reset();
                Duration::from_secs(self.config.degraded_cooldown_secs)
            } else {
                backoff.next_delay()
            };
            self.stats.incr("reconnects");

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = shutdown.wait() => break,
            }
        }

        self.transition(StreamState::ShuttingDown);
        info!("Stream manager stopped");
        Ok(())
    }

    async fn connect_once(
        &self,
        diffs: &mut broadcast::Receiver<Arc<RegistryDiff>>,
        backoff: &mut Backoff,
        shutdown: &Shutdown,
    ) -> IngestResult<SessionEnd> {
        self.transition(StreamState::Connecting);
        let session = with_timeout(self.request_timeout(), "session", self.sessions.get()).await?;

        self.transition(StreamState::Authenticating);
        let mut conn = with_timeout(
            self.request_timeout(),
            "stream connect",
            self.connector.connect(&session),
        )
        .await?;

        self.transition(StreamState::Subscribing);
        let active = self.registry.snapshot();
        let mut version = active.version();
        self.sync_subscriptions(conn.as_mut(), &active).await?;

        self.transition(StreamState::Streaming);
        backoff.reset();
        self.stats.set_degraded(false);
        self.stats.record_success();
        self.stats.incr("connections");
        info!(markets = active.len(), version, "Stream subscribed");

        let keepalive_every = Duration::from_secs(self.config.keepalive_secs.max(1));
        let idle_timeout = Duration::from_secs(self.config.idle_timeout_secs.max(1));
        let mut keepalive = tokio::time::interval_at(Instant::now() + keepalive_every, keepalive_every);
        let mut last_inbound = Instant::now();
        let refresh = tokio::time::sleep(session.refresh_in(Utc::now(), self.sessions.margin()));
        tokio::pin!(refresh);

        loop {
            tokio::select! {
                biased;
                () = shutdown.wait() => {
                    self.transition(StreamState::ShuttingDown);
                    if let Err(e) = conn.close().await {
                        debug!(error = %e, "Close on shutdown failed");
                    }
                    return Ok(SessionEnd::Shutdown);
                }
                frame = conn.next_frame() => {
                    match frame? {
                        StreamFrame::Text(text) => {
                            last_inbound = Instant::now();
                            self.handle_text(&text)?;
                        }
                        StreamFrame::Pong => {
                            last_inbound = Instant::now();
                            self.stats.record_success();
                        }
                        StreamFrame::Closed => {
                            return Err(IngestError::ConnectionLost("closed by peer".into()));
                        }
                    }
                }
                diff = diffs.recv() => {
                    match diff {
                        Ok(diff) if diff.version <= version => {}
                        Ok(_) => {
                            let active = self.registry.snapshot();
                            self.sync_subscriptions(conn.as_mut(), &active).await?;
                            version = active.version();
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Registry diffs lagged, resyncing subscriptions");
                            let active = self.registry.snapshot();
                            self.sync_subscriptions(conn.as_mut(), &active).await?;
                            version = active.version();
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(IngestError::ConnectionLost("registry closed".into()));
                        }
                    }
                }
                _ = keepalive.tick() => {
                    with_timeout(self.request_timeout(), "keepalive", conn.send(StreamCommand::Ping)).await?;
                }
                () = tokio::time::sleep_until(last_inbound + idle_timeout) => {
                    self.stats.incr("idle_timeouts");
                    return Err(IngestError::ConnectionLost(format!(
                        "no inbound traffic for {}s",
                        idle_timeout.as_secs()
                    )));
                }
                () = &mut refresh => {
                    if let Err(e) = conn.close().await {
                        debug!(error = %e, "Close before session refresh failed");
                    }
                    self.sessions.invalidate().await;
                    self.stats.incr("session_refreshes");
                    return Ok(SessionEnd::Reconnect("session refresh"));
                }
            }
        }
    }

    /// Bring the connection's subscriptions in line with `active`
    async fn sync_subscriptions(
        &self,
        conn: &mut dyn StreamConnection,
        active: &ActiveSet,
    ) -> IngestResult<()> {
        let target = active.ticker_set();
        let current = self.subscribed();
        let to_add: Vec<String> = target.difference(&current).cloned().collect();
        let to_remove: Vec<String> = current.difference(&target).cloned().collect();

        if !to_add.is_empty() {
            self.send_batched(conn, &to_add, true).await?;
            self.subscribed.lock().extend(to_add.iter().cloned());
        }
        if !to_remove.is_empty() {
            self.send_batched(conn, &to_remove, false).await?;
            let mut subscribed = self.subscribed.lock();
            for ticker in &to_remove {
                subscribed.remove(ticker);
            }
        }
        if !to_add.is_empty() || !to_remove.is_empty() {
            info!(
                added = to_add.len(),
                removed = to_remove.len(),
                version = active.version(),
                "Stream subscriptions updated"
            );
        }
        Ok(())
    }

    async fn send_batched(
        &self,
        conn: &mut dyn StreamConnection,
        tickers: &[String],
        subscribe: bool,
    ) -> IngestResult<()> {
        let batch = self.config.subscribe_batch_size.max(1);
        for channel in &self.config.channels {
            for chunk in tickers.chunks(batch) {
                let command = if subscribe {
                    StreamCommand::Subscribe {
                        channel: *channel,
                        tickers: chunk.to_vec(),
                    }
                } else {
                    StreamCommand::Unsubscribe {
                        channel: *channel,
                        tickers: chunk.to_vec(),
                    }
                };
                with_timeout(self.request_timeout(), "subscription", conn.send(command)).await?;
            }
        }
        Ok(())
    }

    /// Parse a text frame and emit it if its market is tracked
    ///
    /// Fails only when the feed rejects the session, which ends the connection.
    fn handle_text(&self, text: &str) -> IngestResult<()> {
        match protocol::parse_frame(text) {
            Ok(Inbound::Market {
                ticker,
                exchange_ts,
                payload,
            }) => {
                let active = self.registry.snapshot();
                let Some(market) = active.get(&ticker) else {
                    self.stats.incr("dropped_unsubscribed");
                    return Ok(());
                };
                let event = TypedEvent::new(
                    ticker,
                    market.category,
                    EventSource::Stream,
                    self.clock.now_ms(),
                    exchange_ts,
                    payload,
                );
                self.stats.record_success();
                self.stats.incr("events");
                self.sink.publish(event);
            }
            Ok(Inbound::Subscribed { channel, sid }) => {
                self.stats.touch();
                debug!(?channel, ?sid, "Subscription confirmed");
            }
            Ok(inbound @ Inbound::Error { .. }) => {
                self.stats.incr("upstream_errors");
                let auth = inbound.is_auth_error();
                if let Inbound::Error { code, message } = inbound {
                    warn!(?code, %message, "Stream error message");
                    if auth {
                        return Err(IngestError::AuthExpired(message));
                    }
                }
            }
            Ok(Inbound::Other(kind)) => {
                debug!(%kind, "Ignoring stream message");
            }
            Err(e) => {
                self.stats.incr("malformed");
                debug!(error = %e, "Dropping malformed frame");
            }
        }
        Ok(())
    }
}
