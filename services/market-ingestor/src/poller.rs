//! REST poll fallback
//!
//! Walks the Active Set round-robin on a fixed tick, spending the poll
//! budget. When the budget cannot cover the rest of a rotation inside the
//! current tick, the remaining markets are deferred to the next tick and
//! the cursor stays on the first deferred market. Membership is checked
//! again before each visit and each emitted event, so a market discovery
//! removes mid-tick gets nothing further.

use crate::clock::MonotonicClock;
use crate::health::ComponentStats;
use crate::rate_limiter::{Acquire, TokenBucket};
use crate::registry::MarketRegistry;
use crate::session::{Session, SessionCache};
use crate::sink::EventSink;
use crate::supervisor::Shutdown;
use crate::upstream::{MarketDataClient, TradeRecord, with_timeout};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use services_common::constants::{poll, upstream};
use services_common::{EventPayload, EventSource, IngestResult, Market, TypedEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Poller settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Seconds between ticks
    pub tick_secs: u64,
    /// Coverage window above which the poller reports degraded
    pub max_staleness_secs: u64,
    /// Also fetch the orderbook per market
    pub fetch_orderbook: bool,
    /// Also fetch recent trades per market
    pub fetch_trades: bool,
    /// Orderbook depth
    pub orderbook_depth: u32,
    /// Recent trades per request
    pub trades_limit: u32,
    /// Deadline for one request
    pub request_timeout_secs: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            tick_secs: poll::DEFAULT_TICK_SECS,
            max_staleness_secs: poll::DEFAULT_MAX_STALENESS_SECS,
            fetch_orderbook: false,
            fetch_trades: false,
            orderbook_depth: upstream::DEFAULT_ORDERBOOK_DEPTH,
            trades_limit: upstream::DEFAULT_TRADES_LIMIT,
            request_timeout_secs: upstream::DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl PollerConfig {
    /// Requests issued per market visit
    #[must_use]
    pub fn requests_per_market(&self) -> u32 {
        1 + u32::from(self.fetch_orderbook) + u32::from(self.fetch_trades)
    }

    fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs.max(1))
    }
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Markets polled successfully
    pub polled: usize,
    /// Markets whose poll failed
    pub failed: usize,
    /// Markets pushed to the next tick
    pub deferred: usize,
    /// Markets that left the Active Set before their turn
    pub skipped: usize,
}

enum Visit {
    Polled,
    Failed,
    Deferred,
}

#[derive(Debug, Default)]
struct PollState {
    /// Next ticker to visit
    cursor: Option<String>,
    /// Newest trade id emitted per market
    last_trade: FxHashMap<String, String>,
    /// Last successful poll per market
    last_polled: FxHashMap<String, Instant>,
}

/// Rate-budgeted REST poller over the Active Set
pub struct PollFallback {
    client: Arc<dyn MarketDataClient>,
    sessions: Arc<SessionCache>,
    registry: Arc<MarketRegistry>,
    bucket: Arc<TokenBucket>,
    sink: EventSink,
    stats: Arc<ComponentStats>,
    config: PollerConfig,
    clock: MonotonicClock,
    state: tokio::sync::Mutex<PollState>,
}

impl std::fmt::Debug for PollFallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollFallback")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PollFallback {
    /// Build a poller drawing from `bucket`
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<dyn MarketDataClient>,
        sessions: Arc<SessionCache>,
        registry: Arc<MarketRegistry>,
        bucket: Arc<TokenBucket>,
        sink: EventSink,
        stats: Arc<ComponentStats>,
        config: PollerConfig,
        clock: MonotonicClock,
    ) -> Self {
        Self {
            client,
            sessions,
            registry,
            bucket,
            sink,
            stats,
            config,
            clock,
            state: tokio::sync::Mutex::new(PollState::default()),
        }
    }

    /// Time since `ticker` was last polled successfully
    pub async fn staleness(&self, ticker: &str) -> Option<Duration> {
        self.state
            .lock()
            .await
            .last_polled
            .get(ticker)
            .map(Instant::elapsed)
    }

    /// Worst-case time to visit every market once at the current budget
    ///
    /// One tick plus the time to refill whatever a full rotation needs
    /// beyond the bucket's burst capacity.
    #[must_use]
    pub fn coverage_window(&self, active: usize) -> Duration {
        let needed = active as f64 * f64::from(self.config.requests_per_market());
        let beyond_burst = (needed - f64::from(self.bucket.capacity())).max(0.0);
        let refill = beyond_burst / self.bucket.rate_per_sec();
        self.config.tick() + Duration::from_secs_f64(refill.min(f64::from(u32::MAX)))
    }

    fn check_coverage(&self, active: usize) {
        let window = self.coverage_window(active);
        let limit = Duration::from_secs(self.config.max_staleness_secs);
        if window > limit {
            if !self.stats.is_degraded() {
                warn!(
                    markets = active,
                    window_secs = window.as_secs(),
                    limit_secs = limit.as_secs(),
                    "Poll budget cannot cover the active set within the staleness limit"
                );
            }
            self.stats.set_degraded(true);
        } else {
            self.stats.set_degraded(false);
        }
    }

    /// Poll on the configured tick until shutdown
    pub async fn run(self: Arc<Self>, shutdown: Shutdown) -> IngestResult<()> {
        let mut ticker = tokio::time::interval(self.config.tick());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                () = shutdown.wait() => {
                    info!("Poll fallback stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    let report = self.run_tick(&shutdown).await;
                    if report.deferred > 0 || report.failed > 0 || report.skipped > 0 {
                        debug!(?report, "Poll tick finished");
                    }
                }
            }
        }
    }

    /// One pass over the Active Set, starting at the cursor
    pub async fn run_tick(&self, shutdown: &Shutdown) -> TickReport {
        let tick_started = Instant::now();
        let deadline = tick_started + self.config.tick();
        let mut report = TickReport::default();

        let active = self.registry.snapshot();
        let markets: Vec<Arc<Market>> = active.markets().cloned().collect();
        let mut state = self.state.lock().await;
        state.last_trade.retain(|t, _| active.contains(t));
        state.last_polled.retain(|t, _| active.contains(t));
        if markets.is_empty() {
            state.cursor = None;
            return report;
        }
        self.check_coverage(markets.len());

        let session = match with_timeout(self.request_timeout(), "session", self.sessions.get()).await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Poller could not obtain a session");
                self.stats.record_failure();
                report.failed = markets.len();
                return report;
            }
        };

        let start = state
            .cursor
            .as_deref()
            .map_or(0, |cursor| markets.partition_point(|m| m.ticker.as_str() < cursor))
            % markets.len();

        for offset in 0..markets.len() {
            let market = &markets[(start + offset) % markets.len()];
            if shutdown.is_triggered() {
                state.cursor = Some(market.ticker.clone());
                break;
            }
            let next = &markets[(start + offset + 1) % markets.len()];
            if !self.is_active(&market.ticker) {
                debug!(ticker = %market.ticker, "Market left the active set, skipping");
                report.skipped += 1;
                state.cursor = Some(next.ticker.clone());
                continue;
            }
            match self.visit(&mut state, &session, market, deadline).await {
                Visit::Polled => report.polled += 1,
                Visit::Failed => report.failed += 1,
                Visit::Deferred => {
                    report.deferred = markets.len() - offset;
                    state.cursor = Some(market.ticker.clone());
                    self.stats.add("deferred", report.deferred as u64);
                    return report;
                }
            }
            state.cursor = Some(next.ticker.clone());
        }
        report
    }

    fn is_active(&self, ticker: &str) -> bool {
        self.registry.snapshot().contains(ticker)
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs.max(1))
    }

    async fn visit(
        &self,
        state: &mut PollState,
        session: &Session,
        market: &Market,
        deadline: Instant,
    ) -> Visit {
        let requests = self.config.requests_per_market();
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.bucket.acquire(requests, remaining).await {
            Acquire::Granted => {}
            Acquire::Wait(wait) => {
                debug!(ticker = %market.ticker, wait_ms = wait.as_millis() as u64, "Poll budget exhausted for this tick");
                return Visit::Deferred;
            }
            Acquire::Unsatisfiable => {
                warn!(requests, capacity = self.bucket.capacity(), "Poll budget smaller than one market visit");
                return Visit::Deferred;
            }
        }

        match self.poll_market(state, session, market).await {
            Ok(()) => {
                state.last_polled.insert(market.ticker.clone(), Instant::now());
                self.stats.record_success();
                Visit::Polled
            }
            Err(e) if e.is_rate_limited() => {
                // Retried first next tick, not dropped
                self.bucket.record_rejection();
                self.stats.incr("rate_limited");
                Visit::Deferred
            }
            Err(e) => {
                if e.is_auth() {
                    self.stats.incr("auth_rejections");
                    self.sessions.invalidate().await;
                }
                warn!(ticker = %market.ticker, error = %e, "Market poll failed");
                self.stats.record_failure();
                Visit::Failed
            }
        }
    }

    async fn poll_market(
        &self,
        state: &mut PollState,
        session: &Session,
        market: &Market,
    ) -> IngestResult<()> {
        let timeout = self.request_timeout();
        let ticker = market.ticker.as_str();

        let quote = with_timeout(timeout, "market snapshot", self.client.market_snapshot(session, ticker)).await?;
        self.bucket.record_success();
        self.emit(market, None, EventPayload::TickerUpdate(quote.into()));

        if self.config.fetch_orderbook {
            let book = with_timeout(
                timeout,
                "orderbook",
                self.client.orderbook(session, ticker, self.config.orderbook_depth),
            )
            .await?;
            self.bucket.record_success();
            self.emit(
                market,
                None,
                EventPayload::OrderbookDelta {
                    yes: book.yes,
                    no: book.no,
                    snapshot: true,
                },
            );
        }

        if self.config.fetch_trades {
            let trades = with_timeout(
                timeout,
                "recent trades",
                self.client.recent_trades(session, ticker, self.config.trades_limit),
            )
            .await?;
            self.bucket.record_success();
            let fresh = unseen_trades(state.last_trade.get(ticker).map(String::as_str), &trades);
            if let Some(newest) = trades.first() {
                state.last_trade.insert(market.ticker.clone(), newest.trade_id.clone());
            }
            for trade in fresh.into_iter().rev() {
                self.emit(
                    market,
                    trade.created_time,
                    EventPayload::TradeExecution {
                        trade_id: Some(trade.trade_id.clone()),
                        price: trade.price,
                        size: trade.count,
                        taker_side: trade.taker_side,
                    },
                );
            }
        }
        Ok(())
    }

    fn emit(
        &self,
        market: &Market,
        exchange_ts: Option<chrono::DateTime<chrono::Utc>>,
        payload: EventPayload,
    ) {
        if !self.is_active(&market.ticker) {
            self.stats.incr("dropped_inactive");
            return;
        }
        let event = TypedEvent::new(
            market.ticker.clone(),
            market.category,
            EventSource::Poll,
            self.clock.now_ms(),
            exchange_ts,
            payload,
        );
        self.stats.incr("events");
        self.sink.publish(event);
    }
}

/// Trades newer than `last_seen`, newest first
fn unseen_trades<'a>(last_seen: Option<&str>, trades: &'a [TradeRecord]) -> Vec<&'a TradeRecord> {
    trades
        .iter()
        .take_while(|t| Some(t.trade_id.as_str()) != last_seen)
        .collect()
}
