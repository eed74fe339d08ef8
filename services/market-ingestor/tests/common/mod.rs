//! Scripted upstreams shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use market_ingestor::session::{Session, SessionProvider};
use market_ingestor::sink::{PersistenceSink, WriteOutcome};
use market_ingestor::upstream::{
    CatalogClient, ListedMarket, MarketDataClient, MarketPage, MarketQuote, OrderbookLevels,
    StreamCommand, StreamConnection, StreamConnector, StreamFrame, TradeRecord,
};
use parking_lot::Mutex;
use services_common::{Category, IngestError, IngestResult, Market, MarketStatus, TypedEvent};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;

static INIT: Once = Once::new();

/// Route tracing output through the test harness
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("market_ingestor=debug")
            .with_test_writer()
            .try_init();
    });
}

pub fn market(ticker: &str, category: Category) -> Market {
    Market {
        ticker: ticker.to_string(),
        title: format!("{ticker} title"),
        event_ticker: format!("{ticker}-EVT"),
        series_ticker: "TEST".to_string(),
        category,
        status: MarketStatus::Discovered,
        close_time: None,
        expiration_time: None,
    }
}

pub fn expiring_market(ticker: &str, category: Category, expires: DateTime<Utc>) -> Market {
    Market {
        close_time: Some(expires),
        expiration_time: Some(expires),
        ..market(ticker, category)
    }
}

pub fn listed(ticker: &str, series: &str) -> ListedMarket {
    ListedMarket {
        ticker: ticker.to_string(),
        title: format!("{ticker} title"),
        event_ticker: format!("{ticker}-EVT"),
        series_ticker: Some(series.to_string()),
        status: "active".to_string(),
        close_time: None,
        expiration_time: None,
    }
}

/// Always hands out the same long-lived token
pub struct FixedSession;

#[async_trait]
impl SessionProvider for FixedSession {
    async fn get_session(&self) -> IngestResult<Session> {
        Ok(Session {
            token: "test-token".into(),
            expires_at: Utc::now() + chrono::Duration::days(1),
        })
    }
}

/// Provider counting how often a fresh session was requested
pub struct CountingSession {
    pub calls: Arc<AtomicUsize>,
    ttl: chrono::Duration,
}

impl CountingSession {
    pub fn new(ttl: chrono::Duration) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                calls: Arc::clone(&calls),
                ttl,
            },
            calls,
        )
    }
}

#[async_trait]
impl SessionProvider for CountingSession {
    async fn get_session(&self) -> IngestResult<Session> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Session {
            token: format!("token-{n}"),
            expires_at: Utc::now() + self.ttl,
        })
    }
}

/// Catalog answering from a per-series script
#[derive(Default)]
pub struct ScriptedCatalog {
    pages: Mutex<HashMap<String, Result<Vec<ListedMarket>, IngestError>>>,
    transient: Mutex<HashMap<String, VecDeque<IngestError>>>,
    endless: Mutex<HashSet<String>>,
    pub calls: AtomicUsize,
}

impl ScriptedCatalog {
    pub fn list(&self, series: &str, markets: Vec<ListedMarket>) {
        self.pages.lock().insert(series.to_string(), Ok(markets));
    }

    pub fn fail(&self, series: &str, error: IngestError) {
        self.pages.lock().insert(series.to_string(), Err(error));
    }

    /// Keep handing out a next-page cursor for `series`
    pub fn endless(&self, series: &str) {
        self.endless.lock().insert(series.to_string());
    }

    /// Fail the next call for `series` once, then answer from the script
    pub fn fail_once(&self, series: &str, error: IngestError) {
        self.transient
            .lock()
            .entry(series.to_string())
            .or_default()
            .push_back(error);
    }
}

#[async_trait]
impl CatalogClient for ScriptedCatalog {
    async fn list_markets(&self, series: &str, cursor: Option<&str>) -> IngestResult<MarketPage> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.transient.lock().get_mut(series).and_then(VecDeque::pop_front) {
            return Err(e);
        }
        let next = self
            .endless
            .lock()
            .contains(series)
            .then(|| format!("{}-{call}", cursor.unwrap_or("page")));
        match self.pages.lock().get(series) {
            Some(Ok(markets)) => Ok(MarketPage {
                markets: markets.clone(),
                cursor: next,
            }),
            Some(Err(e)) => Err(e.clone()),
            None => Ok(MarketPage::default()),
        }
    }
}

type SnapshotHook = Box<dyn Fn(&str) + Send + Sync>;

/// Market data client recording which tickers were polled
#[derive(Default)]
pub struct RecordingMarketData {
    pub polled: Mutex<Vec<String>>,
    pub trades: Mutex<HashMap<String, Vec<TradeRecord>>>,
    /// Tickers whose next snapshot is throttled once
    pub throttle_once: Mutex<HashSet<String>>,
    on_snapshot: Mutex<Option<SnapshotHook>>,
}

impl RecordingMarketData {
    /// Run `hook` inside every snapshot call, after it is recorded
    pub fn on_snapshot(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_snapshot.lock() = Some(Box::new(hook));
    }
}

#[async_trait]
impl MarketDataClient for RecordingMarketData {
    async fn market_snapshot(&self, _session: &Session, ticker: &str) -> IngestResult<MarketQuote> {
        self.polled.lock().push(ticker.to_string());
        if let Some(hook) = self.on_snapshot.lock().as_ref() {
            hook(ticker);
        }
        if self.throttle_once.lock().remove(ticker) {
            return Err(IngestError::RateLimitRejected { retry_after: None });
        }
        Ok(MarketQuote {
            yes_bid: Some(40),
            yes_ask: Some(44),
            last_price: Some(42),
            ..MarketQuote::default()
        })
    }

    async fn orderbook(&self, _session: &Session, _ticker: &str, _depth: u32) -> IngestResult<OrderbookLevels> {
        Ok(OrderbookLevels::default())
    }

    async fn recent_trades(&self, _session: &Session, ticker: &str, _limit: u32) -> IngestResult<Vec<TradeRecord>> {
        Ok(self.trades.lock().get(ticker).cloned().unwrap_or_default())
    }
}

/// Test side of one mock connection
pub struct MockLink {
    pub frames: mpsc::UnboundedSender<StreamFrame>,
    pub commands: mpsc::UnboundedReceiver<StreamCommand>,
}

impl MockLink {
    /// Commands sent so far, without waiting
    pub fn drain_commands(&mut self) -> Vec<StreamCommand> {
        let mut out = Vec::new();
        while let Ok(command) = self.commands.try_recv() {
            out.push(command);
        }
        out
    }

    pub fn send_text(&self, text: &str) {
        let _ = self.frames.send(StreamFrame::Text(text.to_string()));
    }
}

/// Connector handing each new connection to the test through a channel
pub struct MockConnector {
    links: mpsc::UnboundedSender<MockLink>,
    pub connects: AtomicUsize,
    /// Refuse every connect with a transport error
    pub refuse: AtomicBool,
    /// Reject this many connects as unauthorized
    pub auth_failures: AtomicUsize,
    /// Leave pings unanswered on new connections
    pub mute_pongs: AtomicBool,
    /// Pings sent over every connection
    pub pings: Arc<AtomicUsize>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockLink>) {
        let (links, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                links,
                connects: AtomicUsize::new(0),
                refuse: AtomicBool::new(false),
                auth_failures: AtomicUsize::new(0),
                mute_pongs: AtomicBool::new(false),
                pings: Arc::new(AtomicUsize::new(0)),
            }),
            rx,
        )
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamConnector for MockConnector {
    async fn connect(&self, _session: &Session) -> IngestResult<Box<dyn StreamConnection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(IngestError::ConnectionLost("connection refused".into()));
        }
        if self
            .auth_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(IngestError::AuthExpired("401 Unauthorized".into()));
        }
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        self.links
            .send(MockLink {
                frames: frames_tx,
                commands: commands_rx,
            })
            .map_err(|_| IngestError::ConnectionLost("test dropped the link receiver".into()))?;
        Ok(Box::new(MockConnection {
            frames: frames_rx,
            commands: commands_tx,
            pending_pongs: VecDeque::new(),
            answer_pings: !self.mute_pongs.load(Ordering::SeqCst),
            pings: Arc::clone(&self.pings),
        }))
    }
}

struct MockConnection {
    frames: mpsc::UnboundedReceiver<StreamFrame>,
    commands: mpsc::UnboundedSender<StreamCommand>,
    pending_pongs: VecDeque<StreamFrame>,
    answer_pings: bool,
    pings: Arc<AtomicUsize>,
}

#[async_trait]
impl StreamConnection for MockConnection {
    async fn send(&mut self, command: StreamCommand) -> IngestResult<()> {
        if command == StreamCommand::Ping {
            self.pings.fetch_add(1, Ordering::SeqCst);
            if self.answer_pings {
                self.pending_pongs.push_back(StreamFrame::Pong);
            }
            return Ok(());
        }
        self.commands
            .send(command)
            .map_err(|_| IngestError::ConnectionLost("peer gone".into()))
    }

    async fn next_frame(&mut self) -> IngestResult<StreamFrame> {
        if let Some(pong) = self.pending_pongs.pop_front() {
            return Ok(pong);
        }
        Ok(self.frames.recv().await.unwrap_or(StreamFrame::Closed))
    }

    async fn close(&mut self) -> IngestResult<()> {
        self.frames.close();
        Ok(())
    }
}

/// Persistence that keeps every accepted event
#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<TypedEvent>>,
}

#[async_trait]
impl PersistenceSink for RecordingSink {
    async fn write_batch(&self, events: &[TypedEvent]) -> IngestResult<WriteOutcome> {
        self.events.lock().extend(events.iter().cloned());
        Ok(WriteOutcome {
            accepted: events.iter().map(|e| e.id).collect(),
            rejected: Vec::new(),
        })
    }
}
