//! Contracts with the upstream exchange
//!
//! The engine only talks to these traits; `exchanges::kalshi` provides the
//! production implementations and tests supply scripted ones.

use crate::session::Session;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use services_common::{ContractSide, IngestError, IngestResult, PriceLevel, TickerUpdate};
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// A market as listed by the catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListedMarket {
    /// Market ticker
    pub ticker: String,
    /// Title
    pub title: String,
    /// Event ticker
    pub event_ticker: String,
    /// Series ticker when the catalog reports it
    pub series_ticker: Option<String>,
    /// Upstream status label
    pub status: String,
    /// Close time
    pub close_time: Option<DateTime<Utc>>,
    /// Expiration time
    pub expiration_time: Option<DateTime<Utc>>,
}

/// One page of catalog results
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarketPage {
    /// Markets on this page
    pub markets: Vec<ListedMarket>,
    /// Cursor for the next page; `None` on the last page
    pub cursor: Option<String>,
}

/// Paged catalog listing, consumed only by discovery
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// List open markets of a series
    async fn list_markets(&self, series: &str, cursor: Option<&str>) -> IngestResult<MarketPage>;
}

/// Top-of-book quote from the snapshot endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketQuote {
    /// Best YES bid
    pub yes_bid: Option<i64>,
    /// Best YES ask
    pub yes_ask: Option<i64>,
    /// Best NO bid
    pub no_bid: Option<i64>,
    /// Best NO ask
    pub no_ask: Option<i64>,
    /// Last trade price
    pub last_price: Option<i64>,
    /// Volume
    pub volume: Option<i64>,
    /// Open interest
    pub open_interest: Option<i64>,
}

impl From<MarketQuote> for TickerUpdate {
    fn from(q: MarketQuote) -> Self {
        Self::new(
            q.yes_bid,
            q.yes_ask,
            q.no_bid,
            q.no_ask,
            q.last_price,
            q.volume,
            q.open_interest,
        )
    }
}

/// Orderbook levels per side
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderbookLevels {
    /// YES bids
    pub yes: Vec<PriceLevel>,
    /// NO bids
    pub no: Vec<PriceLevel>,
}

/// A trade from the trades endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct TradeRecord {
    /// Exchange trade id
    pub trade_id: String,
    /// YES price in cents
    pub price: i64,
    /// Contracts
    pub count: i64,
    /// Aggressor
    pub taker_side: Option<ContractSide>,
    /// Execution time
    pub created_time: Option<DateTime<Utc>>,
}

/// Per-market request/response endpoints
#[async_trait]
pub trait MarketDataClient: Send + Sync {
    /// Current quote
    async fn market_snapshot(&self, session: &Session, ticker: &str) -> IngestResult<MarketQuote>;

    /// Orderbook to `depth` levels
    async fn orderbook(
        &self,
        session: &Session,
        ticker: &str,
        depth: u32,
    ) -> IngestResult<OrderbookLevels>;

    /// Most recent trades, newest first
    async fn recent_trades(
        &self,
        session: &Session,
        ticker: &str,
        limit: u32,
    ) -> IngestResult<Vec<TradeRecord>>;
}

/// Stream channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Quote updates
    Ticker,
    /// Trade prints
    Trade,
    /// Orderbook snapshots and deltas
    OrderbookDelta,
}

impl Channel {
    /// Every channel the stream subscribes to
    pub const ALL: [Self; 3] = [Self::Ticker, Self::Trade, Self::OrderbookDelta];

    /// Wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ticker => "ticker",
            Self::Trade => "trade",
            Self::OrderbookDelta => "orderbook_delta",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound stream command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamCommand {
    /// Start receiving `channel` for tickers
    Subscribe {
        /// Channel name
        channel: Channel,
        /// Market tickers
        tickers: Vec<String>,
    },
    /// Stop receiving `channel` for tickers
    Unsubscribe {
        /// Channel name
        channel: Channel,
        /// Market tickers
        tickers: Vec<String>,
    },
    /// Keepalive
    Ping,
}

/// Inbound stream frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// Application payload
    Text(String),
    /// Keepalive acknowledgement
    Pong,
    /// Peer closed the connection
    Closed,
}

/// An open streaming connection
#[async_trait]
pub trait StreamConnection: Send {
    /// Send a command
    async fn send(&mut self, command: StreamCommand) -> IngestResult<()>;

    /// Next inbound frame; cancel-safe
    async fn next_frame(&mut self) -> IngestResult<StreamFrame>;

    /// Close gracefully
    async fn close(&mut self) -> IngestResult<()>;
}

/// Opens authenticated streaming connections
#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// Connect and complete the handshake with `session`
    async fn connect(&self, session: &Session) -> IngestResult<Box<dyn StreamConnection>>;
}

/// Bound an upstream call; an elapsed deadline counts as a failed call
pub async fn with_timeout<T, F>(limit: Duration, what: &str, call: F) -> IngestResult<T>
where
    F: Future<Output = IngestResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(IngestError::Timeout(format!("{what} exceeded {}ms", limit.as_millis()))),
    }
}
