//! Normalized market data events
//!
//! Stream and poll paths both produce [`TypedEvent`], so downstream
//! consumers never care where an event came from.

use crate::types::market::Category;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which ingestion path produced an event
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    /// Live WebSocket feed
    Stream,
    /// REST poll fallback
    Poll,
}

/// Binary contract side
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractSide {
    /// YES contract
    Yes,
    /// NO contract
    No,
}

impl ContractSide {
    /// Parse the exchange's lower-case side label
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "yes" | "YES" => Some(Self::Yes),
            "no" | "NO" => Some(Self::No),
            _ => None,
        }
    }
}

/// One orderbook price level, prices in cents
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    /// Price in cents (1..=99)
    pub price: i64,
    /// Resting contracts, or the change in contracts for a delta
    pub size: i64,
}

/// Top-of-book quote update
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TickerUpdate {
    /// Best YES bid in cents
    pub yes_bid: Option<i64>,
    /// Best YES ask in cents
    pub yes_ask: Option<i64>,
    /// Best NO bid in cents
    pub no_bid: Option<i64>,
    /// Best NO ask in cents
    pub no_ask: Option<i64>,
    /// Last traded price in cents
    pub last_price: Option<i64>,
    /// Contracts traded
    pub volume: Option<i64>,
    /// Open interest
    pub open_interest: Option<i64>,
    /// (yes_bid + yes_ask) / 2
    pub mid_price: Option<f64>,
    /// yes_ask - yes_bid
    pub spread: Option<f64>,
}

impl TickerUpdate {
    /// Build an update and derive mid and spread when both sides quote
    #[must_use]
    pub fn new(
        yes_bid: Option<i64>,
        yes_ask: Option<i64>,
        no_bid: Option<i64>,
        no_ask: Option<i64>,
        last_price: Option<i64>,
        volume: Option<i64>,
        open_interest: Option<i64>,
    ) -> Self {
        let (mid_price, spread) = match (yes_bid, yes_ask) {
            (Some(bid), Some(ask)) => (
                Some((bid + ask) as f64 / 2.0),
                Some((ask - bid) as f64),
            ),
            _ => (None, None),
        };
        Self {
            yes_bid,
            yes_ask,
            no_bid,
            no_ask,
            last_price,
            volume,
            open_interest,
            mid_price,
            spread,
        }
    }
}

/// Variant-specific event body
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    /// Quote change
    TickerUpdate(TickerUpdate),
    /// A matched trade
    TradeExecution {
        /// Exchange trade id, used for de-duplication
        trade_id: Option<String>,
        /// YES price in cents
        price: i64,
        /// Contracts
        size: i64,
        /// Aggressor side
        taker_side: Option<ContractSide>,
    },
    /// Orderbook levels, either a full snapshot or an incremental change
    OrderbookDelta {
        /// YES side levels
        yes: Vec<PriceLevel>,
        /// NO side levels
        no: Vec<PriceLevel>,
        /// True when levels replace the whole book
        snapshot: bool,
    },
}

impl EventPayload {
    /// Short label for logs and counters
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::TickerUpdate(_) => "ticker",
            Self::TradeExecution { .. } => "trade",
            Self::OrderbookDelta { .. } => "orderbook",
        }
    }
}

/// A normalized record ready for persistence
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TypedEvent {
    /// Unique event id
    pub id: Uuid,
    /// Market ticker, an Active Set member when emitted
    pub ticker: String,
    /// Category of the market
    pub category: Category,
    /// Exchange-reported time; advisory only
    pub exchange_ts: Option<DateTime<Utc>>,
    /// Monotonic receipt time in milliseconds, the ordering authority
    pub received_at_ms: u64,
    /// Wall-clock receipt time
    pub received_at: DateTime<Utc>,
    /// Producing path
    pub source: EventSource,
    /// Body
    pub payload: EventPayload,
}

impl TypedEvent {
    /// Create an event with a fresh id
    #[must_use]
    pub fn new(
        ticker: impl Into<String>,
        category: Category,
        source: EventSource,
        received_at_ms: u64,
        exchange_ts: Option<DateTime<Utc>>,
        payload: EventPayload,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            ticker: ticker.into(),
            category,
            exchange_ts,
            received_at_ms,
            received_at: Utc::now(),
            source,
            payload,
        }
    }
}
