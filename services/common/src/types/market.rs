//! Tracked market identity and lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Market category derived from the series table
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Category {
    /// Pro football
    Nfl,
    /// Pro hockey
    Nhl,
    /// Pro basketball
    Nba,
    /// College football
    #[serde(alias = "CFB")]
    Ncaaf,
    /// Temperature and precipitation markets
    Weather,
}

impl Category {
    /// All known categories, in table order
    pub const ALL: [Self; 5] = [Self::Nfl, Self::Nhl, Self::Nba, Self::Ncaaf, Self::Weather];

    /// Canonical upper-case label
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Nfl => "NFL",
            Self::Nhl => "NHL",
            Self::Nba => "NBA",
            Self::Ncaaf => "NCAAF",
            Self::Weather => "WEATHER",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NFL" => Ok(Self::Nfl),
            "NHL" => Ok(Self::Nhl),
            "NBA" => Ok(Self::Nba),
            "NCAAF" | "CFB" => Ok(Self::Ncaaf),
            "WEATHER" => Ok(Self::Weather),
            other => Err(format!("unknown category: {other}")),
        }
    }
}

/// Lifecycle state of a market
///
/// The derived ordering is the lifecycle order. A market only ever moves
/// forward through it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MarketStatus {
    /// Seen in the catalog for the first time
    Discovered,
    /// Open and tracked
    Active,
    /// No longer listed as open, still tracked until settlement
    Closing,
    /// Terminal
    Settled,
}

impl MarketStatus {
    /// Whether moving to `next` keeps the lifecycle monotonic
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        next >= self
    }

    /// Member of the Active Set
    #[must_use]
    pub const fn is_tracked(self) -> bool {
        matches!(self, Self::Active | Self::Closing)
    }
}

/// A prediction market tracked by the registry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Market {
    /// Exchange ticker, the identity key
    pub ticker: String,
    /// Human readable title
    pub title: String,
    /// Parent event ticker
    pub event_ticker: String,
    /// Series the market belongs to
    pub series_ticker: String,
    /// Category from the series table
    pub category: Category,
    /// Current lifecycle state
    pub status: MarketStatus,
    /// Trading close time
    pub close_time: Option<DateTime<Utc>>,
    /// Expiration time
    pub expiration_time: Option<DateTime<Utc>>,
}

impl Market {
    /// Latest of close and expiration, used for settlement
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match (self.close_time, self.expiration_time) {
            (Some(close), Some(exp)) => Some(close.max(exp)),
            (close, exp) => close.or(exp),
        }
    }

    /// Same listing metadata, ignoring lifecycle state
    #[must_use]
    pub fn same_listing(&self, other: &Self) -> bool {
        self.ticker == other.ticker
            && self.title == other.title
            && self.event_ticker == other.event_ticker
            && self.series_ticker == other.series_ticker
            && self.category == other.category
            && self.close_time == other.close_time
            && self.expiration_time == other.expiration_time
    }
}
