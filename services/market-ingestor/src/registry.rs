//! Authoritative market set and the published Active Set
//!
//! Readers take an `Arc<ActiveSet>` snapshot without locking. Discovery is
//! the only writer: it builds a fresh set during `reconcile` and swaps it
//! in atomically, then broadcasts the diff.

use arc_swap::ArcSwap;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use services_common::constants::discovery::DEFAULT_SETTLED_RETENTION_SECS;
use services_common::{Category, Market, MarketStatus};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Diff broadcast buffer; slow subscribers resync from a snapshot on lag
const DIFF_CHANNEL_CAPACITY: usize = 64;

/// Immutable, versioned view of the tracked markets
#[derive(Debug, Default, Clone)]
pub struct ActiveSet {
    version: u64,
    markets: BTreeMap<String, Arc<Market>>,
}

impl ActiveSet {
    /// Build a set from markets; untracked statuses are skipped
    #[must_use]
    pub fn from_markets<I: IntoIterator<Item = Market>>(version: u64, markets: I) -> Self {
        let markets = markets
            .into_iter()
            .filter(|m| m.status.is_tracked())
            .map(|m| (m.ticker.clone(), Arc::new(m)))
            .collect();
        Self { version, markets }
    }

    /// Reconciliation count that produced this set
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Membership test
    #[must_use]
    pub fn contains(&self, ticker: &str) -> bool {
        self.markets.contains_key(ticker)
    }

    /// Market by ticker
    #[must_use]
    pub fn get(&self, ticker: &str) -> Option<&Arc<Market>> {
        self.markets.get(ticker)
    }

    /// Number of tracked markets
    #[must_use]
    pub fn len(&self) -> usize {
        self.markets.len()
    }

    /// No tracked markets
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }

    /// Tickers in sorted order
    pub fn tickers(&self) -> impl Iterator<Item = &str> {
        self.markets.keys().map(String::as_str)
    }

    /// Markets in ticker order
    pub fn markets(&self) -> impl Iterator<Item = &Arc<Market>> {
        self.markets.values()
    }

    /// Ticker set, for diffing
    #[must_use]
    pub fn ticker_set(&self) -> BTreeSet<String> {
        self.markets.keys().cloned().collect()
    }
}

/// Output of one discovery cycle
#[derive(Debug, Clone)]
pub struct DiscoveryBatch {
    /// Markets the catalog listed as open
    pub markets: Vec<Market>,
    /// Categories whose listing completed; absence only closes markets in these
    pub covered: BTreeSet<Category>,
    /// Reconciliation time
    pub now: DateTime<Utc>,
}

/// One lifecycle move
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    /// Market ticker
    pub ticker: String,
    /// Previous state
    pub from: MarketStatus,
    /// New state
    pub to: MarketStatus,
}

/// What changed in a reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryDiff {
    /// Active Set version after the change
    pub version: u64,
    /// Tickers that joined the Active Set
    pub added: Vec<String>,
    /// Tickers that left the Active Set
    pub removed: Vec<String>,
    /// Tracked tickers whose listing metadata changed
    pub updated: Vec<String>,
    /// Lifecycle moves applied
    pub transitions: Vec<StatusChange>,
}

impl RegistryDiff {
    /// Nothing changed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.updated.is_empty()
            && self.transitions.is_empty()
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    known: FxHashMap<String, Market>,
    /// When each settled market settled, for pruning
    settled_at: FxHashMap<String, DateTime<Utc>>,
    version: u64,
}

/// Market registry
pub struct MarketRegistry {
    active: ArcSwap<ActiveSet>,
    state: Mutex<RegistryState>,
    diffs: broadcast::Sender<Arc<RegistryDiff>>,
    settle_grace: ChronoDuration,
    settled_retention: ChronoDuration,
}

impl std::fmt::Debug for MarketRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketRegistry")
            .field("version", &self.active.load().version())
            .field("active", &self.active.load().len())
            .finish()
    }
}

impl MarketRegistry {
    /// Empty registry
    #[must_use]
    pub fn new(settle_grace: Duration) -> Self {
        let (diffs, _) = broadcast::channel(DIFF_CHANNEL_CAPACITY);
        Self {
            active: ArcSwap::from_pointee(ActiveSet::default()),
            state: Mutex::new(RegistryState::default()),
            diffs,
            settle_grace: ChronoDuration::from_std(settle_grace)
                .unwrap_or_else(|_| ChronoDuration::hours(1)),
            settled_retention: ChronoDuration::seconds(DEFAULT_SETTLED_RETENTION_SECS as i64),
        }
    }

    /// Forget settled markets this long after they settle
    #[must_use]
    pub fn with_settled_retention(mut self, retention: Duration) -> Self {
        self.settled_retention =
            ChronoDuration::from_std(retention).unwrap_or_else(|_| ChronoDuration::days(1));
        self
    }

    /// Current Active Set; never blocks, never observes a partial update
    #[must_use]
    pub fn snapshot(&self) -> Arc<ActiveSet> {
        self.active.load_full()
    }

    /// Subscribe to diffs published after each changing reconciliation
    #[must_use]
    pub fn subscribe_diffs(&self) -> broadcast::Receiver<Arc<RegistryDiff>> {
        self.diffs.subscribe()
    }

    /// Any known market, tracked or not
    #[must_use]
    pub fn market(&self, ticker: &str) -> Option<Market> {
        self.state.lock().known.get(ticker).cloned()
    }

    /// Count of markets remembered, including settled ones not yet pruned
    #[must_use]
    pub fn len_known(&self) -> usize {
        self.state.lock().known.len()
    }

    /// Apply a discovery batch and publish the resulting Active Set
    pub fn reconcile(&self, batch: DiscoveryBatch) -> RegistryDiff {
        let mut state = self.state.lock();
        let previous = self.active.load_full();
        let mut diff = RegistryDiff::default();

        let listed: FxHashSet<String> = batch.markets.iter().map(|m| m.ticker.clone()).collect();
        let settle_before = batch.now - self.settle_grace;

        for incoming in batch.markets {
            match state.known.get_mut(&incoming.ticker) {
                // Already past settlement; also keeps pruned markets from returning
                None if incoming.expires_at().is_some_and(|at| at < settle_before) => {
                    debug!(ticker = %incoming.ticker, "Ignoring listing already past settlement");
                }
                None => {
                    diff.transitions.push(StatusChange {
                        ticker: incoming.ticker.clone(),
                        from: MarketStatus::Discovered,
                        to: MarketStatus::Active,
                    });
                    let market = Market {
                        status: MarketStatus::Active,
                        ..incoming
                    };
                    state.known.insert(market.ticker.clone(), market);
                }
                Some(existing) if existing.status == MarketStatus::Settled => {
                    debug!(ticker = %existing.ticker, "Ignoring settled market still listed");
                }
                Some(existing) => {
                    if !existing.same_listing(&incoming) {
                        diff.updated.push(existing.ticker.clone());
                        *existing = Market {
                            status: existing.status,
                            ..incoming
                        };
                    }
                }
            }
        }

        let mut tickers: Vec<&String> = state.known.keys().collect();
        tickers.sort();
        let mut moves = Vec::new();
        for ticker in tickers {
            let market = &state.known[ticker];
            if !market.status.is_tracked() || listed.contains(ticker) {
                continue;
            }
            let expired = market.expires_at().is_some_and(|at| at < settle_before);
            let next = if expired {
                MarketStatus::Settled
            } else if market.status == MarketStatus::Active
                && batch.covered.contains(&market.category)
            {
                MarketStatus::Closing
            } else {
                continue;
            };
            moves.push((ticker.clone(), market.status, next));
        }
        for (ticker, from, to) in moves {
            if !from.can_transition_to(to) {
                continue;
            }
            if let Some(market) = state.known.get_mut(&ticker) {
                market.status = to;
            }
            if to == MarketStatus::Settled {
                state.settled_at.insert(ticker.clone(), batch.now);
            }
            diff.transitions.push(StatusChange { ticker, from, to });
        }
        self.prune_settled(&mut state, batch.now);

        if diff.is_empty() {
            diff.version = previous.version();
            return diff;
        }

        let next_tickers: BTreeSet<&String> = state
            .known
            .values()
            .filter(|m| m.status.is_tracked())
            .map(|m| &m.ticker)
            .collect();
        diff.added = next_tickers
            .iter()
            .filter(|t| !previous.contains(t.as_str()))
            .map(|t| (*t).clone())
            .collect();
        diff.removed = previous
            .tickers()
            .filter(|t| !next_tickers.contains(&t.to_string()))
            .map(str::to_string)
            .collect();
        diff.updated.retain(|t| next_tickers.contains(t));
        diff.updated.sort();

        state.version += 1;
        diff.version = state.version;
        let next = ActiveSet::from_markets(state.version, state.known.values().cloned());
        self.active.store(Arc::new(next));

        info!(
            version = diff.version,
            added = diff.added.len(),
            removed = diff.removed.len(),
            transitions = diff.transitions.len(),
            "Active set republished"
        );
        for change in &diff.transitions {
            debug!(ticker = %change.ticker, from = ?change.from, to = ?change.to, "Lifecycle transition");
        }

        // No subscribers is fine
        let _ = self.diffs.send(Arc::new(diff.clone()));
        diff
    }

    /// Drop settled markets past retention; they are already out of the Active Set
    fn prune_settled(&self, state: &mut RegistryState, now: DateTime<Utc>) {
        let forget_before = now - self.settled_retention;
        let expired: Vec<String> = state
            .settled_at
            .iter()
            .filter(|(_, at)| **at < forget_before)
            .map(|(ticker, _)| ticker.clone())
            .collect();
        for ticker in &expired {
            state.settled_at.remove(ticker);
            state.known.remove(ticker);
        }
        if !expired.is_empty() {
            debug!(pruned = expired.len(), "Forgot settled markets");
        }
    }
}
