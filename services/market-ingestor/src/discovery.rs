//! Periodic catalog reconciliation
//!
//! Lists open markets per tracked category, classifies them and hands the
//! result to the registry. A category that fails to list is left out of the
//! covered set, so its markets keep their current state until a later cycle
//! succeeds.

use crate::catalog::{classify, classify_ticker, query_series};
use crate::health::ComponentStats;
use crate::rate_limiter::{Acquire, TokenBucket};
use crate::registry::{DiscoveryBatch, MarketRegistry, RegistryDiff};
use crate::supervisor::Shutdown;
use crate::upstream::{CatalogClient, ListedMarket, MarketPage, with_timeout};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use services_common::constants::{discovery, upstream};
use services_common::{Category, IngestError, IngestResult, Market, MarketStatus};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Discovery cycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    /// Waiting for the next cycle
    Idle,
    /// Listing the catalog
    Fetching,
    /// Applying the listing to the registry
    Reconciling,
}

/// Discovery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Seconds between cycles
    pub interval_secs: u64,
    /// Categories to track
    pub categories: Vec<Category>,
    /// Retries of one page after a rate-limit rejection
    pub max_page_retries: u32,
    /// Hard stop on pages per series; a listing cut short fails its category
    pub max_pages: u32,
    /// Grace after expiry before an unlisted market is settled
    pub settle_grace_secs: u64,
    /// How long a settled market is remembered
    pub settled_retention_secs: u64,
    /// Deadline for one page request
    pub request_timeout_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval_secs: discovery::DEFAULT_INTERVAL_SECS,
            categories: Category::ALL.to_vec(),
            max_page_retries: discovery::DEFAULT_MAX_PAGE_RETRIES,
            max_pages: discovery::DEFAULT_MAX_PAGES,
            settle_grace_secs: discovery::DEFAULT_SETTLE_GRACE_SECS,
            settled_retention_secs: discovery::DEFAULT_SETTLED_RETENTION_SECS,
            request_timeout_secs: upstream::DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

/// Result of one cycle
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Categories listed completely
    pub covered: BTreeSet<Category>,
    /// Categories that failed, with the reason
    pub failed: BTreeMap<Category, IngestError>,
    /// Markets returned by the catalog and classified
    pub fetched: usize,
    /// Registry change applied
    pub diff: RegistryDiff,
}

/// Catalog poller feeding the registry
pub struct MarketDiscovery {
    catalog: Arc<dyn CatalogClient>,
    registry: Arc<MarketRegistry>,
    bucket: Arc<TokenBucket>,
    stats: Arc<ComponentStats>,
    config: DiscoveryConfig,
    state: Mutex<DiscoveryState>,
    wake: Notify,
}

impl std::fmt::Debug for MarketDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDiscovery")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl MarketDiscovery {
    /// Build discovery over `catalog`, spending from `bucket`
    #[must_use]
    pub fn new(
        catalog: Arc<dyn CatalogClient>,
        registry: Arc<MarketRegistry>,
        bucket: Arc<TokenBucket>,
        stats: Arc<ComponentStats>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            catalog,
            registry,
            bucket,
            stats,
            config,
            state: Mutex::new(DiscoveryState::Idle),
            wake: Notify::new(),
        }
    }

    /// Current phase
    #[must_use]
    pub fn state(&self) -> DiscoveryState {
        *self.state.lock()
    }

    /// Run a cycle now instead of waiting for the interval
    pub fn trigger(&self) {
        self.wake.notify_one();
    }

    /// Cycle at startup, then on the interval or on `trigger`
    pub async fn run(self: Arc<Self>, shutdown: Shutdown) -> IngestResult<()> {
        let interval = Duration::from_secs(self.config.interval_secs.max(1));
        loop {
            let report = self.run_cycle().await;
            info!(
                covered = report.covered.len(),
                failed = report.failed.len(),
                fetched = report.fetched,
                added = report.diff.added.len(),
                removed = report.diff.removed.len(),
                version = report.diff.version,
                "Discovery cycle complete"
            );

            tokio::select! {
                biased;
                () = shutdown.wait() => {
                    info!("Market discovery stopping");
                    return Ok(());
                }
                () = self.wake.notified() => debug!("Discovery triggered"),
                () = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// List every category and reconcile the registry
    pub async fn run_cycle(&self) -> CycleReport {
        self.set_state(DiscoveryState::Fetching);
        let mut report = CycleReport::default();
        let mut markets = Vec::new();

        for &category in &self.config.categories {
            match self.fetch_category(category).await {
                Ok(found) => {
                    debug!(%category, markets = found.len(), "Category listed");
                    self.stats.add("markets_found", found.len() as u64);
                    report.covered.insert(category);
                    markets.extend(found);
                }
                Err(e) => {
                    let e = match e {
                        e @ IngestError::DiscoveryPartialFailure { .. } => e,
                        e => IngestError::DiscoveryPartialFailure {
                            category: category.to_string(),
                            reason: e.to_string(),
                        },
                    };
                    error!(%category, error = %e, "Category listing failed, keeping its markets as they are");
                    self.stats.record_failure();
                    report.failed.insert(category, e);
                }
            }
        }
        report.fetched = markets.len();

        self.set_state(DiscoveryState::Reconciling);
        report.diff = self.registry.reconcile(DiscoveryBatch {
            markets,
            covered: report.covered.clone(),
            now: Utc::now(),
        });
        if !report.covered.is_empty() {
            self.stats.record_success();
        }
        self.stats.incr("cycles");
        self.set_state(DiscoveryState::Idle);
        report
    }

    fn set_state(&self, state: DiscoveryState) {
        *self.state.lock() = state;
    }

    async fn fetch_category(&self, category: Category) -> IngestResult<Vec<Market>> {
        let mut found = Vec::new();
        for series in query_series(category) {
            let max_pages = self.config.max_pages.max(1);
            let mut cursor: Option<String> = None;
            let mut pages = 0;
            loop {
                if pages == max_pages {
                    warn!(%category, series, max_pages, "Catalog still paging at the page cap");
                    return Err(IngestError::DiscoveryPartialFailure {
                        category: category.to_string(),
                        reason: format!("page cap of {max_pages} reached on {series}"),
                    });
                }
                let page = self.fetch_page(series, cursor.as_deref()).await?;
                pages += 1;
                found.extend(
                    page.markets
                        .into_iter()
                        .filter_map(|listed| to_market(listed, series, category)),
                );
                match page.cursor.filter(|c| !c.is_empty()) {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }
        }
        Ok(found)
    }

    async fn fetch_page(&self, series: &str, cursor: Option<&str>) -> IngestResult<MarketPage> {
        let timeout = Duration::from_secs(self.config.request_timeout_secs.max(1));
        let mut retries = 0;
        loop {
            match self.bucket.acquire(1, timeout).await {
                Acquire::Granted => {}
                Acquire::Wait(wait) => {
                    tokio::time::sleep(wait).await;
                    continue;
                }
                Acquire::Unsatisfiable => {
                    return Err(IngestError::Config("discovery budget has zero capacity".into()));
                }
            }

            match with_timeout(timeout, "list markets", self.catalog.list_markets(series, cursor)).await {
                Ok(page) => {
                    self.bucket.record_success();
                    return Ok(page);
                }
                Err(IngestError::RateLimitRejected { retry_after }) if retries < self.config.max_page_retries => {
                    self.bucket.record_rejection();
                    self.stats.incr("rate_limited");
                    let wait = retry_after.unwrap_or_else(|| retry_delay(retries));
                    warn!(series, retries, wait_ms = wait.as_millis() as u64, "Catalog page rate limited, retrying");
                    retries += 1;
                    tokio::time::sleep(wait).await;
                }
                Err(e) => {
                    if e.is_rate_limited() {
                        self.bucket.record_rejection();
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// Exponential wait for a throttled page when the server gives no hint
fn retry_delay(retries: u32) -> Duration {
    Duration::from_secs(
        1u64.checked_shl(retries)
            .unwrap_or(u64::MAX)
            .min(discovery::MAX_RETRY_DELAY_SECS),
    )
}

/// Classify a listing; markets outside the tracked table yield `None`
fn to_market(listed: ListedMarket, queried: &str, category: Category) -> Option<Market> {
    let classified = listed
        .series_ticker
        .as_deref()
        .and_then(classify)
        .or_else(|| classify(queried))
        .or_else(|| classify_ticker(&listed.ticker))?;
    if classified != category {
        debug!(ticker = %listed.ticker, %classified, %category, "Listing classified outside its queried category");
    }
    Some(Market {
        ticker: listed.ticker,
        title: listed.title,
        event_ticker: listed.event_ticker,
        series_ticker: listed.series_ticker.unwrap_or_else(|| queried.to_string()),
        category: classified,
        status: MarketStatus::Discovered,
        close_time: listed.close_time,
        expiration_time: listed.expiration_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn listed(ticker: &str, series: Option<&str>) -> ListedMarket {
        ListedMarket {
            ticker: ticker.into(),
            title: ticker.into(),
            event_ticker: ticker.into(),
            series_ticker: series.map(Into::into),
            status: "open".into(),
            close_time: None,
            expiration_time: None,
        }
    }

    #[test]
    fn test_to_market_prefers_reported_series() {
        let market = to_market(listed("KXHIGHNY-25JAN01-B40", Some("KXHIGHNY")), "KXHIGHNY", Category::Weather)
            .unwrap();
        assert_eq!(market.category, Category::Weather);
        assert_eq!(market.series_ticker, "KXHIGHNY");
        assert_eq!(market.status, MarketStatus::Discovered);
    }

    #[test]
    fn test_to_market_falls_back_to_queried_series() {
        let market = to_market(listed("X-1", None), "KXNFLGAME", Category::Nfl).unwrap();
        assert_eq!(market.category, Category::Nfl);
        assert_eq!(market.series_ticker, "KXNFLGAME");
    }

    #[rstest]
    #[case::first(0, 1)]
    #[case::doubling(3, 8)]
    #[case::capped(6, 60)]
    #[case::past_shift_width(64, 60)]
    #[case::max(u32::MAX, 60)]
    fn test_retry_delay_doubles_and_caps(#[case] retries: u32, #[case] secs: u64) {
        assert_eq!(retry_delay(retries), Duration::from_secs(secs));
    }

    #[test]
    fn test_to_market_ignores_unknown_series() {
        assert!(to_market(listed("FOO-1", Some("FOO")), "FOO", Category::Nfl).is_none());
    }
}
