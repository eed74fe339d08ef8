//! Component counters and the passive health aggregator
//!
//! Components write to their own [`ComponentStats`]. The aggregator only
//! reads them on a fixed cadence and publishes derived snapshots, so a
//! sampling problem can never stall ingestion.

use crate::supervisor::Shutdown;
use arc_swap::ArcSwap;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use services_common::constants::health;
use services_common::{ComponentStatus, HealthSnapshot};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// Sentinel for "never"
const NEVER: u64 = 0;

/// Counters and timestamps owned by one component
#[derive(Debug)]
pub struct ComponentStats {
    name: &'static str,
    successes: AtomicU64,
    failures: AtomicU64,
    consecutive_failures: AtomicU64,
    last_success_ms: AtomicU64,
    last_activity_ms: AtomicU64,
    degraded: AtomicBool,
    counters: RwLock<FxHashMap<&'static str, AtomicU64>>,
}

impl ComponentStats {
    /// Fresh stats for `name`
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            last_success_ms: AtomicU64::new(NEVER),
            last_activity_ms: AtomicU64::new(NEVER),
            degraded: AtomicBool::new(false),
            counters: RwLock::new(FxHashMap::default()),
        }
    }

    /// Component name
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Record a successful operation now
    pub fn record_success(&self) {
        self.record_success_at(Utc::now());
    }

    /// Record a successful operation at `at`
    pub fn record_success_at(&self, at: DateTime<Utc>) {
        let ms = to_ms(at);
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.last_success_ms.store(ms, Ordering::Relaxed);
        self.last_activity_ms.store(ms, Ordering::Relaxed);
    }

    /// Record a failed operation now
    pub fn record_failure(&self) {
        self.record_failure_at(Utc::now());
    }

    /// Record a failed operation at `at`
    pub fn record_failure_at(&self, at: DateTime<Utc>) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        self.last_activity_ms.store(to_ms(at), Ordering::Relaxed);
    }

    /// Note activity that is neither a success nor a failure
    pub fn touch(&self) {
        self.last_activity_ms.store(to_ms(Utc::now()), Ordering::Relaxed);
    }

    /// Flag or clear a self-reported degraded condition
    pub fn set_degraded(&self, degraded: bool) {
        self.degraded.store(degraded, Ordering::Relaxed);
    }

    /// Self-reported degraded flag
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Increment a named counter
    pub fn incr(&self, counter: &'static str) {
        self.add(counter, 1);
    }

    /// Add to a named counter
    pub fn add(&self, counter: &'static str, n: u64) {
        {
            let counters = self.counters.read();
            if let Some(value) = counters.get(counter) {
                value.fetch_add(n, Ordering::Relaxed);
                return;
            }
        }
        let mut counters = self.counters.write();
        counters
            .entry(counter)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    /// Current value of a named counter
    #[must_use]
    pub fn counter(&self, counter: &str) -> u64 {
        self.counters
            .read()
            .get(counter)
            .map_or(0, |v| v.load(Ordering::Relaxed))
    }

    /// Successful operations so far
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Failed operations so far
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Failures since the last success
    #[must_use]
    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Last successful operation
    #[must_use]
    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        from_ms(self.last_success_ms.load(Ordering::Relaxed))
    }

    /// Last operation of any kind
    #[must_use]
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        from_ms(self.last_activity_ms.load(Ordering::Relaxed))
    }

    fn counters_snapshot(&self) -> BTreeMap<String, u64> {
        let mut out: BTreeMap<String, u64> = self
            .counters
            .read()
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.load(Ordering::Relaxed)))
            .collect();
        out.insert("successes".into(), self.successes());
        out.insert("failures".into(), self.failures());
        out
    }
}

fn to_ms(at: DateTime<Utc>) -> u64 {
    u64::try_from(at.timestamp_millis()).unwrap_or(NEVER).max(1)
}

fn from_ms(ms: u64) -> Option<DateTime<Utc>> {
    if ms == NEVER {
        return None;
    }
    i64::try_from(ms)
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

/// Status derivation thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Sampling cadence in seconds
    pub cadence_secs: u64,
    /// Activity older than this is stale
    pub stale_after_secs: u64,
    /// No success for this long means down
    pub down_after_secs: u64,
    /// Failure ratio between samples above which a component is degraded
    pub max_failure_ratio: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            cadence_secs: health::DEFAULT_CADENCE_SECS,
            stale_after_secs: health::DEFAULT_STALE_AFTER_SECS,
            down_after_secs: health::DEFAULT_DOWN_AFTER_SECS,
            max_failure_ratio: health::DEFAULT_MAX_FAILURE_RATIO,
        }
    }
}

/// Samples component stats into health snapshots
pub struct HealthAggregator {
    components: Vec<Arc<ComponentStats>>,
    config: HealthConfig,
    started_at: DateTime<Utc>,
    previous: Mutex<FxHashMap<&'static str, (u64, u64)>>,
    published: ArcSwap<Vec<HealthSnapshot>>,
}

impl std::fmt::Debug for HealthAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthAggregator")
            .field("components", &self.components.len())
            .field("config", &self.config)
            .finish()
    }
}

impl HealthAggregator {
    /// Aggregator over `components`, started now
    #[must_use]
    pub fn new(components: Vec<Arc<ComponentStats>>, config: HealthConfig) -> Self {
        Self::new_at(components, config, Utc::now())
    }

    /// Aggregator with an explicit start time
    #[must_use]
    pub fn new_at(
        components: Vec<Arc<ComponentStats>>,
        config: HealthConfig,
        started_at: DateTime<Utc>,
    ) -> Self {
        let aggregator = Self {
            components,
            config,
            started_at,
            previous: Mutex::new(FxHashMap::default()),
            published: ArcSwap::from_pointee(Vec::new()),
        };
        aggregator.sample(started_at);
        aggregator
    }

    /// Latest published snapshots; lock-free and always answers
    #[must_use]
    pub fn get_health(&self) -> Arc<Vec<HealthSnapshot>> {
        self.published.load_full()
    }

    /// Worst status across components
    #[must_use]
    pub fn overall(&self) -> ComponentStatus {
        ComponentStatus::worst(self.get_health().iter().map(|s| s.status))
    }

    /// Recompute and publish snapshots for `now`
    pub fn sample(&self, now: DateTime<Utc>) -> Arc<Vec<HealthSnapshot>> {
        let mut previous = self.previous.lock();
        let snapshots: Vec<HealthSnapshot> = self
            .components
            .iter()
            .map(|stats| {
                let totals = (stats.successes(), stats.failures());
                let last = previous.insert(stats.name(), totals).unwrap_or((0, 0));
                let delta_ok = totals.0.saturating_sub(last.0);
                let delta_err = totals.1.saturating_sub(last.1);
                HealthSnapshot {
                    component: stats.name().to_string(),
                    status: self.derive(stats, now, delta_ok, delta_err),
                    last_success: stats.last_success(),
                    consecutive_failures: stats.consecutive_failures(),
                    counters: stats.counters_snapshot(),
                    sampled_at: now,
                }
            })
            .collect();
        let snapshots = Arc::new(snapshots);
        self.published.store(Arc::clone(&snapshots));
        snapshots
    }

    fn derive(
        &self,
        stats: &ComponentStats,
        now: DateTime<Utc>,
        delta_ok: u64,
        delta_err: u64,
    ) -> ComponentStatus {
        let age = |at: Option<DateTime<Utc>>| {
            (now - at.unwrap_or(self.started_at))
                .to_std()
                .unwrap_or(Duration::ZERO)
        };

        if age(stats.last_success()) > Duration::from_secs(self.config.down_after_secs) {
            return ComponentStatus::Down;
        }

        let stale = age(stats.last_activity()) > Duration::from_secs(self.config.stale_after_secs);
        let attempts = delta_ok + delta_err;
        let failing = attempts > 0
            && (delta_err as f64 / attempts as f64) > self.config.max_failure_ratio;

        if stale || failing || stats.is_degraded() {
            ComponentStatus::Degraded
        } else {
            ComponentStatus::Healthy
        }
    }

    /// Sample on the configured cadence until shutdown
    pub async fn run(self: Arc<Self>, shutdown: Shutdown) -> services_common::IngestResult<()> {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.cadence_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshots = self.sample(Utc::now());
                    for snapshot in snapshots.iter() {
                        if snapshot.status == ComponentStatus::Healthy {
                            continue;
                        }
                        warn!(
                            component = %snapshot.component,
                            status = ?snapshot.status,
                            consecutive_failures = snapshot.consecutive_failures,
                            "Component unhealthy"
                        );
                    }
                    info!(overall = ?self.overall(), components = snapshots.len(), "Health sampled");
                }
                () = shutdown.wait() => {
                    info!("Health aggregator stopping");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use rstest::*;

    #[fixture]
    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 1, 12, 0, 0).unwrap()
    }

    fn config() -> HealthConfig {
        HealthConfig {
            cadence_secs: 60,
            stale_after_secs: 600,
            down_after_secs: 1800,
            max_failure_ratio: 0.2,
        }
    }

    fn status_of(snapshots: &[HealthSnapshot], name: &str) -> ComponentStatus {
        snapshots
            .iter()
            .find(|s| s.component == name)
            .map(|s| s.status)
            .unwrap()
    }

    #[rstest]
    fn test_fresh_component_is_healthy(t0: DateTime<Utc>) {
        let stats = Arc::new(ComponentStats::new("stream"));
        let aggregator = HealthAggregator::new_at(vec![stats.clone()], config(), t0);
        stats.record_success_at(t0 + ChronoDuration::seconds(10));
        let snapshots = aggregator.sample(t0 + ChronoDuration::seconds(60));
        assert_eq!(status_of(&snapshots, "stream"), ComponentStatus::Healthy);
        assert_eq!(snapshots[0].counters["successes"], 1);
    }

    #[rstest]
    fn test_stale_component_is_degraded(t0: DateTime<Utc>) {
        let stats = Arc::new(ComponentStats::new("poller"));
        let aggregator = HealthAggregator::new_at(vec![stats.clone()], config(), t0);
        stats.record_success_at(t0);
        let snapshots = aggregator.sample(t0 + ChronoDuration::seconds(700));
        assert_eq!(status_of(&snapshots, "poller"), ComponentStatus::Degraded);
    }

    #[rstest]
    fn test_silent_component_is_down(t0: DateTime<Utc>) {
        let stats = Arc::new(ComponentStats::new("discovery"));
        let aggregator = HealthAggregator::new_at(vec![stats.clone()], config(), t0);
        stats.record_failure_at(t0 + ChronoDuration::seconds(1900));
        let snapshots = aggregator.sample(t0 + ChronoDuration::seconds(1950));
        assert_eq!(status_of(&snapshots, "discovery"), ComponentStatus::Down);
        assert_eq!(snapshots[0].consecutive_failures, 1);
    }

    #[rstest]
    fn test_failure_ratio_uses_delta_since_last_sample(t0: DateTime<Utc>) {
        let stats = Arc::new(ComponentStats::new("poller"));
        let aggregator = HealthAggregator::new_at(vec![stats.clone()], config(), t0);
        let at = t0 + ChronoDuration::seconds(30);
        for _ in 0..5 {
            stats.record_success_at(at);
        }
        for _ in 0..5 {
            stats.record_failure_at(at);
        }
        let snapshots = aggregator.sample(t0 + ChronoDuration::seconds(60));
        assert_eq!(status_of(&snapshots, "poller"), ComponentStatus::Degraded);

        // Only successes in the next window
        for _ in 0..10 {
            stats.record_success_at(t0 + ChronoDuration::seconds(90));
        }
        let snapshots = aggregator.sample(t0 + ChronoDuration::seconds(120));
        assert_eq!(status_of(&snapshots, "poller"), ComponentStatus::Healthy);
    }

    #[rstest]
    fn test_degraded_flag_and_overall(t0: DateTime<Utc>) {
        let stream = Arc::new(ComponentStats::new("stream"));
        let poller = Arc::new(ComponentStats::new("poller"));
        let aggregator =
            HealthAggregator::new_at(vec![stream.clone(), poller.clone()], config(), t0);
        stream.record_success_at(t0);
        poller.record_success_at(t0);
        stream.set_degraded(true);
        aggregator.sample(t0 + ChronoDuration::seconds(5));
        assert_eq!(aggregator.overall(), ComponentStatus::Degraded);
        assert_eq!(aggregator.get_health().len(), 2);
    }

    #[test]
    fn test_named_counters() {
        let stats = ComponentStats::new("stream");
        stats.incr("dropped_unsubscribed");
        stats.add("dropped_unsubscribed", 2);
        assert_eq!(stats.counter("dropped_unsubscribed"), 3);
        assert_eq!(stats.counter("missing"), 0);
    }
}
