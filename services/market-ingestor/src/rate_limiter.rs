//! Adaptive token-bucket rate limiting, one bucket per endpoint class
//!
//! Refill slows multiplicatively when the upstream throttles us and
//! recovers additively after a run of successes.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use services_common::constants::rate;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Tolerance for float accumulation in refill arithmetic
const TOKEN_EPSILON: f64 = 1e-9;

/// Upstream endpoint classes with independent budgets
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointClass {
    /// Per-market REST polling
    Poll,
    /// Catalog listing
    Discovery,
    /// Historical / backfill calls
    Historical,
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Poll => "poll",
            Self::Discovery => "discovery",
            Self::Historical => "historical",
        };
        f.write_str(name)
    }
}

/// Budget parameters for one bucket
///
/// Rates are expressed as tokens per `refill_interval_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateBudgetConfig {
    /// Maximum tokens held
    pub capacity: u32,
    /// Starting refill rate
    pub refill_tokens: f64,
    /// Interval the rate is expressed over
    pub refill_interval_ms: u64,
    /// Lowest rate reachable by decay
    pub floor: f64,
    /// Highest rate reachable by recovery
    pub ceiling: f64,
    /// Multiplier applied on rejection, in (0, 1]
    pub decay_factor: f64,
    /// Consecutive successes before one recovery step
    pub recovery_threshold: u32,
    /// Additive recovery step
    pub recovery_step: f64,
}

impl Default for RateBudgetConfig {
    fn default() -> Self {
        Self::per_minute(rate::DEFAULT_REQUESTS_PER_MINUTE)
    }
}

impl RateBudgetConfig {
    /// A budget of `requests` per minute with burst equal to one minute
    #[must_use]
    pub fn per_minute(requests: u32) -> Self {
        let per_minute = f64::from(requests);
        Self {
            capacity: requests,
            refill_tokens: per_minute,
            refill_interval_ms: 60_000,
            floor: (per_minute * rate::DEFAULT_FLOOR_RATIO).max(1.0),
            ceiling: per_minute,
            decay_factor: rate::DEFAULT_DECAY_FACTOR,
            recovery_threshold: rate::DEFAULT_RECOVERY_THRESHOLD,
            recovery_step: (per_minute * 0.05).max(1.0),
        }
    }

    /// Check the parameters describe a usable bucket
    pub fn validate(&self) -> Result<(), String> {
        if self.capacity == 0 {
            return Err("capacity must be positive".into());
        }
        if self.refill_interval_ms == 0 {
            return Err("refill_interval_ms must be positive".into());
        }
        if !(self.floor > 0.0) {
            return Err("floor must be positive".into());
        }
        if self.floor > self.ceiling {
            return Err(format!("floor {} exceeds ceiling {}", self.floor, self.ceiling));
        }
        if self.refill_tokens < self.floor || self.refill_tokens > self.ceiling {
            return Err("refill_tokens must lie within [floor, ceiling]".into());
        }
        if !(self.decay_factor > 0.0 && self.decay_factor <= 1.0) {
            return Err("decay_factor must lie in (0, 1]".into());
        }
        if self.recovery_threshold == 0 {
            return Err("recovery_threshold must be positive".into());
        }
        Ok(())
    }
}

/// Outcome of a non-blocking acquire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// Tokens were deducted
    Granted,
    /// Minimum wait until the request would be granted
    Wait(Duration),
    /// More tokens than the bucket can ever hold
    Unsatisfiable,
}

/// Observable bucket state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetSnapshot {
    /// Maximum tokens
    pub capacity: f64,
    /// Tokens currently available
    pub tokens: f64,
    /// Current refill rate per interval
    pub refill_rate: f64,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    rate: f64,
    last_refill: Instant,
    success_streak: u32,
}

/// Token bucket with adaptive refill
#[derive(Debug)]
pub struct TokenBucket {
    class: EndpointClass,
    config: RateBudgetConfig,
    interval_secs: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket
    #[must_use]
    pub fn new(class: EndpointClass, config: RateBudgetConfig) -> Self {
        Self::new_at(class, config, Instant::now())
    }

    /// Create a full bucket with an explicit clock origin
    #[must_use]
    pub fn new_at(class: EndpointClass, config: RateBudgetConfig, now: Instant) -> Self {
        let interval_secs = Duration::from_millis(config.refill_interval_ms).as_secs_f64();
        let state = BucketState {
            tokens: f64::from(config.capacity),
            rate: config.refill_tokens.clamp(config.floor, config.ceiling),
            last_refill: now,
            success_streak: 0,
        };
        Self {
            class,
            config,
            interval_secs,
            state: Mutex::new(state),
        }
    }

    /// Endpoint class served by this bucket
    #[must_use]
    pub const fn class(&self) -> EndpointClass {
        self.class
    }

    /// Try to take `n` tokens now
    pub fn try_acquire(&self, n: u32) -> Acquire {
        self.try_acquire_at(n, Instant::now())
    }

    /// Try to take `n` tokens at `now`
    pub fn try_acquire_at(&self, n: u32, now: Instant) -> Acquire {
        let needed = f64::from(n);
        if n > self.config.capacity {
            return Acquire::Unsatisfiable;
        }

        let mut state = self.state.lock();
        self.refill(&mut state, now);

        if state.tokens + TOKEN_EPSILON >= needed {
            state.tokens = (state.tokens - needed).max(0.0);
            return Acquire::Granted;
        }

        let secs = (needed - state.tokens) * self.interval_secs / state.rate;
        // Round up to whole milliseconds so a caller that sleeps the
        // returned duration is granted on the next attempt.
        let millis = (secs * 1000.0).ceil().max(1.0);
        Acquire::Wait(Duration::from_millis(millis as u64))
    }

    /// Acquire `n` tokens, sleeping while the wait is at most `max_wait`
    ///
    /// Returns `Granted`, or the outcome that made the caller give up.
    pub async fn acquire(&self, n: u32, max_wait: Duration) -> Acquire {
        loop {
            match self.try_acquire(n) {
                Acquire::Wait(wait) if wait <= max_wait => tokio::time::sleep(wait).await,
                outcome => return outcome,
            }
        }
    }

    /// Upstream throttled a call: decay the refill rate
    pub fn record_rejection(&self) {
        self.record_rejection_at(Instant::now());
    }

    /// Rejection with an explicit clock
    pub fn record_rejection_at(&self, now: Instant) {
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        let previous = state.rate;
        state.rate = (state.rate * self.config.decay_factor).max(self.config.floor);
        state.success_streak = 0;
        warn!(
            class = %self.class,
            previous_rate = previous,
            rate = state.rate,
            "Upstream rate limit hit, decaying refill rate"
        );
    }

    /// A call succeeded: count towards recovery
    pub fn record_success(&self) {
        self.record_success_at(Instant::now());
    }

    /// Success with an explicit clock
    pub fn record_success_at(&self, now: Instant) {
        let mut state = self.state.lock();
        state.success_streak += 1;
        if state.success_streak < self.config.recovery_threshold {
            return;
        }
        state.success_streak = 0;
        if state.rate >= self.config.ceiling {
            return;
        }
        self.refill(&mut state, now);
        state.rate = (state.rate + self.config.recovery_step).min(self.config.ceiling);
        debug!(class = %self.class, rate = state.rate, "Refill rate recovered");
    }

    /// Current state
    #[must_use]
    pub fn snapshot(&self) -> BudgetSnapshot {
        self.snapshot_at(Instant::now())
    }

    /// Current state at `now`
    #[must_use]
    pub fn snapshot_at(&self, now: Instant) -> BudgetSnapshot {
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        BudgetSnapshot {
            capacity: f64::from(self.config.capacity),
            tokens: state.tokens,
            refill_rate: state.rate,
        }
    }

    /// Tokens per second at the current rate
    #[must_use]
    pub fn rate_per_sec(&self) -> f64 {
        self.state.lock().rate / self.interval_secs
    }

    /// Configured capacity
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.config.capacity
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            let added = elapsed * state.rate / self.interval_secs;
            state.tokens = (state.tokens + added).min(f64::from(self.config.capacity));
            state.last_refill = now;
        }
    }
}

/// Per-class budgets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitsConfig {
    /// Per-market polling
    pub poll: RateBudgetConfig,
    /// Catalog listing
    pub discovery: RateBudgetConfig,
    /// Historical calls
    pub historical: RateBudgetConfig,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            poll: RateBudgetConfig::per_minute(rate::DEFAULT_REQUESTS_PER_MINUTE),
            discovery: RateBudgetConfig::per_minute(rate::DEFAULT_REQUESTS_PER_MINUTE / 2),
            historical: RateBudgetConfig::per_minute(rate::DEFAULT_REQUESTS_PER_MINUTE / 4),
        }
    }
}

/// Independent buckets per endpoint class
///
/// A 429 on one class never drains or slows another.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    poll: Arc<TokenBucket>,
    discovery: Arc<TokenBucket>,
    historical: Arc<TokenBucket>,
}

impl RateLimiter {
    /// Build all buckets from configuration
    #[must_use]
    pub fn new(config: &RateLimitsConfig) -> Self {
        Self {
            poll: Arc::new(TokenBucket::new(EndpointClass::Poll, config.poll.clone())),
            discovery: Arc::new(TokenBucket::new(
                EndpointClass::Discovery,
                config.discovery.clone(),
            )),
            historical: Arc::new(TokenBucket::new(
                EndpointClass::Historical,
                config.historical.clone(),
            )),
        }
    }

    /// Bucket for an endpoint class
    #[must_use]
    pub fn bucket(&self, class: EndpointClass) -> &Arc<TokenBucket> {
        match class {
            EndpointClass::Poll => &self.poll,
            EndpointClass::Discovery => &self.discovery,
            EndpointClass::Historical => &self.historical,
        }
    }
}
