//! Default values shared by the ingestion services
//!
//! Single source of truth for tunables; every one of them is overridable
//! through configuration.

/// Upstream API defaults
pub mod upstream {
    /// REST base URL for the trade API v2
    pub const DEFAULT_REST_BASE_URL: &str = "https://api.elections.kalshi.com/trade-api/v2";
    /// WebSocket endpoint for the trade API v2
    pub const DEFAULT_WS_URL: &str = "wss://api.elections.kalshi.com/trade-api/ws/v2";
    /// Per-call timeout in seconds
    pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
    /// Page size for catalog listing
    pub const DEFAULT_PAGE_LIMIT: u32 = 200;
    /// Orderbook depth requested by the poller
    pub const DEFAULT_ORDERBOOK_DEPTH: u32 = 10;
    /// Recent trades requested per market per poll
    pub const DEFAULT_TRADES_LIMIT: u32 = 50;
    /// Session lifetime assumed for static API keys
    pub const DEFAULT_SESSION_TTL_SECS: u64 = 3600;
    /// Refresh a session this long before it expires
    pub const DEFAULT_SESSION_REFRESH_MARGIN_SECS: u64 = 60;
}

/// Rate budget defaults
pub mod rate {
    /// REST requests allowed per minute
    pub const DEFAULT_REQUESTS_PER_MINUTE: u32 = 100;
    /// Multiplicative decay applied on a 429
    pub const DEFAULT_DECAY_FACTOR: f64 = 0.5;
    /// Consecutive successes needed before recovering
    pub const DEFAULT_RECOVERY_THRESHOLD: u32 = 20;
    /// Lowest refill rate, as a fraction of the configured rate
    pub const DEFAULT_FLOOR_RATIO: f64 = 0.1;
}

/// Discovery defaults
pub mod discovery {
    /// Seconds between catalog reconciliations
    pub const DEFAULT_INTERVAL_SECS: u64 = 300;
    /// Retries of a single page after a 429
    pub const DEFAULT_MAX_PAGE_RETRIES: u32 = 3;
    /// Grace period after expiry before a market is considered settled
    pub const DEFAULT_SETTLE_GRACE_SECS: u64 = 3600;
    /// Ceiling on the wait between retries of a throttled page
    pub const MAX_RETRY_DELAY_SECS: u64 = 60;
    /// Pages listed per series before the category is reported incomplete
    pub const DEFAULT_MAX_PAGES: u32 = 50;
    /// How long a settled market is remembered before it is forgotten
    pub const DEFAULT_SETTLED_RETENTION_SECS: u64 = 86_400;
}

/// Stream defaults
pub mod stream {
    /// Base reconnect delay in milliseconds
    pub const DEFAULT_BACKOFF_BASE_MS: u64 = 5000;
    /// Reconnect delay ceiling in milliseconds
    pub const DEFAULT_BACKOFF_MAX_MS: u64 = 300_000;
    /// Attempts before the stream is reported degraded
    pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
    /// Keepalive ping interval in seconds
    pub const DEFAULT_KEEPALIVE_SECS: u64 = 30;
    /// Pause after reconnect attempts are exhausted
    pub const DEFAULT_DEGRADED_COOLDOWN_SECS: u64 = 60;
    /// Silence tolerated before forcing a reconnect
    pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 90;
    /// Tickers per subscribe command
    pub const DEFAULT_SUBSCRIBE_BATCH: usize = 100;
}

/// Poller defaults
pub mod poll {
    /// Seconds between poll ticks
    pub const DEFAULT_TICK_SECS: u64 = 3;
    /// Staleness above which coverage is reported degraded
    pub const DEFAULT_MAX_STALENESS_SECS: u64 = 300;
}

/// Sink defaults
pub mod sink {
    /// Bounded event queue capacity
    pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;
    /// Events per persistence batch
    pub const DEFAULT_BATCH_SIZE: usize = 500;
    /// Flush interval in milliseconds
    pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1000;
    /// Events retained while persistence is unavailable
    pub const DEFAULT_RETRY_BUFFER: usize = 50_000;
}

/// Health defaults
pub mod health {
    /// Seconds between health samples
    pub const DEFAULT_CADENCE_SECS: u64 = 60;
    /// Activity older than this is stale
    pub const DEFAULT_STALE_AFTER_SECS: u64 = 600;
    /// No success for this long means down
    pub const DEFAULT_DOWN_AFTER_SECS: u64 = 1800;
    /// Failure ratio above which a component is degraded
    pub const DEFAULT_MAX_FAILURE_RATIO: f64 = 0.2;
}

/// Supervisor defaults
pub mod supervisor {
    /// Cooldown before restarting a failed loop
    pub const DEFAULT_RESTART_COOLDOWN_SECS: u64 = 5;
}
