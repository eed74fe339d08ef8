//! Service configuration
//!
//! Layered from an optional file and `INGESTOR__*` environment variables,
//! e.g. `INGESTOR__POLLER__TICK_SECS=5`.

use crate::discovery::DiscoveryConfig;
use crate::health::HealthConfig;
use crate::poller::PollerConfig;
use crate::rate_limiter::RateLimitsConfig;
use crate::sink::SinkConfig;
use crate::stream::StreamConfig;
use serde::{Deserialize, Serialize};
use services_common::constants::{supervisor, upstream};
use services_common::{IngestError, IngestResult};
use std::time::Duration;

/// Upstream endpoints and credentials
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// REST base URL including the API version path
    pub rest_base_url: String,
    /// WebSocket feed URL
    pub ws_url: String,
    /// API key presented as a bearer token
    pub api_key: String,
    /// Lifetime assumed for a session before it is re-issued
    pub session_ttl_secs: u64,
    /// Refresh this long before expiry
    pub session_refresh_margin_secs: u64,
    /// Deadline for one REST call
    pub request_timeout_secs: u64,
    /// Catalog page size
    pub page_limit: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            rest_base_url: upstream::DEFAULT_REST_BASE_URL.to_string(),
            ws_url: upstream::DEFAULT_WS_URL.to_string(),
            api_key: String::new(),
            session_ttl_secs: upstream::DEFAULT_SESSION_TTL_SECS,
            session_refresh_margin_secs: upstream::DEFAULT_SESSION_REFRESH_MARGIN_SECS,
            request_timeout_secs: upstream::DEFAULT_REQUEST_TIMEOUT_SECS,
            page_limit: upstream::DEFAULT_PAGE_LIMIT,
        }
    }
}

/// Loop supervision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Pause before restarting a loop that failed
    pub restart_cooldown_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_cooldown_secs: supervisor::DEFAULT_RESTART_COOLDOWN_SECS,
        }
    }
}

impl SupervisorConfig {
    /// Cooldown as a duration
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.restart_cooldown_secs)
    }
}

/// Log output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "market_ingestor=info,services_common=info".to_string(),
            json: false,
        }
    }
}

/// Health endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Serve `/health`
    pub enabled: bool,
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 8081,
        }
    }
}

impl ServerConfig {
    /// `host:port`
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Everything the ingestion service needs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestorConfig {
    /// Upstream endpoints
    pub upstream: UpstreamConfig,
    /// Catalog discovery
    pub discovery: DiscoveryConfig,
    /// Streaming connection
    pub stream: StreamConfig,
    /// REST poll fallback
    pub poller: PollerConfig,
    /// Budgets per endpoint class
    pub rate_limits: RateLimitsConfig,
    /// Event delivery
    pub sink: SinkConfig,
    /// Health thresholds
    pub health: HealthConfig,
    /// Loop supervision
    pub supervisor: SupervisorConfig,
    /// Logging
    pub logging: LoggingConfig,
    /// Health endpoint
    pub server: ServerConfig,
}

impl IngestorConfig {
    /// Load from `path` (if any) overlaid with `INGESTOR__` environment variables
    pub fn load(path: Option<&str>) -> IngestResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("INGESTOR")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("discovery.categories")
                    .with_list_parse_key("stream.channels")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| IngestError::Config(e.to_string()))?;

        let config: Self = settings
            .try_deserialize()
            .map_err(|e| IngestError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the loops cannot run with
    pub fn validate(&self) -> IngestResult<()> {
        let fail = |msg: String| Err(IngestError::Config(msg));

        for (class, budget) in [
            ("poll", &self.rate_limits.poll),
            ("discovery", &self.rate_limits.discovery),
            ("historical", &self.rate_limits.historical),
        ] {
            if let Err(e) = budget.validate() {
                return fail(format!("rate_limits.{class}: {e}"));
            }
        }
        if self.discovery.categories.is_empty() {
            return fail("discovery.categories must not be empty".into());
        }
        if self.discovery.interval_secs == 0 {
            return fail("discovery.interval_secs must be positive".into());
        }
        if self.poller.tick_secs == 0 {
            return fail("poller.tick_secs must be positive".into());
        }
        if self.poller.requests_per_market() > self.rate_limits.poll.capacity {
            return fail("rate_limits.poll.capacity is smaller than one market visit".into());
        }
        if self.stream.channels.is_empty() {
            return fail("stream.channels must not be empty".into());
        }
        if self.stream.keepalive_secs == 0 || self.stream.idle_timeout_secs <= self.stream.keepalive_secs {
            return fail("stream.idle_timeout_secs must exceed a positive keepalive_secs".into());
        }
        if self.stream.backoff_base_ms == 0 || self.stream.backoff_max_ms < self.stream.backoff_base_ms {
            return fail("stream backoff must satisfy 0 < base <= max".into());
        }
        if self.stream.subscribe_batch_size == 0 {
            return fail("stream.subscribe_batch_size must be positive".into());
        }
        if self.sink.queue_capacity == 0 || self.sink.batch_size == 0 || self.sink.flush_interval_ms == 0 {
            return fail("sink queue_capacity, batch_size and flush_interval_ms must be positive".into());
        }
        if self.health.cadence_secs == 0 {
            return fail("health.cadence_secs must be positive".into());
        }
        if !(0.0..=1.0).contains(&self.health.max_failure_ratio) {
            return fail("health.max_failure_ratio must lie in [0, 1]".into());
        }
        if self.upstream.session_ttl_secs <= self.upstream.session_refresh_margin_secs {
            return fail("upstream.session_ttl_secs must exceed the refresh margin".into());
        }
        Ok(())
    }
}
