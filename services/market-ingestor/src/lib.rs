//! Market Ingestor Service
//!
//! Discovers tracked prediction markets, streams their market data with a
//! rate-budgeted REST poll fallback, and delivers normalized events to a
//! persistence sink while publishing per-component health.

pub mod catalog;
pub mod clock;
pub mod config;
pub mod discovery;
pub mod exchanges;
pub mod health;
pub mod poller;
pub mod rate_limiter;
pub mod registry;
pub mod session;
pub mod sink;
pub mod stream;
pub mod supervisor;
pub mod upstream;

use crate::clock::MonotonicClock;
use crate::config::IngestorConfig;
use crate::discovery::MarketDiscovery;
use crate::health::{ComponentStats, HealthAggregator};
use crate::poller::PollFallback;
use crate::rate_limiter::{EndpointClass, RateLimiter};
use crate::registry::MarketRegistry;
use crate::session::{SessionCache, SessionProvider};
use crate::sink::{EventSink, PersistenceSink, SinkWriter, event_channel};
use crate::stream::StreamManager;
use crate::supervisor::{Shutdown, spawn_supervised};
use crate::upstream::{CatalogClient, MarketDataClient, StreamConnector};
use services_common::{ComponentStatus, HealthSnapshot, IngestResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// External collaborators the service is wired to
pub struct Upstream {
    /// Catalog listing for discovery
    pub catalog: Arc<dyn CatalogClient>,
    /// Per-market REST endpoints for the poller
    pub market_data: Arc<dyn MarketDataClient>,
    /// Streaming transport
    pub connector: Arc<dyn StreamConnector>,
    /// Session source shared by stream and poller
    pub sessions: Box<dyn SessionProvider>,
    /// Where events end up
    pub persistence: Arc<dyn PersistenceSink>,
}

/// Per-component stats handles
#[derive(Debug, Clone)]
pub struct ComponentHandles {
    /// Market discovery
    pub discovery: Arc<ComponentStats>,
    /// Stream manager
    pub stream: Arc<ComponentStats>,
    /// Poll fallback
    pub poller: Arc<ComponentStats>,
    /// Event sink writer
    pub sink: Arc<ComponentStats>,
    /// Health sampler itself; not part of the aggregate
    pub health: Arc<ComponentStats>,
}

impl ComponentHandles {
    fn new() -> Self {
        Self {
            discovery: Arc::new(ComponentStats::new("discovery")),
            stream: Arc::new(ComponentStats::new("stream")),
            poller: Arc::new(ComponentStats::new("poller")),
            sink: Arc::new(ComponentStats::new("sink")),
            health: Arc::new(ComponentStats::new("health")),
        }
    }
}

/// The assembled ingestion engine
pub struct IngestionService {
    config: IngestorConfig,
    registry: Arc<MarketRegistry>,
    limiter: RateLimiter,
    discovery: Arc<MarketDiscovery>,
    stream: Arc<StreamManager>,
    poller: Arc<PollFallback>,
    writer: Arc<SinkWriter>,
    events: EventSink,
    health: Arc<HealthAggregator>,
    stats: ComponentHandles,
    shutdown: Shutdown,
    writer_shutdown: Shutdown,
    producers: Vec<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for IngestionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionService")
            .field("running", &!self.producers.is_empty())
            .field("active_markets", &self.registry.snapshot().len())
            .finish_non_exhaustive()
    }
}

impl IngestionService {
    /// Wire every component; nothing runs until `start`
    pub fn new(config: IngestorConfig, upstream: Upstream) -> IngestResult<Self> {
        config.validate()?;

        let stats = ComponentHandles::new();
        let clock = MonotonicClock::new();
        let limiter = RateLimiter::new(&config.rate_limits);
        let registry = Arc::new(
            MarketRegistry::new(Duration::from_secs(config.discovery.settle_grace_secs))
                .with_settled_retention(Duration::from_secs(config.discovery.settled_retention_secs)),
        );
        let sessions = Arc::new(SessionCache::new(
            upstream.sessions,
            Duration::from_secs(config.upstream.session_refresh_margin_secs),
        ));
        let (events, writer) = event_channel(
            config.sink.clone(),
            upstream.persistence,
            Arc::clone(&stats.sink),
        );

        let discovery = Arc::new(MarketDiscovery::new(
            upstream.catalog,
            Arc::clone(&registry),
            Arc::clone(limiter.bucket(EndpointClass::Discovery)),
            Arc::clone(&stats.discovery),
            config.discovery.clone(),
        ));
        let stream = Arc::new(StreamManager::new(
            upstream.connector,
            Arc::clone(&sessions),
            Arc::clone(&registry),
            events.clone(),
            Arc::clone(&stats.stream),
            config.stream.clone(),
            clock,
        ));
        let poller = Arc::new(PollFallback::new(
            upstream.market_data,
            sessions,
            Arc::clone(&registry),
            Arc::clone(limiter.bucket(EndpointClass::Poll)),
            events.clone(),
            Arc::clone(&stats.poller),
            config.poller.clone(),
            clock,
        ));
        let health = Arc::new(HealthAggregator::new(
            vec![
                Arc::clone(&stats.discovery),
                Arc::clone(&stats.stream),
                Arc::clone(&stats.poller),
                Arc::clone(&stats.sink),
            ],
            config.health.clone(),
        ));

        Ok(Self {
            config,
            registry,
            limiter,
            discovery,
            stream,
            poller,
            writer: Arc::new(writer),
            events,
            health,
            stats,
            shutdown: Shutdown::new(),
            writer_shutdown: Shutdown::new(),
            producers: Vec::new(),
            writer_task: None,
        })
    }

    /// Spawn every loop under supervision
    pub fn start(&mut self) {
        if self.writer_task.is_some() {
            warn!("Ingestion service already started");
            return;
        }
        let cooldown = self.config.supervisor.cooldown();

        let writer = Arc::clone(&self.writer);
        let writer_shutdown = self.writer_shutdown.clone();
        self.writer_task = Some(spawn_supervised(
            "sink-writer",
            cooldown,
            self.writer_shutdown.clone(),
            Arc::clone(&self.stats.sink),
            move || Arc::clone(&writer).run(writer_shutdown.clone()),
        ));

        let discovery = Arc::clone(&self.discovery);
        let shutdown = self.shutdown.clone();
        self.producers.push(spawn_supervised(
            "discovery",
            cooldown,
            self.shutdown.clone(),
            Arc::clone(&self.stats.discovery),
            move || Arc::clone(&discovery).run(shutdown.clone()),
        ));

        let stream = Arc::clone(&self.stream);
        let shutdown = self.shutdown.clone();
        self.producers.push(spawn_supervised(
            "stream",
            cooldown,
            self.shutdown.clone(),
            Arc::clone(&self.stats.stream),
            move || Arc::clone(&stream).run(shutdown.clone()),
        ));

        let poller = Arc::clone(&self.poller);
        let shutdown = self.shutdown.clone();
        self.producers.push(spawn_supervised(
            "poller",
            cooldown,
            self.shutdown.clone(),
            Arc::clone(&self.stats.poller),
            move || Arc::clone(&poller).run(shutdown.clone()),
        ));

        let health = Arc::clone(&self.health);
        let shutdown = self.shutdown.clone();
        self.producers.push(spawn_supervised(
            "health",
            cooldown,
            self.shutdown.clone(),
            Arc::clone(&self.stats.health),
            move || Arc::clone(&health).run(shutdown.clone()),
        ));

        info!(
            categories = ?self.config.discovery.categories,
            poll_tick_secs = self.config.poller.tick_secs,
            "Ingestion service started"
        );
    }

    /// Latest per-component health
    #[must_use]
    pub fn health(&self) -> Arc<Vec<HealthSnapshot>> {
        self.health.get_health()
    }

    /// Worst component status
    #[must_use]
    pub fn overall_status(&self) -> ComponentStatus {
        self.health.overall()
    }

    /// Shared health aggregator, for serving outside the service
    #[must_use]
    pub fn health_aggregator(&self) -> Arc<HealthAggregator> {
        Arc::clone(&self.health)
    }

    /// Market registry
    #[must_use]
    pub fn registry(&self) -> &Arc<MarketRegistry> {
        &self.registry
    }

    /// Rate budgets
    #[must_use]
    pub const fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Discovery loop
    #[must_use]
    pub fn discovery(&self) -> &Arc<MarketDiscovery> {
        &self.discovery
    }

    /// Stream manager
    #[must_use]
    pub fn stream(&self) -> &Arc<StreamManager> {
        &self.stream
    }

    /// Poll fallback
    #[must_use]
    pub fn poller(&self) -> &Arc<PollFallback> {
        &self.poller
    }

    /// Stats handles
    #[must_use]
    pub const fn stats(&self) -> &ComponentHandles {
        &self.stats
    }

    /// Signal observed by the producing loops
    #[must_use]
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Stop producers, then drain and flush the sink
    pub async fn shutdown(mut self) {
        info!("Shutting down ingestion service");
        self.shutdown.trigger();
        for handle in self.producers.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Producer task did not stop cleanly");
            }
        }

        self.writer_shutdown.trigger();
        if let Some(handle) = self.writer_task.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Sink writer did not stop cleanly");
            }
        }
        info!(
            dropped = self.events.dropped(),
            buffered = self.writer.buffered(),
            "Ingestion service stopped"
        );
    }
}
