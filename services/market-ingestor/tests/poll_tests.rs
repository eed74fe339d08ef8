mod common;

use common::*;
use market_ingestor::clock::MonotonicClock;
use market_ingestor::health::ComponentStats;
use market_ingestor::poller::{PollFallback, PollerConfig};
use market_ingestor::rate_limiter::{EndpointClass, RateBudgetConfig, TokenBucket};
use market_ingestor::registry::{DiscoveryBatch, MarketRegistry};
use market_ingestor::session::SessionCache;
use market_ingestor::sink::{SinkConfig, SinkWriter, event_channel};
use market_ingestor::supervisor::Shutdown;
use market_ingestor::upstream::TradeRecord;
use pretty_assertions::assert_eq;
use services_common::{Category, EventPayload, EventSource, Market};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

struct Setup {
    poller: Arc<PollFallback>,
    registry: Arc<MarketRegistry>,
    bucket: Arc<TokenBucket>,
    client: Arc<RecordingMarketData>,
    stats: Arc<ComponentStats>,
    recording: Arc<RecordingSink>,
    writer: SinkWriter,
}

fn markets(n: usize) -> Vec<Market> {
    (0..n).map(|i| market(&format!("M{i:02}"), Category::Nfl)).collect()
}

fn listing(markets: Vec<Market>, now: chrono::DateTime<chrono::Utc>) -> DiscoveryBatch {
    DiscoveryBatch {
        markets,
        covered: [Category::Nfl].into_iter().collect(),
        now,
    }
}

fn setup(markets: Vec<Market>, budget: RateBudgetConfig, config: PollerConfig) -> Setup {
    init_tracing();
    let registry = Arc::new(MarketRegistry::new(Duration::ZERO));
    registry.reconcile(listing(markets, chrono::Utc::now()));
    let bucket = Arc::new(TokenBucket::new(EndpointClass::Poll, budget));

    let client = Arc::new(RecordingMarketData::default());
    let stats = Arc::new(ComponentStats::new("poller"));
    let recording = Arc::new(RecordingSink::default());
    let (events, writer) = event_channel(
        SinkConfig::default(),
        recording.clone(),
        Arc::new(ComponentStats::new("sink")),
    );
    let poller = Arc::new(PollFallback::new(
        client.clone(),
        Arc::new(SessionCache::new(Box::new(FixedSession), Duration::from_secs(60))),
        Arc::clone(&registry),
        Arc::clone(&bucket),
        events,
        Arc::clone(&stats),
        config,
        MonotonicClock::new(),
    ));
    Setup {
        poller,
        registry,
        bucket,
        client,
        stats,
        recording,
        writer,
    }
}

/// Stop the writer and let it drain everything queued so far
async fn drain(writer: SinkWriter) {
    let shutdown = Shutdown::new();
    shutdown.trigger();
    Arc::new(writer).run(shutdown).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_every_market_polled_within_coverage_window() {
    // 20 markets, burst of 10, refill of 10 per minute
    let s = setup(markets(20), RateBudgetConfig::per_minute(10), PollerConfig::default());
    // One tick plus 10 markets beyond the burst at one per 6s
    let window = s.poller.coverage_window(20);
    assert!(window >= Duration::from_millis(62_999) && window <= Duration::from_millis(63_001));

    let shutdown = Shutdown::new();
    let task = tokio::spawn(Arc::clone(&s.poller).run(shutdown.clone()));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(s.client.polled.lock().len(), 10, "burst capacity spent on the first tick");

    tokio::time::sleep(Duration::from_secs(119)).await;
    let polled: BTreeSet<String> = s.client.polled.lock().iter().cloned().collect();
    assert_eq!(polled.len(), 20, "every active market polled within 120s");
    assert!(!s.stats.is_degraded());
    assert!(s.stats.counter("deferred") > 0);

    shutdown.trigger();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_rotation_resumes_at_deferred_market() {
    let s = setup(markets(6), RateBudgetConfig::per_minute(4), PollerConfig::default());
    let shutdown = Shutdown::new();

    let first = s.poller.run_tick(&shutdown).await;
    assert_eq!((first.polled, first.deferred), (4, 2));

    // Enough refill for the two deferred markets
    tokio::time::sleep(Duration::from_secs(30)).await;
    let second = s.poller.run_tick(&shutdown).await;
    assert!(second.polled >= 2);

    let polled = s.client.polled.lock().clone();
    assert_eq!(&polled[..6], &["M00", "M01", "M02", "M03", "M04", "M05"]);
}

#[tokio::test(start_paused = true)]
async fn test_insufficient_budget_reports_degraded() {
    let config = PollerConfig {
        max_staleness_secs: 30,
        ..PollerConfig::default()
    };
    let s = setup(markets(20), RateBudgetConfig::per_minute(10), config);
    s.poller.run_tick(&Shutdown::new()).await;
    assert!(s.stats.is_degraded());
}

#[tokio::test(start_paused = true)]
async fn test_trades_emitted_once_in_order() {
    let config = PollerConfig {
        fetch_trades: true,
        ..PollerConfig::default()
    };
    let s = setup(markets(1), RateBudgetConfig::per_minute(100), config);
    let trade = |id: &str, price| TradeRecord {
        trade_id: id.into(),
        price,
        count: 1,
        taker_side: None,
        created_time: None,
    };
    s.client
        .trades
        .lock()
        .insert("M00".into(), vec![trade("c", 43), trade("b", 42), trade("a", 41)]);

    let shutdown = Shutdown::new();
    s.poller.run_tick(&shutdown).await;
    s.poller.run_tick(&shutdown).await;
    s.client.trades.lock().insert(
        "M00".into(),
        vec![trade("d", 44), trade("c", 43), trade("b", 42), trade("a", 41)],
    );
    s.poller.run_tick(&shutdown).await;
    assert!(s.poller.staleness("M00").await.is_some());
    drain(s.writer).await;

    let events = s.recording.events.lock().clone();
    assert!(events.iter().all(|e| e.source == EventSource::Poll));
    let trade_prices: Vec<i64> = events
        .iter()
        .filter_map(|e| match e.payload {
            EventPayload::TradeExecution { price, .. } => Some(price),
            _ => None,
        })
        .collect();
    assert_eq!(trade_prices, vec![41, 42, 43, 44]);
    let quotes = events
        .iter()
        .filter(|e| matches!(e.payload, EventPayload::TickerUpdate(_)))
        .count();
    assert_eq!(quotes, 3);
}

#[tokio::test(start_paused = true)]
async fn test_throttled_market_defers_rest_of_tick_and_goes_first_next() {
    let s = setup(markets(4), RateBudgetConfig::per_minute(100), PollerConfig::default());
    s.client.throttle_once.lock().insert("M01".into());
    let rate_before = s.bucket.snapshot().refill_rate;
    let shutdown = Shutdown::new();

    let first = s.poller.run_tick(&shutdown).await;
    assert_eq!((first.polled, first.deferred), (1, 3));
    assert_eq!(s.stats.counter("rate_limited"), 1);
    assert!(s.bucket.snapshot().refill_rate < rate_before);

    let second = s.poller.run_tick(&shutdown).await;
    assert_eq!((second.polled, second.deferred), (4, 0));
    assert_eq!(
        s.client.polled.lock().clone(),
        vec!["M00", "M01", "M01", "M02", "M03", "M00"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_markets_removed_mid_tick_get_no_events() {
    let expires = chrono::Utc::now() + chrono::Duration::hours(1);
    let tracked = vec![
        expiring_market("M00", Category::Nfl, expires),
        expiring_market("M01", Category::Nfl, expires),
        market("M02", Category::Nfl),
    ];
    let s = setup(tracked, RateBudgetConfig::per_minute(100), PollerConfig::default());

    // Discovery settles M00 and M01 while M00's snapshot is in flight
    let registry = Arc::clone(&s.registry);
    s.client.on_snapshot(move |ticker| {
        if ticker == "M00" {
            registry.reconcile(listing(
                vec![market("M02", Category::Nfl)],
                chrono::Utc::now() + chrono::Duration::hours(2),
            ));
        }
    });

    let report = s.poller.run_tick(&Shutdown::new()).await;
    assert_eq!((report.polled, report.skipped), (2, 1));
    assert_eq!(s.client.polled.lock().clone(), vec!["M00", "M02"]);
    assert_eq!(s.stats.counter("dropped_inactive"), 1);
    drain(s.writer).await;

    let tickers: Vec<String> = s.recording.events.lock().iter().map(|e| e.ticker.clone()).collect();
    assert_eq!(tickers, vec!["M02"]);
}
