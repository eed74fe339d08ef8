mod common;

use common::*;
use market_ingestor::config::IngestorConfig;
use market_ingestor::discovery::DiscoveryState;
use market_ingestor::rate_limiter::EndpointClass;
use market_ingestor::stream::StreamState;
use market_ingestor::{IngestionService, Upstream};
use services_common::{Category, ComponentStatus};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_service_discovers_streams_and_persists() {
    init_tracing();
    let catalog = Arc::new(ScriptedCatalog::default());
    catalog.list("KXNFLGAME", vec![listed("KXNFLGAME-25SEP07-KC", "KXNFLGAME")]);
    catalog.list("KXNHLGAME", vec![listed("KXNHLGAME-25OCT01-BOS", "KXNHLGAME")]);
    let market_data = Arc::new(RecordingMarketData::default());
    let (connector, mut links) = MockConnector::new();
    let recording = Arc::new(RecordingSink::default());

    let mut config = IngestorConfig::default();
    config.discovery.categories = vec![Category::Nfl, Category::Nhl];
    config.sink.flush_interval_ms = 100;

    let mut service = IngestionService::new(
        config,
        Upstream {
            catalog: catalog.clone(),
            market_data: market_data.clone(),
            connector,
            sessions: Box::new(FixedSession),
            persistence: recording.clone(),
        },
    )
    .unwrap();
    service.start();

    let link = links.recv().await.unwrap();
    for _ in 0..500 {
        if service.stream().state() == StreamState::Streaming && service.stream().subscribed().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(service.registry().snapshot().len(), 2);
    assert_eq!(service.stream().subscribed().len(), 2);

    link.send_text(
        r#"{"type":"ticker","sid":1,"msg":{"market_ticker":"KXNHLGAME-25OCT01-BOS","yes_bid":30,"yes_ask":34}}"#,
    );
    tokio::time::sleep(Duration::from_secs(5)).await;

    let events = recording.events.lock().clone();
    assert!(events.iter().any(|e| e.ticker == "KXNHLGAME-25OCT01-BOS" && e.category == Category::Nhl));
    assert!(!market_data.polled.lock().is_empty(), "poll fallback runs alongside the stream");

    let health = service.health();
    assert_eq!(health.len(), 4);
    assert!(health.iter().all(|h| h.status != ComponentStatus::Down));
    assert_ne!(service.overall_status(), ComponentStatus::Down);

    // Discovery and polling spend separate budgets
    let limiter = service.rate_limiter();
    assert!(!Arc::ptr_eq(
        limiter.bucket(EndpointClass::Discovery),
        limiter.bucket(EndpointClass::Poll)
    ));
    assert!(service.poller().staleness("KXNFLGAME-25SEP07-KC").await.is_some());
    assert!(service.stats().stream.counter("events") >= 1);

    // An early discovery cycle picks up a newly listed market
    catalog.list(
        "KXNFLGAME",
        vec![
            listed("KXNFLGAME-25SEP07-KC", "KXNFLGAME"),
            listed("KXNFLGAME-25SEP14-BUF", "KXNFLGAME"),
        ],
    );
    service.discovery().trigger();
    for _ in 0..500 {
        if service.registry().snapshot().contains("KXNFLGAME-25SEP14-BUF") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(service.registry().snapshot().contains("KXNFLGAME-25SEP14-BUF"));
    assert_eq!(service.discovery().state(), DiscoveryState::Idle);

    service.shutdown().await;
}

#[test]
fn test_invalid_config_is_rejected() {
    let mut config = IngestorConfig::default();
    config.discovery.categories.clear();
    let (connector, _links) = MockConnector::new();
    let result = IngestionService::new(
        config,
        Upstream {
            catalog: Arc::new(ScriptedCatalog::default()),
            market_data: Arc::new(RecordingMarketData::default()),
            connector,
            sessions: Box::new(FixedSession),
            persistence: Arc::new(RecordingSink::default()),
        },
    );
    assert!(result.is_err());
}
