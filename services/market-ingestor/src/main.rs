//! Market Ingestor Service entry point

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use market_ingestor::config::IngestorConfig;
use market_ingestor::exchanges::kalshi::{KalshiRestClient, KalshiWsConnector};
use market_ingestor::health::HealthAggregator;
use market_ingestor::session::StaticTokenProvider;
use market_ingestor::sink::LogSink;
use market_ingestor::supervisor::Shutdown;
use market_ingestor::{IngestionService, Upstream};
use services_common::ComponentStatus;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Real-time prediction market ingestion
#[derive(Debug, Parser)]
#[command(name = "market-ingestor", version, about)]
struct Args {
    /// Configuration file (TOML, YAML or JSON); environment overrides apply on top
    #[arg(short, long, env = "INGESTOR_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let config = match IngestorConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("market-ingestor: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(&config);
    info!("Starting Market Ingestor Service");
    if config.upstream.api_key.is_empty() {
        warn!("No API key configured; authenticated endpoints will be rejected");
    }

    let rest = Arc::new(
        KalshiRestClient::new(
            &config.upstream.rest_base_url,
            Duration::from_secs(config.upstream.request_timeout_secs),
            config.upstream.page_limit,
        )
        .context("Failed to build REST client")?,
    );
    let upstream = Upstream {
        catalog: rest.clone(),
        market_data: rest,
        connector: Arc::new(KalshiWsConnector::new(config.upstream.ws_url.clone())),
        sessions: Box::new(StaticTokenProvider::new(
            config.upstream.api_key.clone(),
            Duration::from_secs(config.upstream.session_ttl_secs),
        )),
        persistence: Arc::new(LogSink),
    };

    let mut service =
        IngestionService::new(config.clone(), upstream).context("Failed to assemble ingestion service")?;
    service.start();

    let server = if config.server.enabled {
        let listener = tokio::net::TcpListener::bind(config.server.address())
            .await
            .with_context(|| format!("Failed to bind {}", config.server.address()))?;
        info!("Health endpoint listening on {}", config.server.address());
        let app = Router::new()
            .route("/health", get(health))
            .with_state(service.health_aggregator());
        let stop = service.shutdown_handle();
        Some(tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.wait().await })
                .await;
            if let Err(e) = served {
                error!("Health server error: {}", e);
            }
        }))
    } else {
        None
    };

    shutdown_signal(service.shutdown_handle()).await;
    service.shutdown().await;
    if let Some(server) = server {
        let _ = server.await;
    }
    info!("Market Ingestor Service shutdown complete");
    Ok(())
}

fn init_tracing(config: &IngestorConfig) {
    let json = config.logging.json;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with((!json).then(|| fmt::layer().with_target(true)))
        .with(json.then(|| fmt::layer().json()))
        .init();
}

async fn health(State(aggregator): State<Arc<HealthAggregator>>) -> impl IntoResponse {
    let overall = aggregator.overall();
    let code = if overall == ComponentStatus::Down {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let body = serde_json::json!({
        "status": overall,
        "components": aggregator.get_health().as_ref(),
    });
    (code, Json(body))
}

async fn shutdown_signal(shutdown: Shutdown) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
    shutdown.trigger();
}
