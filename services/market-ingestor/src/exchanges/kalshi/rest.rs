//! REST client for the trade API v2
//!
//! Serves both the catalog listing used by discovery and the per-market
//! endpoints used by the poll fallback.

use crate::session::Session;
use crate::upstream::{
    CatalogClient, ListedMarket, MarketDataClient, MarketPage, MarketQuote, OrderbookLevels,
    TradeRecord,
};
use crate::stream::protocol::levels;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode, header};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use services_common::{ContractSide, IngestError, IngestResult};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

#[derive(Deserialize)]
struct MarketsResponse {
    #[serde(default)]
    markets: Vec<WireMarket>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Deserialize)]
struct MarketResponse {
    market: WireMarket,
}

#[derive(Deserialize)]
struct WireMarket {
    ticker: String,
    #[serde(default)]
    event_ticker: String,
    #[serde(default)]
    series_ticker: Option<String>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    close_time: Option<DateTime<Utc>>,
    #[serde(default)]
    expiration_time: Option<DateTime<Utc>>,
    yes_bid: Option<i64>,
    yes_ask: Option<i64>,
    no_bid: Option<i64>,
    no_ask: Option<i64>,
    last_price: Option<i64>,
    volume: Option<i64>,
    open_interest: Option<i64>,
}

impl From<WireMarket> for ListedMarket {
    fn from(m: WireMarket) -> Self {
        Self {
            ticker: m.ticker,
            title: m.title,
            event_ticker: m.event_ticker,
            series_ticker: m.series_ticker.filter(|s| !s.is_empty()),
            status: m.status,
            close_time: m.close_time,
            expiration_time: m.expiration_time,
        }
    }
}

#[derive(Deserialize)]
struct OrderbookResponse {
    orderbook: WireOrderbook,
}

#[derive(Deserialize)]
struct WireOrderbook {
    #[serde(default)]
    yes: Option<Vec<[i64; 2]>>,
    #[serde(default)]
    no: Option<Vec<[i64; 2]>>,
}

#[derive(Deserialize)]
struct TradesResponse {
    #[serde(default)]
    trades: Vec<WireTrade>,
}

#[derive(Deserialize)]
struct WireTrade {
    trade_id: String,
    yes_price: i64,
    count: i64,
    #[serde(default)]
    taker_side: Option<String>,
    #[serde(default)]
    created_time: Option<DateTime<Utc>>,
}

/// reqwest-backed client for the catalog and market data endpoints
#[derive(Debug, Clone)]
pub struct KalshiRestClient {
    http: Client,
    base_url: Url,
    page_limit: u32,
}

impl KalshiRestClient {
    /// Client against `base_url` (e.g. `https://host/trade-api/v2`)
    pub fn new(base_url: &str, timeout: Duration, page_limit: u32) -> IngestResult<Self> {
        // Trailing slash so relative joins keep the version path segment
        let normalized = format!("{}/", base_url.trim_end_matches('/'));
        let base_url = Url::parse(&normalized)
            .map_err(|e| IngestError::Config(format!("invalid REST base URL {base_url}: {e}")))?;
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IngestError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url,
            page_limit: page_limit.max(1),
        })
    }

    fn endpoint(&self, path: &str) -> IngestResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| IngestError::Config(format!("invalid endpoint path {path}: {e}")))
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> IngestResult<T> {
        let response = request.send().await.map_err(|e| transport_error(what, &e))?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, retry_after, what, body));
        }
        response.json::<T>().await.map_err(|e| {
            if e.is_timeout() {
                IngestError::Timeout(format!("{what}: {e}"))
            } else {
                IngestError::MalformedMessage(format!("{what}: {e}"))
            }
        })
    }
}

fn retry_after(headers: &header::HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

fn status_error(status: StatusCode, retry_after: Option<Duration>, what: &str, body: String) -> IngestError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => IngestError::RateLimitRejected { retry_after },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            IngestError::AuthExpired(format!("{what}: HTTP {status}"))
        }
        _ => {
            warn!(what, status = status.as_u16(), "Upstream request failed");
            IngestError::Upstream {
                status: status.as_u16(),
                message: if body.is_empty() { what.to_string() } else { format!("{what}: {body}") },
            }
        }
    }
}

fn transport_error(what: &str, e: &reqwest::Error) -> IngestError {
    if e.is_timeout() {
        IngestError::Timeout(format!("{what}: {e}"))
    } else {
        IngestError::ConnectionLost(format!("{what}: {e}"))
    }
}

#[async_trait]
impl CatalogClient for KalshiRestClient {
    async fn list_markets(&self, series: &str, cursor: Option<&str>) -> IngestResult<MarketPage> {
        let mut query = vec![
            ("series_ticker", series.to_string()),
            ("status", "open".to_string()),
            ("limit", self.page_limit.to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }
        let request = self.http.get(self.endpoint("markets")?).query(&query);
        let response: MarketsResponse = self.fetch(request, "list markets").await?;
        debug!(series, markets = response.markets.len(), "Catalog page fetched");
        Ok(MarketPage {
            markets: response.markets.into_iter().map(Into::into).collect(),
            cursor: response.cursor.filter(|c| !c.is_empty()),
        })
    }
}

#[async_trait]
impl MarketDataClient for KalshiRestClient {
    async fn market_snapshot(&self, session: &Session, ticker: &str) -> IngestResult<MarketQuote> {
        let request = self
            .http
            .get(self.endpoint(&format!("markets/{ticker}"))?)
            .bearer_auth(&session.token);
        let MarketResponse { market } = self.fetch(request, "market snapshot").await?;
        Ok(MarketQuote {
            yes_bid: market.yes_bid,
            yes_ask: market.yes_ask,
            no_bid: market.no_bid,
            no_ask: market.no_ask,
            last_price: market.last_price,
            volume: market.volume,
            open_interest: market.open_interest,
        })
    }

    async fn orderbook(&self, session: &Session, ticker: &str, depth: u32) -> IngestResult<OrderbookLevels> {
        let request = self
            .http
            .get(self.endpoint(&format!("markets/{ticker}/orderbook"))?)
            .query(&[("depth", depth)])
            .bearer_auth(&session.token);
        let OrderbookResponse { orderbook } = self.fetch(request, "orderbook").await?;
        Ok(OrderbookLevels {
            yes: levels(orderbook.yes),
            no: levels(orderbook.no),
        })
    }

    async fn recent_trades(&self, session: &Session, ticker: &str, limit: u32) -> IngestResult<Vec<TradeRecord>> {
        let request = self
            .http
            .get(self.endpoint("markets/trades")?)
            .query(&[("ticker", ticker.to_string()), ("limit", limit.to_string())])
            .bearer_auth(&session.token);
        let TradesResponse { trades } = self.fetch(request, "recent trades").await?;
        Ok(trades
            .into_iter()
            .map(|t| TradeRecord {
                trade_id: t.trade_id,
                price: t.yes_price,
                count: t.count,
                taker_side: t.taker_side.as_deref().and_then(ContractSide::parse),
                created_time: t.created_time,
            })
            .collect())
    }
}
