//! Wire format of the trade API v2 WebSocket feed
//!
//! Outbound: `{"id", "cmd", "params": {"channels", "market_tickers"}}`.
//! Inbound: `{"type", "sid", "seq", "msg": {...}}`.

use crate::upstream::StreamCommand;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use services_common::{ContractSide, EventPayload, IngestError, IngestResult, PriceLevel, TickerUpdate};

#[derive(Serialize)]
struct CommandEnvelope<'a> {
    id: u64,
    cmd: &'static str,
    params: CommandParams<'a>,
}

#[derive(Serialize)]
struct CommandParams<'a> {
    channels: [&'static str; 1],
    market_tickers: &'a [String],
}

/// Encode a command; `None` for commands sent as transport frames (ping)
pub fn encode_command(id: u64, command: &StreamCommand) -> IngestResult<Option<String>> {
    let (cmd, channel, tickers) = match command {
        StreamCommand::Subscribe { channel, tickers } => ("subscribe", channel, tickers),
        StreamCommand::Unsubscribe { channel, tickers } => ("unsubscribe", channel, tickers),
        StreamCommand::Ping => return Ok(None),
    };
    let envelope = CommandEnvelope {
        id,
        cmd,
        params: CommandParams {
            channels: [channel.as_str()],
            market_tickers: tickers,
        },
    };
    serde_json::to_string(&envelope)
        .map(Some)
        .map_err(|e| IngestError::MalformedMessage(e.to_string()))
}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Market data for one ticker
    Market {
        /// Market ticker
        ticker: String,
        /// Exchange timestamp, if present
        exchange_ts: Option<DateTime<Utc>>,
        /// Normalized body
        payload: EventPayload,
    },
    /// Subscription acknowledged
    Subscribed {
        /// Channel name
        channel: Option<String>,
        /// Subscription id
        sid: Option<u64>,
    },
    /// Upstream reported an error
    Error {
        /// Upstream error code
        code: Option<i64>,
        /// Message
        message: String,
    },
    /// Recognized envelope of a type we do not consume
    Other(String),
}

/// Error code the feed sends when the session is missing or rejected
pub const AUTH_REQUIRED_CODE: i64 = 9;

impl Inbound {
    /// Whether this is an error telling us the session is no longer accepted
    #[must_use]
    pub fn is_auth_error(&self) -> bool {
        match self {
            Self::Error { code, message } => {
                matches!(code, Some(AUTH_REQUIRED_CODE | 401 | 403))
                    || message.to_ascii_lowercase().contains("auth")
            }
            _ => false,
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    msg: serde_json::Value,
}

#[derive(Deserialize)]
struct TickerMsg {
    #[serde(alias = "ticker")]
    market_ticker: String,
    yes_bid: Option<i64>,
    yes_ask: Option<i64>,
    no_bid: Option<i64>,
    no_ask: Option<i64>,
    #[serde(alias = "last_price")]
    price: Option<i64>,
    volume: Option<i64>,
    open_interest: Option<i64>,
    ts: Option<i64>,
}

#[derive(Deserialize)]
struct TradeMsg {
    trade_id: Option<String>,
    #[serde(alias = "ticker")]
    market_ticker: String,
    #[serde(alias = "price")]
    yes_price: i64,
    #[serde(alias = "size")]
    count: i64,
    taker_side: Option<String>,
    ts: Option<i64>,
}

#[derive(Deserialize)]
struct SnapshotMsg {
    #[serde(alias = "ticker")]
    market_ticker: String,
    #[serde(default)]
    yes: Option<Vec<[i64; 2]>>,
    #[serde(default)]
    no: Option<Vec<[i64; 2]>>,
}

#[derive(Deserialize)]
struct DeltaMsg {
    #[serde(alias = "ticker")]
    market_ticker: String,
    price: i64,
    delta: i64,
    side: String,
}

#[derive(Deserialize)]
struct SubscribedMsg {
    channel: Option<String>,
    sid: Option<u64>,
}

#[derive(Deserialize)]
struct ErrorMsg {
    code: Option<i64>,
    msg: Option<String>,
}

fn decode<T: for<'de> Deserialize<'de>>(kind: &str, msg: serde_json::Value) -> IngestResult<T> {
    serde_json::from_value(msg).map_err(|e| IngestError::MalformedMessage(format!("{kind}: {e}")))
}

fn epoch_secs(ts: Option<i64>) -> Option<DateTime<Utc>> {
    ts.and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

/// Convert `[price, size]` pairs into levels
#[must_use]
pub fn levels(pairs: Option<Vec<[i64; 2]>>) -> Vec<PriceLevel> {
    pairs
        .unwrap_or_default()
        .into_iter()
        .map(|[price, size]| PriceLevel { price, size })
        .collect()
}

/// Decode one text frame
pub fn parse_frame(text: &str) -> IngestResult<Inbound> {
    let envelope: Envelope =
        serde_json::from_str(text).map_err(|e| IngestError::MalformedMessage(e.to_string()))?;

    match envelope.kind.as_str() {
        "ticker" | "ticker_v2" => {
            let m: TickerMsg = decode(&envelope.kind, envelope.msg)?;
            Ok(Inbound::Market {
                ticker: m.market_ticker,
                exchange_ts: epoch_secs(m.ts),
                payload: EventPayload::TickerUpdate(TickerUpdate::new(
                    m.yes_bid,
                    m.yes_ask,
                    m.no_bid,
                    m.no_ask,
                    m.price,
                    m.volume,
                    m.open_interest,
                )),
            })
        }
        "trade" => {
            let m: TradeMsg = decode(&envelope.kind, envelope.msg)?;
            Ok(Inbound::Market {
                ticker: m.market_ticker,
                exchange_ts: epoch_secs(m.ts),
                payload: EventPayload::TradeExecution {
                    trade_id: m.trade_id,
                    price: m.yes_price,
                    size: m.count,
                    taker_side: m.taker_side.as_deref().and_then(ContractSide::parse),
                },
            })
        }
        "orderbook_snapshot" => {
            let m: SnapshotMsg = decode(&envelope.kind, envelope.msg)?;
            Ok(Inbound::Market {
                ticker: m.market_ticker,
                exchange_ts: None,
                payload: EventPayload::OrderbookDelta {
                    yes: levels(m.yes),
                    no: levels(m.no),
                    snapshot: true,
                },
            })
        }
        "orderbook_delta" => {
            let m: DeltaMsg = decode(&envelope.kind, envelope.msg)?;
            let level = vec![PriceLevel {
                price: m.price,
                size: m.delta,
            }];
            let (yes, no) = match ContractSide::parse(&m.side) {
                Some(ContractSide::Yes) => (level, Vec::new()),
                Some(ContractSide::No) => (Vec::new(), level),
                None => {
                    return Err(IngestError::MalformedMessage(format!(
                        "orderbook_delta: unknown side {}",
                        m.side
                    )));
                }
            };
            Ok(Inbound::Market {
                ticker: m.market_ticker,
                exchange_ts: None,
                payload: EventPayload::OrderbookDelta {
                    yes,
                    no,
                    snapshot: false,
                },
            })
        }
        "subscribed" => {
            let m: SubscribedMsg = decode(&envelope.kind, envelope.msg)?;
            Ok(Inbound::Subscribed {
                channel: m.channel,
                sid: m.sid,
            })
        }
        "error" => {
            let m: ErrorMsg = decode(&envelope.kind, envelope.msg)?;
            Ok(Inbound::Error {
                code: m.code,
                message: m.msg.unwrap_or_default(),
            })
        }
        other => Ok(Inbound::Other(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::Channel;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_encode_subscribe() {
        let command = StreamCommand::Subscribe {
            channel: Channel::OrderbookDelta,
            tickers: vec!["A".into(), "B".into()],
        };
        let json: serde_json::Value =
            serde_json::from_str(&encode_command(7, &command).unwrap().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": 7,
                "cmd": "subscribe",
                "params": {"channels": ["orderbook_delta"], "market_tickers": ["A", "B"]}
            })
        );
        assert_eq!(encode_command(8, &StreamCommand::Ping).unwrap(), None);
    }

    #[test]
    fn test_parse_ticker_derives_mid() {
        let frame = r#"{"type":"ticker","sid":1,"msg":{"market_ticker":"T1","yes_bid":52,"yes_ask":54,"price":53,"volume":10,"ts":1700000000}}"#;
        let Inbound::Market { ticker, exchange_ts, payload } = parse_frame(frame).unwrap() else {
            panic!("expected market frame");
        };
        assert_eq!(ticker, "T1");
        assert!(exchange_ts.is_some());
        let EventPayload::TickerUpdate(update) = payload else {
            panic!("expected ticker update");
        };
        assert_eq!(update.mid_price, Some(53.0));
        assert_eq!(update.spread, Some(2.0));
        assert_eq!(update.last_price, Some(53));
    }

    #[test]
    fn test_parse_trade_and_delta() {
        let trade = r#"{"type":"trade","sid":2,"msg":{"trade_id":"x1","market_ticker":"T1","yes_price":36,"no_price":64,"count":136,"taker_side":"no","ts":1700000000}}"#;
        match parse_frame(trade).unwrap() {
            Inbound::Market { payload: EventPayload::TradeExecution { trade_id, price, size, taker_side }, .. } => {
                assert_eq!(trade_id.as_deref(), Some("x1"));
                assert_eq!((price, size), (36, 136));
                assert_eq!(taker_side, Some(ContractSide::No));
            }
            other => panic!("unexpected {other:?}"),
        }

        let delta = r#"{"type":"orderbook_delta","sid":3,"seq":4,"msg":{"market_ticker":"T1","price":96,"delta":-54,"side":"yes"}}"#;
        match parse_frame(delta).unwrap() {
            Inbound::Market { payload: EventPayload::OrderbookDelta { yes, no, snapshot }, .. } => {
                assert_eq!(yes, vec![PriceLevel { price: 96, size: -54 }]);
                assert!(no.is_empty());
                assert!(!snapshot);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_snapshot_with_missing_side() {
        let frame = r#"{"type":"orderbook_snapshot","sid":3,"seq":1,"msg":{"market_ticker":"T1","yes":[[8,300],[22,333]]}}"#;
        match parse_frame(frame).unwrap() {
            Inbound::Market { payload: EventPayload::OrderbookDelta { yes, no, snapshot }, .. } => {
                assert_eq!(yes.len(), 2);
                assert!(no.is_empty());
                assert!(snapshot);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_control_and_garbage() {
        assert_eq!(
            parse_frame(r#"{"id":1,"type":"subscribed","msg":{"channel":"ticker","sid":1}}"#).unwrap(),
            Inbound::Subscribed { channel: Some("ticker".into()), sid: Some(1) }
        );
        assert_eq!(
            parse_frame(r#"{"id":2,"type":"error","msg":{"code":6,"msg":"Already subscribed"}}"#).unwrap(),
            Inbound::Error { code: Some(6), message: "Already subscribed".into() }
        );
        assert!(matches!(parse_frame("not json"), Err(IngestError::MalformedMessage(_))));
        assert!(matches!(
            parse_frame(r#"{"type":"ticker","msg":{"yes_bid":1}}"#),
            Err(IngestError::MalformedMessage(_))
        ));
        assert_eq!(
            parse_frame(r#"{"type":"fill","msg":{}}"#).unwrap(),
            Inbound::Other("fill".into())
        );
    }

    #[test]
    fn test_auth_errors_are_recognized() {
        let auth = parse_frame(r#"{"id":3,"type":"error","msg":{"code":9,"msg":"Authentication required"}}"#).unwrap();
        assert!(auth.is_auth_error());
        let forbidden = Inbound::Error { code: Some(403), message: String::new() };
        assert!(forbidden.is_auth_error());
        let busy = Inbound::Error { code: Some(6), message: "Already subscribed".into() };
        assert!(!busy.is_auth_error());
        assert!(!Inbound::Other("fill".into()).is_auth_error());
    }
}
