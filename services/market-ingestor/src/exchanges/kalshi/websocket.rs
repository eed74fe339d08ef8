//! WebSocket transport for the trade API v2 feed

use crate::session::Session;
use crate::stream::protocol::encode_command;
use crate::upstream::{StreamCommand, StreamConnection, StreamConnector, StreamFrame};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use services_common::constants::upstream;
use services_common::{IngestError, IngestResult};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens authenticated feed connections
#[derive(Debug, Clone)]
pub struct KalshiWsConnector {
    url: String,
}

impl KalshiWsConnector {
    /// Connector for `url`
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Default for KalshiWsConnector {
    fn default() -> Self {
        Self::new(upstream::DEFAULT_WS_URL)
    }
}

fn ws_error(e: WsError) -> IngestError {
    match e {
        WsError::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
            IngestError::AuthExpired(format!("handshake rejected with HTTP {}", response.status()))
        }
        WsError::Http(response) if response.status().as_u16() == 429 => {
            IngestError::RateLimitRejected { retry_after: None }
        }
        WsError::Url(e) => IngestError::Config(format!("invalid stream URL: {e}")),
        other => IngestError::ConnectionLost(other.to_string()),
    }
}

#[async_trait]
impl StreamConnector for KalshiWsConnector {
    async fn connect(&self, session: &Session) -> IngestResult<Box<dyn StreamConnection>> {
        let mut request = self.url.as_str().into_client_request().map_err(ws_error)?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", session.token))
            .map_err(|e| IngestError::AuthExpired(format!("unusable token: {e}")))?;
        request.headers_mut().insert(header::AUTHORIZATION, auth);

        let (stream, response) = connect_async(request).await.map_err(ws_error)?;
        info!(url = %self.url, status = response.status().as_u16(), "Stream connected");
        Ok(Box::new(KalshiWsConnection { stream, next_id: 1 }))
    }
}

/// One open feed connection
struct KalshiWsConnection {
    stream: WsStream,
    next_id: u64,
}

#[async_trait]
impl StreamConnection for KalshiWsConnection {
    async fn send(&mut self, command: StreamCommand) -> IngestResult<()> {
        let id = self.next_id;
        let message = match encode_command(id, &command)? {
            Some(text) => {
                self.next_id += 1;
                Message::Text(text)
            }
            None => Message::Ping(Vec::new()),
        };
        self.stream.send(message).await.map_err(ws_error)
    }

    async fn next_frame(&mut self) -> IngestResult<StreamFrame> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(StreamFrame::Text(text)),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => return Ok(StreamFrame::Pong),
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Stream closed by peer");
                    return Ok(StreamFrame::Closed);
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => return Ok(StreamFrame::Text(text)),
                    Err(_) => warn!("Ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => return Err(ws_error(e)),
                None => return Ok(StreamFrame::Closed),
            }
        }
    }

    async fn close(&mut self) -> IngestResult<()> {
        match self.stream.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(ws_error(e)),
        }
    }
}
