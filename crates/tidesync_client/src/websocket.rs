//! Websocket transport backed by tokio-tungstenite.

use crate::transport::{SocketConnection, SocketProvider, SocketSink, SocketSource, TransportError};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tidesync_protocol::ServerEndpoint;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, LOCATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// [`SocketProvider`] implementation dialing real websockets.
#[derive(Debug, Default)]
pub struct WebSocketProvider;

impl WebSocketProvider {
    /// Creates the provider.
    pub fn new() -> Self {
        Self
    }
}

fn map_connect_error(error: WsError) -> TransportError {
    match error {
        WsError::Tls(e) => TransportError::Tls(e.to_string()),
        WsError::Io(e) => TransportError::ConnectFailed(e.to_string()),
        WsError::Url(e) => TransportError::ConnectFailed(e.to_string()),
        other => TransportError::ConnectFailed(other.to_string()),
    }
}

#[async_trait]
impl SocketProvider for WebSocketProvider {
    async fn connect(
        &self,
        endpoint: &ServerEndpoint,
        subprotocols: &[String],
    ) -> Result<SocketConnection, TransportError> {
        let mut url = endpoint.websocket_url();
        // A permanent redirect is followed exactly once; temporary
        // redirects are unsupported and surface as HTTP errors.
        let mut redirects_left = 1;
        loop {
            let mut request = url
                .as_str()
                .into_client_request()
                .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
            let protocols = HeaderValue::from_str(&subprotocols.join(", "))
                .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
            request
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, protocols);

            debug!(url = %url, "opening websocket");
            match connect_async(request).await {
                Ok((stream, response)) => {
                    let negotiated_protocol = response
                        .headers()
                        .get(SEC_WEBSOCKET_PROTOCOL)
                        .and_then(|value| value.to_str().ok())
                        .map(str::to_owned);
                    let (sink, source) = stream.split();
                    return Ok(SocketConnection {
                        sink: Box::new(WsSink { sink }),
                        source: Box::new(WsSource { source }),
                        negotiated_protocol,
                    });
                }
                Err(WsError::Http(response)) => {
                    let status = response.status().as_u16();
                    let permanent = status == 301 || status == 308;
                    if permanent && redirects_left > 0 {
                        if let Some(location) = response
                            .headers()
                            .get(LOCATION)
                            .and_then(|value| value.to_str().ok())
                        {
                            info!(status, location, "following permanent redirect");
                            url = location
                                .replacen("https://", "wss://", 1)
                                .replacen("http://", "ws://", 1);
                            redirects_left -= 1;
                            continue;
                        }
                    }
                    return Err(TransportError::Http { status });
                }
                Err(error) => return Err(map_connect_error(error)),
            }
        }
    }
}

struct WsSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl SocketSink for WsSink {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.sink
            .send(Message::Binary(frame))
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }
}

struct WsSource {
    source: SplitStream<WsStream>,
}

#[async_trait]
impl SocketSource for WsSource {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            match self.source.next().await {
                None => return Ok(None),
                Some(Ok(Message::Binary(frame))) => return Ok(Some(frame)),
                Some(Ok(Message::Text(text))) => return Ok(Some(text.into_bytes())),
                Some(Ok(Message::Close(_))) => return Ok(None),
                // Transport-level ping/pong is handled by tungstenite;
                // the sync protocol runs its own keepalive.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => return Ok(None),
                Some(Err(error)) => return Err(TransportError::Read(error.to_string())),
            }
        }
    }
}
