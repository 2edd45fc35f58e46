//! Transport abstraction: the socket provider capability and a channel
//! based mock implementation for tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use thiserror::Error;
use tidesync_protocol::{
    ClientMessage, Ping, Pong, ServerEndpoint, ServerMessage, PROTOCOL_VERSION_CURRENT,
    WEBSOCKET_PROTOCOL_PREFIX,
};
use tokio::sync::mpsc;

/// Errors raised by the transport layer.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Host name resolution failed.
    #[error("resolve failed: {0}")]
    ResolveFailed(String),

    /// The TCP connect or websocket handshake failed.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// TLS handshake or certificate verification failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// A read on an established socket failed.
    #[error("read failed: {0}")]
    Read(String),

    /// A write on an established socket failed.
    #[error("write failed: {0}")]
    Write(String),

    /// The HTTP response to the websocket handshake was an error.
    #[error("HTTP error response: status {status}")]
    Http {
        /// The HTTP status code.
        status: u16,
    },
}

/// The write half of an established socket.
#[async_trait]
pub trait SocketSink: Send {
    /// Writes one binary frame. Completion of the returned future is the
    /// write-complete signal; the connection never has two writes in
    /// flight.
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Closes the socket cleanly.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// The read half of an established socket.
#[async_trait]
pub trait SocketSource: Send {
    /// Reads the next binary frame. `Ok(None)` signals a clean close by
    /// the peer.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError>;
}

/// An established socket, as returned by [`SocketProvider::connect`].
pub struct SocketConnection {
    /// Write half.
    pub sink: Box<dyn SocketSink>,
    /// Read half.
    pub source: Box<dyn SocketSource>,
    /// The subprotocol the server selected, if any.
    pub negotiated_protocol: Option<String>,
}

/// The transport capability: opens websockets to sync servers.
#[async_trait]
pub trait SocketProvider: Send + Sync + 'static {
    /// Opens a websocket to `endpoint`, offering `subprotocols` for
    /// version negotiation.
    async fn connect(
        &self,
        endpoint: &ServerEndpoint,
        subprotocols: &[String],
    ) -> Result<SocketConnection, TransportError>;
}

// ---------------------------------------------------------------------------
// Mock provider
// ---------------------------------------------------------------------------

/// The server-side end of a mock socket, handed to tests when the client
/// connects. Dropping it closes the socket cleanly.
pub struct MockServerSocket {
    /// The endpoint the client dialed.
    pub endpoint: ServerEndpoint,
    /// The subprotocols the client offered.
    pub offered_protocols: Vec<String>,
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
}

impl MockServerSocket {
    /// Receives the next client message, answering keepalive pings
    /// transparently. Returns `None` when the client hung up.
    pub async fn recv_message(&mut self) -> Option<ClientMessage> {
        loop {
            let frame = self.incoming.recv().await?;
            let message = ClientMessage::decode(&frame).expect("client sent undecodable frame");
            if let ClientMessage::Ping(Ping { timestamp, .. }) = &message {
                self.send_message(&ServerMessage::Pong(Pong {
                    timestamp: *timestamp,
                }));
                continue;
            }
            return Some(message);
        }
    }

    /// Receives the next client message without answering pings.
    pub async fn recv_raw_message(&mut self) -> Option<ClientMessage> {
        let frame = self.incoming.recv().await?;
        Some(ClientMessage::decode(&frame).expect("client sent undecodable frame"))
    }

    /// Sends a server message to the client.
    pub fn send_message(&self, message: &ServerMessage) {
        let _ = self.outgoing.send(message.encode());
    }

    /// Sends a raw frame to the client (for malformed-input tests).
    pub fn send_frame(&self, frame: Vec<u8>) {
        let _ = self.outgoing.send(frame);
    }
}

struct MockSink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl SocketSink for MockSink {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.tx
            .send(frame)
            .map_err(|_| TransportError::Write("peer gone".into()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct MockSource {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl SocketSource for MockSource {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

struct MockProviderState {
    /// Errors to fail upcoming connect attempts with, in order.
    connect_failures: VecDeque<TransportError>,
    /// Subprotocol the mock server negotiates.
    negotiated_protocol: Option<String>,
    connect_attempts: u64,
}

/// A [`SocketProvider`] backed by in-process channels. Each accepted
/// connection is surfaced to the test as a [`MockServerSocket`].
pub struct MockSocketProvider {
    state: Mutex<MockProviderState>,
    accept_tx: mpsc::UnboundedSender<MockServerSocket>,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockServerSocket>>,
}

impl MockSocketProvider {
    /// Creates a provider that negotiates the current protocol version.
    pub fn new() -> Self {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(MockProviderState {
                connect_failures: VecDeque::new(),
                negotiated_protocol: Some(format!(
                    "{WEBSOCKET_PROTOCOL_PREFIX}{PROTOCOL_VERSION_CURRENT}"
                )),
                connect_attempts: 0,
            }),
            accept_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        }
    }

    /// Awaits the next connection from the client.
    pub async fn accept(&self) -> MockServerSocket {
        self.accept_rx
            .lock()
            .await
            .recv()
            .await
            .expect("mock provider dropped")
    }

    /// Makes the next connect attempt fail with `error`.
    pub fn fail_next_connect(&self, error: TransportError) {
        self.state.lock().connect_failures.push_back(error);
    }

    /// Overrides the negotiated subprotocol (`None` = no subprotocol).
    pub fn set_negotiated_protocol(&self, protocol: Option<String>) {
        self.state.lock().negotiated_protocol = protocol;
    }

    /// Number of connect attempts observed so far.
    pub fn connect_attempts(&self) -> u64 {
        self.state.lock().connect_attempts
    }
}

impl Default for MockSocketProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SocketProvider for MockSocketProvider {
    async fn connect(
        &self,
        endpoint: &ServerEndpoint,
        subprotocols: &[String],
    ) -> Result<SocketConnection, TransportError> {
        let negotiated = {
            let mut state = self.state.lock();
            state.connect_attempts += 1;
            if let Some(error) = state.connect_failures.pop_front() {
                return Err(error);
            }
            state.negotiated_protocol.clone()
        };
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        let server_socket = MockServerSocket {
            endpoint: endpoint.clone(),
            offered_protocols: subprotocols.to_vec(),
            incoming: server_rx,
            outgoing: server_tx,
        };
        let _ = self.accept_tx.send(server_socket);
        Ok(SocketConnection {
            sink: Box::new(MockSink { tx: client_tx }),
            source: Box::new(MockSource { rx: client_rx }),
            negotiated_protocol: negotiated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidesync_protocol::parse_server_url;

    #[tokio::test]
    async fn mock_connect_and_exchange() {
        let provider = MockSocketProvider::new();
        let endpoint = parse_server_url("tidesync://server.test/app").unwrap();
        let protocols = vec!["io.tidesync.protocol/v9".to_owned()];

        let mut conn = provider.connect(&endpoint, &protocols).await.unwrap();
        let mut server = provider.accept().await;
        assert_eq!(server.offered_protocols, protocols);
        assert!(conn.negotiated_protocol.is_some());

        conn.sink
            .send(ClientMessage::Ping(Ping { timestamp: 7, rtt: 0 }).encode())
            .await
            .unwrap();
        let message = server.recv_raw_message().await.unwrap();
        assert!(matches!(message, ClientMessage::Ping(_)));

        server.send_message(&ServerMessage::Pong(Pong { timestamp: 7 }));
        let frame = conn.source.recv().await.unwrap().unwrap();
        assert_eq!(
            ServerMessage::decode(&frame).unwrap(),
            ServerMessage::Pong(Pong { timestamp: 7 })
        );
    }

    #[tokio::test]
    async fn mock_connect_failure_injection() {
        let provider = MockSocketProvider::new();
        provider.fail_next_connect(TransportError::ConnectFailed("refused".into()));
        let endpoint = parse_server_url("tidesync://server.test/app").unwrap();
        let result = provider.connect(&endpoint, &[]).await;
        assert!(result.is_err());
        assert_eq!(provider.connect_attempts(), 1);

        let result = provider.connect(&endpoint, &[]).await;
        assert!(result.is_ok());
    }
}
