//! The process-wide sync client: owns one connection actor per server
//! endpoint and the shutdown/drain machinery.

use crate::config::ClientConfig;
use crate::connection::{ConnCommand, ConnectionActor, SessionActivation};
use crate::transport::SocketProvider;
use crate::websocket::WebSocketProvider;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tidesync_protocol::{ServerEndpoint, SessionIdent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Key of one connection slot. With `one_connection_per_session` enabled
/// each session gets its own slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ConnectionKey {
    pub endpoint: ServerEndpoint,
    pub isolated: Option<SessionIdent>,
}

pub(crate) struct ConnectionHandle {
    pub cmd_tx: mpsc::UnboundedSender<ConnCommand>,
    pub join: JoinHandle<()>,
}

pub(crate) struct ClientShared {
    pub config: ClientConfig,
    pub provider: Arc<dyn SocketProvider>,
    pub connections: Mutex<HashMap<ConnectionKey, ConnectionHandle>>,
    pub session_registry: Mutex<HashSet<String>>,
    pub next_session_ident: AtomicU64,
}

/// The process-wide coordinator. Create one per application, pass it to
/// every [`crate::SyncSession`], and call [`SyncClient::shutdown`] before
/// exit to drain the connection actors.
///
/// Must be created and used inside a tokio runtime.
#[derive(Clone)]
pub struct SyncClient {
    shared: Arc<ClientShared>,
}

impl SyncClient {
    /// Creates a client dialing real websockets.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_socket_provider(config, Arc::new(WebSocketProvider::new()))
    }

    /// Creates a client with a custom socket provider (tests, embedders).
    pub fn with_socket_provider(config: ClientConfig, provider: Arc<dyn SocketProvider>) -> Self {
        debug!(?config, "Sync client created");
        Self {
            shared: Arc::new(ClientShared {
                config,
                provider,
                connections: Mutex::new(HashMap::new()),
                session_registry: Mutex::new(HashSet::new()),
                next_session_ident: AtomicU64::new(1),
            }),
        }
    }

    /// The client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub(crate) fn shared(&self) -> &Arc<ClientShared> {
        &self.shared
    }

    pub(crate) fn next_session_ident(&self) -> SessionIdent {
        self.shared.next_session_ident.fetch_add(1, Ordering::Relaxed)
    }

    /// Locates or creates the connection for `key` and activates the
    /// given session on it. The activation is sent while the connection
    /// table lock is held, so it can never race with the actor retiring.
    pub(crate) fn activate_session(
        &self,
        key: ConnectionKey,
        activation: SessionActivation,
    ) -> mpsc::UnboundedSender<ConnCommand> {
        let mut connections = self.shared.connections.lock();
        let handle = connections.entry(key.clone()).or_insert_with(|| {
            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            let actor = ConnectionActor::new(Arc::clone(&self.shared), key.clone(), cmd_rx);
            let join = tokio::spawn(actor.run());
            ConnectionHandle { cmd_tx, join }
        });
        if handle.cmd_tx.is_closed() {
            // The previous actor retired concurrently; replace it.
            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            let actor = ConnectionActor::new(Arc::clone(&self.shared), key.clone(), cmd_rx);
            let join = tokio::spawn(actor.run());
            *handle = ConnectionHandle { cmd_tx, join };
        }
        let _ = handle
            .cmd_tx
            .send(ConnCommand::ActivateSession(Box::new(activation)));
        handle.cmd_tx.clone()
    }

    /// Asks every connection to retry connecting without further delay
    /// (or to probe an established connection with an urgent ping).
    pub fn cancel_reconnect_delays(&self) {
        let connections = self.shared.connections.lock();
        for handle in connections.values() {
            let _ = handle.cmd_tx.send(ConnCommand::CancelReconnectDelay);
        }
    }

    pub(crate) fn register_session(&self, store_path: &str) {
        self.shared
            .session_registry
            .lock()
            .insert(store_path.to_owned());
    }

    pub(crate) fn unregister_session(&self, store_path: &str) {
        self.shared.session_registry.lock().remove(store_path);
    }

    /// Whether a session for the given local store is registered.
    pub fn has_session(&self, store_path: &str) -> bool {
        self.shared.session_registry.lock().contains(store_path)
    }

    /// Force-closes every connection and waits for the actors to finish.
    pub async fn shutdown(&self) {
        debug!("Draining connections during sync client shutdown");
        let handles: Vec<ConnectionHandle> = {
            let mut connections = self.shared.connections.lock();
            connections.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &handles {
            let _ = handle.cmd_tx.send(ConnCommand::ForceClose);
        }
        for handle in handles {
            let _ = handle.join.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockSocketProvider;

    #[tokio::test]
    async fn session_registry() {
        let client = SyncClient::with_socket_provider(
            ClientConfig::default(),
            Arc::new(MockSocketProvider::new()),
        );
        assert!(!client.has_session("/tmp/a.store"));
        client.register_session("/tmp/a.store");
        assert!(client.has_session("/tmp/a.store"));
        client.unregister_session("/tmp/a.store");
        assert!(!client.has_session("/tmp/a.store"));
    }

    #[tokio::test]
    async fn session_ident_allocation_is_unique() {
        let client = SyncClient::with_socket_provider(
            ClientConfig::default(),
            Arc::new(MockSocketProvider::new()),
        );
        let a = client.next_session_ident();
        let b = client.next_session_ident();
        assert_ne!(a, b);
        assert!(a >= 1);
    }

    #[tokio::test]
    async fn shutdown_with_no_connections() {
        let client = SyncClient::with_socket_provider(
            ClientConfig::default(),
            Arc::new(MockSocketProvider::new()),
        );
        client.shutdown().await;
    }
}
