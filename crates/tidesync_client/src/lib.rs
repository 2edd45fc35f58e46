//! # Tidesync Sync Client
//!
//! Client-side sync engine for tidesync: keeps a local persistent store
//! synchronized with a remote sync service over a long-lived,
//! multiplexed, binary websocket protocol.
//!
//! This crate provides:
//! - [`SyncSession`]: the application-facing per-store state machine
//!   (bind, suspend, resume, close) that stays stable across transient
//!   network conditions
//! - [`SyncClient`]: the process-wide coordinator owning one connection
//!   actor per server endpoint, with shutdown/drain semantics
//! - The protocol engine: connection management, protocol version
//!   negotiation, ping/pong keepalive, reconnect backoff, and the
//!   strictly ordered BIND/IDENT/UPLOAD/DOWNLOAD/MARK/QUERY exchange
//! - [`ProgressTracker`] and [`CallbackRegistry`] for application
//!   notifications
//! - Capability traits for the collaborators: [`History`] (changeset
//!   storage), [`SubscriptionStore`] (query-driven sync),
//!   [`TokenProvider`] (credentials), [`SocketProvider`] (transport),
//!   [`FreshCopyDownloader`] (client reset)
//!
//! ## Architecture
//!
//! All protocol work for one connection runs inside a single actor task;
//! no protocol state is ever mutated concurrently. Application-facing
//! entry points may be called from any thread and communicate with the
//! actors through channels; locks are never held while user callbacks
//! run.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backoff;
mod callbacks;
mod client;
mod config;
mod connection;
mod error;
mod history;
mod progress;
mod session;
mod sync_session;
mod transport;
mod websocket;

pub use backoff::{DelayProgression, ReconnectInfo, TerminationReason};
pub use callbacks::CallbackRegistry;
pub use client::SyncClient;
pub use config::{
    BackoffConfig, ClientConfig, ReconnectMode, ResyncMode, RoundtripTimeHandler, SessionConfig,
    StopPolicy, SyncMode,
};
pub use connection::ConnectionState;
pub use error::{ErrorCode, HistoryResult, IntegrationError, SyncError, SyncResult};
pub use history::{
    FreshCopyDownloader, History, HistoryStatus, MemoryHistory, MigrationObserver, QuerySet,
    RefreshCallback, SubscriptionStore, TokenProvider, UploadBatch,
};
pub use progress::{Progress, ProgressCallback, ProgressDirection, ProgressTracker};
pub use sync_session::{
    CompletionCallback, ConnectionStateChange, ErrorHandler, SessionState, SyncSession,
    SyncSessionBuilder,
};
pub use transport::{
    MockServerSocket, MockSocketProvider, SocketConnection, SocketProvider, SocketSink,
    SocketSource, TransportError,
};
pub use websocket::WebSocketProvider;
