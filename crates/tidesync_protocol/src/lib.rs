//! # Tidesync Sync Protocol
//!
//! Wire protocol types and codecs for the tidesync client.
//!
//! This crate provides:
//! - Message types for both directions of the sync protocol
//!   (BIND, IDENT, UPLOAD, DOWNLOAD, MARK, QUERY, UNBIND, ERROR, ...)
//! - Text-header + binary-payload encoding/decoding
//! - Progress cursors and the client file identity pair
//! - Protocol error codes and server-requested recovery actions
//! - Protocol version negotiation helpers (websocket subprotocol strings,
//!   server URL scheme mapping)
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod messages;
mod progress;
mod version;

pub use error::{
    ClientErrorCode, CompensatingWrite, ErrorInfo, ProtocolErrorCode, RecoveryAction,
    CLIENT_ERROR_BASE,
};
pub use messages::{
    Bind, ClientMessage, Download, ErrorMessage, ErrorReport, Ident, IdentAllocation, Mark,
    MarkResponse, ParseError, Ping, Pong, QueryChange, QueryError, RemoteChangeset, ServerMessage,
    TestCommand, TestCommandResponse, Unbind, Unbound, Upload, UploadChangeset,
};
pub use progress::{
    DownloadCursor, RequestIdent, SaltedFileIdent, SaltedVersion, SessionIdent, SyncProgress,
    Timestamp, UploadCursor, Version,
};
pub use version::{
    parse_negotiated_subprotocol, parse_server_url, supported_subprotocols, Envelope,
    ServerEndpoint, UrlError, PROTOCOL_VERSION_CURRENT, PROTOCOL_VERSION_MIN,
    WEBSOCKET_PROTOCOL_PREFIX,
};
