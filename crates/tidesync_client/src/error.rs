//! Error types for the sync client.

use std::fmt;
use tidesync_protocol::{
    ClientErrorCode, CompensatingWrite, ErrorInfo, ProtocolErrorCode, RecoveryAction,
};

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Identifies the origin and kind of a [`SyncError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// A server-reported protocol error code.
    Protocol(ProtocolErrorCode),
    /// A condition detected by the client itself.
    Client(ClientErrorCode),
    /// A server-reported code this client does not recognize.
    Unknown(u16),
    /// An HTTP-level failure during the websocket handshake.
    Http(u16),
    /// Credential refresh was rejected.
    BadAuthentication,
    /// The operation was cancelled because its owner went away.
    OperationAborted,
}

/// A structured sync error as delivered to the application: error code,
/// message, fatality, and the server-requested recovery action where one
/// applies.
#[derive(Debug, Clone)]
pub struct SyncError {
    /// What went wrong.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Whether the error terminates the session.
    pub is_fatal: bool,
    /// Whether a retry (with backoff) is expected to help.
    pub try_again: bool,
    /// Recovery action requested by the server, if any.
    pub action: RecoveryAction,
    /// Present when the error describes a compensating write.
    pub compensating_write: Option<CompensatingWrite>,
    /// FLX query string supplied with a migration request.
    pub migration_query: Option<String>,
}

impl SyncError {
    /// An error for a condition the client detected itself.
    pub fn client(code: ClientErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Client(code),
            message: message.into(),
            is_fatal: true,
            try_again: false,
            action: RecoveryAction::NoAction,
            compensating_write: None,
            migration_query: None,
        }
    }

    /// Same as [`SyncError::client`], but retryable and non-fatal.
    pub fn client_transient(code: ClientErrorCode, message: impl Into<String>) -> Self {
        let mut error = Self::client(code, message);
        error.is_fatal = false;
        error.try_again = true;
        error
    }

    /// An error constructed from a server ERROR message.
    pub fn from_server(raw_code: u16, info: &ErrorInfo) -> Self {
        let code = match ProtocolErrorCode::from_raw(raw_code) {
            Some(code) => ErrorCode::Protocol(code),
            None => ErrorCode::Unknown(raw_code),
        };
        Self {
            code,
            message: info.message.clone(),
            is_fatal: !info.try_again,
            try_again: info.try_again,
            action: info.action,
            compensating_write: info.compensating_write.clone(),
            migration_query: info.migration_query.clone(),
        }
    }

    /// An HTTP-level handshake failure.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Http(status),
            message: message.into(),
            is_fatal: false,
            try_again: true,
            action: RecoveryAction::NoAction,
            compensating_write: None,
            migration_query: None,
        }
    }

    /// The cancellation status delivered to completion callbacks whose
    /// session is torn down before they can resolve.
    pub fn aborted() -> Self {
        Self {
            code: ErrorCode::OperationAborted,
            message: "sync session became inactive".into(),
            is_fatal: false,
            try_again: false,
            action: RecoveryAction::NoAction,
            compensating_write: None,
            migration_query: None,
        }
    }

    /// A fatal authentication failure (credential refresh rejected).
    pub fn bad_authentication(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::BadAuthentication,
            message: message.into(),
            is_fatal: true,
            try_again: false,
            action: RecoveryAction::NoAction,
            compensating_write: None,
            migration_query: None,
        }
    }

    /// Whether the error terminates the session.
    pub fn is_fatal(&self) -> bool {
        self.is_fatal
    }

    /// The raw numeric code, for reporting to the server.
    pub fn raw_code(&self) -> u16 {
        match self.code {
            ErrorCode::Protocol(code) => code.as_raw(),
            ErrorCode::Client(code) => code.as_raw(),
            ErrorCode::Unknown(raw) => raw,
            ErrorCode::Http(status) => status,
            ErrorCode::BadAuthentication => ProtocolErrorCode::BadAuthentication.as_raw(),
            ErrorCode::OperationAborted => 0,
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for SyncError {}

/// Error raised by the [`crate::History`] capability while integrating
/// downloaded changesets or enumerating uploadable ones.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct IntegrationError {
    /// Classification of the failure.
    pub code: ClientErrorCode,
    /// Human-readable description.
    pub message: String,
}

impl IntegrationError {
    /// A malformed-changeset failure, the common case.
    pub fn bad_changeset(message: impl Into<String>) -> Self {
        Self {
            code: ClientErrorCode::BadChangeset,
            message: message.into(),
        }
    }
}

/// Result type for [`crate::History`] operations.
pub type HistoryResult<T> = Result<T, IntegrationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_classification() {
        let info = ErrorInfo::transient("try later");
        let error = SyncError::from_server(200, &info);
        assert_eq!(
            error.code,
            ErrorCode::Protocol(ProtocolErrorCode::SessionClosed)
        );
        assert!(!error.is_fatal());
        assert!(error.try_again);

        let info = ErrorInfo::new("nope");
        let error = SyncError::from_server(203, &info);
        assert!(error.is_fatal());

        let error = SyncError::from_server(999, &info);
        assert_eq!(error.code, ErrorCode::Unknown(999));
    }

    #[test]
    fn client_error_fatality() {
        let error = SyncError::client(ClientErrorCode::BadProgress, "cursor went backwards");
        assert!(error.is_fatal());
        let error = SyncError::client_transient(ClientErrorCode::PongTimeout, "no pong");
        assert!(!error.is_fatal());
        assert!(error.try_again);
    }

    #[test]
    fn aborted_is_not_fatal() {
        let error = SyncError::aborted();
        assert_eq!(error.code, ErrorCode::OperationAborted);
        assert!(!error.is_fatal());
    }
}
