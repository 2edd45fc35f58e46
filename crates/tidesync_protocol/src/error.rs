//! Protocol error codes and recovery actions.

use serde::{Deserialize, Serialize};

/// Base value for client-detected error codes, keeping them disjoint from
/// the server-reported codes in [`ProtocolErrorCode`].
pub const CLIENT_ERROR_BASE: u16 = 1000;

/// Error codes reported by the server in ERROR messages.
///
/// Codes below 200 are connection-level: the whole connection is being
/// closed and every multiplexed session is affected. Codes from 200 are
/// session-level and name one session by identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum ProtocolErrorCode {
    // Connection level.
    ConnectionClosed = 100,
    OtherConnectionError = 101,
    UnknownMessage = 102,
    BadSyntax = 103,
    LimitsExceeded = 104,
    WrongProtocolVersion = 105,
    BadSessionIdent = 106,
    ReuseOfSessionIdent = 107,
    BoundInOtherSession = 108,
    BadMessageOrder = 109,
    BadChangesetHeaderSyntax = 110,
    BadChangesetSize = 111,
    SwitchToFlxSync = 112,
    SwitchToPbsSync = 113,

    // Session level.
    SessionClosed = 200,
    OtherSessionError = 201,
    TokenExpired = 202,
    BadAuthentication = 203,
    IllegalStorePath = 204,
    NoSuchStore = 205,
    PermissionDenied = 206,
    BadServerFileIdent = 207,
    BadClientFileIdent = 208,
    BadServerVersion = 209,
    BadClientVersion = 210,
    DivergingHistories = 211,
    BadChangeset = 212,
    BadOriginFileIdent = 213,
    UnsupportedSessionFeature = 214,
    BadClientFile = 215,
    ServerFileDeleted = 216,
    ClientFileDenylisted = 217,
    UserDenylisted = 218,
    ClientFileExpired = 219,
    UserMismatch = 220,
    TooManySessions = 221,
    InvalidSchemaChange = 222,
    BadQuery = 223,
    ObjectAlreadyExists = 224,
    ServerPermissionsChanged = 225,
    InitialSyncNotCompleted = 226,
    WriteNotAllowed = 227,
    CompensatingWrite = 228,
    BadProgress = 229,
    MigrateToFlx = 230,
    RevertToPbs = 231,
}

impl ProtocolErrorCode {
    /// Looks up a raw wire value. Unknown values yield `None`; the caller
    /// decides whether that is a protocol violation or merely surfaced
    /// without special handling.
    pub fn from_raw(raw: u16) -> Option<Self> {
        use ProtocolErrorCode::*;
        Some(match raw {
            100 => ConnectionClosed,
            101 => OtherConnectionError,
            102 => UnknownMessage,
            103 => BadSyntax,
            104 => LimitsExceeded,
            105 => WrongProtocolVersion,
            106 => BadSessionIdent,
            107 => ReuseOfSessionIdent,
            108 => BoundInOtherSession,
            109 => BadMessageOrder,
            110 => BadChangesetHeaderSyntax,
            111 => BadChangesetSize,
            112 => SwitchToFlxSync,
            113 => SwitchToPbsSync,
            200 => SessionClosed,
            201 => OtherSessionError,
            202 => TokenExpired,
            203 => BadAuthentication,
            204 => IllegalStorePath,
            205 => NoSuchStore,
            206 => PermissionDenied,
            207 => BadServerFileIdent,
            208 => BadClientFileIdent,
            209 => BadServerVersion,
            210 => BadClientVersion,
            211 => DivergingHistories,
            212 => BadChangeset,
            213 => BadOriginFileIdent,
            214 => UnsupportedSessionFeature,
            215 => BadClientFile,
            216 => ServerFileDeleted,
            217 => ClientFileDenylisted,
            218 => UserDenylisted,
            219 => ClientFileExpired,
            220 => UserMismatch,
            221 => TooManySessions,
            222 => InvalidSchemaChange,
            223 => BadQuery,
            224 => ObjectAlreadyExists,
            225 => ServerPermissionsChanged,
            226 => InitialSyncNotCompleted,
            227 => WriteNotAllowed,
            228 => CompensatingWrite,
            229 => BadProgress,
            230 => MigrateToFlx,
            231 => RevertToPbs,
            _ => return None,
        })
    }

    /// The raw wire value.
    pub fn as_raw(self) -> u16 {
        self as u16
    }

    /// Whether the code names one session rather than the connection.
    pub fn is_session_level(self) -> bool {
        self.as_raw() >= 200
    }
}

/// Error codes for conditions detected by the client itself.
///
/// These never travel on the wire (except as the code of a client-reported
/// ERROR message); they classify why the client closed a connection or
/// suspended a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum ClientErrorCode {
    ConnectionClosed = 1000,
    UnknownMessage = 1001,
    BadSyntax = 1002,
    LimitsExceeded = 1003,
    BadSessionIdent = 1004,
    BadMessageOrder = 1005,
    BadClientFileIdent = 1006,
    BadClientFileIdentSalt = 1007,
    BadProgress = 1008,
    BadChangesetHeaderSyntax = 1009,
    BadChangesetSize = 1010,
    BadOriginFileIdent = 1011,
    BadServerVersion = 1012,
    BadClientVersion = 1013,
    BadChangeset = 1014,
    BadRequestIdent = 1015,
    BadErrorCode = 1016,
    BadTimestamp = 1017,
    BadProtocolFromServer = 1018,
    ClientTooOldForServer = 1019,
    ClientTooNewForServer = 1020,
    ProtocolMismatch = 1021,
    ConnectTimeout = 1022,
    PongTimeout = 1023,
    AutoClientResetFailure = 1024,
    HttpTunnelFailed = 1025,
    TlsHandshakeFailed = 1026,
}

impl ClientErrorCode {
    /// The raw value, offset by [`CLIENT_ERROR_BASE`].
    pub fn as_raw(self) -> u16 {
        self as u16
    }
}

/// The action the server asks the client to take in response to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum RecoveryAction {
    #[default]
    NoAction,
    ApplicationBug,
    ProtocolViolation,
    Warning,
    Transient,
    DeleteStore,
    ClientReset,
    ClientResetNoRecovery,
    MigrateToFlx,
    RevertToPbs,
}

impl RecoveryAction {
    /// Whether the action triggers the client-reset (fresh copy) flow.
    pub fn requires_fresh_copy(self) -> bool {
        matches!(
            self,
            RecoveryAction::ClientReset
                | RecoveryAction::ClientResetNoRecovery
                | RecoveryAction::MigrateToFlx
                | RecoveryAction::RevertToPbs
        )
    }
}

/// Details of a compensating write issued by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensatingWrite {
    /// The client version whose write was rejected.
    pub rejected_client_version: u64,
    /// The server version that carries the correcting changeset.
    pub server_version: u64,
}

/// Structured detail of an ERROR message, carried as its JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Human-readable description.
    pub message: String,
    /// Whether the server permits a retry after a delay.
    #[serde(default)]
    pub try_again: bool,
    /// Recovery action requested by the server.
    #[serde(default)]
    pub action: RecoveryAction,
    /// Server-suggested override of the resumption delay, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumption_delay_ms: Option<u64>,
    /// Present when the error describes a compensating write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensating_write: Option<CompensatingWrite>,
    /// FLX query string to adopt when migrating (MigrateToFlx).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_query: Option<String>,
}

impl ErrorInfo {
    /// A minimal info with the given message and defaults elsewhere.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            try_again: false,
            action: RecoveryAction::NoAction,
            resumption_delay_ms: None,
            compensating_write: None,
            migration_query: None,
        }
    }

    /// Same, but marked retryable.
    pub fn transient(message: impl Into<String>) -> Self {
        let mut info = Self::new(message);
        info.try_again = true;
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_roundtrip() {
        for raw in 0..400u16 {
            if let Some(code) = ProtocolErrorCode::from_raw(raw) {
                assert_eq!(code.as_raw(), raw);
            }
        }
        assert!(ProtocolErrorCode::from_raw(999).is_none());
    }

    #[test]
    fn session_level_partition() {
        assert!(!ProtocolErrorCode::ConnectionClosed.is_session_level());
        assert!(!ProtocolErrorCode::BadMessageOrder.is_session_level());
        assert!(ProtocolErrorCode::SessionClosed.is_session_level());
        assert!(ProtocolErrorCode::CompensatingWrite.is_session_level());
        assert!(ProtocolErrorCode::BadAuthentication.is_session_level());
    }

    #[test]
    fn error_info_json_roundtrip() {
        let mut info = ErrorInfo::transient("write rejected");
        info.action = RecoveryAction::ClientReset;
        info.compensating_write = Some(CompensatingWrite {
            rejected_client_version: 11,
            server_version: 42,
        });

        let json = serde_json::to_string(&info).unwrap();
        let back: ErrorInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn error_info_defaults_from_sparse_json() {
        let back: ErrorInfo = serde_json::from_str(r#"{"message":"x"}"#).unwrap();
        assert_eq!(back.message, "x");
        assert!(!back.try_again);
        assert_eq!(back.action, RecoveryAction::NoAction);
        assert!(back.compensating_write.is_none());
    }

    #[test]
    fn fresh_copy_actions() {
        assert!(RecoveryAction::ClientReset.requires_fresh_copy());
        assert!(RecoveryAction::MigrateToFlx.requires_fresh_copy());
        assert!(!RecoveryAction::Warning.requires_fresh_copy());
        assert!(!RecoveryAction::DeleteStore.requires_fresh_copy());
    }
}
