//! Progress cursors and identity types.

/// A store version (position in a history of changesets).
pub type Version = u64;

/// Identifier of a logical session multiplexed over one connection.
pub type SessionIdent = u64;

/// Identifier correlating a request with its response (MARK, TEST_COMMAND).
pub type RequestIdent = u64;

/// A millisecond timestamp as carried by PING/PONG messages.
pub type Timestamp = u64;

/// Server-assigned identity of this client's copy of a store.
///
/// The salt protects against a server that lost its state handing out the
/// same identifier twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SaltedFileIdent {
    /// The identifier proper. Zero means "not yet assigned".
    pub ident: u64,
    /// Salt paired with the identifier at assignment time.
    pub salt: u64,
}

impl SaltedFileIdent {
    /// Returns true once the server has assigned an identity.
    pub fn is_assigned(&self) -> bool {
        self.ident != 0
    }
}

/// A server version paired with its salt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SaltedVersion {
    /// The version.
    pub version: Version,
    /// Salt assigned by the server for this version.
    pub salt: u64,
}

/// Position of the download process within the server's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DownloadCursor {
    /// Last server version integrated locally.
    pub server_version: Version,
    /// The client version that the server had integrated at the point in
    /// its history named by `server_version`.
    pub last_integrated_client_version: Version,
}

/// Position of the upload process within the client's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UploadCursor {
    /// Last client version integrated by the server.
    pub client_version: Version,
    /// The server version that was integrated locally when the client
    /// produced `client_version`.
    pub last_integrated_server_version: Version,
}

/// The full set of progress cursors exchanged in IDENT and DOWNLOAD
/// messages.
///
/// All four axes are weakly increasing over the life of a session; the
/// session validates this on every DOWNLOAD message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncProgress {
    /// Latest version in the server's history, with salt.
    pub latest_server_version: SaltedVersion,
    /// Download position.
    pub download: DownloadCursor,
    /// Upload position.
    pub upload: UploadCursor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unassigned_file_ident() {
        let ident = SaltedFileIdent::default();
        assert!(!ident.is_assigned());

        let ident = SaltedFileIdent { ident: 7, salt: 1234 };
        assert!(ident.is_assigned());
    }

    #[test]
    fn progress_default_is_zeroed() {
        let progress = SyncProgress::default();
        assert_eq!(progress.latest_server_version.version, 0);
        assert_eq!(progress.download.server_version, 0);
        assert_eq!(progress.upload.client_version, 0);
    }
}
