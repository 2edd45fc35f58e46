//! Capability traits through which the engine reaches its collaborators:
//! the local changeset history, the subscription store, the credential
//! holder, and the client-reset fresh-copy flow.

use crate::error::{HistoryResult, IntegrationError, SyncResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use tidesync_protocol::{
    RecoveryAction, RemoteChangeset, SaltedFileIdent, SyncProgress, UploadChangeset, UploadCursor,
    Version,
};

/// Snapshot of the local history's sync status, read at session
/// activation.
#[derive(Debug, Clone, Copy, Default)]
pub struct HistoryStatus {
    /// Latest version in the local history.
    pub current_version: Version,
    /// Client file identity, zero if never assigned.
    pub file_ident: SaltedFileIdent,
    /// Persisted progress cursors.
    pub progress: SyncProgress,
}

/// A batch of changesets selected for upload.
#[derive(Debug, Clone, Default)]
pub struct UploadBatch {
    /// The changesets, oldest first. May be empty when the scan found
    /// only non-uploadable versions.
    pub changesets: Vec<UploadChangeset>,
    /// The upload cursor after this scan. Must advance past the input
    /// cursor whenever uploadable versions at or below the target exist,
    /// or the upload process cannot make progress.
    pub progress: UploadCursor,
    /// The server version the upload asks the server to keep alive.
    pub locked_server_version: Version,
}

/// The local changeset history. Exclusively written by the owning
/// protocol session during integration and upload enumeration.
pub trait History: Send + Sync {
    /// Reads the current sync status.
    fn status(&self) -> HistoryResult<HistoryStatus>;

    /// Persists the server-assigned client file identity.
    fn set_file_ident(&self, file_ident: SaltedFileIdent) -> HistoryResult<()>;

    /// Integrates a DOWNLOAD batch and advances persisted progress.
    /// Returns the new local version produced by the integration.
    fn integrate_remote_changesets(
        &self,
        progress: &SyncProgress,
        downloadable_bytes: u64,
        changesets: &[RemoteChangeset],
    ) -> HistoryResult<Version>;

    /// Persists progress from an empty DOWNLOAD message.
    fn set_sync_progress(
        &self,
        progress: &SyncProgress,
        downloadable_bytes: u64,
    ) -> HistoryResult<()>;

    /// Enumerates changesets to upload, starting after `progress` and not
    /// exceeding `target_version`.
    fn uploadable_changesets(
        &self,
        progress: UploadCursor,
        target_version: Version,
    ) -> HistoryResult<UploadBatch>;

    /// Total payload bytes of changesets still uploadable above
    /// `after_version`, for progress reporting.
    fn uploadable_bytes(&self, after_version: Version) -> HistoryResult<u64>;

    /// Marks the local store for deletion after an unrecoverable error.
    fn mark_for_deletion(&self) -> HistoryResult<()>;
}

/// One versioned query set of a flexible-sync subscription store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySet {
    /// Version of the query set. Versions are allocated monotonically by
    /// the store; the engine compares them by identity when gating
    /// uploads on the sentinel set.
    pub version: i64,
    /// Serialized query set, sent in IDENT and QUERY messages.
    pub body: String,
    /// The local version at which this query set was committed. The set
    /// is only sent once the upload cursor has reached it.
    pub snapshot_version: Version,
}

/// Subscription (query set) management for flexible sync. Shared by
/// reference between the application-facing session and the protocol
/// session; must tolerate concurrent queries and commits.
pub trait SubscriptionStore: Send + Sync {
    /// The query set currently in effect.
    fn active(&self) -> QuerySet;

    /// The next pending query set after `after_version` whose snapshot is
    /// visible at or below `upload_client_version`, if any.
    fn next_pending(&self, after_version: i64, upload_client_version: Version) -> Option<QuerySet>;

    /// The version of the sentinel query set used only to flush
    /// pre-migration uploads, if one exists.
    fn sentinel_version(&self) -> Option<i64>;

    /// The server rejected a query set version.
    fn on_query_error(&self, version: i64, code: u16, message: &str);

    /// Download completion was reached for a query set version.
    fn on_version_complete(&self, version: i64);
}

/// Callback given to [`TokenProvider::refresh`].
pub type RefreshCallback = Box<dyn FnOnce(SyncResult<String>) + Send>;

/// The credential holder.
pub trait TokenProvider: Send + Sync {
    /// The current access token, if one is available.
    fn access_token(&self) -> Option<String>;

    /// Whether the token must be refreshed before it can be used.
    fn refresh_required(&self) -> bool;

    /// Starts an asynchronous refresh. The callback receives the new
    /// token, or a [`crate::SyncError`] with code `BadAuthentication`
    /// when the credential was rejected outright.
    fn refresh(&self, callback: RefreshCallback);

    /// Invalidates the credential after a fatal authentication error.
    fn log_out(&self);
}

/// Downloads the remote state into a side-by-side store and re-bases the
/// local store onto it (the client reset flow).
#[async_trait]
pub trait FreshCopyDownloader: Send + Sync {
    /// Performs the download and re-base. `action` distinguishes plain
    /// client resets from the migration variants.
    async fn download_fresh_copy(&self, action: RecoveryAction) -> SyncResult<()>;
}

/// Observer of migration actions requested by the server. Persistent
/// migration bookkeeping lives outside this crate.
pub type MigrationObserver = Box<dyn Fn(RecoveryAction, Option<&str>) + Send + Sync>;

// ---------------------------------------------------------------------------
// In-memory history for tests
// ---------------------------------------------------------------------------

struct MemoryHistoryInner {
    status: HistoryStatus,
    pending: Vec<UploadChangeset>,
    integrated: Vec<RemoteChangeset>,
    marked_for_deletion: bool,
    fail_next_integration: Option<IntegrationError>,
}

/// An in-memory [`History`] for tests.
pub struct MemoryHistory {
    inner: Mutex<MemoryHistoryInner>,
}

impl MemoryHistory {
    /// Creates an empty history.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryHistoryInner {
                status: HistoryStatus::default(),
                pending: Vec::new(),
                integrated: Vec::new(),
                marked_for_deletion: false,
                fail_next_integration: None,
            }),
        }
    }

    /// Appends a local changeset, advancing the current version to the
    /// changeset's client version.
    pub fn add_local_changeset(&self, changeset: UploadChangeset) {
        let mut inner = self.inner.lock();
        inner.status.current_version = inner.status.current_version.max(changeset.client_version);
        inner.pending.push(changeset);
    }

    /// All remote changesets integrated so far.
    pub fn integrated(&self) -> Vec<RemoteChangeset> {
        self.inner.lock().integrated.clone()
    }

    /// Whether the store was marked for deletion.
    pub fn is_marked_for_deletion(&self) -> bool {
        self.inner.lock().marked_for_deletion
    }

    /// Makes the next integration fail with the given error.
    pub fn fail_next_integration(&self, error: IntegrationError) {
        self.inner.lock().fail_next_integration = Some(error);
    }

    /// The persisted progress cursors.
    pub fn progress(&self) -> SyncProgress {
        self.inner.lock().status.progress
    }
}

impl Default for MemoryHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl History for MemoryHistory {
    fn status(&self) -> HistoryResult<HistoryStatus> {
        Ok(self.inner.lock().status)
    }

    fn set_file_ident(&self, file_ident: SaltedFileIdent) -> HistoryResult<()> {
        self.inner.lock().status.file_ident = file_ident;
        Ok(())
    }

    fn integrate_remote_changesets(
        &self,
        progress: &SyncProgress,
        _downloadable_bytes: u64,
        changesets: &[RemoteChangeset],
    ) -> HistoryResult<Version> {
        let mut inner = self.inner.lock();
        if let Some(error) = inner.fail_next_integration.take() {
            return Err(error);
        }
        inner.integrated.extend(changesets.iter().cloned());
        inner.status.progress = *progress;
        // Each integrated batch produces one new local version.
        inner.status.current_version += 1;
        Ok(inner.status.current_version)
    }

    fn set_sync_progress(
        &self,
        progress: &SyncProgress,
        _downloadable_bytes: u64,
    ) -> HistoryResult<()> {
        self.inner.lock().status.progress = *progress;
        Ok(())
    }

    fn uploadable_changesets(
        &self,
        progress: UploadCursor,
        target_version: Version,
    ) -> HistoryResult<UploadBatch> {
        let inner = self.inner.lock();
        let changesets: Vec<UploadChangeset> = inner
            .pending
            .iter()
            .filter(|c| c.client_version > progress.client_version && c.client_version <= target_version)
            .cloned()
            .collect();
        let new_cursor = UploadCursor {
            client_version: target_version,
            last_integrated_server_version: progress.last_integrated_server_version,
        };
        Ok(UploadBatch {
            changesets,
            progress: new_cursor,
            locked_server_version: inner.status.progress.download.server_version,
        })
    }

    fn uploadable_bytes(&self, after_version: Version) -> HistoryResult<u64> {
        let inner = self.inner.lock();
        Ok(inner
            .pending
            .iter()
            .filter(|c| c.client_version > after_version)
            .map(|c| c.payload.len() as u64)
            .sum())
    }

    fn mark_for_deletion(&self) -> HistoryResult<()> {
        self.inner.lock().marked_for_deletion = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_changeset(client_version: Version, payload: Vec<u8>) -> UploadChangeset {
        UploadChangeset {
            client_version,
            last_integrated_server_version: 0,
            origin_timestamp: 0,
            origin_file_ident: 0,
            payload,
        }
    }

    #[test]
    fn memory_history_tracks_versions() {
        let history = MemoryHistory::new();
        assert_eq!(history.status().unwrap().current_version, 0);

        history.add_local_changeset(local_changeset(1, vec![1]));
        history.add_local_changeset(local_changeset(2, vec![2, 2]));
        assert_eq!(history.status().unwrap().current_version, 2);
        assert_eq!(history.uploadable_bytes(0).unwrap(), 3);
        assert_eq!(history.uploadable_bytes(1).unwrap(), 2);
    }

    #[test]
    fn uploadable_scan_respects_cursor_and_target() {
        let history = MemoryHistory::new();
        for v in 1..=4 {
            history.add_local_changeset(local_changeset(v, vec![v as u8]));
        }
        let batch = history
            .uploadable_changesets(
                UploadCursor {
                    client_version: 1,
                    last_integrated_server_version: 0,
                },
                3,
            )
            .unwrap();
        let versions: Vec<Version> = batch.changesets.iter().map(|c| c.client_version).collect();
        assert_eq!(versions, vec![2, 3]);
        assert_eq!(batch.progress.client_version, 3);
    }

    #[test]
    fn integration_failure_injection() {
        let history = MemoryHistory::new();
        history.fail_next_integration(IntegrationError::bad_changeset("boom"));
        let result =
            history.integrate_remote_changesets(&SyncProgress::default(), 0, &[]);
        assert!(result.is_err());
        // The failure is one-shot.
        assert!(history
            .integrate_remote_changesets(&SyncProgress::default(), 0, &[])
            .is_ok());
    }
}
