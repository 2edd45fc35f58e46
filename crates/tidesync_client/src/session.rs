//! The per-store, per-connection protocol session state machine.
//!
//! A `ProtocolSession` owns the message-level protocol logic for one bound
//! store: the BIND/IDENT handshake, the strictly ordered send schedule,
//! progress-monotonicity validation of DOWNLOAD messages, compensating
//! write deferral, and upload/download completion detection. It is plain
//! synchronous code driven by the owning connection actor; everything the
//! application layer needs to know leaves through [`SessionEvent`]s.

use crate::backoff::DelayProgression;
use crate::config::BackoffConfig;
use crate::connection::ConnectionState;
use crate::error::{IntegrationError, SyncError, SyncResult};
use crate::history::{History, QuerySet, SubscriptionStore};
use crate::progress::Progress;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tidesync_protocol::{
    Bind, ClientErrorCode, Download, ErrorInfo, ErrorReport, Ident, Mark, ProtocolErrorCode,
    QueryChange, RequestIdent, SaltedFileIdent, SessionIdent, SyncProgress, TestCommand, Unbind,
    Upload, Version,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Runtime parameters of one protocol session, distilled from the
/// application-level session configuration.
#[derive(Debug, Clone)]
pub(crate) struct SessionRuntimeConfig {
    /// Query-driven sync.
    pub flx: bool,
    /// Server path of the bound store (partition-based sync).
    pub path: String,
    /// Access token snapshot for the BIND message.
    pub access_token: String,
    /// Backoff progression for resumption after suspension.
    pub resumption_backoff: BackoffConfig,
    /// Upload without waiting for the first download completion.
    pub disable_upload_activation_delay: bool,
}

/// Events surfaced to the application-facing session.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// The connection this session is multiplexed over changed state.
    ConnState {
        /// The new state.
        state: ConnectionState,
        /// Error that caused the change, if any.
        error: Option<SyncError>,
    },
    /// A session-level error (server ERROR message, integration failure,
    /// deferred compensating write).
    Error(SyncError),
    /// Upload completion was reached.
    UploadCompleted,
    /// Download completion was reached.
    DownloadCompleted,
    /// Transfer progress advanced.
    Progress(Progress),
}

/// Lifecycle of a protocol session. `Deactivated` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionLifecycle {
    Unactivated,
    Active,
    Deactivating,
    Deactivated,
}

/// Progress of the wire handshake on the current connection. The phases
/// are strictly ordered; each variant carries only the facts meaningful
/// to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WirePhase {
    /// Nothing sent on this connection yet.
    Idle,
    /// BIND sent; IDENT not yet sent.
    Bound,
    /// IDENT sent; steady-state exchange in progress.
    Idented,
    /// UNBIND sent; waiting for the round-trip to finish.
    Unbinding {
        send_complete: bool,
        unbound_received: bool,
    },
}

/// What kind of message a produced frame carries; echoed back to the
/// session when the write completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SentKind {
    Bind,
    Ident,
    TestCommand,
    ErrorReport,
    Mark,
    Query,
    Upload,
    Unbind,
}

/// A frame produced by [`ProtocolSession::next_message`].
pub(crate) struct OutboundMessage {
    pub frame: Vec<u8>,
    pub kind: SentKind,
    /// Whether the session wants another send opportunity right after
    /// this write completes.
    pub re_enlist: bool,
}

struct PendingTestCommand {
    id: RequestIdent,
    body: String,
    pending: bool,
    reply: Option<oneshot::Sender<SyncResult<String>>>,
}

pub(crate) struct ProtocolSession {
    ident: SessionIdent,
    cfg: SessionRuntimeConfig,
    history: Arc<dyn History>,
    subscriptions: Option<Weak<dyn SubscriptionStore>>,
    events: mpsc::UnboundedSender<SessionEvent>,

    state: SessionLifecycle,
    wire: WirePhase,
    suspended: bool,
    error_message_received: bool,
    connected: bool,
    /// Maintained by the owning connection.
    pub(crate) enlisted: bool,

    file_ident: SaltedFileIdent,
    progress: SyncProgress,
    upload_progress: tidesync_protocol::UploadCursor,
    download_progress: tidesync_protocol::DownloadCursor,
    last_version_available: Version,
    upload_target_version: Version,
    last_version_selected_for_upload: Version,
    allow_upload: bool,

    target_download_mark: RequestIdent,
    last_download_mark_sent: RequestIdent,
    last_download_mark_received: RequestIdent,
    last_triggering_download_mark: RequestIdent,
    server_version_at_last_download_mark: Version,

    upload_completion_requested: bool,

    last_sent_query_version: i64,

    client_error: Option<IntegrationError>,
    error_to_send: bool,

    pending_compensating: VecDeque<(u16, ErrorInfo)>,

    pending_test_commands: Vec<PendingTestCommand>,
    next_test_ident: RequestIdent,

    resumption: DelayProgression<u16>,
    pub(crate) resumption_deadline: Option<Instant>,

    downloaded_bytes: u64,
    downloadable_bytes: u64,
    uploaded_bytes: u64,
}

impl ProtocolSession {
    pub fn new(
        ident: SessionIdent,
        cfg: SessionRuntimeConfig,
        history: Arc<dyn History>,
        subscriptions: Option<Weak<dyn SubscriptionStore>>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let resumption = DelayProgression::new(cfg.resumption_backoff);
        Self {
            ident,
            cfg,
            history,
            subscriptions,
            events,
            state: SessionLifecycle::Unactivated,
            wire: WirePhase::Idle,
            suspended: false,
            error_message_received: false,
            connected: false,
            enlisted: false,
            file_ident: SaltedFileIdent::default(),
            progress: SyncProgress::default(),
            upload_progress: Default::default(),
            download_progress: Default::default(),
            last_version_available: 0,
            upload_target_version: 0,
            last_version_selected_for_upload: 0,
            allow_upload: false,
            target_download_mark: 0,
            last_download_mark_sent: 0,
            last_download_mark_received: 0,
            last_triggering_download_mark: 0,
            server_version_at_last_download_mark: 0,
            upload_completion_requested: false,
            last_sent_query_version: -1,
            client_error: None,
            error_to_send: false,
            pending_compensating: VecDeque::new(),
            pending_test_commands: Vec::new(),
            next_test_ident: 1,
            resumption,
            resumption_deadline: None,
            downloaded_bytes: 0,
            downloadable_bytes: 0,
            uploaded_bytes: 0,
        }
    }

    pub fn state(&self) -> SessionLifecycle {
        self.state
    }

    pub fn is_active_unsuspended(&self) -> bool {
        self.state == SessionLifecycle::Active && !self.suspended
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub fn emit_connection_state(&self, state: ConnectionState, error: Option<SyncError>) {
        self.emit(SessionEvent::ConnState { state, error });
    }

    fn subscriptions(&self) -> Option<Arc<dyn SubscriptionStore>> {
        self.subscriptions.as_ref().and_then(Weak::upgrade)
    }

    // -- lifecycle ----------------------------------------------------------

    pub fn activate(&mut self) -> SyncResult<()> {
        debug_assert_eq!(self.state, SessionLifecycle::Unactivated);
        debug!(session = self.ident, "Activating");

        let status = self
            .history
            .status()
            .map_err(|e| SyncError::client(e.code, e.message))?;
        self.file_ident = status.file_ident;
        self.progress = status.progress;
        self.last_version_available = status
            .current_version
            .max(self.progress.upload.client_version);
        self.upload_target_version = self.last_version_available;
        self.upload_progress = self.progress.upload;
        self.last_version_selected_for_upload = self.upload_progress.client_version;
        self.download_progress = self.progress.download;
        self.allow_upload = self.cfg.disable_upload_activation_delay;
        self.state = SessionLifecycle::Active;

        debug!(
            session = self.ident,
            client_file_ident = self.file_ident.ident,
            last_version_available = self.last_version_available,
            progress_server_version = self.progress.download.server_version,
            "Activated"
        );
        Ok(())
    }

    /// Begins deactivation. The caller must discard the session if it is
    /// `Deactivated` upon return.
    pub fn initiate_deactivation(&mut self) {
        debug_assert_eq!(self.state, SessionLifecycle::Active);
        debug!(session = self.ident, "Initiating deactivation");
        self.state = SessionLifecycle::Deactivating;

        if self.enlisted {
            return;
        }
        match self.wire {
            WirePhase::Idle => self.complete_deactivation(),
            WirePhase::Unbinding { .. } => {
                if self.unbind_process_complete() {
                    self.complete_deactivation();
                }
            }
            // UNBIND goes out at the next send opportunity.
            WirePhase::Bound | WirePhase::Idented => {}
        }
    }

    /// Immediate teardown without an UNBIND round-trip (client shutdown).
    pub fn force_close(&mut self) {
        if matches!(
            self.state,
            SessionLifecycle::Active | SessionLifecycle::Deactivating
        ) {
            self.state = SessionLifecycle::Deactivated;
            debug!(session = self.ident, "Force closed");
        }
    }

    fn complete_deactivation(&mut self) {
        debug_assert_eq!(self.state, SessionLifecycle::Deactivating);
        self.state = SessionLifecycle::Deactivated;
        debug!(session = self.ident, "Deactivation completed");
    }

    fn unbind_process_complete(&self) -> bool {
        match self.wire {
            WirePhase::Unbinding {
                send_complete: true,
                unbound_received,
            } => unbound_received || self.error_message_received,
            _ => false,
        }
    }

    fn reset_protocol_state(&mut self) {
        self.wire = WirePhase::Idle;
        self.error_message_received = false;
        self.enlisted = false;
        self.last_download_mark_sent = self.last_download_mark_received;
    }

    // -- connection lifecycle ----------------------------------------------

    pub fn connection_established(&mut self, fast_reconnect: bool) {
        self.connected = true;
        if fast_reconnect {
            self.allow_upload = true;
        }
    }

    /// The caller must discard the session if it is `Deactivated` upon
    /// return.
    pub fn connection_lost(&mut self) {
        self.connected = false;
        self.reset_protocol_state();
        if self.state == SessionLifecycle::Deactivating {
            self.complete_deactivation();
        }
    }

    // -- suspension ---------------------------------------------------------

    fn suspend(&mut self, error: SyncError, raw_code: u16, delay_override: Option<u64>) {
        debug_assert!(!self.suspended);
        debug!(session = self.ident, "Suspended");
        self.suspended = true;

        if self.state == SessionLifecycle::Deactivating && self.unbind_process_complete() {
            self.complete_deactivation();
            return;
        }

        let try_again = error.try_again;
        if self.state == SessionLifecycle::Active {
            self.emit(SessionEvent::Error(error));
        }
        if try_again {
            self.begin_resumption_delay(raw_code, delay_override);
        }
    }

    fn begin_resumption_delay(&mut self, raw_code: u16, delay_override: Option<u64>) {
        self.resumption
            .update(raw_code, delay_override.map(Duration::from_millis));
        let mut interval = self.resumption.next_delay();
        if raw_code == ProtocolErrorCode::SessionClosed.as_raw() {
            // The server sends session_closed after completing a query
            // bootstrap; normal backoff would add unacceptable latency
            // between query changes.
            interval = Duration::from_secs(1);
        }
        debug!(
            session = self.ident,
            delay_ms = interval.as_millis() as u64,
            "Will attempt to resume session"
        );
        self.resumption_deadline = Some(Instant::now() + interval);
    }

    /// Ends a suspension. Returns true if the session re-armed and wants
    /// a send opportunity.
    pub fn cancel_resumption_delay(&mut self) -> bool {
        if !self.suspended {
            return false;
        }
        self.suspended = false;
        self.resumption_deadline = None;
        debug!(session = self.ident, "Resumed");
        if self.unbind_process_complete() {
            self.initiate_rebind();
        }
        true
    }

    fn initiate_rebind(&mut self) {
        debug_assert_eq!(self.state, SessionLifecycle::Active);
        self.reset_protocol_state();
    }

    fn clear_resumption_delay_state(&mut self) {
        if self.resumption.cause().is_some() {
            debug!(
                session = self.ident,
                "Clearing resumption delay state after successful download"
            );
            self.resumption.reset();
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    // -- application requests ----------------------------------------------

    pub fn request_upload_completion(&mut self) {
        self.upload_completion_requested = true;
        self.check_for_upload_completion();
    }

    pub fn request_download_completion(&mut self) {
        self.target_download_mark += 1;
    }

    pub fn local_changes(&mut self, version: Version) {
        if version > self.last_version_available {
            self.last_version_available = version;
            self.upload_target_version = version;
        }
    }

    pub fn add_test_command(
        &mut self,
        body: String,
        reply: oneshot::Sender<SyncResult<String>>,
    ) {
        let id = self.next_test_ident;
        self.next_test_ident += 1;
        self.pending_test_commands.push(PendingTestCommand {
            id,
            body,
            pending: true,
            reply: Some(reply),
        });
    }

    // -- sending ------------------------------------------------------------

    /// Produces the next message this session wants to send, if any. The
    /// legal order is fixed: BIND, then IDENT once the file identity is
    /// known, then one of test command, queued error, MARK, QUERY, UPLOAD.
    ///
    /// The caller must discard the session if it is `Deactivated` upon
    /// return.
    pub fn next_message(&mut self) -> Option<OutboundMessage> {
        debug_assert!(self.connected);
        debug_assert!(matches!(
            self.state,
            SessionLifecycle::Active | SessionLifecycle::Deactivating
        ));

        if self.state == SessionLifecycle::Deactivating
            || self.error_message_received
            || self.suspended
        {
            // Teardown: send UNBIND if the binding ever started.
            return match self.wire {
                WirePhase::Idle => {
                    if self.state == SessionLifecycle::Deactivating {
                        self.complete_deactivation();
                    }
                    None
                }
                WirePhase::Unbinding { .. } => None,
                WirePhase::Bound | WirePhase::Idented => Some(self.make_unbind()),
            };
        }

        match self.wire {
            WirePhase::Idle => return Some(self.make_bind()),
            WirePhase::Bound => {
                if self.file_ident.is_assigned() {
                    return Some(self.make_ident());
                }
                return None;
            }
            WirePhase::Unbinding { .. } => return None,
            WirePhase::Idented => {}
        }

        if self.pending_test_commands.iter().any(|c| c.pending) {
            return Some(self.make_test_command());
        }
        if self.error_to_send {
            return Some(self.make_error_report());
        }
        // Stop sending upload, mark and query messages once the client
        // has detected an integration error.
        if self.client_error.is_some() {
            return None;
        }
        if self.target_download_mark > self.last_download_mark_sent {
            return Some(self.make_mark());
        }
        if !self.upload_allowed_by_sentinel() {
            return None;
        }
        if let Some(pending) = self.pending_query_change() {
            return Some(self.make_query_change(pending));
        }
        if self.allow_upload && self.upload_target_version > self.upload_progress.client_version {
            return self.make_upload();
        }
        None
    }

    /// Uploads are withheld while the most recently sent query version is
    /// the sentinel set used only to flush pre-migration state.
    fn upload_allowed_by_sentinel(&self) -> bool {
        if !self.cfg.flx {
            return true;
        }
        let Some(subscriptions) = self.subscriptions() else {
            return true;
        };
        match subscriptions.sentinel_version() {
            Some(sentinel) => self.last_sent_query_version != sentinel,
            None => true,
        }
    }

    fn pending_query_change(&self) -> Option<QuerySet> {
        if !self.cfg.flx || !self.allow_upload {
            return None;
        }
        let subscriptions = self.subscriptions()?;
        let pending = subscriptions.next_pending(
            self.last_sent_query_version,
            self.upload_progress.client_version,
        )?;
        (self.upload_progress.client_version >= pending.snapshot_version).then_some(pending)
    }

    fn make_bind(&mut self) -> OutboundMessage {
        debug_assert_eq!(self.state, SessionLifecycle::Active);
        let need_file_ident = !self.file_ident.is_assigned();
        debug!(
            session = self.ident,
            need_file_ident,
            flx = self.cfg.flx,
            path = %self.cfg.path,
            "Sending: BIND"
        );
        let message = Bind {
            session_ident: self.ident,
            need_file_ident,
            flx: self.cfg.flx,
            access_token: self.cfg.access_token.clone(),
            path: if self.cfg.flx {
                String::new()
            } else {
                self.cfg.path.clone()
            },
            json_data: String::new(),
        };
        self.wire = WirePhase::Bound;
        OutboundMessage {
            frame: message.encode(),
            kind: SentKind::Bind,
            // Ready to send IDENT right away when the identity is known.
            re_enlist: !need_file_ident,
        }
    }

    fn make_ident(&mut self) -> OutboundMessage {
        debug_assert_eq!(self.wire, WirePhase::Bound);
        debug_assert!(self.file_ident.is_assigned());
        let query = if self.cfg.flx {
            let active = self
                .subscriptions()
                .map(|s| s.active())
                .unwrap_or_else(|| QuerySet {
                    version: 0,
                    body: String::new(),
                    snapshot_version: 0,
                });
            self.last_sent_query_version = active.version;
            Some((active.version, active.body))
        } else {
            None
        };
        debug!(
            session = self.ident,
            client_file_ident = self.file_ident.ident,
            scan_server_version = self.progress.download.server_version,
            scan_client_version = self.progress.download.last_integrated_client_version,
            latest_server_version = self.progress.latest_server_version.version,
            "Sending: IDENT"
        );
        let message = Ident {
            session_ident: self.ident,
            file_ident: self.file_ident,
            progress: self.progress,
            query,
        };
        self.wire = WirePhase::Idented;
        OutboundMessage {
            frame: message.encode(),
            kind: SentKind::Ident,
            re_enlist: true,
        }
    }

    fn make_test_command(&mut self) -> OutboundMessage {
        let command = self
            .pending_test_commands
            .iter_mut()
            .find(|c| c.pending)
            .expect("checked by caller");
        command.pending = false;
        info!(
            session = self.ident,
            request_ident = command.id,
            body = %command.body,
            "Sending: TEST_COMMAND"
        );
        let message = TestCommand {
            session_ident: self.ident,
            request_ident: command.id,
            body: command.body.clone(),
        };
        OutboundMessage {
            frame: message.encode(),
            kind: SentKind::TestCommand,
            re_enlist: true,
        }
    }

    fn make_error_report(&mut self) -> OutboundMessage {
        debug_assert!(self.error_to_send);
        let client_error = self.client_error.as_ref().expect("error_to_send implies client_error");
        info!(
            session = self.ident,
            code = client_error.code.as_raw(),
            message = %client_error.message,
            "Sending: ERROR"
        );
        let message = ErrorReport {
            session_ident: self.ident,
            code: client_error.code.as_raw(),
            message: client_error.message.clone(),
        };
        self.error_to_send = false;
        OutboundMessage {
            frame: message.encode(),
            kind: SentKind::ErrorReport,
            re_enlist: true,
        }
    }

    fn make_mark(&mut self) -> OutboundMessage {
        let request_ident = self.target_download_mark;
        debug!(session = self.ident, request_ident, "Sending: MARK");
        let message = Mark {
            session_ident: self.ident,
            request_ident,
        };
        self.last_download_mark_sent = request_ident;
        OutboundMessage {
            frame: message.encode(),
            kind: SentKind::Mark,
            re_enlist: true,
        }
    }

    fn make_query_change(&mut self, pending: QuerySet) -> OutboundMessage {
        debug_assert!(pending.version > self.last_sent_query_version);
        debug!(
            session = self.ident,
            query_version = pending.version,
            snapshot_version = pending.snapshot_version,
            "Sending: QUERY"
        );
        let message = QueryChange {
            session_ident: self.ident,
            query_version: pending.version,
            query_body: pending.body,
        };
        self.last_sent_query_version = pending.version;
        // Completion of the new query set is observed through a download
        // checkpoint.
        self.request_download_completion();
        OutboundMessage {
            frame: message.encode(),
            kind: SentKind::Query,
            re_enlist: true,
        }
    }

    fn make_upload(&mut self) -> Option<OutboundMessage> {
        let mut target = self.upload_target_version;
        if self.cfg.flx {
            if let Some(subscriptions) = self.subscriptions() {
                if let Some(pending) = subscriptions.next_pending(
                    self.last_sent_query_version,
                    self.upload_progress.client_version,
                ) {
                    if pending.snapshot_version < target {
                        debug!(
                            session = self.ident,
                            limit = pending.snapshot_version,
                            query_version = pending.version,
                            "Limiting UPLOAD to make room for a QUERY change"
                        );
                        target = pending.snapshot_version;
                    }
                }
            }
        }

        let batch = match self.history.uploadable_changesets(self.upload_progress, target) {
            Ok(batch) => batch,
            Err(error) => {
                self.on_integration_failure(error);
                return None;
            }
        };
        if let Some(last) = batch.changesets.last() {
            self.last_version_selected_for_upload = last.client_version;
        }
        self.upload_progress = batch.progress;
        if batch.changesets.is_empty() {
            // Nothing more to upload right now.
            self.check_for_upload_completion();
        }

        debug!(
            session = self.ident,
            progress_client_version = self.upload_progress.client_version,
            progress_server_version = self.upload_progress.last_integrated_server_version,
            locked_server_version = batch.locked_server_version,
            num_changesets = batch.changesets.len(),
            "Sending: UPLOAD"
        );

        self.uploaded_bytes += batch
            .changesets
            .iter()
            .map(|c| c.payload.len() as u64)
            .sum::<u64>();
        let message = Upload {
            session_ident: self.ident,
            progress_client_version: self.upload_progress.client_version,
            progress_server_version: self.upload_progress.last_integrated_server_version,
            locked_server_version: batch.locked_server_version,
            changesets: batch.changesets,
        };
        self.emit_progress();
        Some(OutboundMessage {
            frame: message.encode(),
            kind: SentKind::Upload,
            re_enlist: true,
        })
    }

    fn make_unbind(&mut self) -> OutboundMessage {
        debug!(session = self.ident, "Sending: UNBIND");
        let message = Unbind {
            session_ident: self.ident,
        };
        self.wire = WirePhase::Unbinding {
            send_complete: false,
            unbound_received: false,
        };
        OutboundMessage {
            frame: message.encode(),
            kind: SentKind::Unbind,
            re_enlist: false,
        }
    }

    /// Called when the write of a previously produced frame completes.
    /// The caller must discard the session if it is `Deactivated` upon
    /// return.
    pub fn message_sent(&mut self, kind: SentKind) {
        if kind != SentKind::Unbind {
            return;
        }
        if let WirePhase::Unbinding { send_complete, .. } = &mut self.wire {
            *send_complete = true;
        }
        if self.unbind_process_complete() {
            if self.state == SessionLifecycle::Deactivating {
                self.complete_deactivation();
            } else if self.state == SessionLifecycle::Active && !self.suspended {
                self.initiate_rebind();
            }
        }
    }

    // -- receiving ----------------------------------------------------------

    pub fn receive_ident(&mut self, file_ident: SaltedFileIdent) -> SyncResult<()> {
        debug!(
            session = self.ident,
            client_file_ident = file_ident.ident,
            client_file_ident_salt = file_ident.salt,
            "Received: IDENT"
        );
        // Ignore the message if deactivation has begun; the local store
        // must not be touched any longer.
        if self.state != SessionLifecycle::Active {
            return Ok(());
        }
        let legal = self.wire == WirePhase::Bound
            && !self.file_ident.is_assigned()
            && !self.error_message_received;
        if !legal {
            return Err(SyncError::client(
                ClientErrorCode::BadMessageOrder,
                "IDENT message is illegal at this time",
            ));
        }
        if file_ident.ident < 1 {
            return Err(SyncError::client(
                ClientErrorCode::BadClientFileIdent,
                "bad client file identifier in IDENT message",
            ));
        }
        if file_ident.salt == 0 {
            return Err(SyncError::client(
                ClientErrorCode::BadClientFileIdentSalt,
                "bad client file identifier salt in IDENT message",
            ));
        }
        self.file_ident = file_ident;
        self.history
            .set_file_ident(file_ident)
            .map_err(|e| SyncError::client(e.code, e.message))?;
        self.progress.download.last_integrated_client_version = 0;
        self.progress.upload.client_version = 0;
        self.upload_progress = self.progress.upload;
        self.download_progress = self.progress.download;
        self.last_version_selected_for_upload = 0;
        // Ready to send the IDENT message.
        Ok(())
    }

    pub fn receive_download(&mut self, message: Download) -> SyncResult<()> {
        if self.state != SessionLifecycle::Active {
            return Ok(());
        }
        debug!(
            session = self.ident,
            download_server_version = message.progress.download.server_version,
            download_client_version = message.progress.download.last_integrated_client_version,
            latest_server_version = message.progress.latest_server_version.version,
            upload_client_version = message.progress.upload.client_version,
            downloadable_bytes = message.downloadable_bytes,
            last_in_batch = message.last_in_batch,
            query_version = message.query_version,
            num_changesets = message.changesets.len(),
            "Received: DOWNLOAD"
        );
        if self.client_error.is_some() {
            // Prevent re-transforming the same bad changeset over and
            // over again.
            debug!(
                session = self.ident,
                "Ignoring DOWNLOAD after a client-side integration error"
            );
            return Ok(());
        }
        let legal = self.wire == WirePhase::Idented && !self.error_message_received;
        if !legal {
            return Err(SyncError::client(
                ClientErrorCode::BadMessageOrder,
                "DOWNLOAD message is illegal at this time",
            ));
        }
        if let Err(rule) = self.check_received_sync_progress(&message.progress) {
            return Err(SyncError::client(
                ClientErrorCode::BadProgress,
                format!("bad sync progress in DOWNLOAD message (rule {rule})"),
            ));
        }

        let mut server_version = self.progress.download.server_version;
        let mut last_integrated = self.progress.download.last_integrated_client_version;
        for changeset in &message.changesets {
            // Per-changeset server versions are strictly increasing,
            // except in FLX sync where they may repeat during a bootstrap.
            let good_server_version = if self.cfg.flx {
                changeset.remote_version >= server_version
            } else {
                changeset.remote_version > server_version
            };
            if !good_server_version {
                return Err(SyncError::client(
                    ClientErrorCode::BadServerVersion,
                    "bad server version in changeset header (DOWNLOAD)",
                ));
            }
            server_version = changeset.remote_version;

            let good_client_version = changeset.last_integrated_local_version >= last_integrated
                && changeset.last_integrated_local_version
                    <= message.progress.download.last_integrated_client_version;
            if !good_client_version {
                return Err(SyncError::client(
                    ClientErrorCode::BadClientVersion,
                    "bad last integrated client version in changeset header (DOWNLOAD)",
                ));
            }
            last_integrated = changeset.last_integrated_local_version;

            // The server must never echo this client's own changes, and
            // zero is not a valid origin.
            let good_origin = changeset.origin_file_ident > 0
                && changeset.origin_file_ident != self.file_ident.ident;
            if !good_origin {
                return Err(SyncError::client(
                    ClientErrorCode::BadOriginFileIdent,
                    "bad origin file identifier in changeset header (DOWNLOAD)",
                ));
            }
        }

        let integration = if message.changesets.is_empty() {
            if message.last_in_batch {
                self.history
                    .set_sync_progress(&message.progress, message.downloadable_bytes)
                    .map(|()| None)
            } else {
                Err(IntegrationError {
                    code: ClientErrorCode::BadProgress,
                    message: "received empty download message that was not the last in batch"
                        .into(),
                })
            }
        } else {
            self.history
                .integrate_remote_changesets(
                    &message.progress,
                    message.downloadable_bytes,
                    &message.changesets,
                )
                .map(Some)
        };

        match integration {
            Err(error) => {
                self.on_integration_failure(error);
                Ok(())
            }
            Ok(new_version) => {
                let surfaceable = self.take_surfaceable_compensating(&message.changesets);
                let batch_bytes: u64 = message
                    .changesets
                    .iter()
                    .map(|c| c.payload.len() as u64)
                    .sum();
                if let Some(version) = new_version {
                    debug!(
                        session = self.ident,
                        num_changesets = message.changesets.len(),
                        client_version = version,
                        "Remote changesets integrated"
                    );
                }
                self.on_changesets_integrated(
                    new_version,
                    &message.progress,
                    message.downloadable_bytes,
                    batch_bytes,
                );
                for (raw_code, info) in surfaceable {
                    info!(
                        session = self.ident,
                        server_version = info
                            .compensating_write
                            .as_ref()
                            .map(|c| c.server_version)
                            .unwrap_or_default(),
                        "Reporting compensating write"
                    );
                    self.emit(SessionEvent::Error(SyncError::from_server(raw_code, &info)));
                }
                self.clear_resumption_delay_state();
                Ok(())
            }
        }
    }

    /// Compensating-write errors become reportable once the server
    /// version carrying the correction has appeared in a DOWNLOAD batch,
    /// preserving causal order between the rejection and the corrected
    /// state.
    fn take_surfaceable_compensating(
        &mut self,
        changesets: &[tidesync_protocol::RemoteChangeset],
    ) -> Vec<(u16, ErrorInfo)> {
        let mut surfaceable = Vec::new();
        let Some(last) = changesets.last() else {
            return surfaceable;
        };
        while let Some((_, info)) = self.pending_compensating.front() {
            let version = info
                .compensating_write
                .as_ref()
                .map(|c| c.server_version)
                .unwrap_or(0);
            if version <= last.remote_version {
                surfaceable.push(self.pending_compensating.pop_front().expect("non-empty"));
            } else {
                break;
            }
        }
        surfaceable
    }

    fn on_changesets_integrated(
        &mut self,
        new_version: Option<Version>,
        progress: &SyncProgress,
        downloadable_estimate: u64,
        batch_bytes: u64,
    ) {
        debug_assert!(progress.download.server_version >= self.download_progress.server_version);
        self.download_progress = progress.download;
        let upload_progressed = progress.upload.client_version > self.progress.upload.client_version;
        self.progress = *progress;
        if upload_progressed {
            if progress.upload.client_version > self.last_version_selected_for_upload {
                if progress.upload.client_version > self.upload_progress.client_version {
                    self.upload_progress = progress.upload;
                }
                self.last_version_selected_for_upload = progress.upload.client_version;
            }
            self.check_for_upload_completion();
        }
        if let Some(version) = new_version {
            // Versions produced by integration are part of the local
            // history; the upload process must scan past them.
            if version > self.last_version_available {
                self.last_version_available = version;
                self.upload_target_version = version;
            }
        }
        self.downloaded_bytes += batch_bytes;
        self.downloadable_bytes = self.downloaded_bytes + downloadable_estimate;
        self.emit_progress();
        self.check_for_download_completion();
    }

    fn emit_progress(&self) {
        let uploadable = self
            .history
            .uploadable_bytes(self.upload_progress.client_version)
            .unwrap_or(0);
        self.emit(SessionEvent::Progress(Progress {
            uploaded: self.uploaded_bytes,
            uploadable: self.uploaded_bytes + uploadable,
            downloaded: self.downloaded_bytes,
            downloadable: self.downloadable_bytes,
            snapshot_version: self.last_version_available,
        }));
    }

    fn on_integration_failure(&mut self, error: IntegrationError) {
        debug_assert_eq!(self.state, SessionLifecycle::Active);
        error!(
            session = self.ident,
            code = error.code.as_raw(),
            message = %error.message,
            "Failed to integrate downloaded changesets"
        );
        let surfaced = SyncError::client_transient(error.code, error.message.clone());
        self.client_error = Some(error);
        self.error_to_send = true;
        // Surface the failure; the ERROR report goes to the server at the
        // next send opportunity.
        self.emit(SessionEvent::Error(surfaced));
    }

    pub fn receive_mark(&mut self, request_ident: RequestIdent) -> SyncResult<()> {
        debug!(session = self.ident, request_ident, "Received: MARK");
        if self.state != SessionLifecycle::Active {
            return Ok(());
        }
        let legal = self.wire == WirePhase::Idented && !self.error_message_received;
        if !legal {
            return Err(SyncError::client(
                ClientErrorCode::BadMessageOrder,
                "MARK message is illegal at this time",
            ));
        }
        let good_request_ident = request_ident <= self.last_download_mark_sent
            && request_ident > self.last_download_mark_received;
        if !good_request_ident {
            return Err(SyncError::client(
                ClientErrorCode::BadRequestIdent,
                "bad request identifier in MARK message",
            ));
        }
        self.server_version_at_last_download_mark = self.progress.download.server_version;
        self.last_download_mark_received = request_ident;
        self.check_for_download_completion();
        Ok(())
    }

    /// The caller must discard the session if it is `Deactivated` upon
    /// return.
    pub fn receive_unbound(&mut self) -> SyncResult<()> {
        debug!(session = self.ident, "Received: UNBOUND");
        let legal = matches!(
            self.wire,
            WirePhase::Unbinding {
                unbound_received: false,
                ..
            }
        ) && !self.error_message_received;
        if !legal {
            return Err(SyncError::client(
                ClientErrorCode::BadMessageOrder,
                "UNBOUND message is illegal at this time",
            ));
        }
        if let WirePhase::Unbinding {
            unbound_received, ..
        } = &mut self.wire
        {
            *unbound_received = true;
        }
        if self.unbind_process_complete() {
            if self.state == SessionLifecycle::Deactivating {
                self.complete_deactivation();
            } else if self.state == SessionLifecycle::Active && !self.suspended {
                self.initiate_rebind();
            }
        }
        Ok(())
    }

    /// The caller must discard the session if it is `Deactivated` upon
    /// return.
    pub fn receive_error(&mut self, raw_code: u16, info: ErrorInfo) -> SyncResult<()> {
        info!(
            session = self.ident,
            code = raw_code,
            try_again = info.try_again,
            action = ?info.action,
            message = %info.message,
            "Received: ERROR"
        );
        let legal =
            self.wire != WirePhase::Idle && !self.error_message_received && !self.unbound_received();
        if !legal {
            return Err(SyncError::client(
                ClientErrorCode::BadMessageOrder,
                "ERROR message is illegal at this time",
            ));
        }
        let Some(code) = ProtocolErrorCode::from_raw(raw_code) else {
            return Err(SyncError::client(
                ClientErrorCode::BadErrorCode,
                "unknown error code in session-level ERROR message",
            ));
        };
        if !code.is_session_level() {
            return Err(SyncError::client(
                ClientErrorCode::BadErrorCode,
                "not a session-level error code",
            ));
        }
        if code == ProtocolErrorCode::CompensatingWrite {
            // Defer surfacing until the server version carrying the
            // compensating write appears in a DOWNLOAD message. When the
            // session is not active the error is dropped; the server
            // sends it again on the next connect.
            if self.state == SessionLifecycle::Active {
                self.pending_compensating.push_back((raw_code, info));
            }
            return Ok(());
        }
        self.error_message_received = true;
        let delay_override = info.resumption_delay_ms;
        let error = SyncError::from_server(raw_code, &info);
        self.suspend(error, raw_code, delay_override);
        Ok(())
    }

    fn unbound_received(&self) -> bool {
        matches!(
            self.wire,
            WirePhase::Unbinding {
                unbound_received: true,
                ..
            }
        )
    }

    pub fn receive_query_error(
        &mut self,
        code: u16,
        query_version: i64,
        message: &str,
    ) -> SyncResult<()> {
        info!(
            session = self.ident,
            code, query_version, message, "Received: QUERY_ERROR"
        );
        if self.state == SessionLifecycle::Active {
            if let Some(subscriptions) = self.subscriptions() {
                subscriptions.on_query_error(query_version, code, message);
            }
        }
        Ok(())
    }

    pub fn receive_test_command_response(
        &mut self,
        request_ident: RequestIdent,
        body: String,
    ) -> SyncResult<()> {
        info!(
            session = self.ident,
            request_ident, "Received: TEST_COMMAND response"
        );
        let position = self
            .pending_test_commands
            .iter()
            .position(|c| c.id == request_ident);
        let Some(position) = position else {
            return Err(SyncError::client(
                ClientErrorCode::BadRequestIdent,
                "no matching pending test command",
            ));
        };
        let mut command = self.pending_test_commands.remove(position);
        if let Some(reply) = command.reply.take() {
            let _ = reply.send(Ok(body));
        }
        Ok(())
    }

    // -- progress validation ------------------------------------------------

    /// The seven monotonicity rules checked against every DOWNLOAD
    /// message. Returns the number of the violated rule.
    fn check_received_sync_progress(&self, incoming: &SyncProgress) -> Result<(), u8> {
        let known = &self.progress;
        // Latest server version is weakly increasing.
        if incoming.latest_server_version.version < known.latest_server_version.version {
            return Err(1);
        }
        // Server-acknowledged client version is weakly increasing.
        if incoming.upload.client_version < known.upload.client_version {
            return Err(2);
        }
        // ... and can never exceed the highest local version.
        if incoming.upload.client_version > self.last_version_available {
            return Err(3);
        }
        // Download cursor is weakly increasing.
        if incoming.download.server_version < known.download.server_version {
            return Err(4);
        }
        // ... and can never exceed the latest server version.
        if incoming.download.server_version > incoming.latest_server_version.version {
            return Err(5);
        }
        // The client version embedded in the download cursor is weakly
        // increasing.
        if incoming.download.last_integrated_client_version
            < known.download.last_integrated_client_version
        {
            return Err(6);
        }
        // ... and can never exceed the server-acknowledged client version.
        if incoming.download.last_integrated_client_version > incoming.upload.client_version {
            return Err(7);
        }
        Ok(())
    }

    // -- completion detection -----------------------------------------------

    fn check_for_upload_completion(&mut self) {
        if !self.upload_completion_requested {
            return;
        }
        // The upload scan must have reached the end of the local history.
        debug_assert!(self.upload_progress.client_version <= self.last_version_available);
        if self.upload_progress.client_version != self.last_version_available {
            return;
        }
        // Every selected changeset must have been acknowledged.
        debug_assert!(self.progress.upload.client_version <= self.last_version_selected_for_upload);
        if self.progress.upload.client_version != self.last_version_selected_for_upload {
            return;
        }
        self.upload_completion_requested = false;
        self.emit(SessionEvent::UploadCompleted);
    }

    fn check_for_download_completion(&mut self) {
        debug_assert!(self.target_download_mark >= self.last_download_mark_received);
        debug_assert!(self.last_download_mark_received >= self.last_triggering_download_mark);
        if self.last_download_mark_received == self.last_triggering_download_mark {
            return;
        }
        if self.last_download_mark_received < self.target_download_mark {
            return;
        }
        if self.download_progress.server_version < self.server_version_at_last_download_mark {
            return;
        }
        self.last_triggering_download_mark = self.target_download_mark;
        if !self.allow_upload {
            // First download completion activates the upload process.
            self.allow_upload = true;
        }
        if self.cfg.flx && self.last_sent_query_version >= 0 {
            if let Some(subscriptions) = self.subscriptions() {
                subscriptions.on_version_complete(self.last_sent_query_version);
            }
        }
        self.emit(SessionEvent::DownloadCompleted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemoryHistory;
    use tidesync_protocol::{
        ClientMessage, CompensatingWrite, DownloadCursor, RemoteChangeset, SaltedVersion,
        UploadChangeset, UploadCursor,
    };

    fn runtime_config() -> SessionRuntimeConfig {
        SessionRuntimeConfig {
            flx: false,
            path: "/default".into(),
            access_token: "token".into(),
            resumption_backoff: BackoffConfig::default().without_jitter(),
            disable_upload_activation_delay: false,
        }
    }

    struct Harness {
        session: ProtocolSession,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        history: Arc<MemoryHistory>,
    }

    fn harness() -> Harness {
        let (tx, rx) = mpsc::unbounded_channel();
        let history = Arc::new(MemoryHistory::new());
        let mut session =
            ProtocolSession::new(1, runtime_config(), Arc::clone(&history) as _, None, tx);
        session.activate().unwrap();
        session.connection_established(false);
        Harness {
            session,
            events: rx,
            history,
        }
    }

    fn file_ident() -> SaltedFileIdent {
        SaltedFileIdent { ident: 9, salt: 44 }
    }

    fn progress(latest: Version, dl_server: Version, dl_client: Version, ul_client: Version) -> SyncProgress {
        SyncProgress {
            latest_server_version: SaltedVersion {
                version: latest,
                salt: 1,
            },
            download: DownloadCursor {
                server_version: dl_server,
                last_integrated_client_version: dl_client,
            },
            upload: UploadCursor {
                client_version: ul_client,
                last_integrated_server_version: dl_server.min(latest),
            },
        }
    }

    fn remote_changeset(remote_version: Version, origin: u64) -> RemoteChangeset {
        RemoteChangeset {
            remote_version,
            last_integrated_local_version: 0,
            origin_timestamp: 1,
            origin_file_ident: origin,
            payload: vec![0xab],
        }
    }

    fn download(progress_value: SyncProgress, changesets: Vec<RemoteChangeset>) -> Download {
        Download {
            session_ident: 1,
            progress: progress_value,
            downloadable_bytes: 0,
            last_in_batch: true,
            query_version: 0,
            changesets,
        }
    }

    /// Drives the handshake to the steady (Idented) state.
    fn drive_to_idented(h: &mut Harness) {
        let bind = h.session.next_message().expect("bind first");
        assert_eq!(bind.kind, SentKind::Bind);
        assert!(matches!(
            ClientMessage::decode(&bind.frame).unwrap(),
            ClientMessage::Bind(_)
        ));
        h.session.message_sent(SentKind::Bind);
        assert!(h.session.next_message().is_none(), "no IDENT before identity");
        h.session.receive_ident(file_ident()).unwrap();
        let ident = h.session.next_message().expect("ident after identity");
        assert_eq!(ident.kind, SentKind::Ident);
        h.session.message_sent(SentKind::Ident);
    }

    #[test]
    fn message_order_bind_then_ident() {
        let mut h = harness();
        drive_to_idented(&mut h);
        // Nothing else to send: no marks requested, uploads not allowed.
        assert!(h.session.next_message().is_none());
    }

    #[test]
    fn ident_before_bind_is_protocol_error() {
        let mut h = harness();
        let error = h.session.receive_ident(file_ident()).unwrap_err();
        assert_eq!(
            error.code,
            crate::error::ErrorCode::Client(ClientErrorCode::BadMessageOrder)
        );
    }

    #[test]
    fn download_progress_monotonicity_violations() {
        let mut h = harness();
        drive_to_idented(&mut h);
        h.session
            .receive_download(download(progress(10, 5, 0, 0), vec![remote_changeset(5, 3)]))
            .unwrap();

        // Rule 1: latest server version regresses.
        let error = h
            .session
            .receive_download(download(progress(9, 5, 0, 0), vec![]))
            .unwrap_err();
        assert_eq!(
            error.code,
            crate::error::ErrorCode::Client(ClientErrorCode::BadProgress)
        );
        assert!(error.message.contains("rule 1"));

        // Rule 4: download cursor regresses.
        let error = h
            .session
            .receive_download(download(progress(10, 4, 0, 0), vec![]))
            .unwrap_err();
        assert!(error.message.contains("rule 4"));

        // Rule 5: download cursor beyond latest server version.
        let error = h
            .session
            .receive_download(download(progress(10, 11, 0, 0), vec![]))
            .unwrap_err();
        assert!(error.message.contains("rule 5"));

        // Rule 3: server claims a client version that does not exist.
        let error = h
            .session
            .receive_download(download(progress(10, 5, 0, 7), vec![]))
            .unwrap_err();
        assert!(error.message.contains("rule 3"));

        // Advance the acknowledged client version to 2 legitimately.
        h.session.local_changes(2);
        h.session
            .receive_download(download(progress(10, 6, 2, 2), vec![]))
            .unwrap();

        // Rule 2: server-acknowledged client version regresses.
        let error = h
            .session
            .receive_download(download(progress(10, 6, 2, 1), vec![]))
            .unwrap_err();
        assert!(error.message.contains("rule 2"));

        // Rule 6: the client version embedded in the download cursor
        // regresses.
        let error = h
            .session
            .receive_download(download(progress(10, 6, 1, 2), vec![]))
            .unwrap_err();
        assert!(error.message.contains("rule 6"));

        // Rule 7: the download cursor claims more integration than the
        // server has acknowledged.
        let error = h
            .session
            .receive_download(download(progress(10, 6, 3, 2), vec![]))
            .unwrap_err();
        assert!(error.message.contains("rule 7"));
    }

    #[test]
    fn download_rejects_own_origin_and_zero_origin() {
        let mut h = harness();
        drive_to_idented(&mut h);

        let error = h
            .session
            .receive_download(download(progress(10, 6, 0, 0), vec![remote_changeset(6, 0)]))
            .unwrap_err();
        assert_eq!(
            error.code,
            crate::error::ErrorCode::Client(ClientErrorCode::BadOriginFileIdent)
        );

        // The session's own file ident must never be echoed back.
        let error = h
            .session
            .receive_download(download(
                progress(10, 6, 0, 0),
                vec![remote_changeset(6, file_ident().ident)],
            ))
            .unwrap_err();
        assert_eq!(
            error.code,
            crate::error::ErrorCode::Client(ClientErrorCode::BadOriginFileIdent)
        );
    }

    #[test]
    fn download_rejects_nonincreasing_changeset_versions() {
        let mut h = harness();
        drive_to_idented(&mut h);
        let error = h
            .session
            .receive_download(download(
                progress(10, 6, 0, 0),
                vec![remote_changeset(6, 3), remote_changeset(6, 3)],
            ))
            .unwrap_err();
        assert_eq!(
            error.code,
            crate::error::ErrorCode::Client(ClientErrorCode::BadServerVersion)
        );
    }

    #[test]
    fn mark_round_trip_and_stale_ack() {
        let mut h = harness();
        drive_to_idented(&mut h);

        for _ in 0..5 {
            h.session.request_download_completion();
        }
        let mark = h.session.next_message().expect("mark message");
        assert_eq!(mark.kind, SentKind::Mark);
        match ClientMessage::decode(&mark.frame).unwrap() {
            ClientMessage::Mark(m) => assert_eq!(m.request_ident, 5),
            other => panic!("expected MARK, got {other:?}"),
        }
        h.session.message_sent(SentKind::Mark);

        h.session.receive_mark(5).unwrap();
        // An acknowledgement for an already superseded identifier is a
        // protocol violation.
        let error = h.session.receive_mark(4).unwrap_err();
        assert_eq!(
            error.code,
            crate::error::ErrorCode::Client(ClientErrorCode::BadRequestIdent)
        );
    }

    #[test]
    fn download_completion_requires_mark_and_catchup() {
        let mut h = harness();
        drive_to_idented(&mut h);

        // Server announces data at version 5.
        h.session
            .receive_download(download(progress(5, 5, 0, 0), vec![remote_changeset(5, 3)]))
            .unwrap();
        h.session.request_download_completion();
        let mark = h.session.next_message().expect("mark");
        assert_eq!(mark.kind, SentKind::Mark);
        h.session.message_sent(SentKind::Mark);

        h.session.receive_mark(1).unwrap();

        let mut saw_download_completion = false;
        while let Ok(event) = h.events.try_recv() {
            if matches!(event, SessionEvent::DownloadCompleted) {
                saw_download_completion = true;
            }
        }
        assert!(saw_download_completion);
    }

    #[test]
    fn upload_completion_requires_scan_and_ack() {
        let mut h = harness();
        h.history.add_local_changeset(UploadChangeset {
            client_version: 1,
            last_integrated_server_version: 0,
            origin_timestamp: 0,
            origin_file_ident: 0,
            payload: vec![1, 2],
        });
        // Recompute status: re-activate a fresh session against the
        // updated history.
        let (tx, rx) = mpsc::unbounded_channel();
        let mut session = ProtocolSession::new(
            1,
            runtime_config(),
            Arc::clone(&h.history) as _,
            None,
            tx,
        );
        session.activate().unwrap();
        session.connection_established(false);
        h.session = session;
        h.events = rx;
        drive_to_idented(&mut h);

        h.session.request_upload_completion();
        // Not complete: nothing scanned or acknowledged yet.
        while let Ok(event) = h.events.try_recv() {
            assert!(!matches!(event, SessionEvent::UploadCompleted));
        }

        // Lift the activation delay via download completion.
        h.session.request_download_completion();
        let mark = h.session.next_message().unwrap();
        assert_eq!(mark.kind, SentKind::Mark);
        h.session.message_sent(SentKind::Mark);
        h.session.receive_mark(1).unwrap();

        let upload = h.session.next_message().expect("upload after activation");
        assert_eq!(upload.kind, SentKind::Upload);
        h.session.message_sent(SentKind::Upload);

        // Scan is complete but the server has not acknowledged: no
        // completion yet.
        let mut completed = false;
        while let Ok(event) = h.events.try_recv() {
            if matches!(event, SessionEvent::UploadCompleted) {
                completed = true;
            }
        }
        assert!(!completed);

        // Server acknowledges client version 1.
        h.session
            .receive_download(download(progress(6, 6, 1, 1), vec![remote_changeset(6, 3)]))
            .unwrap();
        let mut completed = false;
        while let Ok(event) = h.events.try_recv() {
            if matches!(event, SessionEvent::UploadCompleted) {
                completed = true;
            }
        }
        assert!(completed);
    }

    #[test]
    fn compensating_write_deferred_until_download() {
        let mut h = harness();
        drive_to_idented(&mut h);

        let mut info = ErrorInfo::transient("write rejected");
        info.action = tidesync_protocol::RecoveryAction::Warning;
        info.compensating_write = Some(CompensatingWrite {
            rejected_client_version: 3,
            server_version: 8,
        });
        h.session
            .receive_error(ProtocolErrorCode::CompensatingWrite.as_raw(), info)
            .unwrap();

        // Not surfaced yet, and the session is not suspended.
        while let Ok(event) = h.events.try_recv() {
            assert!(!matches!(event, SessionEvent::Error(_)));
        }
        assert!(!h.session.is_suspended());

        // A download short of server version 8 does not surface it.
        h.session
            .receive_download(download(progress(10, 6, 0, 0), vec![remote_changeset(6, 3)]))
            .unwrap();
        while let Ok(event) = h.events.try_recv() {
            assert!(!matches!(event, SessionEvent::Error(_)));
        }

        // Version 8 appears: the compensating write surfaces.
        h.session
            .receive_download(download(progress(10, 8, 0, 0), vec![remote_changeset(8, 3)]))
            .unwrap();
        let mut surfaced = false;
        while let Ok(event) = h.events.try_recv() {
            if let SessionEvent::Error(error) = event {
                assert!(error.compensating_write.is_some());
                surfaced = true;
            }
        }
        assert!(surfaced);
    }

    #[test]
    fn session_error_suspends_and_unbinds() {
        let mut h = harness();
        drive_to_idented(&mut h);

        let mut info = ErrorInfo::transient("session closed");
        info.resumption_delay_ms = Some(50);
        h.session
            .receive_error(ProtocolErrorCode::SessionClosed.as_raw(), info)
            .unwrap();
        assert!(h.session.is_suspended());
        assert!(h.session.resumption_deadline.is_some());

        // The suspension surfaced as an error event.
        let mut surfaced = false;
        while let Ok(event) = h.events.try_recv() {
            if matches!(event, SessionEvent::Error(_)) {
                surfaced = true;
            }
        }
        assert!(surfaced);

        // Next send opportunity produces the UNBIND.
        let unbind = h.session.next_message().expect("unbind");
        assert_eq!(unbind.kind, SentKind::Unbind);
        h.session.message_sent(SentKind::Unbind);
        // ERROR was received, so the unbind process completes without an
        // UNBOUND message; the session rebinds on resumption.
        assert_eq!(h.session.state(), SessionLifecycle::Active);

        assert!(h.session.cancel_resumption_delay());
        let bind = h.session.next_message().expect("rebind after resume");
        assert_eq!(bind.kind, SentKind::Bind);
    }

    #[test]
    fn deactivation_before_bind_completes_immediately() {
        let mut h = harness();
        h.session.initiate_deactivation();
        assert_eq!(h.session.state(), SessionLifecycle::Deactivated);
    }

    #[test]
    fn deactivation_after_bind_runs_unbind_round_trip() {
        let mut h = harness();
        drive_to_idented(&mut h);
        h.session.initiate_deactivation();
        assert_eq!(h.session.state(), SessionLifecycle::Deactivating);

        let unbind = h.session.next_message().expect("unbind");
        assert_eq!(unbind.kind, SentKind::Unbind);
        h.session.message_sent(SentKind::Unbind);
        assert_eq!(h.session.state(), SessionLifecycle::Deactivating);

        h.session.receive_unbound().unwrap();
        assert_eq!(h.session.state(), SessionLifecycle::Deactivated);
    }

    #[test]
    fn integration_failure_reports_error_to_server() {
        let mut h = harness();
        drive_to_idented(&mut h);
        h.history
            .fail_next_integration(IntegrationError::bad_changeset("malformed"));

        h.session
            .receive_download(download(progress(10, 6, 0, 0), vec![remote_changeset(6, 3)]))
            .unwrap();

        // Surfaced to the application...
        let mut surfaced = false;
        while let Ok(event) = h.events.try_recv() {
            if matches!(event, SessionEvent::Error(_)) {
                surfaced = true;
            }
        }
        assert!(surfaced);

        // ...and reported to the server as a diagnostic.
        let report = h.session.next_message().expect("error report");
        assert_eq!(report.kind, SentKind::ErrorReport);
        match ClientMessage::decode(&report.frame).unwrap() {
            ClientMessage::Error(e) => {
                assert_eq!(e.code, ClientErrorCode::BadChangeset.as_raw());
            }
            other => panic!("expected ERROR, got {other:?}"),
        }
        h.session.message_sent(SentKind::ErrorReport);

        // Further downloads are ignored, not re-integrated.
        h.session
            .receive_download(download(progress(10, 7, 0, 0), vec![remote_changeset(7, 3)]))
            .unwrap();
        assert_eq!(h.history.integrated().len(), 0);
    }

    #[test]
    fn connection_loss_resets_wire_state() {
        let mut h = harness();
        drive_to_idented(&mut h);
        h.session.connection_lost();
        h.session.connection_established(false);
        let bind = h.session.next_message().expect("fresh bind");
        assert_eq!(bind.kind, SentKind::Bind);
        // The identity is already known; no need-ident round trip.
        match ClientMessage::decode(&bind.frame).unwrap() {
            ClientMessage::Bind(b) => assert!(!b.need_file_ident),
            other => panic!("expected BIND, got {other:?}"),
        }
    }

    #[test]
    fn test_command_round_trip() {
        let mut h = harness();
        drive_to_idented(&mut h);
        let (reply_tx, mut reply_rx) = oneshot::channel();
        h.session.add_test_command("echo".into(), reply_tx);

        let command = h.session.next_message().expect("test command");
        assert_eq!(command.kind, SentKind::TestCommand);
        h.session.message_sent(SentKind::TestCommand);

        h.session
            .receive_test_command_response(1, "echo-response".into())
            .unwrap();
        assert_eq!(reply_rx.try_recv().unwrap().unwrap(), "echo-response");

        // A response for an unknown request is a protocol violation.
        let error = h
            .session
            .receive_test_command_response(99, "bogus".into())
            .unwrap_err();
        assert_eq!(
            error.code,
            crate::error::ErrorCode::Client(ClientErrorCode::BadRequestIdent)
        );
    }
}
