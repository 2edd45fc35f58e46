//! The application-facing session state machine.
//!
//! A `SyncSession` owns the lifecycle of one synchronized local store,
//! exposing a stable interface (close, pause, resume) regardless of what
//! the network is doing underneath. It reacts to protocol errors by
//! choosing recovery actions, and keeps completion-callback bookkeeping
//! consistent across protocol session restarts.
//!
//! State transitions:
//!
//! - `WaitingForAccessToken`: a credential refresh is outstanding.
//!   To `Active` on success; to `Inactive` on logout or close.
//! - `Active`: connected and transferring. To `Inactive` on logout or
//!   close with the `Immediate` stop policy; to `Dying` on close with
//!   `AfterChangesUploaded`.
//! - `Dying`: draining uploads before teardown. To `Inactive` when
//!   upload completion is observed or on explicit logout; to `Active` if
//!   revived; to `WaitingForAccessToken` if revival needs a token.
//! - `Inactive`: quiescent; no underlying protocol session. To `Active`
//!   or `WaitingForAccessToken` on revival.
//! - `Paused`: operator-requested suspension; only an explicit `resume`
//!   leaves it (revival attempts are no-ops).

use crate::callbacks::CallbackRegistry;
use crate::client::{ConnectionKey, SyncClient};
use crate::config::{ResyncMode, SessionConfig, StopPolicy, SyncMode};
use crate::connection::{ConnCommand, ConnectionState, SessionActivation};
use crate::error::{ErrorCode, SyncError, SyncResult};
use crate::history::{
    FreshCopyDownloader, History, MigrationObserver, SubscriptionStore, TokenProvider,
};
use crate::progress::{ProgressCallback, ProgressDirection, ProgressTracker};
use crate::session::{SessionEvent, SessionRuntimeConfig};
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::sync::Arc;
use tidesync_protocol::{
    parse_server_url, ClientErrorCode, ProtocolErrorCode, RecoveryAction, ServerEndpoint,
    SessionIdent, UrlError, Version,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Lifecycle state of a [`SyncSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected (or connecting) and transferring.
    Active,
    /// Draining uploads before teardown.
    Dying,
    /// Quiescent; no underlying protocol session.
    Inactive,
    /// A credential refresh is outstanding.
    WaitingForAccessToken,
    /// Operator-requested suspension; leave with `resume()`.
    Paused,
}

/// A reported connection state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStateChange {
    /// The previous state.
    pub old_state: ConnectionState,
    /// The new state.
    pub new_state: ConnectionState,
}

/// Callback resolved when a completion wait finishes; receives `Ok` on
/// completion or the cancellation/error status. Waits are never silently
/// dropped.
pub type CompletionCallback = Box<dyn FnOnce(SyncResult<()>) + Send>;

/// Handler invoked with every error surfaced to the application.
pub type ErrorHandler = Arc<dyn Fn(SyncError) + Send + Sync>;

struct SessionStateData {
    state: SessionState,
    session_ident: Option<SessionIdent>,
    conn_cmd: Option<mpsc::UnboundedSender<ConnCommand>>,
    completion: BTreeMap<u64, (ProgressDirection, CompletionCallback)>,
    completion_counter: u64,
    /// Bumped each time the session starts dying; detects superseded
    /// deactivation attempts.
    death_count: u64,
}

struct SessionInner {
    client: SyncClient,
    endpoint: ServerEndpoint,
    history: Arc<dyn History>,
    subscriptions: Option<Arc<dyn SubscriptionStore>>,
    token_provider: Option<Arc<dyn TokenProvider>>,
    fresh_copy: Option<Arc<dyn FreshCopyDownloader>>,
    migration_observer: Mutex<Option<MigrationObserver>>,
    config: Mutex<SessionConfig>,
    state: Mutex<SessionStateData>,
    conn_state: Mutex<ConnectionState>,
    conn_listeners: CallbackRegistry<ConnectionStateChange>,
    progress: ProgressTracker,
    error_handler: Mutex<Option<ErrorHandler>>,
}

/// Builder for a [`SyncSession`].
pub struct SyncSessionBuilder {
    client: SyncClient,
    config: SessionConfig,
    history: Arc<dyn History>,
    subscriptions: Option<Arc<dyn SubscriptionStore>>,
    token_provider: Option<Arc<dyn TokenProvider>>,
    fresh_copy: Option<Arc<dyn FreshCopyDownloader>>,
    migration_observer: Option<MigrationObserver>,
}

impl SyncSessionBuilder {
    /// Attaches a subscription store (required for flexible sync).
    pub fn with_subscriptions(mut self, subscriptions: Arc<dyn SubscriptionStore>) -> Self {
        self.subscriptions = Some(subscriptions);
        self
    }

    /// Attaches a credential holder.
    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    /// Attaches the client-reset fresh-copy flow.
    pub fn with_fresh_copy_downloader(mut self, downloader: Arc<dyn FreshCopyDownloader>) -> Self {
        self.fresh_copy = Some(downloader);
        self
    }

    /// Attaches an observer of server-requested migrations.
    pub fn with_migration_observer(
        mut self,
        observer: impl Fn(RecoveryAction, Option<&str>) + Send + Sync + 'static,
    ) -> Self {
        self.migration_observer = Some(Box::new(observer));
        self
    }

    /// Builds the session. It starts `Inactive`; call
    /// [`SyncSession::revive_if_needed`] to bring it up.
    pub fn build(self) -> Result<SyncSession, UrlError> {
        let endpoint = parse_server_url(&self.config.server_url)?;
        self.client.register_session(&self.config.store_path);
        let inner = Arc::new(SessionInner {
            client: self.client,
            endpoint,
            history: self.history,
            subscriptions: self.subscriptions,
            token_provider: self.token_provider,
            fresh_copy: self.fresh_copy,
            migration_observer: Mutex::new(self.migration_observer),
            config: Mutex::new(self.config),
            state: Mutex::new(SessionStateData {
                state: SessionState::Inactive,
                session_ident: None,
                conn_cmd: None,
                completion: BTreeMap::new(),
                completion_counter: 0,
                death_count: 0,
            }),
            conn_state: Mutex::new(ConnectionState::Disconnected),
            conn_listeners: CallbackRegistry::new(),
            progress: ProgressTracker::new(),
            error_handler: Mutex::new(None),
        });
        Ok(SyncSession { inner })
    }
}

/// The application-facing handle to one synchronized store.
///
/// Cheap to clone; all clones share state. Entry points may be invoked
/// from any thread; no internal lock is ever held while a user-supplied
/// callback runs.
#[derive(Clone)]
pub struct SyncSession {
    inner: Arc<SessionInner>,
}

impl SyncSession {
    /// Starts building a session for `config` against `client`, reading
    /// and writing the local store through `history`.
    pub fn builder(
        client: &SyncClient,
        config: SessionConfig,
        history: Arc<dyn History>,
    ) -> SyncSessionBuilder {
        SyncSessionBuilder {
            client: client.clone(),
            config,
            history,
            subscriptions: None,
            token_provider: None,
            fresh_copy: None,
            migration_observer: None,
        }
    }

    /// The current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner.state.lock().state
    }

    /// The current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.conn_state.lock()
    }

    /// Installs the application error handler. The handler is invoked at
    /// most once per error event.
    pub fn set_error_handler(&self, handler: impl Fn(SyncError) + Send + Sync + 'static) {
        *self.inner.error_handler.lock() = Some(Arc::new(handler));
    }

    /// Brings the session up unless it is already up, paused, or waiting
    /// for a token.
    pub fn revive_if_needed(&self) {
        let guard = self.inner.state.lock();
        match guard.state {
            SessionState::Active | SessionState::WaitingForAccessToken | SessionState::Paused => {}
            SessionState::Dying | SessionState::Inactive => {
                SessionInner::do_revive(&self.inner, guard);
            }
        }
    }

    /// Hints that network conditions changed: retry connecting without
    /// waiting out the backoff delay.
    pub fn handle_reconnect(&self) {
        let guard = self.inner.state.lock();
        match guard.state {
            SessionState::Active => {
                if let Some(cmd) = &guard.conn_cmd {
                    let _ = cmd.send(ConnCommand::CancelReconnectDelay);
                }
            }
            _ => {}
        }
    }

    /// Applies the configured stop policy.
    pub fn close(&self) {
        let guard = self.inner.state.lock();
        match guard.state {
            SessionState::Active => {
                let policy = self.inner.config.lock().stop_policy;
                match policy {
                    StopPolicy::Immediate => {
                        SessionInner::become_inactive(&self.inner, guard, None)
                    }
                    StopPolicy::LiveIndefinitely => {}
                    StopPolicy::AfterChangesUploaded => {
                        SessionInner::become_dying(&self.inner, guard)
                    }
                }
            }
            SessionState::WaitingForAccessToken => {
                SessionInner::become_inactive(&self.inner, guard, None);
            }
            SessionState::Dying | SessionState::Paused | SessionState::Inactive => {
                drop(guard);
                let store_path = self.inner.store_path();
                self.inner.client.unregister_session(&store_path);
            }
        }
    }

    /// Collapses the session directly to `Inactive`, regardless of stop
    /// policy.
    pub fn force_close(&self) {
        let guard = self.inner.state.lock();
        match guard.state {
            SessionState::Active | SessionState::Dying | SessionState::WaitingForAccessToken => {
                SessionInner::become_inactive(&self.inner, guard, None);
            }
            SessionState::Inactive | SessionState::Paused => {}
        }
    }

    /// Suspends the session until [`SyncSession::resume`]. Unlike
    /// `Inactive`, revival attempts are no-ops while paused.
    pub fn pause(&self) {
        let guard = self.inner.state.lock();
        match guard.state {
            SessionState::Active
            | SessionState::Dying
            | SessionState::WaitingForAccessToken
            | SessionState::Inactive => {
                SessionInner::become_paused(&self.inner, guard);
            }
            SessionState::Paused => {}
        }
    }

    /// Ends a pause (or revives a dying/inactive session).
    pub fn resume(&self) {
        let guard = self.inner.state.lock();
        match guard.state {
            SessionState::Active | SessionState::WaitingForAccessToken => {}
            SessionState::Paused | SessionState::Dying | SessionState::Inactive => {
                SessionInner::do_revive(&self.inner, guard);
            }
        }
    }

    /// Registers a callback resolved when upload completion is reached.
    /// If the session is torn down first, the callback resolves with the
    /// cancellation status instead.
    pub fn wait_for_upload_completion(&self, callback: impl FnOnce(SyncResult<()>) + Send + 'static) {
        self.add_completion_callback(ProgressDirection::Upload, Box::new(callback));
    }

    /// Registers a callback resolved when download completion is reached.
    pub fn wait_for_download_completion(
        &self,
        callback: impl FnOnce(SyncResult<()>) + Send + 'static,
    ) {
        self.add_completion_callback(ProgressDirection::Download, Box::new(callback));
    }

    fn add_completion_callback(&self, direction: ProgressDirection, callback: CompletionCallback) {
        let mut guard = self.inner.state.lock();
        guard.completion_counter += 1;
        let id = guard.completion_counter;
        guard.completion.insert(id, (direction, callback));
        // Without a protocol session the callback stays queued; it is
        // re-registered when the session next becomes active.
        if let (Some(cmd), Some(ident)) = (&guard.conn_cmd, guard.session_ident) {
            let _ = cmd.send(completion_request(direction, ident));
        }
    }

    /// Registers a transfer progress callback; returns a removal token.
    pub fn register_progress_notifier(
        &self,
        direction: ProgressDirection,
        streaming: bool,
        callback: ProgressCallback,
    ) -> u64 {
        self.inner.progress.register(direction, streaming, callback)
    }

    /// Removes a progress callback.
    pub fn unregister_progress_notifier(&self, token: u64) {
        self.inner.progress.unregister(token);
    }

    /// Registers a connection state change callback; returns a removal
    /// token.
    pub fn register_connection_change_callback(
        &self,
        callback: impl Fn(&ConnectionStateChange) + Send + Sync + 'static,
    ) -> u64 {
        self.inner.conn_listeners.add(callback)
    }

    /// Removes a connection state change callback.
    pub fn unregister_connection_change_callback(&self, token: u64) {
        self.inner.conn_listeners.remove(token);
    }

    /// Tells the session that the local store advanced to `version`
    /// through a non-sync write, so the new changesets become eligible
    /// for upload.
    pub fn notify_local_commit(&self, version: Version) {
        self.inner.progress.set_local_version(version);
        let guard = self.inner.state.lock();
        match guard.state {
            SessionState::Active | SessionState::WaitingForAccessToken => {
                if let (Some(cmd), Some(ident)) = (&guard.conn_cmd, guard.session_ident) {
                    let _ = cmd.send(ConnCommand::LocalChanges { ident, version });
                }
            }
            SessionState::Dying | SessionState::Inactive | SessionState::Paused => {}
        }
    }

    /// Tells the session that the subscription store has a new query set
    /// version to announce.
    pub fn notify_query_set_changed(&self) {
        let guard = self.inner.state.lock();
        if let (Some(cmd), Some(ident)) = (&guard.conn_cmd, guard.session_ident) {
            let _ = cmd.send(ConnCommand::QuerySetChanged { ident });
        }
    }

    /// Supplies a freshly refreshed access token.
    pub fn update_access_token(&self, _token: &str) {
        // The token itself is read back from the credential holder at
        // bind time; this call only unblocks a waiting session.
        let guard = self.inner.state.lock();
        if guard.state == SessionState::WaitingForAccessToken {
            SessionInner::become_active_from(&self.inner, guard);
        }
    }

    /// Sends a test command to the server and awaits its response.
    pub async fn send_test_command(&self, body: impl Into<String>) -> SyncResult<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let guard = self.inner.state.lock();
            match (&guard.conn_cmd, guard.session_ident) {
                (Some(cmd), Some(ident)) => {
                    let _ = cmd.send(ConnCommand::SendTestCommand {
                        ident,
                        body: body.into(),
                        reply: reply_tx,
                    });
                }
                _ => return Err(SyncError::aborted()),
            }
        }
        reply_rx.await.unwrap_or_else(|_| Err(SyncError::aborted()))
    }

    /// Reads a copy of the session configuration.
    pub fn config(&self) -> SessionConfig {
        self.inner.config.lock().clone()
    }

    /// Replaces parts of the configuration. Only allowed while the
    /// session is `Inactive` or `Paused`.
    pub fn update_config(&self, update: impl FnOnce(&mut SessionConfig)) -> SyncResult<()> {
        {
            let guard = self.inner.state.lock();
            if !matches!(guard.state, SessionState::Inactive | SessionState::Paused) {
                return Err(SyncError::client(
                    ClientErrorCode::BadMessageOrder,
                    "configuration can only change while the session is inactive or paused",
                ));
            }
        }
        update(&mut self.inner.config.lock());
        Ok(())
    }
}

enum NextStateAfterError {
    None,
    Inactive,
    Error,
}

impl SessionInner {
    fn store_path(&self) -> String {
        self.config.lock().store_path.clone()
    }

    // -- state transitions --------------------------------------------------

    fn do_revive(inner: &Arc<SessionInner>, guard: MutexGuard<'_, SessionStateData>) {
        let needs_refresh = inner
            .token_provider
            .as_ref()
            .is_some_and(|provider| provider.refresh_required());
        if !needs_refresh {
            Self::become_active_from(inner, guard);
            return;
        }
        let mut guard = guard;
        guard.state = SessionState::WaitingForAccessToken;
        drop(guard);
        Self::initiate_access_token_refresh(inner);
    }

    fn become_active_from(inner: &Arc<SessionInner>, mut guard: MutexGuard<'_, SessionStateData>) {
        Self::become_active(inner, &mut guard);
        drop(guard);
    }

    fn become_active(inner: &Arc<SessionInner>, data: &mut SessionStateData) {
        data.state = SessionState::Active;
        if data.session_ident.is_none() {
            let ident = inner.client.next_session_ident();
            let (event_tx, mut event_rx) = mpsc::unbounded_channel();
            let (config, key) = {
                let config = inner.config.lock();
                let runtime = SessionRuntimeConfig {
                    flx: config.sync_mode.is_flx(),
                    path: match &config.sync_mode {
                        SyncMode::Partition(path) => path.clone(),
                        SyncMode::Flexible => String::new(),
                    },
                    access_token: inner
                        .token_provider
                        .as_ref()
                        .and_then(|provider| provider.access_token())
                        .unwrap_or_default(),
                    resumption_backoff: config.resumption_backoff,
                    disable_upload_activation_delay: inner
                        .client
                        .config()
                        .disable_upload_activation_delay,
                };
                let key = ConnectionKey {
                    endpoint: inner.endpoint.clone(),
                    isolated: inner
                        .client
                        .config()
                        .one_connection_per_session
                        .then_some(ident),
                };
                (runtime, key)
            };
            let activation = SessionActivation {
                ident,
                config,
                history: Arc::clone(&inner.history),
                subscriptions: inner.subscriptions.as_ref().map(Arc::downgrade),
                events: event_tx,
            };
            let cmd_tx = inner.client.activate_session(key, activation);
            data.session_ident = Some(ident);
            data.conn_cmd = Some(cmd_tx);

            let weak = Arc::downgrade(inner);
            tokio::spawn(async move {
                while let Some(event) = event_rx.recv().await {
                    let Some(inner) = weak.upgrade() else { break };
                    SessionInner::handle_event(&inner, ident, event);
                }
            });
            debug!(session = ident, "Session became active");
        }
        // Re-register queued completion waits with the (new) protocol
        // session. Callbacks stay owned here; only the requests travel.
        if let (Some(cmd), Some(ident)) = (&data.conn_cmd, data.session_ident) {
            for (direction, _) in data.completion.values() {
                let _ = cmd.send(completion_request(*direction, ident));
            }
        }
    }

    fn become_dying(inner: &Arc<SessionInner>, mut guard: MutexGuard<'_, SessionStateData>) {
        guard.state = SessionState::Dying;
        // Without a protocol session nothing can possibly upload.
        if guard.session_ident.is_none() {
            Self::become_inactive_locked(inner, guard, None);
            return;
        }
        guard.death_count += 1;
        if let (Some(cmd), Some(ident)) = (&guard.conn_cmd, guard.session_ident) {
            let _ = cmd.send(ConnCommand::RequestUploadCompletion { ident });
        }
        debug!(
            generation = guard.death_count,
            "Session is dying; waiting for uploads to drain"
        );
    }

    fn become_inactive(
        inner: &Arc<SessionInner>,
        guard: MutexGuard<'_, SessionStateData>,
        status: Option<SyncError>,
    ) {
        Self::become_inactive_locked(inner, guard, status);
    }

    fn become_inactive_locked(
        inner: &Arc<SessionInner>,
        mut guard: MutexGuard<'_, SessionStateData>,
        status: Option<SyncError>,
    ) {
        guard.state = SessionState::Inactive;
        Self::do_teardown(inner, guard, status);
    }

    fn become_paused(inner: &Arc<SessionInner>, mut guard: MutexGuard<'_, SessionStateData>) {
        let old_state = guard.state;
        guard.state = SessionState::Paused;
        // Nothing to tear down if we were already inactive.
        if old_state == SessionState::Inactive {
            return;
        }
        Self::do_teardown(inner, guard, None);
    }

    /// Drops the protocol session, resolves queued completion waits with
    /// the cancellation status, and reports the connection as
    /// disconnected. The state lock is released before any callback runs.
    fn do_teardown(
        inner: &Arc<SessionInner>,
        mut guard: MutexGuard<'_, SessionStateData>,
        status: Option<SyncError>,
    ) {
        if let (Some(cmd), Some(ident)) = (guard.conn_cmd.take(), guard.session_ident.take()) {
            let _ = cmd.send(ConnCommand::DeactivateSession { ident });
        }
        let waits: Vec<CompletionCallback> = std::mem::take(&mut guard.completion)
            .into_values()
            .map(|(_, callback)| callback)
            .collect();
        drop(guard);

        let store_path = inner.store_path();
        inner.client.unregister_session(&store_path);

        let old_state = {
            let mut conn_state = inner.conn_state.lock();
            let old = *conn_state;
            *conn_state = ConnectionState::Disconnected;
            old
        };
        if old_state != ConnectionState::Disconnected {
            inner.conn_listeners.invoke(&ConnectionStateChange {
                old_state,
                new_state: ConnectionState::Disconnected,
            });
        }

        let status = status.unwrap_or_else(SyncError::aborted);
        for callback in waits {
            callback(Err(status.clone()));
        }
    }

    /// Tears down and recreates the protocol session without resolving
    /// completion waits, so they carry across the restart.
    fn restart_session(inner: &Arc<SessionInner>) {
        let mut guard = inner.state.lock();
        if guard.state == SessionState::Paused {
            return;
        }
        guard.state = SessionState::Inactive;
        if let (Some(cmd), Some(ident)) = (guard.conn_cmd.take(), guard.session_ident.take()) {
            let _ = cmd.send(ConnCommand::DeactivateSession { ident });
        }
        Self::become_active(inner, &mut guard);
    }

    // -- token refresh ------------------------------------------------------

    fn initiate_access_token_refresh(inner: &Arc<SessionInner>) {
        let Some(provider) = inner.token_provider.clone() else {
            return;
        };
        let weak = Arc::downgrade(inner);
        provider.refresh(Box::new(move |result| {
            let Some(inner) = weak.upgrade() else { return };
            SessionInner::handle_refresh_result(&inner, result);
        }));
    }

    fn handle_refresh_result(inner: &Arc<SessionInner>, result: SyncResult<String>) {
        match result {
            Ok(_token) => {
                let guard = inner.state.lock();
                if guard.state == SessionState::WaitingForAccessToken {
                    Self::become_active_from(inner, guard);
                }
            }
            Err(error) if error.code == ErrorCode::BadAuthentication => {
                Self::handle_bad_auth(inner, error);
            }
            Err(error) => {
                warn!(%error, "Access token refresh failed");
                let guard = inner.state.lock();
                if guard.state == SessionState::WaitingForAccessToken {
                    Self::become_inactive_locked(inner, guard, Some(error.clone()));
                    Self::invoke_error_handler(inner, error);
                }
            }
        }
    }

    /// A single token-refresh retry is attempted when the data connection
    /// is refused with an authorization failure; a second failure lands
    /// here via [`Self::handle_bad_auth`].
    fn initiate_refresh_for_retry(inner: &Arc<SessionInner>) {
        let Some(provider) = inner.token_provider.clone() else {
            return;
        };
        let weak = Arc::downgrade(inner);
        let client = inner.client.clone();
        provider.refresh(Box::new(move |result| {
            let Some(inner) = weak.upgrade() else { return };
            match result {
                Ok(_token) => {
                    // Token refreshed: retry the connection promptly.
                    client.cancel_reconnect_delays();
                }
                Err(error) if error.code == ErrorCode::BadAuthentication => {
                    SessionInner::handle_bad_auth(&inner, error);
                }
                Err(error) => {
                    warn!(%error, "Access token refresh failed; waiting for reconnect backoff");
                }
            }
        }));
    }

    fn handle_bad_auth(inner: &Arc<SessionInner>, error: SyncError) {
        let guard = inner.state.lock();
        if !matches!(guard.state, SessionState::Inactive | SessionState::Paused) {
            Self::become_inactive_locked(inner, guard, Some(error.clone()));
        } else {
            drop(guard);
        }
        if let Some(provider) = &inner.token_provider {
            provider.log_out();
        }
        let mut fatal = error;
        fatal.is_fatal = true;
        Self::invoke_error_handler(inner, fatal);
    }

    fn invoke_error_handler(inner: &Arc<SessionInner>, error: SyncError) {
        let handler = inner.error_handler.lock().clone();
        if let Some(handler) = handler {
            handler(error);
        }
    }

    // -- event handling -----------------------------------------------------

    fn handle_event(inner: &Arc<SessionInner>, ident: SessionIdent, event: SessionEvent) {
        let current = inner.state.lock().session_ident == Some(ident);
        if !current {
            return;
        }
        match event {
            SessionEvent::ConnState { state, error } => {
                let change = {
                    let mut conn_state = inner.conn_state.lock();
                    if *conn_state == state {
                        None
                    } else {
                        let old_state = *conn_state;
                        *conn_state = state;
                        Some(old_state)
                    }
                };
                // Reported only when the state actually changed, with no
                // lock held during the callbacks.
                if let Some(old_state) = change {
                    inner.conn_listeners.invoke(&ConnectionStateChange {
                        old_state,
                        new_state: state,
                    });
                }
                if let Some(error) = error {
                    Self::handle_error(inner, error);
                }
            }
            SessionEvent::Error(error) => Self::handle_error(inner, error),
            SessionEvent::UploadCompleted => {
                Self::resolve_completions(inner, ProgressDirection::Upload);
                let guard = inner.state.lock();
                if guard.state == SessionState::Dying {
                    Self::become_inactive_locked(inner, guard, None);
                }
            }
            SessionEvent::DownloadCompleted => {
                Self::resolve_completions(inner, ProgressDirection::Download);
            }
            SessionEvent::Progress(progress) => {
                inner.progress.update(progress);
            }
        }
    }

    fn resolve_completions(inner: &Arc<SessionInner>, direction: ProgressDirection) {
        let callbacks: Vec<CompletionCallback> = {
            let mut guard = inner.state.lock();
            let ids: Vec<u64> = guard
                .completion
                .iter()
                .filter(|(_, (d, _))| *d == direction)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| guard.completion.remove(&id))
                .map(|(_, callback)| callback)
                .collect()
        };
        for callback in callbacks {
            callback(Ok(()));
        }
    }

    // -- error classification -----------------------------------------------

    /// Classifies an error into a recovery path: fatal protocol actions,
    /// client resets, migrations, transient noise, or plain surfacing.
    fn handle_error(inner: &Arc<SessionInner>, error: SyncError) {
        let mut next_state = if error.is_fatal {
            NextStateAfterError::Error
        } else {
            NextStateAfterError::None
        };
        let mut delete_file = false;
        let mut log_out_user = false;

        match error.code {
            ErrorCode::Client(ClientErrorCode::AutoClientResetFailure) => {
                // Automatic recovery failed; fall back to a manual reset.
                next_state = NextStateAfterError::Inactive;
                delete_file = true;
            }
            ErrorCode::Client(ClientErrorCode::ConnectionClosed)
            | ErrorCode::Client(ClientErrorCode::PongTimeout) => {
                // Not real errors: the connection retries on its own.
                return;
            }
            ErrorCode::Client(_) => {}
            ErrorCode::Protocol(code) => match error.action {
                RecoveryAction::NoAction => {
                    if code == ProtocolErrorCode::BadAuthentication {
                        next_state = NextStateAfterError::Inactive;
                        log_out_user = true;
                    }
                }
                RecoveryAction::ApplicationBug | RecoveryAction::ProtocolViolation => {
                    next_state = NextStateAfterError::Inactive;
                }
                RecoveryAction::Warning => {}
                RecoveryAction::Transient => return,
                RecoveryAction::DeleteStore => {
                    next_state = NextStateAfterError::Inactive;
                    delete_file = true;
                }
                RecoveryAction::ClientReset | RecoveryAction::ClientResetNoRecovery => {
                    let resync_mode = inner.config.lock().resync_mode;
                    if resync_mode == ResyncMode::Manual || inner.fresh_copy.is_none() {
                        next_state = NextStateAfterError::Inactive;
                        delete_file = true;
                    } else {
                        Self::download_fresh_copy(inner, error.action);
                        // Not propagated to the user at this point; the
                        // reset flow reports its own outcome.
                        return;
                    }
                }
                RecoveryAction::MigrateToFlx | RecoveryAction::RevertToPbs => {
                    if let Some(observer) = &*inner.migration_observer.lock() {
                        observer(error.action, error.migration_query.as_deref());
                    }
                    Self::download_fresh_copy(inner, error.action);
                    return;
                }
            },
            ErrorCode::Http(status) => {
                if (status == 401 || status == 403) && inner.token_provider.is_some() {
                    Self::initiate_refresh_for_retry(inner);
                    return;
                }
                // Temporary redirects arrive fatal from the transport
                // layer; everything else is retried with backoff.
            }
            ErrorCode::Unknown(_) => {
                // Surfaced below, but not acted upon specially.
            }
            ErrorCode::BadAuthentication => {
                next_state = NextStateAfterError::Inactive;
                log_out_user = true;
            }
            ErrorCode::OperationAborted => return,
        }

        {
            let guard = inner.state.lock();
            if guard.state == SessionState::Dying && error.is_fatal {
                // Already on the way out; finish without re-reporting.
                Self::become_inactive_locked(inner, guard, Some(error));
                return;
            }
            // Drop errors arriving after teardown to avoid duplicates.
            if matches!(guard.state, SessionState::Inactive | SessionState::Paused) {
                return;
            }
            match next_state {
                NextStateAfterError::None => {
                    let cancel_waits = inner.config.lock().cancel_waits_on_nonfatal_error;
                    if cancel_waits {
                        Self::cancel_pending_waits(inner, guard, error.clone());
                    }
                }
                NextStateAfterError::Inactive => {
                    Self::become_inactive_locked(inner, guard, Some(error.clone()));
                }
                NextStateAfterError::Error => {
                    Self::cancel_pending_waits(inner, guard, error.clone());
                }
            }
        }

        if delete_file {
            let _ = inner.history.mark_for_deletion();
        }
        if log_out_user {
            if let Some(provider) = &inner.token_provider {
                provider.log_out();
            }
        }
        Self::invoke_error_handler(inner, error);
    }

    fn cancel_pending_waits(
        inner: &Arc<SessionInner>,
        mut guard: MutexGuard<'_, SessionStateData>,
        error: SyncError,
    ) {
        let waits: Vec<CompletionCallback> = std::mem::take(&mut guard.completion)
            .into_values()
            .map(|(_, callback)| callback)
            .collect();
        drop(guard);
        for callback in waits {
            callback(Err(error.clone()));
        }
    }

    // -- client reset -------------------------------------------------------

    /// Downloads the remote state into a side-by-side store through the
    /// [`FreshCopyDownloader`] capability, then tears down and recreates
    /// the protocol session against the fresh copy.
    fn download_fresh_copy(inner: &Arc<SessionInner>, action: RecoveryAction) {
        {
            let guard = inner.state.lock();
            if guard.state != SessionState::Active {
                return;
            }
        }
        let Some(downloader) = inner.fresh_copy.clone() else {
            return;
        };
        info!(?action, "Starting client reset: downloading a fresh copy");
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            let result = downloader.download_fresh_copy(action).await;
            let Some(inner) = weak.upgrade() else { return };
            match result {
                Ok(()) => {
                    debug!("Client reset completed; restarting session");
                    SessionInner::restart_session(&inner);
                }
                Err(error) => {
                    SessionInner::handle_error(
                        &inner,
                        SyncError::client(
                            ClientErrorCode::AutoClientResetFailure,
                            format!("a fatal error occurred during client reset: {error}"),
                        ),
                    );
                }
            }
        });
    }
}

fn completion_request(direction: ProgressDirection, ident: SessionIdent) -> ConnCommand {
    match direction {
        ProgressDirection::Upload => ConnCommand::RequestUploadCompletion { ident },
        ProgressDirection::Download => ConnCommand::RequestDownloadCompletion { ident },
    }
}
