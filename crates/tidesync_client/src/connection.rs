//! The per-endpoint connection actor.
//!
//! One actor task owns the websocket to one server endpoint and every
//! protocol session multiplexed over it. All protocol work (timers,
//! socket events, message dispatch) runs inside the actor, so no
//! protocol state is ever touched from two places at once. Exactly one
//! outbound write is in flight at any time; sessions are granted send
//! opportunities strictly in enlistment order, with urgent pings slotted
//! between session sends.

use crate::backoff::{ReconnectInfo, TerminationReason};
use crate::client::{ClientShared, ConnectionKey};
use crate::error::{SyncError, SyncResult};
use crate::history::{History, SubscriptionStore};
use crate::session::{
    ProtocolSession, SessionEvent, SessionLifecycle, SessionRuntimeConfig,
};
use crate::transport::{SocketConnection, SocketSink, TransportError};
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tidesync_protocol::{
    parse_negotiated_subprotocol, supported_subprotocols, ClientErrorCode, ErrorMessage, Ping,
    ProtocolErrorCode, ServerEndpoint, ServerMessage, SessionIdent,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info};

/// State of the physical connection to one server endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection, and none being established.
    #[default]
    Disconnected,
    /// Connection establishment (including handshakes) in progress.
    Connecting,
    /// Connected and exchanging messages.
    Connected,
}

/// Everything needed to create and activate a protocol session inside
/// the actor.
pub(crate) struct SessionActivation {
    pub ident: SessionIdent,
    pub config: SessionRuntimeConfig,
    pub history: Arc<dyn History>,
    pub subscriptions: Option<Weak<dyn SubscriptionStore>>,
    pub events: mpsc::UnboundedSender<SessionEvent>,
}

/// Commands accepted by the connection actor.
pub(crate) enum ConnCommand {
    ActivateSession(Box<SessionActivation>),
    DeactivateSession {
        ident: SessionIdent,
    },
    LocalChanges {
        ident: SessionIdent,
        version: u64,
    },
    RequestUploadCompletion {
        ident: SessionIdent,
    },
    RequestDownloadCompletion {
        ident: SessionIdent,
    },
    QuerySetChanged {
        ident: SessionIdent,
    },
    SendTestCommand {
        ident: SessionIdent,
        body: String,
        reply: oneshot::Sender<SyncResult<String>>,
    },
    CancelReconnectDelay,
    ForceClose,
}

enum SocketTaskEvent {
    Connected {
        generation: u64,
        connection: SocketConnection,
    },
    ConnectFailed {
        generation: u64,
        error: TransportError,
    },
    Frame {
        generation: u64,
        frame: Vec<u8>,
    },
    Closed {
        generation: u64,
        error: Option<TransportError>,
    },
}

enum RetireOutcome {
    Retired,
    Pending(ConnCommand),
}

pub(crate) struct ConnectionActor {
    shared: Arc<ClientShared>,
    key: ConnectionKey,
    endpoint: ServerEndpoint,
    cmd_rx: mpsc::UnboundedReceiver<ConnCommand>,
    socket_tx: mpsc::UnboundedSender<SocketTaskEvent>,
    socket_rx: mpsc::UnboundedReceiver<SocketTaskEvent>,

    state: ConnectionState,
    sink: Option<Box<dyn SocketSink>>,
    /// Bumped whenever the socket changes; socket task events carrying a
    /// stale generation are ignored. This is the cancellation token that
    /// lets in-flight transport callbacks outlive their connection.
    generation: u64,
    negotiated_version: Option<u32>,

    sessions: HashMap<SessionIdent, ProtocolSession>,
    /// Every session identifier ever activated on this connection. Only
    /// grows; distinguishes "unknown" (protocol violation) from "closed"
    /// (stale in-flight message) in late-arriving messages.
    session_history: HashSet<SessionIdent>,
    enlisted: VecDeque<SessionIdent>,

    force_closed: bool,

    reconnect_info: ReconnectInfo,
    reconnect_delay_in_progress: bool,
    nonzero_reconnect_delay: bool,
    reconnect_deadline: Option<Instant>,
    linger_in_progress: bool,
    linger_deadline: Option<Instant>,
    connect_deadline: Option<Instant>,

    ping_delay_in_progress: bool,
    waiting_for_pong: bool,
    send_ping: bool,
    minimize_next_ping_delay: bool,
    ping_after_scheduled_reset: bool,
    ping_sent: bool,
    heartbeat_deadline: Option<Instant>,
    pong_wait_started_at: u64,
    last_ping_sent_at: u64,
    previous_rtt: u64,

    epoch: Instant,
    disconnect_time: Option<u64>,
}

impl ConnectionActor {
    pub fn new(
        shared: Arc<ClientShared>,
        key: ConnectionKey,
        cmd_rx: mpsc::UnboundedReceiver<ConnCommand>,
    ) -> Self {
        let (socket_tx, socket_rx) = mpsc::unbounded_channel();
        let reconnect_info = ReconnectInfo::new(
            shared.config.reconnect_backoff,
            shared.config.reconnect_mode,
        );
        let endpoint = key.endpoint.clone();
        Self {
            shared,
            key,
            endpoint,
            cmd_rx,
            socket_tx,
            socket_rx,
            state: ConnectionState::Disconnected,
            sink: None,
            generation: 0,
            negotiated_version: None,
            sessions: HashMap::new(),
            session_history: HashSet::new(),
            enlisted: VecDeque::new(),
            force_closed: false,
            reconnect_info,
            reconnect_delay_in_progress: false,
            nonzero_reconnect_delay: false,
            reconnect_deadline: None,
            linger_in_progress: false,
            linger_deadline: None,
            connect_deadline: None,
            ping_delay_in_progress: false,
            waiting_for_pong: false,
            send_ping: false,
            minimize_next_ping_delay: false,
            ping_after_scheduled_reset: false,
            ping_sent: false,
            heartbeat_deadline: None,
            pong_wait_started_at: 0,
            last_ping_sent_at: 0,
            previous_rtt: 0,
            epoch: Instant::now(),
            disconnect_time: None,
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub async fn run(mut self) {
        loop {
            // Retire once the last session is gone and nothing is in
            // flight. The connections-map lock makes this race-free with
            // concurrent activations.
            if self.sessions.is_empty()
                && self.state == ConnectionState::Disconnected
                && !self.force_closed
            {
                match self.try_retire() {
                    RetireOutcome::Retired => break,
                    RetireOutcome::Pending(cmd) => {
                        if self.handle_command(cmd).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            let deadline = self.next_deadline();
            let timer = async move {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if self.handle_command(cmd).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                event = self.socket_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_socket_event(event).await;
                    }
                }
                _ = timer => {
                    self.handle_timers().await;
                }
            }
        }
        debug!(endpoint = %self.endpoint, "Connection actor stopped");
    }

    fn try_retire(&mut self) -> RetireOutcome {
        let mut connections = self.shared.connections.lock();
        match self.cmd_rx.try_recv() {
            Ok(cmd) => RetireOutcome::Pending(cmd),
            Err(_) => {
                connections.remove(&self.key);
                debug!(endpoint = %self.endpoint, "Retiring idle connection");
                RetireOutcome::Retired
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let mut deadline: Option<Instant> = None;
        let mut consider = |candidate: Option<Instant>| {
            if let Some(candidate) = candidate {
                deadline = Some(match deadline {
                    Some(current) => current.min(candidate),
                    None => candidate,
                });
            }
        };
        consider(self.connect_deadline);
        if self.reconnect_delay_in_progress {
            consider(self.reconnect_deadline);
        }
        consider(self.linger_deadline);
        consider(self.heartbeat_deadline);
        for session in self.sessions.values() {
            consider(session.resumption_deadline);
        }
        deadline
    }

    // -- commands -----------------------------------------------------------

    /// Returns true when the actor must stop.
    async fn handle_command(&mut self, cmd: ConnCommand) -> bool {
        match cmd {
            ConnCommand::ActivateSession(activation) => {
                self.activate_session(*activation).await;
            }
            ConnCommand::DeactivateSession { ident } => {
                self.deactivate_session(ident).await;
            }
            ConnCommand::LocalChanges { ident, version } => {
                if let Some(session) = self.sessions.get_mut(&ident) {
                    session.local_changes(version);
                    self.enlist(ident);
                    self.pump_send().await;
                }
            }
            ConnCommand::RequestUploadCompletion { ident } => {
                if let Some(session) = self.sessions.get_mut(&ident) {
                    session.request_upload_completion();
                    self.enlist(ident);
                    self.pump_send().await;
                }
            }
            ConnCommand::RequestDownloadCompletion { ident } => {
                if let Some(session) = self.sessions.get_mut(&ident) {
                    session.request_download_completion();
                    self.enlist(ident);
                    self.pump_send().await;
                }
            }
            ConnCommand::QuerySetChanged { ident } => {
                if self.sessions.contains_key(&ident) {
                    self.enlist(ident);
                    self.pump_send().await;
                }
            }
            ConnCommand::SendTestCommand {
                ident,
                body,
                reply,
            } => match self.sessions.get_mut(&ident) {
                Some(session) => {
                    session.add_test_command(body, reply);
                    self.enlist(ident);
                    self.pump_send().await;
                }
                None => {
                    let _ = reply.send(Err(SyncError::aborted()));
                }
            },
            ConnCommand::CancelReconnectDelay => {
                self.cancel_reconnect_delay();
                self.pump_send().await;
            }
            ConnCommand::ForceClose => {
                self.force_close().await;
                return true;
            }
        }
        false
    }

    async fn activate_session(&mut self, activation: SessionActivation) {
        let ident = activation.ident;
        let events = activation.events.clone();
        let mut session = ProtocolSession::new(
            ident,
            activation.config,
            activation.history,
            activation.subscriptions,
            activation.events,
        );
        if let Err(error) = session.activate() {
            error!(session = ident, %error, "Session activation failed");
            let _ = events.send(SessionEvent::Error(error));
            return;
        }
        self.session_history.insert(ident);
        self.cancel_linger();
        match self.state {
            ConnectionState::Connected => {
                session.connection_established(false);
                session.emit_connection_state(ConnectionState::Connected, None);
                self.sessions.insert(ident, session);
                self.enlist(ident);
                self.pump_send().await;
            }
            ConnectionState::Connecting => {
                session.emit_connection_state(ConnectionState::Connecting, None);
                self.sessions.insert(ident, session);
            }
            ConnectionState::Disconnected => {
                self.sessions.insert(ident, session);
                if !self.reconnect_delay_in_progress {
                    self.initiate_reconnect_wait();
                }
            }
        }
    }

    async fn deactivate_session(&mut self, ident: SessionIdent) {
        let Some(session) = self.sessions.get_mut(&ident) else {
            return;
        };
        if session.state() == SessionLifecycle::Active {
            session.initiate_deactivation();
        }
        if self.session_deactivated(ident) {
            self.finish_session_deactivation(ident);
        } else {
            // The UNBIND round-trip runs to completion.
            self.enlist(ident);
            self.after_sessions_changed();
            self.pump_send().await;
        }
    }

    fn session_deactivated(&self, ident: SessionIdent) -> bool {
        self.sessions
            .get(&ident)
            .map(|s| s.state() == SessionLifecycle::Deactivated)
            .unwrap_or(false)
    }

    fn finish_session_deactivation(&mut self, ident: SessionIdent) {
        self.sessions.remove(&ident);
        self.after_sessions_changed();
    }

    fn after_sessions_changed(&mut self) {
        let active_unsuspended = self
            .sessions
            .values()
            .filter(|s| s.is_active_unsuspended())
            .count();
        if active_unsuspended == 0
            && self.state != ConnectionState::Disconnected
            && !self.linger_in_progress
        {
            self.initiate_disconnect_wait();
        }
    }

    fn cancel_linger(&mut self) {
        if self.linger_in_progress {
            self.linger_in_progress = false;
            self.linger_deadline = None;
        }
    }

    fn initiate_disconnect_wait(&mut self) {
        let linger = if self.shared.config.one_connection_per_session {
            Duration::ZERO
        } else {
            self.shared.config.connection_linger_time
        };
        self.linger_in_progress = true;
        self.linger_deadline = Some(Instant::now() + linger);
    }

    // -- reconnect schedule -------------------------------------------------

    fn initiate_reconnect_wait(&mut self) {
        if self.force_closed {
            return;
        }
        debug_assert!(!self.reconnect_delay_in_progress);
        self.reconnect_delay_in_progress = true;
        match self.reconnect_info.delay_interval() {
            None => {
                debug!(endpoint = %self.endpoint, "Reconnection delayed indefinitely");
                self.nonzero_reconnect_delay = true;
                self.reconnect_deadline = None;
            }
            Some(delay) if delay.is_zero() => {
                self.nonzero_reconnect_delay = false;
                self.reconnect_deadline = Some(Instant::now());
            }
            Some(delay) => {
                debug!(
                    endpoint = %self.endpoint,
                    delay_ms = delay.as_millis() as u64,
                    "Allowing reconnection after delay"
                );
                self.nonzero_reconnect_delay = true;
                self.reconnect_deadline = Some(Instant::now() + delay);
            }
        }
    }

    fn handle_reconnect_wait(&mut self) {
        debug_assert!(self.reconnect_delay_in_progress);
        self.reconnect_delay_in_progress = false;
        self.reconnect_deadline = None;
        let any_active_unsuspended = self.sessions.values().any(|s| s.is_active_unsuspended());
        if any_active_unsuspended {
            self.initiate_reconnect();
        }
    }

    fn initiate_reconnect(&mut self) {
        self.state = ConnectionState::Connecting;
        self.report_connection_state(ConnectionState::Connecting, None);
        self.generation += 1;
        self.sink = None;
        self.negotiated_version = None;

        let generation = self.generation;
        let provider = Arc::clone(&self.shared.provider);
        let endpoint = self.endpoint.clone();
        let tx = self.socket_tx.clone();
        let subprotocols = supported_subprotocols();
        info!(endpoint = %self.endpoint, "Connecting");
        tokio::spawn(async move {
            match provider.connect(&endpoint, &subprotocols).await {
                Ok(connection) => {
                    let _ = tx.send(SocketTaskEvent::Connected {
                        generation,
                        connection,
                    });
                }
                Err(error) => {
                    let _ = tx.send(SocketTaskEvent::ConnectFailed { generation, error });
                }
            }
        });
        // Watchdog over the whole connect operation.
        self.connect_deadline = Some(Instant::now() + self.shared.config.connect_timeout);
    }

    fn cancel_reconnect_delay(&mut self) {
        if self.reconnect_delay_in_progress {
            if self.nonzero_reconnect_delay {
                debug!(endpoint = %self.endpoint, "Canceling reconnect delay");
            }
            self.reconnect_delay_in_progress = false;
            self.reconnect_deadline = None;
            self.reconnect_info.reset();
            self.initiate_reconnect_wait();
            return;
        }
        if self.state != ConnectionState::Disconnected {
            // Arm a reset of the backoff state, to be committed only if
            // the urgent ping below is answered. A dead connection must
            // not have its backoff masked.
            self.reconnect_info.scheduled_reset = true;
            self.ping_after_scheduled_reset = false;
            self.schedule_urgent_ping();
        }
    }

    fn schedule_urgent_ping(&mut self) {
        debug_assert_ne!(self.state, ConnectionState::Disconnected);
        if self.ping_delay_in_progress {
            self.heartbeat_deadline = None;
            self.ping_delay_in_progress = false;
            self.minimize_next_ping_delay = true;
            let now = self.now_ms();
            self.initiate_ping_delay(now);
            return;
        }
        if !self.send_ping {
            self.minimize_next_ping_delay = true;
        }
    }

    // -- socket events ------------------------------------------------------

    async fn handle_socket_event(&mut self, event: SocketTaskEvent) {
        match event {
            SocketTaskEvent::Connected {
                generation,
                connection,
            } => {
                if generation != self.generation || self.state != ConnectionState::Connecting {
                    return;
                }
                self.handle_connected(connection).await;
            }
            SocketTaskEvent::ConnectFailed { generation, error } => {
                if generation != self.generation || self.state != ConnectionState::Connecting {
                    return;
                }
                let (sync_error, reason) = map_transport_error(&error);
                info!(endpoint = %self.endpoint, %error, "Connect attempt failed");
                self.involuntary_disconnect(sync_error, reason, None).await;
            }
            SocketTaskEvent::Frame { generation, frame } => {
                if generation != self.generation {
                    return;
                }
                self.handle_frame(frame).await;
            }
            SocketTaskEvent::Closed { generation, error } => {
                if generation != self.generation {
                    return;
                }
                match error {
                    None => {
                        let error = SyncError::client_transient(
                            ClientErrorCode::ConnectionClosed,
                            "connection closed by server",
                        );
                        self.involuntary_disconnect(
                            error,
                            TerminationReason::ReadOrWriteError,
                            None,
                        )
                        .await;
                    }
                    Some(transport_error) => {
                        let (sync_error, reason) = map_transport_error(&transport_error);
                        self.involuntary_disconnect(sync_error, reason, None).await;
                    }
                }
            }
        }
    }

    async fn handle_connected(&mut self, connection: SocketConnection) {
        match &connection.negotiated_protocol {
            None => {
                error!(endpoint = %self.endpoint, "Missing protocol info from server");
                let error = SyncError::client(
                    ClientErrorCode::BadProtocolFromServer,
                    "missing subprotocol in websocket handshake response",
                );
                self.involuntary_disconnect(error, TerminationReason::BadHeaders, None)
                    .await;
                return;
            }
            Some(protocol) => match parse_negotiated_subprotocol(protocol) {
                Ok(version) => {
                    debug!(version, "Negotiated protocol version");
                    self.negotiated_version = Some(version);
                }
                Err(negotiation_error) => {
                    error!(endpoint = %self.endpoint, %negotiation_error, "Bad protocol info from server");
                    let error = SyncError::client(
                        ClientErrorCode::BadProtocolFromServer,
                        negotiation_error.to_string(),
                    );
                    self.involuntary_disconnect(error, TerminationReason::BadHeaders, None)
                        .await;
                    return;
                }
            },
        }

        // Cancel the connect watchdog.
        self.connect_deadline = None;
        self.state = ConnectionState::Connected;
        self.sink = Some(connection.sink);

        let generation = self.generation;
        let tx = self.socket_tx.clone();
        let mut source = connection.source;
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(Some(frame)) => {
                        if tx
                            .send(SocketTaskEvent::Frame { generation, frame })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(None) => {
                        let _ = tx.send(SocketTaskEvent::Closed {
                            generation,
                            error: None,
                        });
                        break;
                    }
                    Err(error) => {
                        let _ = tx.send(SocketTaskEvent::Closed {
                            generation,
                            error: Some(error),
                        });
                        break;
                    }
                }
            }
        });

        let now = self.now_ms();
        // Initially, no time was spent waiting for a pong.
        self.pong_wait_started_at = now;
        self.initiate_ping_delay(now);

        let fast_reconnect = match self.disconnect_time {
            Some(at) => {
                now.saturating_sub(at) <= self.shared.config.fast_reconnect_limit.as_millis() as u64
            }
            None => false,
        };

        info!(
            endpoint = %self.endpoint,
            protocol_version = self.negotiated_version,
            fast_reconnect,
            "Connected"
        );
        let idents: Vec<SessionIdent> = self.sessions.keys().copied().collect();
        for ident in idents.iter() {
            if let Some(session) = self.sessions.get_mut(ident) {
                session.connection_established(fast_reconnect);
            }
        }
        self.report_connection_state(ConnectionState::Connected, None);
        for ident in idents {
            self.enlist(ident);
        }
        self.pump_send().await;
    }

    fn report_connection_state(&self, state: ConnectionState, error: Option<SyncError>) {
        for session in self.sessions.values() {
            session.emit_connection_state(state, error.clone());
        }
    }

    // -- disconnect ---------------------------------------------------------

    async fn voluntary_disconnect(&mut self) {
        self.disconnect(None, TerminationReason::ClosedVoluntarily, None)
            .await;
    }

    async fn involuntary_disconnect(
        &mut self,
        error: SyncError,
        reason: TerminationReason,
        delay_override: Option<Duration>,
    ) {
        info!(endpoint = %self.endpoint, %error, "Connection closed due to error");
        self.disconnect(Some(error), reason, delay_override).await;
    }

    async fn close_due_to_protocol_error(&mut self, error: SyncError) {
        self.involuntary_disconnect(error, TerminationReason::ProtocolViolation, None)
            .await;
    }

    async fn disconnect(
        &mut self,
        error: Option<SyncError>,
        reason: TerminationReason,
        delay_override: Option<Duration>,
    ) {
        self.connect_deadline = None;
        if self.state == ConnectionState::Connected {
            self.disconnect_time = Some(self.now_ms());
        }

        let idents: Vec<SessionIdent> = self.sessions.keys().copied().collect();
        for ident in idents {
            if let Some(session) = self.sessions.get_mut(&ident) {
                session.emit_connection_state(ConnectionState::Disconnected, error.clone());
                session.connection_lost();
                if matches!(
                    session.state(),
                    SessionLifecycle::Deactivated | SessionLifecycle::Unactivated
                ) {
                    self.sessions.remove(&ident);
                }
            }
        }

        self.state = ConnectionState::Disconnected;
        self.ping_delay_in_progress = false;
        self.waiting_for_pong = false;
        self.send_ping = false;
        self.minimize_next_ping_delay = false;
        self.ping_after_scheduled_reset = false;
        self.ping_sent = false;
        self.heartbeat_deadline = None;
        self.previous_rtt = 0;
        // Invalidate outstanding socket callbacks.
        self.generation += 1;
        if let Some(mut sink) = self.sink.take() {
            let _ = sink.close().await;
        }
        self.enlisted.clear();
        self.cancel_linger();

        self.reconnect_info.update(reason, delay_override);
        self.initiate_reconnect_wait();
    }

    async fn force_close(&mut self) {
        if self.force_closed {
            return;
        }
        self.force_closed = true;
        if self.state != ConnectionState::Disconnected {
            self.voluntary_disconnect().await;
        }
        self.reconnect_delay_in_progress = false;
        self.reconnect_deadline = None;
        self.cancel_linger();
        for session in self.sessions.values_mut() {
            session.force_close();
        }
        self.sessions.clear();
        debug!(endpoint = %self.endpoint, "Force closed connection");
    }

    // -- timers -------------------------------------------------------------

    async fn handle_timers(&mut self) {
        let now = Instant::now();
        let due = |deadline: &mut Option<Instant>| match deadline {
            Some(at) if *at <= now => {
                *deadline = None;
                true
            }
            _ => false,
        };

        if due(&mut self.connect_deadline) {
            info!(endpoint = %self.endpoint, "Connect timeout");
            let error =
                SyncError::client_transient(ClientErrorCode::ConnectTimeout, "connect timeout");
            self.involuntary_disconnect(error, TerminationReason::ConnectTimeout, None)
                .await;
        }

        if self.reconnect_delay_in_progress && due(&mut self.reconnect_deadline) {
            self.handle_reconnect_wait();
        }

        if due(&mut self.linger_deadline) {
            self.linger_in_progress = false;
            let active_unsuspended = self
                .sessions
                .values()
                .filter(|s| s.is_active_unsuspended())
                .count();
            if active_unsuspended == 0 && self.state != ConnectionState::Disconnected {
                debug!(endpoint = %self.endpoint, "Linger time expired");
                self.voluntary_disconnect().await;
                info!(endpoint = %self.endpoint, "Disconnected");
            }
        }

        if due(&mut self.heartbeat_deadline) {
            if self.ping_delay_in_progress {
                self.handle_ping_delay().await;
            } else if self.waiting_for_pong {
                self.handle_pong_timeout().await;
            }
        }

        // Session resumption delays.
        let resumed: Vec<SessionIdent> = self
            .sessions
            .iter_mut()
            .filter_map(|(ident, session)| match session.resumption_deadline {
                Some(at) if at <= now => {
                    session.resumption_deadline = None;
                    session.cancel_resumption_delay().then_some(*ident)
                }
                _ => None,
            })
            .collect();
        if !resumed.is_empty() {
            self.cancel_linger();
            match self.state {
                ConnectionState::Disconnected => {
                    if !self.reconnect_delay_in_progress {
                        self.initiate_reconnect_wait();
                    }
                }
                ConnectionState::Connecting => {}
                ConnectionState::Connected => {
                    for ident in resumed {
                        self.enlist(ident);
                    }
                    self.pump_send().await;
                }
            }
        }
    }

    // -- heartbeat ----------------------------------------------------------

    fn initiate_ping_delay(&mut self, now: u64) {
        debug_assert!(!self.ping_delay_in_progress);
        debug_assert!(!self.waiting_for_pong);
        debug_assert!(!self.send_ping);

        let mut delay_ms;
        if self.minimize_next_ping_delay {
            self.minimize_next_ping_delay = false;
            delay_ms = 0;
        } else {
            delay_ms = self.shared.config.ping_keepalive_period.as_millis() as u64;
            // Randomized deduction of up to 10%, or up to 100% for the
            // first ping on a connection, so that many clients do not
            // ping the server in lockstep.
            let max_deduction = if self.ping_sent {
                delay_ms / 10
            } else {
                delay_ms
            };
            if max_deduction > 0 {
                delay_ms -= rand::thread_rng().gen_range(0..=max_deduction);
            }
            // Deduct time already spent waiting for the previous pong.
            let spent = now.saturating_sub(self.pong_wait_started_at);
            delay_ms = delay_ms.saturating_sub(spent);
        }

        self.ping_delay_in_progress = true;
        self.heartbeat_deadline = Some(Instant::now() + Duration::from_millis(delay_ms));
        debug!(endpoint = %self.endpoint, delay_ms, "Will emit a ping");
    }

    async fn handle_ping_delay(&mut self) {
        debug_assert!(self.ping_delay_in_progress);
        self.ping_delay_in_progress = false;
        self.send_ping = true;
        self.initiate_pong_timeout();
        if self.state == ConnectionState::Connected {
            self.pump_send().await;
        }
    }

    fn initiate_pong_timeout(&mut self) {
        debug_assert!(!self.waiting_for_pong);
        self.waiting_for_pong = true;
        self.pong_wait_started_at = self.now_ms();
        self.heartbeat_deadline =
            Some(Instant::now() + self.shared.config.pong_keepalive_timeout);
    }

    async fn handle_pong_timeout(&mut self) {
        debug_assert!(self.waiting_for_pong);
        debug!(endpoint = %self.endpoint, "Timeout on reception of PONG message");
        let error = SyncError::client_transient(ClientErrorCode::PongTimeout, "pong timeout");
        self.involuntary_disconnect(error, TerminationReason::PongTimeout, None)
            .await;
    }

    async fn send_ping_message(&mut self) {
        debug_assert!(self.send_ping);
        self.send_ping = false;
        if self.reconnect_info.scheduled_reset {
            self.ping_after_scheduled_reset = true;
        }
        self.last_ping_sent_at = self.now_ms();
        debug!(
            endpoint = %self.endpoint,
            timestamp = self.last_ping_sent_at,
            rtt = self.previous_rtt,
            "Sending: PING"
        );
        let frame = Ping {
            timestamp: self.last_ping_sent_at,
            rtt: self.previous_rtt,
        }
        .encode();
        match self.write_frame(frame).await {
            Ok(()) => {
                self.ping_sent = true;
            }
            Err(error) => {
                let (sync_error, reason) = map_transport_error(&error);
                self.involuntary_disconnect(sync_error, reason, None).await;
            }
        }
    }

    async fn receive_pong(&mut self, timestamp: u64) {
        debug!(endpoint = %self.endpoint, timestamp, "Received: PONG");
        let legal = self.waiting_for_pong && !self.send_ping;
        if !legal {
            let error = SyncError::client(
                ClientErrorCode::BadMessageOrder,
                "PONG message is illegal at this time",
            );
            self.close_due_to_protocol_error(error).await;
            return;
        }
        if timestamp != self.last_ping_sent_at {
            let error = SyncError::client(
                ClientErrorCode::BadTimestamp,
                "bad timestamp in PONG message",
            );
            self.close_due_to_protocol_error(error).await;
            return;
        }
        let now = self.now_ms();
        let rtt = now - timestamp;
        debug!(endpoint = %self.endpoint, rtt_ms = rtt, "Round trip time measured");
        self.previous_rtt = rtt;

        // The urgent ping after cancel_reconnect_delay() was answered:
        // the connection is healthy, so keep the backoff state.
        if self.ping_after_scheduled_reset {
            self.ping_after_scheduled_reset = false;
            self.reconnect_info.scheduled_reset = false;
        }

        self.heartbeat_deadline = None;
        self.waiting_for_pong = false;
        self.initiate_ping_delay(now);

        if let Some(handler) = &self.shared.config.roundtrip_time_handler {
            handler(rtt);
        }
    }

    // -- sending ------------------------------------------------------------

    fn enlist(&mut self, ident: SessionIdent) {
        if self.state != ConnectionState::Connected {
            return;
        }
        let Some(session) = self.sessions.get_mut(&ident) else {
            return;
        };
        if session.state() == SessionLifecycle::Deactivated {
            return;
        }
        if !session.enlisted {
            session.enlisted = true;
            self.enlisted.push_back(ident);
        }
    }

    async fn write_frame(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        match self.sink.as_mut() {
            Some(sink) => sink.send(frame).await,
            None => Err(TransportError::Write("no socket".into())),
        }
    }

    /// Drains the send schedule: an urgent ping first, then enlisted
    /// sessions in FIFO order. Exactly one write is in flight at a time,
    /// and a pending ping preempts the session queue between writes but
    /// never mid-write.
    async fn pump_send(&mut self) {
        loop {
            if self.state != ConnectionState::Connected {
                return;
            }
            if self.send_ping {
                self.send_ping_message().await;
                continue;
            }
            let Some(ident) = self.enlisted.pop_front() else {
                return;
            };
            let outbound = match self.sessions.get_mut(&ident) {
                None => continue,
                Some(session) => {
                    session.enlisted = false;
                    session.next_message()
                }
            };
            if self.session_deactivated(ident) {
                self.finish_session_deactivation(ident);
                continue;
            }
            // An enlisted session may choose not to send; pass the
            // opportunity to the next one.
            let Some(outbound) = outbound else {
                continue;
            };
            match self.write_frame(outbound.frame).await {
                Ok(()) => {
                    if let Some(session) = self.sessions.get_mut(&ident) {
                        session.message_sent(outbound.kind);
                    }
                    if self.session_deactivated(ident) {
                        self.finish_session_deactivation(ident);
                    } else if outbound.re_enlist {
                        self.enlist(ident);
                    }
                }
                Err(error) => {
                    let (sync_error, reason) = map_transport_error(&error);
                    self.involuntary_disconnect(sync_error, reason, None).await;
                    return;
                }
            }
        }
    }

    // -- receiving ----------------------------------------------------------

    async fn handle_frame(&mut self, frame: Vec<u8>) {
        match ServerMessage::decode(&frame) {
            Ok(message) => self.dispatch_message(message).await,
            Err(parse_error) => {
                let code = match parse_error {
                    tidesync_protocol::ParseError::UnknownMessage(_) => {
                        ClientErrorCode::UnknownMessage
                    }
                    tidesync_protocol::ParseError::BadChangesetHeader => {
                        ClientErrorCode::BadChangesetHeaderSyntax
                    }
                    tidesync_protocol::ParseError::BadBodySize => {
                        ClientErrorCode::BadChangesetSize
                    }
                    _ => ClientErrorCode::BadSyntax,
                };
                let error = SyncError::client(code, parse_error.to_string());
                self.close_due_to_protocol_error(error).await;
            }
        }
    }

    /// Routes a message to its session. Identifiers never seen are a
    /// protocol violation; identifiers seen but now closed are stale
    /// in-flight messages and are ignored.
    async fn validate_session(
        &mut self,
        ident: SessionIdent,
        message_name: &str,
    ) -> Option<SessionIdent> {
        if ident == 0 {
            let error = SyncError::client(
                ClientErrorCode::BadSessionIdent,
                format!("session identifier zero in {message_name} message"),
            );
            self.close_due_to_protocol_error(error).await;
            return None;
        }
        if self.sessions.contains_key(&ident) {
            return Some(ident);
        }
        if self.session_history.contains(&ident) {
            debug!(
                session = ident,
                message = message_name,
                "Received message for closed session"
            );
            return None;
        }
        error!(
            session = ident,
            message = message_name,
            "Bad session identifier"
        );
        let error = SyncError::client(
            ClientErrorCode::BadSessionIdent,
            format!("unknown session identifier in {message_name} message"),
        );
        self.close_due_to_protocol_error(error).await;
        None
    }

    async fn dispatch_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Pong(pong) => self.receive_pong(pong.timestamp).await,
            ServerMessage::Ident(m) => {
                let Some(ident) = self.validate_session(m.session_ident, "IDENT").await else {
                    return;
                };
                let result = self
                    .sessions
                    .get_mut(&ident)
                    .expect("validated")
                    .receive_ident(m.file_ident);
                self.after_session_receive(ident, result).await;
            }
            ServerMessage::Download(m) => {
                let Some(ident) = self.validate_session(m.session_ident, "DOWNLOAD").await
                else {
                    return;
                };
                let result = self
                    .sessions
                    .get_mut(&ident)
                    .expect("validated")
                    .receive_download(m);
                self.after_session_receive(ident, result).await;
            }
            ServerMessage::Mark(m) => {
                let Some(ident) = self.validate_session(m.session_ident, "MARK").await else {
                    return;
                };
                let result = self
                    .sessions
                    .get_mut(&ident)
                    .expect("validated")
                    .receive_mark(m.request_ident);
                self.after_session_receive(ident, result).await;
            }
            ServerMessage::Unbound(m) => {
                let Some(ident) = self.validate_session(m.session_ident, "UNBOUND").await else {
                    return;
                };
                let result = self
                    .sessions
                    .get_mut(&ident)
                    .expect("validated")
                    .receive_unbound();
                self.after_session_receive(ident, result).await;
            }
            ServerMessage::Error(m) => {
                if m.session_ident == 0 {
                    self.receive_connection_error(m).await;
                    return;
                }
                let Some(ident) = self.validate_session(m.session_ident, "ERROR").await else {
                    return;
                };
                let result = self
                    .sessions
                    .get_mut(&ident)
                    .expect("validated")
                    .receive_error(m.code, m.info);
                self.after_session_receive(ident, result).await;
            }
            ServerMessage::QueryError(m) => {
                let Some(ident) = self.validate_session(m.session_ident, "QUERY_ERROR").await
                else {
                    return;
                };
                let result = self
                    .sessions
                    .get_mut(&ident)
                    .expect("validated")
                    .receive_query_error(m.code, m.query_version, &m.message);
                self.after_session_receive(ident, result).await;
            }
            ServerMessage::TestCommand(m) => {
                let Some(ident) = self
                    .validate_session(m.session_ident, "TEST_COMMAND")
                    .await
                else {
                    return;
                };
                let result = self
                    .sessions
                    .get_mut(&ident)
                    .expect("validated")
                    .receive_test_command_response(m.request_ident, m.body);
                self.after_session_receive(ident, result).await;
            }
        }
    }

    async fn after_session_receive(&mut self, ident: SessionIdent, result: SyncResult<()>) {
        match result {
            Err(error) => {
                self.close_due_to_protocol_error(error).await;
            }
            Ok(()) => {
                if self.session_deactivated(ident) {
                    self.finish_session_deactivation(ident);
                } else {
                    self.enlist(ident);
                    self.after_sessions_changed();
                    self.pump_send().await;
                }
            }
        }
    }

    async fn receive_connection_error(&mut self, message: ErrorMessage) {
        info!(
            endpoint = %self.endpoint,
            code = message.code,
            try_again = message.info.try_again,
            message = %message.info.message,
            "Received: ERROR (connection level)"
        );
        match ProtocolErrorCode::from_raw(message.code) {
            Some(code) if !code.is_session_level() => {
                let reason = if message.info.try_again {
                    TerminationReason::ServerSaidTryAgainLater
                } else {
                    TerminationReason::ServerSaidDoNotReconnect
                };
                let delay_override = message.info.resumption_delay_ms.map(Duration::from_millis);
                let error = SyncError::from_server(message.code, &message.info);
                self.involuntary_disconnect(error, reason, delay_override)
                    .await;
            }
            Some(_) => {
                error!(code = message.code, "Not a connection-level error code");
                let error = SyncError::client(
                    ClientErrorCode::BadErrorCode,
                    "session-level code in connection-level ERROR message",
                );
                self.close_due_to_protocol_error(error).await;
            }
            None => {
                error!(code = message.code, "Unknown error code");
                let error = SyncError::client(
                    ClientErrorCode::BadErrorCode,
                    "unknown code in connection-level ERROR message",
                );
                self.close_due_to_protocol_error(error).await;
            }
        }
    }
}

fn map_transport_error(error: &TransportError) -> (SyncError, TerminationReason) {
    match error {
        TransportError::ResolveFailed(message) => (
            SyncError::client_transient(ClientErrorCode::ConnectionClosed, message.clone()),
            TerminationReason::ConnectOperationFailed,
        ),
        TransportError::ConnectFailed(message) => (
            SyncError::client_transient(ClientErrorCode::ConnectionClosed, message.clone()),
            TerminationReason::ConnectOperationFailed,
        ),
        TransportError::Tls(message) => (
            SyncError::client(ClientErrorCode::TlsHandshakeFailed, message.clone()),
            TerminationReason::TlsError,
        ),
        TransportError::Read(message) => (
            SyncError::client_transient(ClientErrorCode::ConnectionClosed, message.clone()),
            TerminationReason::ReadOrWriteError,
        ),
        TransportError::Write(message) => (
            SyncError::client_transient(ClientErrorCode::ConnectionClosed, message.clone()),
            TerminationReason::ReadOrWriteError,
        ),
        TransportError::Http { status } => {
            let mut sync_error = SyncError::http(*status, format!("HTTP status {status}"));
            if (300..400).contains(status) {
                // Temporary redirects are unsupported; the provider
                // already followed a permanent one.
                sync_error.is_fatal = true;
                sync_error.try_again = false;
                (sync_error, TerminationReason::BadHeaders)
            } else {
                (sync_error, TerminationReason::ConnectOperationFailed)
            }
        }
    }
}
