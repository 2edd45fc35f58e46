//! Configuration for the sync client and its sessions.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Hook invoked with each measured ping/pong round-trip time, in
/// milliseconds.
pub type RoundtripTimeHandler = Arc<dyn Fn(u64) + Send + Sync>;

/// Reconnect behavior of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectMode {
    /// Reconnect with backoff after failures.
    #[default]
    Normal,
    /// Never reconnect automatically. For tests that want full control
    /// over when connection attempts happen.
    Testing,
}

/// Parameters of an exponential backoff progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// Factor applied to the delay after each attempt.
    pub multiplier: u32,
    /// A random deduction of up to `delay / jitter_divisor` is applied to
    /// each produced delay. Zero disables jitter.
    pub jitter_divisor: u32,
}

impl BackoffConfig {
    /// A progression starting at `initial_delay`, doubling up to
    /// `max_delay`.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: 2,
            jitter_divisor: 3,
        }
    }

    /// Disables the random deduction, for deterministic tests.
    pub fn without_jitter(mut self) -> Self {
        self.jitter_divisor = 0;
        self
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300))
    }
}

/// Process-wide configuration of a [`crate::SyncClient`].
#[derive(Clone)]
pub struct ClientConfig {
    /// Upper bound on establishing a connection, including TLS and
    /// websocket handshakes.
    pub connect_timeout: Duration,
    /// How long a connection with no active unsuspended sessions lingers
    /// before disconnecting voluntarily.
    pub connection_linger_time: Duration,
    /// Period between keepalive pings.
    pub ping_keepalive_period: Duration,
    /// How long to wait for a pong before declaring the connection dead.
    pub pong_keepalive_timeout: Duration,
    /// A reconnect within this time of the previous disconnect counts as
    /// "fast" and skips the upload activation delay.
    pub fast_reconnect_limit: Duration,
    /// Reconnect behavior.
    pub reconnect_mode: ReconnectMode,
    /// Backoff progression for reconnect attempts.
    pub reconnect_backoff: BackoffConfig,
    /// Use a dedicated connection per session instead of multiplexing.
    /// Also forces the linger time to zero. Testing feature.
    pub one_connection_per_session: bool,
    /// Begin uploading without waiting for the first download completion.
    /// Testing feature.
    pub disable_upload_activation_delay: bool,
    /// Invoked with each measured round-trip time.
    pub roundtrip_time_handler: Option<RoundtripTimeHandler>,
}

impl ClientConfig {
    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the connection linger time.
    pub fn with_connection_linger_time(mut self, time: Duration) -> Self {
        self.connection_linger_time = time;
        self
    }

    /// Sets the ping keepalive period.
    pub fn with_ping_keepalive_period(mut self, period: Duration) -> Self {
        self.ping_keepalive_period = period;
        self
    }

    /// Sets the pong keepalive timeout.
    pub fn with_pong_keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.pong_keepalive_timeout = timeout;
        self
    }

    /// Sets the reconnect mode.
    pub fn with_reconnect_mode(mut self, mode: ReconnectMode) -> Self {
        self.reconnect_mode = mode;
        self
    }

    /// Sets the reconnect backoff progression.
    pub fn with_reconnect_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    /// Sets the round-trip time handler.
    pub fn with_roundtrip_time_handler(mut self, handler: RoundtripTimeHandler) -> Self {
        self.roundtrip_time_handler = Some(handler);
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(120),
            connection_linger_time: Duration::from_secs(30),
            ping_keepalive_period: Duration::from_secs(60),
            pong_keepalive_timeout: Duration::from_secs(120),
            fast_reconnect_limit: Duration::from_secs(60),
            reconnect_mode: ReconnectMode::Normal,
            reconnect_backoff: BackoffConfig::default(),
            one_connection_per_session: false,
            disable_upload_activation_delay: false,
            roundtrip_time_handler: None,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("connect_timeout", &self.connect_timeout)
            .field("connection_linger_time", &self.connection_linger_time)
            .field("ping_keepalive_period", &self.ping_keepalive_period)
            .field("pong_keepalive_timeout", &self.pong_keepalive_timeout)
            .field("fast_reconnect_limit", &self.fast_reconnect_limit)
            .field("reconnect_mode", &self.reconnect_mode)
            .field("reconnect_backoff", &self.reconnect_backoff)
            .field(
                "one_connection_per_session",
                &self.one_connection_per_session,
            )
            .field(
                "disable_upload_activation_delay",
                &self.disable_upload_activation_delay,
            )
            .field(
                "roundtrip_time_handler",
                &self.roundtrip_time_handler.is_some(),
            )
            .finish()
    }
}

/// What `close()` does to an active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopPolicy {
    /// Tear the session down immediately.
    #[default]
    Immediate,
    /// Leave the session running; it lives until the client shuts down.
    LiveIndefinitely,
    /// Keep the session alive until pending uploads have drained.
    AfterChangesUploaded,
}

/// How to recover when the server demands a client reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResyncMode {
    /// Do nothing automatic; mark the store for deletion and surface the
    /// error to the application.
    Manual,
    /// Discard local changes and adopt the fresh server copy.
    DiscardLocal,
    /// Replay unsynced local changes on top of the fresh copy.
    #[default]
    Recover,
    /// Try recovery; fall back to discarding local changes.
    RecoverOrDiscard,
}

/// Which flavor of sync a session speaks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMode {
    /// Partition-based sync against a server path.
    Partition(String),
    /// Query-driven (flexible) sync.
    Flexible,
}

impl SyncMode {
    /// Whether this is flexible sync.
    pub fn is_flx(&self) -> bool {
        matches!(self, SyncMode::Flexible)
    }
}

/// Per-session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Server URL (`tidesync:`, `tidesyncs:`, `ws:` or `wss:` scheme).
    pub server_url: String,
    /// Path of the local store, used as the session registry key.
    pub store_path: String,
    /// Partition-based or flexible sync.
    pub sync_mode: SyncMode,
    /// Stop policy applied by `close()`.
    pub stop_policy: StopPolicy,
    /// Client reset handling.
    pub resync_mode: ResyncMode,
    /// Resolve pending completion waits when a non-fatal error arrives.
    pub cancel_waits_on_nonfatal_error: bool,
    /// Backoff progression for session resumption after suspension.
    pub resumption_backoff: BackoffConfig,
}

impl SessionConfig {
    /// Creates a configuration for the given server URL and local store.
    pub fn new(
        server_url: impl Into<String>,
        store_path: impl Into<String>,
        sync_mode: SyncMode,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            store_path: store_path.into(),
            sync_mode,
            stop_policy: StopPolicy::default(),
            resync_mode: ResyncMode::default(),
            cancel_waits_on_nonfatal_error: false,
            resumption_backoff: BackoffConfig::default(),
        }
    }

    /// Sets the stop policy.
    pub fn with_stop_policy(mut self, policy: StopPolicy) -> Self {
        self.stop_policy = policy;
        self
    }

    /// Sets the client reset mode.
    pub fn with_resync_mode(mut self, mode: ResyncMode) -> Self {
        self.resync_mode = mode;
        self
    }

    /// Sets the resumption backoff progression.
    pub fn with_resumption_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.resumption_backoff = backoff;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_builder() {
        let config = ClientConfig::default()
            .with_connect_timeout(Duration::from_secs(10))
            .with_ping_keepalive_period(Duration::from_secs(5))
            .with_reconnect_mode(ReconnectMode::Testing);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.ping_keepalive_period, Duration::from_secs(5));
        assert_eq!(config.reconnect_mode, ReconnectMode::Testing);
    }

    #[test]
    fn session_config_builder() {
        let config = SessionConfig::new(
            "tidesyncs://sync.example.com/app",
            "/tmp/app.store",
            SyncMode::Partition("/default".into()),
        )
        .with_stop_policy(StopPolicy::AfterChangesUploaded)
        .with_resync_mode(ResyncMode::DiscardLocal);
        assert_eq!(config.stop_policy, StopPolicy::AfterChangesUploaded);
        assert_eq!(config.resync_mode, ResyncMode::DiscardLocal);
        assert!(!config.sync_mode.is_flx());
    }
}
