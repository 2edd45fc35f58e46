//! Backoff state for reconnect attempts and session resumption.

use crate::config::{BackoffConfig, ReconnectMode};
use rand::Rng;
use std::time::Duration;

/// Why a connection was terminated. Selects the backoff treatment of the
/// next reconnect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The client disconnected on purpose (linger expiry, shutdown).
    ClosedVoluntarily,
    /// The server reported a fatal error; do not reconnect.
    ServerSaidDoNotReconnect,
    /// The server reported a retryable error.
    ServerSaidTryAgainLater,
    /// The connect operation itself failed (resolve/TCP/handshake).
    ConnectOperationFailed,
    /// The connect watchdog expired.
    ConnectTimeout,
    /// A read or write on an established connection failed.
    ReadOrWriteError,
    /// No pong arrived within the keepalive timeout.
    PongTimeout,
    /// The peer violated the sync protocol.
    ProtocolViolation,
    /// TLS handshake or certificate failure.
    TlsError,
    /// The HTTP response to the websocket handshake was unusable.
    BadHeaders,
}

/// An exponential backoff progression keyed by a triggering cause.
///
/// The progression restarts whenever the cause changes, so distinct
/// failure categories back off independently of one another.
#[derive(Debug)]
pub struct DelayProgression<K: PartialEq + Copy> {
    config: BackoffConfig,
    base_config: BackoffConfig,
    cause: Option<K>,
    current: Option<Duration>,
}

impl<K: PartialEq + Copy> DelayProgression<K> {
    /// Creates a progression with the given parameters.
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            base_config: config,
            cause: None,
            current: None,
        }
    }

    /// Clears all accumulated state.
    pub fn reset(&mut self) {
        self.cause = None;
        self.current = None;
        self.config = self.base_config;
    }

    /// Records the cause of the latest failure. A changed cause restarts
    /// the progression; a server-provided delay override replaces the
    /// initial delay for this cause.
    pub fn update(&mut self, cause: K, delay_override: Option<Duration>) {
        if self.cause != Some(cause) {
            self.cause = Some(cause);
            self.current = None;
            self.config = self.base_config;
        }
        if let Some(initial) = delay_override {
            if self.config.initial_delay != initial {
                self.config.initial_delay = initial;
                self.config.max_delay = initial.max(self.base_config.max_delay);
                self.current = None;
            }
        }
    }

    /// The recorded cause of the latest failure.
    pub fn cause(&self) -> Option<K> {
        self.cause
    }

    /// Advances the progression and returns the next delay, with the
    /// random deduction applied.
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.config.initial_delay,
            Some(current) => (current * self.config.multiplier).min(self.config.max_delay),
        };
        self.current = Some(next);
        apply_jitter(next, self.config.jitter_divisor)
    }
}

fn apply_jitter(delay: Duration, jitter_divisor: u32) -> Duration {
    if jitter_divisor == 0 || delay.is_zero() {
        return delay;
    }
    let max_deduction = delay / jitter_divisor;
    if max_deduction.is_zero() {
        return delay;
    }
    let deduction_ms = rand::thread_rng().gen_range(0..=max_deduction.as_millis() as u64);
    delay.saturating_sub(Duration::from_millis(deduction_ms))
}

/// Reconnect backoff state of one connection.
#[derive(Debug)]
pub struct ReconnectInfo {
    progression: DelayProgression<TerminationReason>,
    mode: ReconnectMode,
    /// When set, the backoff state is cleared before computing the next
    /// delay. Armed by `cancel_reconnect_delay()` while connected, and
    /// disarmed again if the urgent ping it schedules is answered.
    pub scheduled_reset: bool,
}

impl ReconnectInfo {
    /// Creates reconnect state with the given backoff parameters.
    pub fn new(config: BackoffConfig, mode: ReconnectMode) -> Self {
        Self {
            progression: DelayProgression::new(config),
            mode,
            scheduled_reset: false,
        }
    }

    /// Clears all accumulated state.
    pub fn reset(&mut self) {
        self.progression.reset();
        self.scheduled_reset = false;
    }

    /// Records why the connection was just terminated.
    pub fn update(&mut self, reason: TerminationReason, delay_override: Option<Duration>) {
        self.progression.update(reason, delay_override);
    }

    /// The delay before the next reconnect attempt. `None` means no
    /// reconnection is scheduled at all (the wait is infinite).
    pub fn delay_interval(&mut self) -> Option<Duration> {
        if self.scheduled_reset {
            self.reset();
        }
        match self.progression.cause() {
            None => Some(Duration::ZERO),
            Some(TerminationReason::ClosedVoluntarily) => Some(Duration::ZERO),
            Some(TerminationReason::ServerSaidDoNotReconnect) => None,
            Some(_) => {
                if self.mode == ReconnectMode::Testing {
                    return None;
                }
                Some(self.progression.next_delay())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BackoffConfig {
        BackoffConfig::new(Duration::from_secs(1), Duration::from_secs(8)).without_jitter()
    }

    #[test]
    fn voluntary_close_means_zero_delay() {
        let mut info = ReconnectInfo::new(config(), ReconnectMode::Normal);
        info.update(TerminationReason::ClosedVoluntarily, None);
        assert_eq!(info.delay_interval(), Some(Duration::ZERO));
    }

    #[test]
    fn server_said_do_not_reconnect_means_infinite() {
        let mut info = ReconnectInfo::new(config(), ReconnectMode::Normal);
        info.update(TerminationReason::ServerSaidDoNotReconnect, None);
        assert_eq!(info.delay_interval(), None);
    }

    #[test]
    fn no_prior_failure_means_zero_delay() {
        let mut info = ReconnectInfo::new(config(), ReconnectMode::Normal);
        assert_eq!(info.delay_interval(), Some(Duration::ZERO));
    }

    #[test]
    fn testing_mode_never_reconnects_after_failure() {
        let mut info = ReconnectInfo::new(config(), ReconnectMode::Testing);
        info.update(TerminationReason::ReadOrWriteError, None);
        assert_eq!(info.delay_interval(), None);
    }

    #[test]
    fn failure_delays_grow_and_cap() {
        let mut info = ReconnectInfo::new(config(), ReconnectMode::Normal);
        info.update(TerminationReason::ReadOrWriteError, None);
        assert_eq!(info.delay_interval(), Some(Duration::from_secs(1)));
        assert_eq!(info.delay_interval(), Some(Duration::from_secs(2)));
        assert_eq!(info.delay_interval(), Some(Duration::from_secs(4)));
        assert_eq!(info.delay_interval(), Some(Duration::from_secs(8)));
        assert_eq!(info.delay_interval(), Some(Duration::from_secs(8)));
    }

    #[test]
    fn reason_change_restarts_progression() {
        let mut info = ReconnectInfo::new(config(), ReconnectMode::Normal);
        info.update(TerminationReason::ReadOrWriteError, None);
        assert_eq!(info.delay_interval(), Some(Duration::from_secs(1)));
        assert_eq!(info.delay_interval(), Some(Duration::from_secs(2)));
        info.update(TerminationReason::PongTimeout, None);
        assert_eq!(info.delay_interval(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn scheduled_reset_clears_backoff() {
        let mut info = ReconnectInfo::new(config(), ReconnectMode::Normal);
        info.update(TerminationReason::ReadOrWriteError, None);
        let _ = info.delay_interval();
        let _ = info.delay_interval();
        info.scheduled_reset = true;
        assert_eq!(info.delay_interval(), Some(Duration::ZERO));
    }

    #[test]
    fn server_delay_override_replaces_initial() {
        let mut progression: DelayProgression<u16> = DelayProgression::new(config());
        progression.update(200, Some(Duration::from_secs(3)));
        assert_eq!(progression.next_delay(), Duration::from_secs(3));
        assert_eq!(progression.next_delay(), Duration::from_secs(6));
        // Same cause, same override: progression continues.
        progression.update(200, Some(Duration::from_secs(3)));
        assert_eq!(progression.next_delay(), Duration::from_secs(8));
    }

    #[test]
    fn jitter_bounded_by_divisor() {
        let config = BackoffConfig::new(Duration::from_secs(9), Duration::from_secs(9));
        let mut progression: DelayProgression<u8> = DelayProgression::new(config);
        progression.update(1, None);
        for _ in 0..32 {
            let delay = progression.next_delay();
            assert!(delay <= Duration::from_secs(9));
            assert!(delay >= Duration::from_secs(6));
        }
    }
}
