//! Connection manager configuration.

use std::sync::Arc;
use std::time::Duration;

use knot_util::IdGenerator;

/// Default time between heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Default time to wait for a heartbeat acknowledgment.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(3);

/// How inbound `DATA`/`HEARTBEAT` callbacks are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchPolicy {
    /// Spawn one task per frame with no limit. Completion order between
    /// frames of the same session is not defined.
    #[default]
    Unbounded,
    /// At most this many callback tasks run at once per connection manager.
    /// The dispatch loop waits for a free slot, which stalls the read pump.
    Bounded(usize),
}

/// What the client does when a heartbeat goes unacknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissedHeartbeatPolicy {
    /// Log a warning and keep the connection.
    #[default]
    LogOnly,
    /// Log a warning and close the session.
    Disconnect,
}

/// Configuration for the server connection manager.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Scheduling of per-frame callbacks.
    pub dispatch: DispatchPolicy,
    /// Source of session ids.
    pub session_ids: Arc<IdGenerator>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            dispatch: DispatchPolicy::default(),
            session_ids: IdGenerator::session_ids(),
        }
    }
}

impl ServerConfig {
    /// Set the dispatch policy.
    #[must_use]
    pub const fn with_dispatch(mut self, dispatch: DispatchPolicy) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Use a dedicated session id generator.
    #[must_use]
    pub fn with_session_ids(mut self, session_ids: Arc<IdGenerator>) -> Self {
        self.session_ids = session_ids;
        self
    }
}

/// Configuration for the client connection manager.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Time between heartbeats. Any inbound frame restarts this timer.
    pub heartbeat_interval: Duration,
    /// Time to wait for a heartbeat acknowledgment.
    pub heartbeat_timeout: Duration,
    /// Reaction to a missed acknowledgment.
    pub missed_heartbeat: MissedHeartbeatPolicy,
    /// Scheduling of per-frame callbacks.
    pub dispatch: DispatchPolicy,
    /// Source of session ids.
    pub session_ids: Arc<IdGenerator>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            missed_heartbeat: MissedHeartbeatPolicy::default(),
            dispatch: DispatchPolicy::default(),
            session_ids: IdGenerator::session_ids(),
        }
    }
}

impl ClientConfig {
    /// Set the heartbeat interval.
    #[must_use]
    pub const fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the heartbeat acknowledgment timeout.
    #[must_use]
    pub const fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Set the missed heartbeat policy.
    #[must_use]
    pub const fn with_missed_heartbeat(mut self, policy: MissedHeartbeatPolicy) -> Self {
        self.missed_heartbeat = policy;
        self
    }

    /// Set the dispatch policy.
    #[must_use]
    pub const fn with_dispatch(mut self, dispatch: DispatchPolicy) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Use a dedicated session id generator.
    #[must_use]
    pub fn with_session_ids(mut self, session_ids: Arc<IdGenerator>) -> Self {
        self.session_ids = session_ids;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(3));
        assert_eq!(config.missed_heartbeat, MissedHeartbeatPolicy::LogOnly);
        assert_eq!(config.dispatch, DispatchPolicy::Unbounded);
    }

    #[test]
    fn test_builders() {
        let ids = Arc::new(IdGenerator::new());
        let config = ServerConfig::default()
            .with_dispatch(DispatchPolicy::Bounded(4))
            .with_session_ids(Arc::clone(&ids));

        assert_eq!(config.dispatch, DispatchPolicy::Bounded(4));
        assert!(Arc::ptr_eq(&config.session_ids, &ids));
    }
}
