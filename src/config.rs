//! Timer and channel configuration for joined sessions.

use std::time::Duration;

/// Configuration for session actors
#[derive(Debug, Clone)]
pub struct CollabConfig {
    /// Snapshot persistence interval
    pub autosave_interval: Duration,
    /// Presence heartbeat interval (re-asserts the local status)
    pub presence_interval: Duration,
    /// Liveness heartbeat interval
    pub liveness_interval: Duration,
    /// Peers silent for longer than this are treated as offline
    pub liveness_timeout: Duration,
    /// No input for this long derives `idle`
    pub idle_timeout: Duration,
    /// No input for this long derives `away`
    pub away_timeout: Duration,
    /// How long a joiner waits for a peer snapshot before falling back to storage
    pub sync_timeout: Duration,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
    /// Capacity of the per-session command queue
    pub command_capacity: usize,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            autosave_interval: Duration::from_secs(5),
            presence_interval: Duration::from_secs(10),
            liveness_interval: Duration::from_secs(15),
            liveness_timeout: Duration::from_secs(45),
            idle_timeout: Duration::from_secs(60),
            away_timeout: Duration::from_secs(300),
            sync_timeout: Duration::from_millis(1500),
            event_capacity: 256,
            command_capacity: 64,
        }
    }
}

impl CollabConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `COLLAB_*` environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            autosave_interval: env_duration("COLLAB_AUTOSAVE_MS", defaults.autosave_interval),
            presence_interval: env_duration("COLLAB_PRESENCE_MS", defaults.presence_interval),
            liveness_interval: env_duration("COLLAB_LIVENESS_MS", defaults.liveness_interval),
            liveness_timeout: env_duration(
                "COLLAB_LIVENESS_TIMEOUT_MS",
                defaults.liveness_timeout,
            ),
            idle_timeout: env_duration("COLLAB_IDLE_MS", defaults.idle_timeout),
            away_timeout: env_duration("COLLAB_AWAY_MS", defaults.away_timeout),
            sync_timeout: env_duration("COLLAB_SYNC_TIMEOUT_MS", defaults.sync_timeout),
            event_capacity: std::env::var("COLLAB_EVENT_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.event_capacity),
            command_capacity: defaults.command_capacity,
        }
    }

    pub fn with_autosave_interval(mut self, interval: Duration) -> Self {
        self.autosave_interval = interval;
        self
    }

    pub fn with_presence_interval(mut self, interval: Duration) -> Self {
        self.presence_interval = interval;
        self
    }

    pub fn with_liveness(mut self, interval: Duration, timeout: Duration) -> Self {
        self.liveness_interval = interval;
        self.liveness_timeout = timeout;
        self
    }

    pub fn with_idle_timeouts(mut self, idle: Duration, away: Duration) -> Self {
        self.idle_timeout = idle;
        self.away_timeout = away;
        self
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }
}

fn env_duration(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
