//! Node configuration parameters

use std::time::Duration;

/// Configuration for consensus timing and placement parameters
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Interval between AppendEntries rounds sent by the leader
    /// (default: 50ms; legacy deployments run 2000ms and interoperate)
    pub heartbeat_interval: Duration,
    /// Minimum election timeout (default: 300ms)
    pub election_timeout_min: Duration,
    /// Maximum election timeout (default: 500ms)
    pub election_timeout_max: Duration,
    /// Numerator of the load-weighted vote delay `base / load_level` ms
    /// (default: 100)
    pub vote_delay_base: u64,
    /// Sampling period of the host load probe (default: 300ms)
    pub load_probe_interval: Duration,
    /// TCP port of the artifact side channel (default: 4001)
    pub artifact_port: u16,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(50),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(500),
            vote_delay_base: 100,
            load_probe_interval: Duration::from_millis(300),
            artifact_port: 4001,
        }
    }
}

impl RaftConfig {
    /// Create a new config with custom heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Create a new config with custom election timeout range
    pub fn with_election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.election_timeout_min = min;
        self.election_timeout_max = max;
        self
    }

    /// Create a new config with custom vote delay numerator
    pub fn with_vote_delay_base(mut self, base: u64) -> Self {
        self.vote_delay_base = base;
        self
    }

    /// Create a new config with custom load probe period
    pub fn with_load_probe_interval(mut self, interval: Duration) -> Self {
        self.load_probe_interval = interval;
        self
    }

    /// Create a new config with custom artifact channel port
    pub fn with_artifact_port(mut self, port: u16) -> Self {
        self.artifact_port = port;
        self
    }

    /// Generate a random election timeout within the configured range
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        let timeout_ms = rand::rng().random_range(min_ms..=max_ms);
        Duration::from_millis(timeout_ms)
    }
}
