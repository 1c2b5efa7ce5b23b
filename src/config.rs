use std::time::Duration;

/// Timeout and interval knobs shared by the master and its workers.
///
/// A worker is considered lost when no heartbeat has been received for
/// `worker_timeout + worker_timeout_grace`. The grace period covers clock
/// skew and heartbeats still in flight.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub worker_timeout: Duration,
    pub worker_timeout_grace: Duration,
    pub worker_heartbeat_interval: Duration,
    pub master_check_interval: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            worker_timeout: Duration::from_secs(15),
            worker_timeout_grace: Duration::from_secs(5),
            worker_heartbeat_interval: Duration::from_secs(3),
            master_check_interval: Duration::from_secs(1),
        }
    }
}

impl TimeoutConfig {
    pub fn with_worker_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout = timeout;
        self
    }

    pub fn with_worker_timeout_grace(mut self, grace: Duration) -> Self {
        self.worker_timeout_grace = grace;
        self
    }

    pub fn with_master_check_interval(mut self, interval: Duration) -> Self {
        self.master_check_interval = interval;
        self
    }

    /// Full interval after which a silent worker expires.
    pub fn worker_expire_interval(&self) -> Duration {
        self.worker_timeout + self.worker_timeout_grace
    }
}
