//! Domain tier tuning knobs.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DomainConfig {
    /// This scheduler's name in the topology.
    pub name: String,
    /// True for the cluster root (the global tier): increments the
    /// schedule round on forwarded requests and defers preferred
    /// affinity to its children.
    pub is_root: bool,
    /// Honour required affinity only (relaxed) or also demand optimal
    /// preferred scores top-down (strict).
    pub relaxed_affinity: bool,
    /// Heartbeat probe interval towards each registered underlayer.
    pub heartbeat_interval: Duration,
    /// Misses before an underlayer is declared lost.
    pub heartbeat_max_times: u32,
    /// Deadline of one downward dispatch.
    pub dispatch_timeout: Duration,
    /// Same-underlayer retries after a dispatch timeout.
    pub dispatch_retry_times: u32,
    /// Backoff schedule after AFFINITY_SCHEDULE_FAILED.
    pub affinity_retry_intervals: Vec<Duration>,
    /// Pause between schedule attempts while waiting for a created
    /// agent to register.
    pub create_agent_await_retry_interval: Duration,
    pub create_agent_await_retry_times: u32,
    /// Deadline for a Reserve/Bind exchange with one underlayer.
    pub group_timeout: Duration,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            name: "domain".to_string(),
            is_root: false,
            relaxed_affinity: false,
            heartbeat_interval: Duration::from_millis(1000),
            heartbeat_max_times: 3,
            dispatch_timeout: Duration::from_secs(20),
            dispatch_retry_times: 3,
            affinity_retry_intervals: vec![
                Duration::from_millis(100),
                Duration::from_millis(100),
                Duration::from_millis(100),
            ],
            create_agent_await_retry_interval: Duration::from_millis(500),
            create_agent_await_retry_times: 10,
            group_timeout: Duration::from_millis(5000),
        }
    }
}
