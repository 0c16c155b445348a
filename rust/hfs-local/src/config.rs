//! Local tier tuning knobs.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// This node's id; doubles as its name in every topology.
    pub node_id: String,
    /// Address advertised on registration.
    pub address: String,
    /// Address of the global scheduler tier.
    pub global_address: String,
    /// Re-registration cycle while an ack is outstanding.
    pub register_cycle: Duration,
    /// Silence window after which the domain is considered gone and
    /// registration restarts.
    pub ping_timeout: Duration,
    /// Deadline of one forward-up attempt.
    pub forward_request_timeout: Duration,
    /// Forward-up retries when the instance sets no init-call budget.
    pub forward_max_retry: u32,
    /// Deadline of one unregister attempt during shutdown.
    pub unregister_timeout: Duration,
    /// Upper bound of the unregister retry backoff.
    pub unregister_backoff_cap: Duration,
    /// TTL of the bus-proxy lease.
    pub service_ttl: Duration,
    /// Honour required affinity only (relaxed) or demand optimal
    /// preferred scores top-down (strict).
    pub relaxed_affinity: bool,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            node_id: "local".to_string(),
            address: "inproc://local".to_string(),
            global_address: "inproc://global".to_string(),
            register_cycle: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(3),
            forward_request_timeout: Duration::from_secs(10),
            forward_max_retry: 3,
            unregister_timeout: Duration::from_secs(5),
            unregister_backoff_cap: Duration::from_secs(60),
            service_ttl: Duration::from_secs(8),
            relaxed_affinity: false,
        }
    }
}
