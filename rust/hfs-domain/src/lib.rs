//! Domain scheduler tier (C5 + C6).
//!
//! The [`UnderlayerSchedMgr`] tracks the subordinate local tiers:
//! registration against the pushed topology, heartbeat observation,
//! dispatch/reserve/bind traffic and the recovery of requests stuck
//! on a dead underlayer. The [`InstanceCtrl`] owns each schedule
//! request accepted by this tier: decision, dispatch retries,
//! rescheduling after races, affinity backoff, agent creation through
//! the scaler, and forwarding up when the domain cannot satisfy the
//! request. [`DomainScheduler`] wires both together behind the
//! inter-tier seams.

pub mod config;
pub mod domain;
pub mod instance_ctrl;
pub mod scheduler;
pub mod underlayer;

pub use config::DomainConfig;
pub use domain::DomainScheduler;
pub use instance_ctrl::InstanceCtrl;
pub use scheduler::{FrameworkScheduler, Scheduler};
pub use underlayer::UnderlayerSchedMgr;
