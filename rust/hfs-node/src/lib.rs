//! Node wiring: configuration, tier assembly and the health surface.

pub mod config;
pub mod health;
pub mod wiring;

pub use config::{NodeConfig, NodeRole};
pub use health::{health_router, HealthState};
pub use wiring::{InProcCluster, InProcResolver};
