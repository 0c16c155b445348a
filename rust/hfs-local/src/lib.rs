//! Local scheduler tier (C5 + C7).
//!
//! One [`LocalSchedSrv`] per node: it registers to the global tier,
//! learns the domain leader from the ack, registers there with its
//! resource snapshot, and from then on serves schedule traffic coming
//! down from the domain and requests coming up from the runtimes on
//! this node. The [`LocalGroupCtrl`] answers the Reserve/Bind quartet
//! against the node's resource view, and the [`ServiceRegistry`]
//! keeps the node's bus-proxy presence alive under a meta-store
//! lease.

pub mod agent;
pub mod config;
pub mod group_ctrl;
pub mod instance_ctrl;
pub mod registry;
pub mod service;

pub use agent::{AgentManager, StaticAgentManager};
pub use config::LocalConfig;
pub use group_ctrl::LocalGroupCtrl;
pub use instance_ctrl::LocalInstanceCtrl;
pub use registry::ServiceRegistry;
pub use service::{LocalSchedSrv, TierResolver};
