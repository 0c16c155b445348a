//! Instance, function and proxy metadata.

use crate::affinity::AffinityTree;
use crate::resource::Resources;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// tenant/name/version triple identifying one function version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FunctionKey {
    pub tenant: String,
    pub name: String,
    pub version: String,
}

impl FunctionKey {
    pub fn new(
        tenant: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self { tenant: tenant.into(), name: name.into(), version: version.into() }
    }

    /// A key is addressable only when all three parts are present.
    pub fn is_valid(&self) -> bool {
        !self.tenant.is_empty() && !self.name.is_empty() && !self.version.is_empty()
    }

    pub fn is_system(&self) -> bool {
        self.tenant == crate::SYSTEM_TENANT_ID
    }
}

impl fmt::Display for FunctionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant, self.name, self.version)
    }
}

/// Placement policy of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedPolicy {
    /// Consumes a whole agent.
    Monopoly,
    /// Packs with other instances.
    #[default]
    Shared,
}

/// What a schedule request ultimately creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CreateTarget {
    #[default]
    Instance,
    ResourceGroup,
}

/// Per-request scheduling knobs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScheduleOption {
    pub affinity: Option<AffinityTree>,
    pub priority: i32,
    /// Overall schedule deadline in seconds; 0 means unbounded.
    pub schedule_timeout_secs: u32,
    /// Deadline of the instance initializer call in seconds.
    pub init_call_timeout_secs: u32,
    pub sched_policy: SchedPolicy,
    /// label -> required value pairs a unit must advertise.
    pub resource_selector: BTreeMap<String, String>,
    pub target: CreateTarget,
}

/// Lifecycle of an instance as stored in the meta-store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    #[default]
    New,
    Scheduling,
    Binding,
    Running,
    Exiting,
    Fatal,
    Finalized,
}

/// A scheduled or scheduling function instance.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub request_id: String,
    pub trace_id: String,
    pub function: FunctionKey,
    /// Chosen agent once scheduled.
    pub function_agent_id: String,
    /// Node owning the instance.
    pub function_proxy_id: String,
    pub resources: Resources,
    pub schedule_option: ScheduleOption,
    /// Free-form options; carries e.g. RESOURCE_OWNER_KEY and
    /// AFFINITY_POOL_ID.
    pub create_options: BTreeMap<String, String>,
    pub status: InstanceStatus,
    pub tenant_id: String,
    pub parent_function_proxy_id: String,
    /// Transaction version checked by the runtime before commit.
    pub version: i64,
}

impl InstanceInfo {
    pub fn is_monopoly(&self) -> bool {
        self.schedule_option.sched_policy == SchedPolicy::Monopoly
    }
}

/// Static descriptor of one function version.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FunctionMeta {
    pub function: FunctionKey,
    pub runtime: String,
    pub handler: String,
    pub code_ref: String,
    pub layer_refs: Vec<String>,
    pub resource_defaults: Resources,
    /// hook name -> handler reference.
    pub hooks: BTreeMap<String, String>,
}

/// Public projection of an instance: the fields another node needs to
/// address it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RouteInfo {
    pub instance_id: String,
    pub runtime_address: String,
    pub status: InstanceStatus,
    pub proxy_id: String,
    pub mod_revision: i64,
}

impl RouteInfo {
    pub fn from_instance(info: &InstanceInfo, runtime_address: impl Into<String>) -> Self {
        Self {
            instance_id: info.instance_id.clone(),
            runtime_address: runtime_address.into(),
            status: info.status,
            proxy_id: info.function_proxy_id.clone(),
            mod_revision: 0,
        }
    }
}

/// Advertisement of one local proxy, held under a TTL lease.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProxyMeta {
    pub node: String,
    pub aid: String,
    pub ak: String,
}
