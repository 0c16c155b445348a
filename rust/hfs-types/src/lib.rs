//! Shared data model for the HFS hierarchical function scheduler.
//!
//! Every tier (global, domain, local) exchanges the types defined here:
//! resource trees, instance descriptors, affinity selectors, the
//! inter-tier message set and the stable wire status codes. The crate
//! is deliberately free of runtime machinery so that observers,
//! schedulers and the meta-store client can all depend on it.

pub mod affinity;
pub mod instance;
pub mod message;
pub mod plugin;
pub mod resource;
pub mod rpc;
pub mod status;
pub mod unit;

pub use affinity::{
    AffinityScope, AffinityTree, InnerAffinity, InstanceAffinity, LabelExpression, LabelOp,
    PendingResource, ResourceAffinity, ScopedSelectors, Selector, SubCondition,
};
pub use instance::{
    CreateTarget, FunctionKey, FunctionMeta, InstanceInfo, InstanceStatus, ProxyMeta, RouteInfo,
    SchedPolicy, ScheduleOption,
};
pub use message::{
    CancelSchedule, CreateAgentRequest, CreateAgentResponse, DeletePodRequest, DeletePodResponse,
    EvictAck, EvictAgentRequest, GroupResponse, NotifyEvictResult, NotifySchedAbnormalRequest,
    NotifySchedAbnormalResponse, NotifyWorkerStatusRequest, NotifyWorkerStatusResponse, Register,
    Registered, ScheduleRequest, ScheduleResponse, ScheduleResult, ScheduleTopology, TopoMember,
    TryCancelResponse,
};
pub use plugin::{
    AffinityContext, DefaultFilterContext, GroupScheduleContext, PluginContext, PluginContextMap,
    DEFAULT_FILTER_PLUGIN, GROUP_SCHEDULE_CONTEXT, LABEL_AFFINITY_PLUGIN,
};
pub use resource::{LabelMap, ResourceValue, Resources, ValueCounter};
pub use status::{Status, StatusCode};
pub use unit::{
    Bucket, BucketIndex, BucketInfo, ResourceType, ResourceUnit, ResourceUnitChanges, UnitChange,
};

/// Create-option key naming the party that owns the reserved resource.
pub const RESOURCE_OWNER_KEY: &str = "RESOURCE_OWNER_KEY";
/// Resource-selector value matched when no explicit owner label exists.
pub const DEFAULT_OWNER_VALUE: &str = "default";
/// Create-option value marking system-owned resources.
pub const SYSTEM_OWNER_VALUE: &str = "system";
/// Create-option key carrying the affinity pool an agent was drawn from.
pub const AFFINITY_POOL_ID: &str = "AFFINITY_POOL_ID";
/// Tenant id reserved for system functions, which bypass lease TTLs.
pub const SYSTEM_TENANT_ID: &str = "0";
/// Request-id suffix routed to the create-time adapter instead of the
/// original caller.
pub const INIT_CALL_SUFFIX: &str = "@initcall";
