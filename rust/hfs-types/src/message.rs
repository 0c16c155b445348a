//! Inter-tier message set.
//!
//! These are the payloads named in the protocol: Register/Registered,
//! Schedule/ForwardSchedule and their responses, the Reserve/Bind
//! group quartet, abnormality and worker-status notifications, evict
//! and preemption traffic, pod deletion and cancellation.

use crate::instance::InstanceInfo;
use crate::plugin::PluginContextMap;
use crate::status::StatusCode;
use crate::unit::{ResourceType, ResourceUnit, ResourceUnitChanges};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A schedule request travelling down (Schedule) or up
/// (ForwardSchedule) the tree.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScheduleRequest {
    pub request_id: String,
    pub trace_id: String,
    pub instance: InstanceInfo,
    /// Monotonically increasing per forward-back cycle; underlayers
    /// reject rounds they have already filtered.
    pub schedule_round: u32,
    /// Resource deltas the sender wants replayed before deciding.
    pub update_resources: Vec<ResourceUnitChanges>,
    /// Cross-tier plugin state.
    pub plugin_context: PluginContextMap,
}

/// Result payload of a successful placement.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScheduleResult {
    pub agent_id: String,
    pub node_id: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScheduleResponse {
    pub code: StatusCode,
    pub message: String,
    pub request_id: String,
    pub instance_id: String,
    pub schedule_result: Option<ScheduleResult>,
    /// Deltas for the caller to replay locally.
    pub update_resources: Vec<ResourceUnitChanges>,
}

impl ScheduleResponse {
    pub fn ok(request_id: impl Into<String>) -> Self {
        Self { request_id: request_id.into(), ..Default::default() }
    }

    pub fn error(
        code: StatusCode,
        message: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            request_id: request_id.into(),
            ..Default::default()
        }
    }
}

/// One member of a scheduler topology.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TopoMember {
    pub name: String,
    pub address: String,
}

/// Topology pushed by the global tier: the domain leader plus the
/// full member list.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScheduleTopology {
    pub leader: TopoMember,
    pub members: Vec<TopoMember>,
}

/// Registration of an underlayer, carrying its resource snapshot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Register {
    pub name: String,
    pub address: String,
    pub resources: BTreeMap<ResourceType, ResourceUnit>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Registered {
    pub code: StatusCode,
    pub message: String,
    /// Present on global-tier acks: tells the local which domain
    /// leader to register with.
    pub topology: Option<ScheduleTopology>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NotifySchedAbnormalRequest {
    pub sched_name: String,
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NotifySchedAbnormalResponse {
    pub sched_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NotifyWorkerStatusRequest {
    pub worker_ip: String,
    pub healthy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NotifyWorkerStatusResponse {
    pub worker_ip: String,
    pub healthy: bool,
}

/// Eviction (or preemption) of a set of instances.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EvictAgentRequest {
    pub request_id: String,
    pub instance_ids: Vec<String>,
    pub timeout_secs: u32,
    pub is_preempt: bool,
}

/// Acknowledgement that the eviction was accepted (not completed).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EvictAck {
    pub request_id: String,
    pub code: StatusCode,
}

/// Completion report of an eviction.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NotifyEvictResult {
    pub request_id: String,
    pub code: StatusCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeletePodRequest {
    pub request_id: String,
    pub function_agent_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeletePodResponse {
    pub request_id: String,
    pub code: i32,
}

/// Ask the scaler to provision an agent able to host `resources`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CreateAgentRequest {
    pub request_id: String,
    pub instance: InstanceInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CreateAgentResponse {
    pub request_id: String,
    pub code: i32,
    pub message: String,
    /// Options to merge back into the caller's create options, e.g.
    /// labels of the affinity pool the agent was drawn from.
    pub updated_create_options: BTreeMap<String, String>,
}

/// Response of the group quartet (Reserve/Bind/UnReserve/UnBind).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GroupResponse {
    pub request_id: String,
    pub trace_id: String,
    pub code: StatusCode,
    pub message: String,
    pub update_resources: Vec<ResourceUnitChanges>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CancelSchedule {
    pub request_id: String,
    /// Only the original caller may cancel.
    pub caller: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TryCancelResponse {
    pub request_id: String,
    pub code: StatusCode,
    pub message: String,
}
