//! Inter-tier seams.
//!
//! The scheduler tiers talk through these traits; the transport
//! behind them (in-process wiring, gRPC, anything else) is not this
//! crate's concern. Errors are transport-level failures — a reachable
//! peer answers with a response carrying its own status code.

use crate::message::{
    CancelSchedule, CreateAgentRequest, CreateAgentResponse, DeletePodRequest, DeletePodResponse,
    EvictAck, EvictAgentRequest, GroupResponse, NotifyEvictResult, NotifySchedAbnormalRequest,
    NotifySchedAbnormalResponse, NotifyWorkerStatusRequest, NotifyWorkerStatusResponse, Register,
    Registered, ScheduleRequest, ScheduleResponse, TryCancelResponse,
};
use crate::status::Status;
use async_trait::async_trait;

pub type RpcResult<T> = Result<T, Status>;

/// What a tier can ask of the tier above it (local → domain,
/// domain → global).
#[async_trait]
pub trait SchedulerUplink: Send + Sync {
    async fn forward_schedule(&self, req: ScheduleRequest) -> RpcResult<ScheduleResponse>;

    async fn notify_sched_abnormal(
        &self,
        req: NotifySchedAbnormalRequest,
    ) -> RpcResult<NotifySchedAbnormalResponse>;

    async fn notify_worker_status(
        &self,
        req: NotifyWorkerStatusRequest,
    ) -> RpcResult<NotifyWorkerStatusResponse>;

    async fn try_cancel_schedule(&self, req: CancelSchedule) -> RpcResult<TryCancelResponse>;

    async fn delete_pod(&self, req: DeletePodRequest) -> RpcResult<DeletePodResponse>;

    /// Completion report of an eviction accepted earlier; the ack and
    /// the result travel separately.
    async fn notify_evict_result(&self, req: NotifyEvictResult) -> RpcResult<()>;

    async fn unregister(&self, name: &str) -> RpcResult<Status>;
}

/// What a tier can ask of one subordinate scheduler
/// (domain → local). One client per underlayer.
#[async_trait]
pub trait SchedulerDownlink: Send + Sync {
    async fn schedule(&self, req: ScheduleRequest) -> RpcResult<ScheduleResponse>;

    async fn reserve(&self, req: ScheduleRequest) -> RpcResult<ScheduleResponse>;

    async fn un_reserve(&self, req: ScheduleRequest) -> RpcResult<GroupResponse>;

    async fn bind(&self, req: ScheduleRequest) -> RpcResult<GroupResponse>;

    async fn un_bind(&self, req: ScheduleRequest) -> RpcResult<GroupResponse>;

    async fn evict_agent(&self, req: EvictAgentRequest) -> RpcResult<EvictAck>;

    async fn preempt_instances(&self, req: EvictAgentRequest) -> RpcResult<EvictAck>;

    /// Heartbeat probe; an Err means the peer is unreachable.
    async fn ping(&self) -> RpcResult<()>;
}

/// The agent scaler on the domain tier.
#[async_trait]
pub trait ScalerClient: Send + Sync {
    async fn create_agent(&self, req: CreateAgentRequest) -> RpcResult<CreateAgentResponse>;

    async fn delete_pod(&self, req: DeletePodRequest) -> RpcResult<DeletePodResponse>;
}

/// Registration endpoint of an upper tier. Split from
/// [`SchedulerUplink`] because registration hands over the reverse
/// (downlink) channel.
#[async_trait]
pub trait RegistrationTarget: Send + Sync {
    async fn register(
        &self,
        req: Register,
        downlink: std::sync::Arc<dyn SchedulerDownlink>,
    ) -> RpcResult<Registered>;
}
