//! The domain scheduler facade: what upper and lower tiers see.

use crate::config::DomainConfig;
use crate::instance_ctrl::InstanceCtrl;
use crate::scheduler::{FrameworkScheduler, Scheduler};
use crate::underlayer::{PreemptResult, UnderlayerSchedMgr};
use async_trait::async_trait;
use hfs_resource_view::ResourceViewMgr;
use hfs_sched_framework::PipelineOptions;
use hfs_types::rpc::{
    RegistrationTarget, RpcResult, ScalerClient, SchedulerDownlink, SchedulerUplink,
};
use hfs_types::{
    CancelSchedule, DeletePodRequest, DeletePodResponse, NotifySchedAbnormalRequest,
    NotifySchedAbnormalResponse, NotifyWorkerStatusRequest, NotifyWorkerStatusResponse, Register,
    Registered, ScheduleRequest, ScheduleResponse, ScheduleTopology, Status, StatusCode,
    TryCancelResponse,
};
use parking_lot::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tracing::{info, warn};

struct DomainInner {
    config: DomainConfig,
    view: ResourceViewMgr,
    underlayer_mgr: UnderlayerSchedMgr,
    instance_ctrl: InstanceCtrl,
    uplink: Mutex<Option<Arc<dyn SchedulerUplink>>>,
    scaler: Mutex<Option<Arc<dyn ScalerClient>>>,
    topology: Mutex<Option<ScheduleTopology>>,
}

/// One domain (or, with `is_root`, the global) scheduler tier.
#[derive(Clone)]
pub struct DomainScheduler {
    inner: Arc<DomainInner>,
}

impl DomainScheduler {
    pub fn new(config: DomainConfig) -> Self {
        let view = ResourceViewMgr::spawn(config.name.clone(), None);
        let scheduler: Arc<dyn Scheduler> = Arc::new(FrameworkScheduler::new(
            view.clone(),
            PipelineOptions { relaxed: config.relaxed_affinity, root_level: config.is_root },
        ));
        Self::with_scheduler(config, view, scheduler)
    }

    /// Construction seam for tests that mock the decision pipeline.
    pub fn with_scheduler(
        config: DomainConfig,
        view: ResourceViewMgr,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let max_retry = Arc::new(AtomicUsize::new(0));
        let underlayer_mgr =
            UnderlayerSchedMgr::new(config.clone(), view.clone(), Arc::clone(&max_retry));
        let instance_ctrl = InstanceCtrl::new(
            config.clone(),
            scheduler,
            underlayer_mgr.clone(),
            max_retry,
        );
        instance_ctrl.set_domain_level(true);
        Self {
            inner: Arc::new(DomainInner {
                config,
                view,
                underlayer_mgr,
                instance_ctrl,
                uplink: Mutex::new(None),
                scaler: Mutex::new(None),
                topology: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn view(&self) -> &ResourceViewMgr {
        &self.inner.view
    }

    pub fn instance_ctrl(&self) -> &InstanceCtrl {
        &self.inner.instance_ctrl
    }

    pub fn underlayer_mgr(&self) -> &UnderlayerSchedMgr {
        &self.inner.underlayer_mgr
    }

    /// Connect to the tier above (absent on the cluster root).
    pub fn set_uplink(&self, uplink: Arc<dyn SchedulerUplink>) {
        self.inner.underlayer_mgr.set_uplink(Arc::clone(&uplink));
        *self.inner.uplink.lock() = Some(uplink);
    }

    pub fn set_scaler(&self, scaler: Arc<dyn ScalerClient>) {
        self.inner.instance_ctrl.set_scaler(Arc::clone(&scaler));
        *self.inner.scaler.lock() = Some(scaler);
    }

    /// Topology push from the global tier (or the operator on the
    /// root): reconciles the underlayer set and is echoed to locals
    /// registering here when this tier is the root.
    pub fn update_sched_topo(&self, topology: ScheduleTopology) {
        self.inner.underlayer_mgr.update_underlayer_topo(&topology);
        *self.inner.topology.lock() = Some(topology);
    }

    pub fn preempt_instances(&self, results: Vec<PreemptResult>) {
        self.inner.underlayer_mgr.preempt_instance(results);
    }

    /// Entry used by tests and by in-process callers that sit on this
    /// tier directly.
    pub async fn schedule(&self, req: ScheduleRequest) -> ScheduleResponse {
        self.inner.instance_ctrl.schedule(req).await
    }
}

#[async_trait]
impl RegistrationTarget for DomainScheduler {
    async fn register(
        &self,
        req: Register,
        downlink: Arc<dyn SchedulerDownlink>,
    ) -> RpcResult<Registered> {
        // The root also answers locals that are not its direct
        // underlayers: they only come for the domain topology.
        if self.inner.config.is_root && !self.inner.underlayer_mgr.in_topology(&req.name) {
            info!(name = %req.name, "worker registered at the root for topology discovery");
            return Ok(Registered {
                code: StatusCode::Success,
                message: String::new(),
                topology: self.inner.topology.lock().clone(),
            });
        }
        let mut registered = self.inner.underlayer_mgr.register(req, downlink).await;
        if registered.code.is_ok() && self.inner.config.is_root {
            registered.topology = self.inner.topology.lock().clone();
        }
        Ok(registered)
    }
}

#[async_trait]
impl SchedulerUplink for DomainScheduler {
    /// Upstream entry: a lower tier could not satisfy the request.
    async fn forward_schedule(&self, mut req: ScheduleRequest) -> RpcResult<ScheduleResponse> {
        if !self.inner.underlayer_mgr.admit_forwarded(&req.request_id) {
            warn!(request_id = %req.request_id, "repeated forward schedule ignored");
            return Err(Status::new(
                StatusCode::DomainSchedulerForwardErr,
                "repeated forward schedule request",
            ));
        }
        for changes in std::mem::take(&mut req.update_resources) {
            let _ = self.inner.view.update_resource_unit_delta(changes).await;
        }
        // The root sees the whole cluster and may still pick the same
        // underlayer; a fresh round keeps it from being filtered out.
        if self.inner.config.is_root {
            req.schedule_round = req.schedule_round.wrapping_add(1);
        }
        info!(request_id = %req.request_id, round = req.schedule_round, "forwarded schedule");

        let response = self.inner.instance_ctrl.schedule(req.clone()).await;
        let response = self.maybe_forward_uplayer(&req, response).await;
        self.inner.underlayer_mgr.finish_forwarded(&req.request_id);
        Ok(response)
    }

    async fn notify_sched_abnormal(
        &self,
        req: NotifySchedAbnormalRequest,
    ) -> RpcResult<NotifySchedAbnormalResponse> {
        // An underlayer reports one of its own children lost; clear
        // whatever we track under that name and pass it on.
        self.inner.underlayer_mgr.clear_abnormal_unfinished(&req.sched_name);
        let uplink = self.inner.uplink.lock().clone();
        if let Some(uplink) = uplink {
            return uplink.notify_sched_abnormal(req).await;
        }
        Ok(NotifySchedAbnormalResponse { sched_name: req.sched_name })
    }

    async fn notify_worker_status(
        &self,
        req: NotifyWorkerStatusRequest,
    ) -> RpcResult<NotifyWorkerStatusResponse> {
        let uplink = self.inner.uplink.lock().clone();
        if let Some(uplink) = uplink {
            return uplink.notify_worker_status(req).await;
        }
        Ok(NotifyWorkerStatusResponse { worker_ip: req.worker_ip, healthy: req.healthy })
    }

    async fn try_cancel_schedule(&self, req: CancelSchedule) -> RpcResult<TryCancelResponse> {
        Ok(self.inner.instance_ctrl.try_cancel_schedule(&req))
    }

    async fn delete_pod(&self, req: DeletePodRequest) -> RpcResult<DeletePodResponse> {
        let scaler = self.inner.scaler.lock().clone();
        match scaler {
            Some(scaler) => scaler.delete_pod(req).await,
            None => {
                warn!(request_id = %req.request_id, "delete pod ignored, scaler not enabled");
                Ok(DeletePodResponse { request_id: req.request_id, code: 0 })
            }
        }
    }

    async fn notify_evict_result(&self, req: hfs_types::NotifyEvictResult) -> RpcResult<()> {
        info!(
            request_id = %req.request_id,
            code = %req.code,
            "eviction completed on an underlayer"
        );
        metrics::counter!("hfs_evict_results_total").increment(1);
        Ok(())
    }

    async fn unregister(&self, name: &str) -> RpcResult<Status> {
        info!(name, "underlayer unregistering");
        self.inner.underlayer_mgr.clear_abnormal_unfinished(name);
        Ok(Status::ok())
    }
}

impl DomainScheduler {
    /// A local failure may still be satisfiable by the tier above; a
    /// refused forward keeps the local answer.
    async fn maybe_forward_uplayer(
        &self,
        req: &ScheduleRequest,
        response: ScheduleResponse,
    ) -> ScheduleResponse {
        if response.code.is_ok()
            || response.code == StatusCode::InstanceTransactionWrongVersion
        {
            return response;
        }
        let Some(uplink) = self.inner.uplink.lock().clone() else {
            return response;
        };
        info!(request_id = %req.request_id, "forwarding to the upper tier");
        match uplink.forward_schedule(req.clone()).await {
            Ok(up) if up.code == StatusCode::DomainSchedulerForwardErr => response,
            Ok(up) => up,
            Err(status) if status.code == StatusCode::DomainSchedulerForwardErr => response,
            Err(status) => {
                warn!(request_id = %req.request_id, %status, "uplayer forward failed");
                response
            }
        }
    }
}
