//! Local scheduler service (C7 plus the node-facing side of C5).

use crate::agent::AgentManager;
use crate::config::LocalConfig;
use crate::group_ctrl::LocalGroupCtrl;
use crate::instance_ctrl::LocalInstanceCtrl;
use async_trait::async_trait;
use hfs_observer::Observer;
use hfs_resource_view::ResourceViewMgr;
use hfs_types::rpc::{
    RegistrationTarget, RpcResult, SchedulerDownlink, SchedulerUplink,
};
use hfs_types::{
    CancelSchedule, EvictAck, EvictAgentRequest, GroupResponse, NotifyEvictResult,
    NotifyWorkerStatusRequest, Register, ScheduleRequest, ScheduleResponse, ScheduleTopology,
    Status, StatusCode, TryCancelResponse,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

/// Lookup of in-reach tiers by address; the node wiring (or a real
/// transport) provides it.
#[async_trait]
pub trait TierResolver: Send + Sync {
    async fn registration_target(&self, address: &str)
        -> Option<Arc<dyn RegistrationTarget>>;
    async fn uplink(&self, address: &str) -> Option<Arc<dyn SchedulerUplink>>;
}

struct DomainLink {
    name: String,
    uplink: Arc<dyn SchedulerUplink>,
}

struct SrvInner {
    config: LocalConfig,
    view: ResourceViewMgr,
    instance_ctrl: LocalInstanceCtrl,
    group_ctrl: LocalGroupCtrl,
    agent_mgr: Arc<dyn AgentManager>,
    resolver: Arc<dyn TierResolver>,
    domain: Mutex<Option<DomainLink>>,
    enabled: AtomicBool,
    exiting: AtomicBool,
    last_ping: Mutex<Instant>,
    ds_worker_healthy: AtomicBool,
    watchdog: Mutex<Option<tokio::task::JoinHandle<()>>>,
    observer: Mutex<Option<Observer>>,
}

/// The one long-running service of a node's local tier.
#[derive(Clone)]
pub struct LocalSchedSrv {
    inner: Arc<SrvInner>,
}

impl LocalSchedSrv {
    pub fn new(
        config: LocalConfig,
        view: ResourceViewMgr,
        agent_mgr: Arc<dyn AgentManager>,
        resolver: Arc<dyn TierResolver>,
    ) -> Self {
        let instance_ctrl =
            LocalInstanceCtrl::new(config.node_id.clone(), view.clone(), config.relaxed_affinity);
        let group_ctrl = LocalGroupCtrl::new(view.clone());
        Self {
            inner: Arc::new(SrvInner {
                config,
                view,
                instance_ctrl,
                group_ctrl,
                agent_mgr,
                resolver,
                domain: Mutex::new(None),
                enabled: AtomicBool::new(false),
                exiting: AtomicBool::new(false),
                last_ping: Mutex::new(Instant::now()),
                ds_worker_healthy: AtomicBool::new(true),
                watchdog: Mutex::new(None),
                observer: Mutex::new(None),
            }),
        }
    }

    /// Attach the metadata observer; bound instances are published
    /// through it.
    pub fn set_observer(&self, observer: Observer) {
        *self.inner.observer.lock() = Some(observer);
    }

    pub fn node_id(&self) -> &str {
        &self.inner.config.node_id
    }

    pub fn view(&self) -> &ResourceViewMgr {
        &self.inner.view
    }

    pub fn instance_ctrl(&self) -> &LocalInstanceCtrl {
        &self.inner.instance_ctrl
    }

    pub fn group_ctrl(&self) -> &LocalGroupCtrl {
        &self.inner.group_ctrl
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Register to the global tier, learn the domain leader from the
    /// ack, register there, and enable the service. Retries on a
    /// register-cycle timer until both acks arrive.
    pub async fn register(&self) -> Status {
        loop {
            match self.register_once().await {
                Ok(()) => {
                    self.start_ping_watchdog();
                    self.inner.enabled.store(true, Ordering::SeqCst);
                    info!(node_id = %self.inner.config.node_id, "local service enabled");
                    return Status::ok();
                }
                Err(status) if self.inner.exiting.load(Ordering::SeqCst) => {
                    return status;
                }
                Err(status) => {
                    error!(%status, "registration failed, retrying");
                    tokio::time::sleep(self.inner.config.register_cycle).await;
                }
            }
        }
    }

    async fn register_once(&self) -> Result<(), Status> {
        let global = self
            .inner
            .resolver
            .registration_target(&self.inner.config.global_address)
            .await
            .ok_or_else(|| {
                Status::new(
                    StatusCode::LsGlobalSchedulerAidEmpty,
                    "global scheduler AID is empty",
                )
            })?;

        let register = self.build_register().await;
        let downlink: Arc<dyn SchedulerDownlink> =
            Arc::new(DomainFacingClient { srv: self.clone() });
        let ack = global.register(register.clone(), Arc::clone(&downlink)).await?;
        if !ack.code.is_ok() {
            return Err(Status::new(ack.code, ack.message));
        }
        let topology = ack.topology.ok_or_else(|| {
            Status::new(StatusCode::LsDomainSchedulerAidEmpty, "domain scheduler AID is empty")
        })?;
        self.register_to_domain(&topology, register, downlink).await
    }

    async fn register_to_domain(
        &self,
        topology: &ScheduleTopology,
        register: Register,
        downlink: Arc<dyn SchedulerDownlink>,
    ) -> Result<(), Status> {
        let leader = &topology.leader;
        if leader.address.is_empty() {
            return Err(Status::new(
                StatusCode::LsDomainSchedulerAidEmpty,
                "domain scheduler AID is empty",
            ));
        }
        info!(name = %leader.name, address = %leader.address, "registering to domain leader");
        let target =
            self.inner.resolver.registration_target(&leader.address).await.ok_or_else(|| {
                Status::new(StatusCode::LsDomainSchedulerAidEmpty, "domain leader unreachable")
            })?;
        let uplink = self.inner.resolver.uplink(&leader.address).await.ok_or_else(|| {
            Status::new(StatusCode::LsDomainSchedulerAidEmpty, "domain leader unreachable")
        })?;
        let ack = target.register(register, downlink).await?;
        if !ack.code.is_ok() {
            return Err(Status::new(ack.code, ack.message));
        }
        *self.inner.domain.lock() = Some(DomainLink { name: leader.name.clone(), uplink });
        *self.inner.last_ping.lock() = Instant::now();
        Ok(())
    }

    async fn build_register(&self) -> Register {
        let resources = self.inner.view.get_resources().await;
        Register {
            name: self.inner.config.node_id.clone(),
            address: self.inner.config.address.clone(),
            resources: resources.into_iter().collect(),
        }
    }

    /// New topology pushed from above: re-register with the new
    /// leader.
    pub async fn update_sched_topo(&self, topology: ScheduleTopology) {
        info!(leader = %topology.leader.name, "domain topology updated");
        let register = self.build_register().await;
        let downlink: Arc<dyn SchedulerDownlink> =
            Arc::new(DomainFacingClient { srv: self.clone() });
        if let Err(status) = self.register_to_domain(&topology, register, downlink).await {
            error!(%status, "failed to register to the new domain leader");
            self.inner.enabled.store(false, Ordering::SeqCst);
        }
    }

    fn start_ping_watchdog(&self) {
        let mut watchdog = self.inner.watchdog.lock();
        if watchdog.is_some() {
            return;
        }
        let srv = self.clone();
        *watchdog = Some(tokio::spawn(async move {
            let interval = srv.inner.config.ping_timeout / 2;
            loop {
                tokio::time::sleep(interval).await;
                if srv.inner.exiting.load(Ordering::SeqCst) {
                    return;
                }
                let silent_for = srv.inner.last_ping.lock().elapsed();
                if srv.is_enabled() && silent_for > srv.inner.config.ping_timeout {
                    error!(
                        node_id = %srv.inner.config.node_id,
                        ?silent_for, "heartbeat from domain timed out"
                    );
                    srv.inner.enabled.store(false, Ordering::SeqCst);
                    // Free the slot so the re-registration can arm a
                    // fresh watchdog.
                    *srv.inner.watchdog.lock() = None;
                    let srv = srv.clone();
                    tokio::spawn(async move {
                        let _ = srv.register().await;
                    });
                    return;
                }
            }
        }));
    }

    /// Entry for runtimes on this node: try locally, forward up when
    /// the node cannot satisfy the request.
    pub async fn schedule_from_runtime(
        &self,
        mut req: ScheduleRequest,
        caller: &str,
    ) -> ScheduleResponse {
        if req.request_id.is_empty() {
            return ScheduleResponse::error(
                StatusCode::ParameterError,
                "requestID is empty",
                String::new(),
            );
        }
        let local = self.inner.instance_ctrl.schedule(&req, caller).await;
        if local.code.is_ok() {
            self.publish_instance(&req, &local).await;
            return local;
        }
        if local.code != StatusCode::ResourceNotEnough {
            return local;
        }
        debug!(request_id = %req.request_id, "local resources exhausted, forwarding up");
        req.schedule_round = req.schedule_round.wrapping_add(1);
        self.forward_schedule(req).await
    }

    /// Record the bound instance in the meta-store so every tier's
    /// observer learns about it.
    async fn publish_instance(&self, req: &ScheduleRequest, rsp: &ScheduleResponse) {
        let observer = self.inner.observer.lock().clone();
        let Some(observer) = observer else {
            return;
        };
        let Some(result) = &rsp.schedule_result else {
            return;
        };
        if !req.instance.function.is_valid() {
            return;
        }
        let mut info = req.instance.clone();
        info.function_agent_id = result.agent_id.clone();
        info.function_proxy_id = result.node_id.clone();
        info.status = hfs_types::InstanceStatus::Binding;
        if let Err(error) = observer.put_instance(&info).await {
            warn!(request_id = %req.request_id, %error, "instance publication failed");
        }
    }

    /// Forward a request to the domain with bounded retry. The retry
    /// budget honours the instance's init-call deadline when set.
    pub async fn forward_schedule(&self, mut req: ScheduleRequest) -> ScheduleResponse {
        let per_try = self.inner.config.forward_request_timeout;
        let init_call_budget = req.instance.schedule_option.init_call_timeout_secs;
        let max_tries = if init_call_budget > 0 {
            let budget_ms = init_call_budget as u128 * 1000;
            ((budget_ms / per_try.as_millis().max(1)) as u32).max(1)
        } else {
            self.inner.config.forward_max_retry
        };

        for attempt in 1..=max_tries {
            let Some(uplink) = self.domain_uplink() else {
                return ScheduleResponse::error(
                    StatusCode::LsDomainSchedulerAidEmpty,
                    "domain scheduler AID is empty",
                    req.request_id.clone(),
                );
            };
            req.update_resources = self.inner.view.get_changes().await;
            info!(
                request_id = %req.request_id,
                attempt, "forward schedule request to domain scheduler"
            );
            match timeout(per_try, uplink.forward_schedule(req.clone())).await {
                Ok(Ok(rsp)) => return rsp,
                Ok(Err(status)) => {
                    warn!(request_id = %req.request_id, %status, "forward refused");
                    return ScheduleResponse::error(
                        status.code,
                        status.message,
                        req.request_id.clone(),
                    );
                }
                Err(_elapsed) => {
                    warn!(
                        request_id = %req.request_id,
                        attempt, "forward to domain timed out, retrying"
                    );
                }
            }
        }
        ScheduleResponse::error(
            StatusCode::LsForwardDomainTimeout,
            "forward to domain scheduler timeout",
            req.request_id,
        )
    }

    /// Relay a cancel upward; timeouts retry without bound (the
    /// domain's answer is the only authority on the race).
    pub async fn try_cancel_schedule(&self, cancel: CancelSchedule) -> TryCancelResponse {
        loop {
            let Some(uplink) = self.domain_uplink() else {
                return TryCancelResponse {
                    request_id: cancel.request_id.clone(),
                    code: StatusCode::LsDomainSchedulerAidEmpty,
                    message: "domain scheduler AID is empty".into(),
                };
            };
            match timeout(
                self.inner.config.forward_request_timeout,
                uplink.try_cancel_schedule(cancel.clone()),
            )
            .await
            {
                Ok(Ok(rsp)) => return rsp,
                Ok(Err(status)) => {
                    return TryCancelResponse {
                        request_id: cancel.request_id.clone(),
                        code: status.code,
                        message: status.message,
                    };
                }
                Err(_elapsed) => {
                    warn!(request_id = %cancel.request_id, "cancel relay timed out, retrying");
                }
            }
        }
    }

    /// Kill one instance. Honoured only when `from` matches the
    /// caller of the original schedule.
    pub async fn kill(&self, from: &str, request_id: &str) -> Status {
        let allowed = self.inner.instance_ctrl.check_kill_allowed(from, request_id);
        if allowed.is_err() {
            return allowed;
        }
        let Some(instance_id) = self.inner.instance_ctrl.instance_of_request(request_id) else {
            return Status::new(StatusCode::LsRequestNotFound, "request not found");
        };
        self.inner.agent_mgr.kill_instance(&instance_id).await
    }

    /// Kill a whole group of instances; membership is resolved by the
    /// caller.
    pub async fn kill_group(&self, instance_ids: &[String]) -> Status {
        self.inner.agent_mgr.evict_instances(instance_ids, false).await
    }

    /// Report data-plane worker health upward; retried until the ack
    /// arrives, abandoned when the state changed in the meantime.
    pub async fn notify_worker_status(&self, healthy: bool) -> Status {
        self.inner.ds_worker_healthy.store(healthy, Ordering::SeqCst);
        loop {
            if self.inner.ds_worker_healthy.load(Ordering::SeqCst) != healthy {
                info!(healthy, "worker health changed during retry, stopping");
                return Status::ok();
            }
            let Some(uplink) = self.domain_uplink() else {
                return Status::new(
                    StatusCode::LsDomainSchedulerAidEmpty,
                    "domain scheduler AID is empty",
                );
            };
            let req = NotifyWorkerStatusRequest {
                worker_ip: self.inner.config.address.clone(),
                healthy,
            };
            match uplink.notify_worker_status(req).await {
                Ok(_) => return Status::ok(),
                Err(status) => {
                    warn!(%status, "worker status report failed, retrying");
                    tokio::time::sleep(self.inner.config.register_cycle).await;
                }
            }
        }
    }

    /// Evict all agents, wait for the controller to quiesce, then
    /// unregister from the tiers above. Unregister attempts retry
    /// with doubled backoff up to the configured cap.
    pub async fn graceful_shutdown(&self) -> Status {
        self.inner.exiting.store(true, Ordering::SeqCst);
        self.inner.enabled.store(false, Ordering::SeqCst);

        let agents: Vec<String> = self.inner.agent_mgr.agents().keys().cloned().collect();
        if !agents.is_empty() {
            let status = self.inner.agent_mgr.evict_instances(&agents, false).await;
            if status.is_err() {
                warn!(%status, "agent eviction during shutdown failed");
            }
        }
        while !self.inner.instance_ctrl.is_quiesced() {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        let mut backoff = self.inner.config.unregister_timeout;
        loop {
            let Some(uplink) = self.domain_uplink() else {
                return Status::ok();
            };
            match timeout(
                self.inner.config.unregister_timeout,
                uplink.unregister(&self.inner.config.node_id),
            )
            .await
            {
                Ok(Ok(_)) => {
                    info!(node_id = %self.inner.config.node_id, "unregistered from domain");
                    return Status::ok();
                }
                Ok(Err(status)) => return status,
                Err(_elapsed) => {
                    warn!(?backoff, "unregister timed out, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.inner.config.unregister_backoff_cap);
                }
            }
        }
    }

    fn domain_uplink(&self) -> Option<Arc<dyn SchedulerUplink>> {
        self.inner.domain.lock().as_ref().map(|link| Arc::clone(&link.uplink))
    }

    fn current_domain_name(&self) -> Option<String> {
        self.inner.domain.lock().as_ref().map(|link| link.name.clone())
    }

    async fn handle_evict(&self, req: EvictAgentRequest, is_preempt: bool) -> EvictAck {
        info!(
            request_id = %req.request_id,
            count = req.instance_ids.len(),
            is_preempt, "evict requested"
        );
        let srv = self.clone();
        let request_id = req.request_id.clone();
        let ids = req.instance_ids.clone();
        // Acknowledge acceptance now; completion is reported
        // separately.
        tokio::spawn(async move {
            let status = srv.inner.agent_mgr.evict_instances(&ids, is_preempt).await;
            let result = NotifyEvictResult {
                request_id: request_id.clone(),
                code: status.code,
                message: status.message,
            };
            if let Some(uplink) = srv.domain_uplink() {
                if let Err(status) = uplink.notify_evict_result(result).await {
                    warn!(request_id = %request_id, %status, "evict result report failed");
                }
            }
        });
        EvictAck { request_id: req.request_id, code: StatusCode::Success }
    }
}

/// The downlink handle handed to a domain at registration. Bound to
/// this service; requests from a superseded domain are rejected by
/// the service-level checks.
struct DomainFacingClient {
    srv: LocalSchedSrv,
}

#[async_trait]
impl SchedulerDownlink for DomainFacingClient {
    async fn schedule(&self, req: ScheduleRequest) -> RpcResult<ScheduleResponse> {
        if !self.srv.is_enabled() {
            return Err(Status::new(
                StatusCode::LsInstanceCtrlIsNull,
                "local scheduler service is not enabled",
            ));
        }
        let caller = self.srv.current_domain_name().unwrap_or_default();
        let mut rsp = self.srv.inner.instance_ctrl.schedule(&req, &caller).await;
        // Piggy-back whatever this node's view accumulated so the
        // domain replays it.
        rsp.update_resources = self.srv.inner.view.get_changes().await;
        Ok(rsp)
    }

    async fn reserve(&self, req: ScheduleRequest) -> RpcResult<ScheduleResponse> {
        Ok(self.srv.inner.group_ctrl.reserve(&req).await)
    }

    async fn un_reserve(&self, req: ScheduleRequest) -> RpcResult<GroupResponse> {
        Ok(self.srv.inner.group_ctrl.un_reserve(&req).await)
    }

    async fn bind(&self, req: ScheduleRequest) -> RpcResult<GroupResponse> {
        Ok(self.srv.inner.group_ctrl.bind(&req).await)
    }

    async fn un_bind(&self, req: ScheduleRequest) -> RpcResult<GroupResponse> {
        Ok(self.srv.inner.group_ctrl.un_bind(&req).await)
    }

    async fn evict_agent(&self, req: EvictAgentRequest) -> RpcResult<EvictAck> {
        Ok(self.srv.handle_evict(req, false).await)
    }

    async fn preempt_instances(&self, req: EvictAgentRequest) -> RpcResult<EvictAck> {
        Ok(self.srv.handle_evict(req, true).await)
    }

    async fn ping(&self) -> RpcResult<()> {
        *self.srv.inner.last_ping.lock() = Instant::now();
        Ok(())
    }
}
