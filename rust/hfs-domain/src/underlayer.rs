//! Underlayer scheduler manager (C6).

use crate::config::DomainConfig;
use hfs_resource_view::ResourceViewMgr;
use hfs_types::rpc::{RpcResult, SchedulerDownlink, SchedulerUplink};
use hfs_types::{
    EvictAgentRequest, NotifySchedAbnormalRequest, Register, Registered, ScheduleRequest,
    ScheduleResponse, ScheduleTopology, Status, StatusCode,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One preemption decision to push down.
#[derive(Debug, Clone)]
pub struct PreemptResult {
    pub status: Status,
    pub unit_id: String,
    /// Proxy (underlayer) owning the preempted instances.
    pub owner_id: String,
    pub preempted_instances: Vec<String>,
}

struct Underlayer {
    name: String,
    address: String,
    client: Option<Arc<dyn SchedulerDownlink>>,
    registered: bool,
    register_deadline: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl Drop for Underlayer {
    fn drop(&mut self) {
        if let Some(task) = self.register_deadline.take() {
            task.abort();
        }
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
    }
}

type Unfinished = HashMap<String, HashMap<String, oneshot::Sender<ScheduleResponse>>>;

struct MgrInner {
    config: DomainConfig,
    underlayers: Mutex<HashMap<String, Underlayer>>,
    /// underlayer name -> request id -> responder used to preempt the
    /// dispatch when the underlayer dies.
    unfinished: Mutex<Unfinished>,
    /// Request ids currently being forwarded; duplicates are ignored.
    received_scheduling: Mutex<HashSet<String>>,
    view: ResourceViewMgr,
    uplink: Mutex<Option<Arc<dyn SchedulerUplink>>>,
    /// Shared with the instance controller: retry budget equals the
    /// live underlayer count.
    max_sched_retry_times: Arc<AtomicUsize>,
}

/// Registry of the subordinate local tiers.
#[derive(Clone)]
pub struct UnderlayerSchedMgr {
    inner: Arc<MgrInner>,
}

impl UnderlayerSchedMgr {
    pub fn new(
        config: DomainConfig,
        view: ResourceViewMgr,
        max_sched_retry_times: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            inner: Arc::new(MgrInner {
                config,
                underlayers: Mutex::new(HashMap::new()),
                unfinished: Mutex::new(HashMap::new()),
                received_scheduling: Mutex::new(HashSet::new()),
                view,
                uplink: Mutex::new(None),
                max_sched_retry_times,
            }),
        }
    }

    pub fn set_uplink(&self, uplink: Arc<dyn SchedulerUplink>) {
        *self.inner.uplink.lock() = Some(uplink);
    }

    pub fn view(&self) -> &ResourceViewMgr {
        &self.inner.view
    }

    pub fn live_underlayers(&self) -> usize {
        self.inner.underlayers.lock().len()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.inner.underlayers.lock().get(name).is_some_and(|u| u.registered)
    }

    pub fn in_topology(&self, name: &str) -> bool {
        self.inner.underlayers.lock().contains_key(name)
    }

    /// Reconcile against a topology pushed by the global tier. New
    /// members get a registration deadline; removed members are
    /// dropped.
    pub fn update_underlayer_topo(&self, topology: &ScheduleTopology) {
        let mut underlayers = self.inner.underlayers.lock();
        let mut next: HashMap<String, Underlayer> = HashMap::new();
        for member in &topology.members {
            if let Some(existing) = underlayers.remove(&member.name) {
                if existing.address == member.address {
                    next.insert(member.name.clone(), existing);
                    continue;
                }
            }
            info!(name = %member.name, address = %member.address, "new underlayer in topology");
            let deadline = self.spawn_register_deadline(member.name.clone(), member.address.clone());
            next.insert(
                member.name.clone(),
                Underlayer {
                    name: member.name.clone(),
                    address: member.address.clone(),
                    client: None,
                    registered: false,
                    register_deadline: Some(deadline),
                    heartbeat: None,
                },
            );
        }
        *underlayers = next;
        self.inner.max_sched_retry_times.store(underlayers.len(), Ordering::SeqCst);
    }

    /// Registration from a local tier. Rejected when the name is not
    /// in the topology or the address does not match.
    pub async fn register(
        &self,
        req: Register,
        downlink: Arc<dyn SchedulerDownlink>,
    ) -> Registered {
        {
            let mut underlayers = self.inner.underlayers.lock();
            let Some(underlayer) = underlayers.get_mut(&req.name) else {
                warn!(name = %req.name, "register from unknown underlayer");
                return Registered {
                    code: StatusCode::Failed,
                    message: "the register name was not found in domain topology".into(),
                    topology: None,
                };
            };
            if underlayer.address != req.address {
                warn!(
                    name = %req.name,
                    expected = %underlayer.address,
                    got = %req.address,
                    "register address mismatch"
                );
                return Registered {
                    code: StatusCode::Failed,
                    message: "the register name was not found in domain topology".into(),
                    topology: None,
                };
            }
            if underlayer.registered {
                info!(name = %req.name, "underlayer already registered");
                return Registered { code: StatusCode::Success, ..Default::default() };
            }
            if let Some(task) = underlayer.register_deadline.take() {
                task.abort();
            }
            underlayer.client = Some(Arc::clone(&downlink));
            underlayer.registered = true;
            underlayer.heartbeat = Some(self.spawn_heartbeat(req.name.clone(), downlink));
        }
        if let Err(error) = self
            .inner
            .view
            .register_resource_unit(req.clone(), req.address.clone())
            .await
        {
            warn!(name = %req.name, %error, "failed to seed resource view from register");
        }
        Registered { code: StatusCode::Success, ..Default::default() }
    }

    /// Dispatch a schedule request to one underlayer. Resolves early
    /// with DOMAIN_SCHEDULER_UNAVAILABLE_SCHEDULER when the underlayer
    /// dies while the request is in flight.
    pub async fn dispatch_schedule(
        &self,
        selected_name: &str,
        req: &ScheduleRequest,
    ) -> RpcResult<ScheduleResponse> {
        let Some(client) = self.client_of(selected_name) else {
            error!(
                request_id = %req.request_id,
                selected_name, "dispatch failed: scheduler not found"
            );
            return Ok(unavailable_response(selected_name, &req.request_id));
        };
        info!(request_id = %req.request_id, selected_name, "dispatch schedule request");

        let (tx, rx) = oneshot::channel();
        self.inner
            .unfinished
            .lock()
            .entry(selected_name.to_string())
            .or_default()
            .insert(req.request_id.clone(), tx);

        let call = timeout(self.inner.config.dispatch_timeout, client.schedule(req.clone()));
        let outcome = tokio::select! {
            flushed = rx => {
                return Ok(flushed.unwrap_or_else(|_| {
                    unavailable_response(selected_name, &req.request_id)
                }));
            }
            outcome = call => outcome,
        };
        self.remove_unfinished(selected_name, &req.request_id);
        match outcome {
            Err(_elapsed) => {
                warn!(request_id = %req.request_id, selected_name, "dispatch timed out");
                Err(Status::new(StatusCode::RequestTimeOut, "dispatch schedule timeout"))
            }
            Ok(Err(status)) => Err(status),
            Ok(Ok(mut rsp)) => {
                self.apply_response_resources(&mut rsp).await;
                Ok(rsp)
            }
        }
    }

    /// Reserve on the local group controller; retried until the
    /// underlayer is declared dead.
    pub async fn reserve(
        &self,
        selected_name: &str,
        req: &ScheduleRequest,
    ) -> ScheduleResponse {
        loop {
            let Some(client) = self.client_of(selected_name) else {
                return ScheduleResponse::error(
                    StatusCode::DomainSchedulerUnavailableScheduler,
                    format!("failed to reserve, local scheduler {selected_name} is abnormal"),
                    req.request_id.clone(),
                );
            };
            match timeout(self.inner.config.group_timeout, client.reserve(req.clone())).await {
                Ok(Ok(mut rsp)) => {
                    self.apply_response_resources(&mut rsp).await;
                    return rsp;
                }
                Ok(Err(status)) => {
                    return ScheduleResponse::error(
                        status.code,
                        status.message,
                        req.request_id.clone(),
                    );
                }
                Err(_elapsed) => {
                    warn!(
                        request_id = %req.request_id,
                        selected_name, "reserve timed out, retrying"
                    );
                }
            }
        }
    }

    pub async fn un_reserve(&self, selected_name: &str, req: &ScheduleRequest) -> Status {
        self.group_method("UnReserve", selected_name, req).await
    }

    pub async fn bind(&self, selected_name: &str, req: &ScheduleRequest) -> Status {
        self.group_method("Bind", selected_name, req).await
    }

    pub async fn un_bind(&self, selected_name: &str, req: &ScheduleRequest) -> Status {
        self.group_method("UnBind", selected_name, req).await
    }

    async fn group_method(
        &self,
        method: &str,
        selected_name: &str,
        req: &ScheduleRequest,
    ) -> Status {
        loop {
            let Some(client) = self.client_of(selected_name) else {
                return Status::new(
                    StatusCode::DomainSchedulerUnavailableScheduler,
                    format!(
                        "failed to {method}, local scheduler {selected_name} is abnormal"
                    ),
                );
            };
            let call = async {
                match method {
                    "Bind" => client.bind(req.clone()).await,
                    "UnBind" => client.un_bind(req.clone()).await,
                    _ => client.un_reserve(req.clone()).await,
                }
            };
            match timeout(self.inner.config.group_timeout, call).await {
                Ok(Ok(rsp)) => {
                    for changes in rsp.update_resources {
                        let _ = self.inner.view.update_resource_unit_delta(changes).await;
                    }
                    return Status::new(rsp.code, rsp.message);
                }
                Ok(Err(status)) => return status,
                Err(_elapsed) => {
                    warn!(
                        request_id = %req.request_id,
                        selected_name, method, "group method timed out, retrying"
                    );
                }
            }
        }
    }

    /// Fan preemption results out to the owning proxies; each evict is
    /// acknowledged and retried until accepted.
    pub fn preempt_instance(&self, results: Vec<PreemptResult>) {
        let mut evict_map: HashMap<String, EvictAgentRequest> = HashMap::new();
        for result in results {
            if result.status.is_err()
                || result.unit_id.is_empty()
                || result.preempted_instances.is_empty()
            {
                continue;
            }
            let entry = evict_map.entry(result.owner_id.clone()).or_insert_with(|| {
                EvictAgentRequest {
                    request_id: Uuid::new_v4().to_string(),
                    timeout_secs: u32::MAX,
                    is_preempt: true,
                    ..Default::default()
                }
            });
            entry.instance_ids.extend(result.preempted_instances);
        }
        for (proxy_id, req) in evict_map {
            let Some(client) = self.client_of(&proxy_id) else {
                warn!(proxy_id, "cannot preempt: proxy has no registered underlayer");
                continue;
            };
            let group_timeout = self.inner.config.group_timeout;
            tokio::spawn(async move {
                loop {
                    info!(request_id = %req.request_id, proxy_id, "send preempt instances");
                    match timeout(group_timeout, client.preempt_instances(req.clone())).await {
                        Ok(Ok(_ack)) => return,
                        Ok(Err(status)) => {
                            warn!(
                                request_id = %req.request_id,
                                %status, "preempt refused, retrying"
                            );
                        }
                        Err(_elapsed) => {
                            warn!(request_id = %req.request_id, "preempt ack timeout, retrying");
                        }
                    }
                }
            });
        }
    }

    /// Forwarded-request dedup: true when the id is new.
    pub fn admit_forwarded(&self, request_id: &str) -> bool {
        self.inner.received_scheduling.lock().insert(request_id.to_string())
    }

    pub fn finish_forwarded(&self, request_id: &str) {
        self.inner.received_scheduling.lock().remove(request_id);
    }

    /// Declare an underlayer abnormal: exactly one notification per
    /// loss event, then flush its outstanding requests and drop it.
    pub async fn notify_abnormal(&self, req: NotifySchedAbnormalRequest) {
        metrics::counter!("hfs_scheduler_abnormal_total").increment(1);
        let uplink = self.inner.uplink.lock().clone();
        if let Some(uplink) = uplink {
            loop {
                match uplink.notify_sched_abnormal(req.clone()).await {
                    Ok(_) => break,
                    Err(status) => {
                        error!(
                            sched_name = %req.sched_name,
                            %status, "notify schedule abnormal failed, retrying"
                        );
                        tokio::time::sleep(self.inner.config.heartbeat_interval).await;
                    }
                }
            }
        }
        self.clear_abnormal_unfinished(&req.sched_name);
    }

    /// Flush outstanding requests of a dead underlayer, drop its
    /// resource subtree and forget it.
    pub fn clear_abnormal_unfinished(&self, sched_name: &str) {
        let pending = self.inner.unfinished.lock().remove(sched_name);
        if let Some(pending) = pending {
            for (request_id, tx) in pending {
                info!(
                    sched_name,
                    request_id, "responding unfinished request of abnormal scheduler"
                );
                let _ = tx.send(unavailable_response(sched_name, &request_id));
            }
        }
        let removed = {
            let mut underlayers = self.inner.underlayers.lock();
            let removed = underlayers.remove(sched_name).is_some();
            self.inner.max_sched_retry_times.store(underlayers.len(), Ordering::SeqCst);
            removed
        };
        if removed {
            let view = self.inner.view.clone();
            let sched_name = sched_name.to_string();
            tokio::spawn(async move {
                let _ = view.unregister_resource_unit(sched_name).await;
            });
        }
    }

    fn client_of(&self, name: &str) -> Option<Arc<dyn SchedulerDownlink>> {
        self.inner.underlayers.lock().get(name).and_then(|u| u.client.clone())
    }

    fn remove_unfinished(&self, name: &str, request_id: &str) {
        let mut unfinished = self.inner.unfinished.lock();
        if let Some(pending) = unfinished.get_mut(name) {
            pending.remove(request_id);
        }
    }

    async fn apply_response_resources(&self, rsp: &mut ScheduleResponse) {
        for changes in std::mem::take(&mut rsp.update_resources) {
            if let Err(error) = self.inner.view.update_resource_unit_delta(changes).await {
                debug!(%error, "skipping resource delta from response");
            }
        }
    }

    /// Registration must complete within the heartbeat window.
    fn spawn_register_deadline(&self, name: String, address: String) -> JoinHandle<()> {
        let mgr = self.clone();
        let wait = self.inner.config.heartbeat_interval
            * self.inner.config.heartbeat_max_times;
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            warn!(name, "underlayer register timeout");
            mgr.notify_abnormal(NotifySchedAbnormalRequest {
                sched_name: name,
                ip: address,
            })
            .await;
        })
    }

    fn spawn_heartbeat(
        &self,
        name: String,
        client: Arc<dyn SchedulerDownlink>,
    ) -> JoinHandle<()> {
        let mgr = self.clone();
        let interval = self.inner.config.heartbeat_interval;
        let max_times = self.inner.config.heartbeat_max_times;
        tokio::spawn(async move {
            let mut misses = 0;
            loop {
                tokio::time::sleep(interval).await;
                match timeout(interval, client.ping()).await {
                    Ok(Ok(())) => misses = 0,
                    _ => misses += 1,
                }
                if misses >= max_times {
                    warn!(name, misses, "underlayer heartbeat lost");
                    let address = mgr
                        .inner
                        .underlayers
                        .lock()
                        .get(&name)
                        .map(|u| u.address.clone())
                        .unwrap_or_default();
                    mgr.notify_abnormal(NotifySchedAbnormalRequest {
                        sched_name: name,
                        ip: address,
                    })
                    .await;
                    return;
                }
            }
        })
    }
}

pub(crate) fn unavailable_response(sched_name: &str, request_id: &str) -> ScheduleResponse {
    ScheduleResponse::error(
        StatusCode::DomainSchedulerUnavailableScheduler,
        format!("local scheduler {sched_name} is abnormal"),
        request_id,
    )
}

// The underlayer struct keeps its name for logging even though the
// map is keyed by it.
impl std::fmt::Debug for Underlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Underlayer")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("registered", &self.registered)
            .finish()
    }
}
