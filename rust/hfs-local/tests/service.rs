//! Local service behaviour against mocked upper tiers.

use async_trait::async_trait;
use hfs_local::{LocalConfig, LocalSchedSrv, StaticAgentManager, TierResolver};
use hfs_resource_view::ResourceViewMgr;
use hfs_types::rpc::{
    RegistrationTarget, RpcResult, SchedulerDownlink, SchedulerUplink,
};
use hfs_types::{
    CancelSchedule, DeletePodRequest, DeletePodResponse, InstanceInfo, NotifyEvictResult,
    NotifySchedAbnormalRequest, NotifySchedAbnormalResponse, NotifyWorkerStatusRequest,
    NotifyWorkerStatusResponse, Register, Registered, Resources, ScheduleRequest,
    ScheduleResponse, ScheduleTopology, Status, StatusCode, TopoMember, TryCancelResponse,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A fake upper tier playing both global and domain.
#[derive(Default)]
struct FakeTier {
    registrations: AtomicUsize,
    forwarded: Mutex<Vec<ScheduleRequest>>,
    worker_reports: Mutex<Vec<bool>>,
    refuse_worker_reports: AtomicBool,
    downlink: Mutex<Option<Arc<dyn SchedulerDownlink>>>,
}

#[async_trait]
impl RegistrationTarget for FakeTier {
    async fn register(
        &self,
        _req: Register,
        downlink: Arc<dyn SchedulerDownlink>,
    ) -> RpcResult<Registered> {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        *self.downlink.lock() = Some(downlink);
        Ok(Registered {
            code: StatusCode::Success,
            message: String::new(),
            topology: Some(ScheduleTopology {
                leader: TopoMember { name: "domain-1".into(), address: "fake://tier".into() },
                members: vec![],
            }),
        })
    }
}

#[async_trait]
impl SchedulerUplink for FakeTier {
    async fn forward_schedule(&self, req: ScheduleRequest) -> RpcResult<ScheduleResponse> {
        self.forwarded.lock().push(req.clone());
        Ok(ScheduleResponse::ok(req.request_id))
    }
    async fn notify_sched_abnormal(
        &self,
        req: NotifySchedAbnormalRequest,
    ) -> RpcResult<NotifySchedAbnormalResponse> {
        Ok(NotifySchedAbnormalResponse { sched_name: req.sched_name })
    }
    async fn notify_worker_status(
        &self,
        req: NotifyWorkerStatusRequest,
    ) -> RpcResult<NotifyWorkerStatusResponse> {
        if self.refuse_worker_reports.load(Ordering::SeqCst) {
            return Err(Status::new(StatusCode::RequestTimeOut, "not now"));
        }
        self.worker_reports.lock().push(req.healthy);
        Ok(NotifyWorkerStatusResponse { worker_ip: req.worker_ip, healthy: req.healthy })
    }
    async fn try_cancel_schedule(&self, req: CancelSchedule) -> RpcResult<TryCancelResponse> {
        Ok(TryCancelResponse {
            request_id: req.request_id,
            code: StatusCode::Success,
            message: String::new(),
        })
    }
    async fn delete_pod(&self, req: DeletePodRequest) -> RpcResult<DeletePodResponse> {
        Ok(DeletePodResponse { request_id: req.request_id, code: 0 })
    }
    async fn notify_evict_result(&self, _req: NotifyEvictResult) -> RpcResult<()> {
        Ok(())
    }
    async fn unregister(&self, _name: &str) -> RpcResult<Status> {
        Ok(Status::ok())
    }
}

struct FakeResolver {
    tier: Arc<FakeTier>,
}

#[async_trait]
impl TierResolver for FakeResolver {
    async fn registration_target(
        &self,
        _address: &str,
    ) -> Option<Arc<dyn RegistrationTarget>> {
        Some(Arc::clone(&self.tier) as Arc<dyn RegistrationTarget>)
    }
    async fn uplink(&self, _address: &str) -> Option<Arc<dyn SchedulerUplink>> {
        Some(Arc::clone(&self.tier) as Arc<dyn SchedulerUplink>)
    }
}

async fn service(tier: Arc<FakeTier>) -> LocalSchedSrv {
    let view = ResourceViewMgr::spawn("node-1", None);
    let register = Register {
        name: "agent-1".into(),
        address: "inproc://node-1".into(),
        resources: [(
            hfs_types::ResourceType::Primary,
            hfs_types::ResourceUnit::new("agent-1")
                .with_capacity(Resources::cpu_mem(1000.0, 1024.0)),
        )]
        .into_iter()
        .collect(),
    };
    view.register_resource_unit(register, "inproc://node-1").await.unwrap();
    let _ = view.get_changes().await;

    let config = LocalConfig {
        node_id: "node-1".into(),
        address: "inproc://node-1".into(),
        global_address: "fake://tier".into(),
        register_cycle: Duration::from_millis(50),
        ping_timeout: Duration::from_millis(200),
        forward_request_timeout: Duration::from_millis(100),
        forward_max_retry: 2,
        ..Default::default()
    };
    LocalSchedSrv::new(
        config,
        view,
        Arc::new(StaticAgentManager::new(HashMap::new())),
        Arc::new(FakeResolver { tier }),
    )
}

fn request(id: &str, cpu: f64, mem: f64) -> ScheduleRequest {
    ScheduleRequest {
        request_id: id.into(),
        instance: InstanceInfo {
            instance_id: format!("ins-{id}"),
            request_id: id.into(),
            resources: Resources::cpu_mem(cpu, mem),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn register_goes_global_then_domain() {
    let tier = Arc::new(FakeTier::default());
    let srv = service(Arc::clone(&tier)).await;
    let status = srv.register().await;
    assert!(status.is_ok());
    assert!(srv.is_enabled());
    // one global registration, one domain registration
    assert_eq!(tier.registrations.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn lost_heartbeat_disables_and_reregisters() {
    let tier = Arc::new(FakeTier::default());
    let srv = service(Arc::clone(&tier)).await;
    srv.register().await;
    assert!(srv.is_enabled());

    // Nobody pings: the watchdog must disable the service and start a
    // fresh registration, which the fake tier accepts again.
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if tier.registrations.load(Ordering::SeqCst) >= 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("service re-registered after heartbeat loss");
}

#[tokio::test]
async fn oversized_request_is_forwarded_up() {
    let tier = Arc::new(FakeTier::default());
    let srv = service(Arc::clone(&tier)).await;
    srv.register().await;

    let rsp = srv.schedule_from_runtime(request("req-big", 4000.0, 4096.0), "rt-1").await;
    assert!(rsp.code.is_ok());
    let forwarded = tier.forwarded.lock();
    assert_eq!(forwarded.len(), 1);
    // the forwarded request carries a bumped round
    assert_eq!(forwarded[0].schedule_round, 1);
}

#[tokio::test]
async fn empty_request_id_is_a_parameter_error() {
    let tier = Arc::new(FakeTier::default());
    let srv = service(tier).await;
    let rsp = srv.schedule_from_runtime(ScheduleRequest::default(), "rt-1").await;
    assert_eq!(rsp.code, StatusCode::ParameterError);
}

#[tokio::test]
async fn worker_status_retries_until_acknowledged() {
    let tier = Arc::new(FakeTier::default());
    let srv = service(Arc::clone(&tier)).await;
    srv.register().await;

    tier.refuse_worker_reports.store(true, Ordering::SeqCst);
    let srv_clone = srv.clone();
    let report = tokio::spawn(async move { srv_clone.notify_worker_status(false).await });
    tokio::time::sleep(Duration::from_millis(120)).await;
    tier.refuse_worker_reports.store(false, Ordering::SeqCst);

    let status = tokio::time::timeout(Duration::from_secs(2), report)
        .await
        .expect("report finished")
        .unwrap();
    assert!(status.is_ok());
    assert_eq!(tier.worker_reports.lock().clone(), vec![false]);
}

#[tokio::test]
async fn cancel_is_relayed_upward() {
    let tier = Arc::new(FakeTier::default());
    let srv = service(Arc::clone(&tier)).await;
    srv.register().await;

    let rsp = srv
        .try_cancel_schedule(CancelSchedule {
            request_id: "req-1".into(),
            caller: "rt-1".into(),
        })
        .await;
    assert!(rsp.code.is_ok());
}
