//! Domain instance controller behaviour with mocked decision and
//! underlayers.

use async_trait::async_trait;
use hfs_domain::{DomainConfig, DomainScheduler, Scheduler};
use hfs_resource_view::ResourceViewMgr;
use hfs_sched_framework::ScheduleDecision;
use hfs_types::rpc::{
    RegistrationTarget, RpcResult, ScalerClient, SchedulerDownlink,
};
use hfs_types::{
    CreateAgentRequest, CreateAgentResponse, DeletePodRequest, DeletePodResponse, EvictAck,
    EvictAgentRequest, GroupResponse, Register, ResourceType, ResourceUnit, Resources,
    SchedPolicy, ScheduleRequest, ScheduleResponse, ScheduleTopology, Status, StatusCode,
    TopoMember,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct MockScheduler {
    decisions: Mutex<VecDeque<ScheduleDecision>>,
    fallback: ScheduleDecision,
    calls: AtomicUsize,
}

impl MockScheduler {
    fn new(decisions: Vec<ScheduleDecision>, fallback: ScheduleDecision) -> Arc<Self> {
        Arc::new(Self {
            decisions: Mutex::new(decisions.into()),
            fallback,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Scheduler for MockScheduler {
    async fn schedule_decision(&self, _req: &mut ScheduleRequest) -> ScheduleDecision {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.decisions.lock().pop_front().unwrap_or_else(|| self.fallback.clone())
    }
}

fn selected_decision(name: &str) -> ScheduleDecision {
    ScheduleDecision {
        status: Status::ok(),
        unit_id: format!("agent-on-{name}"),
        owner_id: name.to_string(),
        dispatch_target: name.to_string(),
        available_for_request: 1,
        score: 1.0,
    }
}

fn failed_decision(code: StatusCode, message: &str) -> ScheduleDecision {
    ScheduleDecision::failed(Status::new(code, message))
}

#[derive(Default)]
struct MockDownlink {
    responses: Mutex<VecDeque<RpcResult<ScheduleResponse>>>,
    alive: AtomicBool,
    schedules: AtomicUsize,
}

impl MockDownlink {
    fn new(responses: Vec<RpcResult<ScheduleResponse>>) -> Arc<Self> {
        let mock = Self {
            responses: Mutex::new(responses.into()),
            alive: AtomicBool::new(true),
            schedules: AtomicUsize::new(0),
        };
        Arc::new(mock)
    }
}

#[async_trait]
impl SchedulerDownlink for MockDownlink {
    async fn schedule(&self, req: ScheduleRequest) -> RpcResult<ScheduleResponse> {
        self.schedules.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(ScheduleResponse::ok(req.request_id)))
    }
    async fn reserve(&self, req: ScheduleRequest) -> RpcResult<ScheduleResponse> {
        Ok(ScheduleResponse::ok(req.request_id))
    }
    async fn un_reserve(&self, _req: ScheduleRequest) -> RpcResult<GroupResponse> {
        Ok(GroupResponse::default())
    }
    async fn bind(&self, _req: ScheduleRequest) -> RpcResult<GroupResponse> {
        Ok(GroupResponse::default())
    }
    async fn un_bind(&self, _req: ScheduleRequest) -> RpcResult<GroupResponse> {
        Ok(GroupResponse::default())
    }
    async fn evict_agent(&self, _req: EvictAgentRequest) -> RpcResult<EvictAck> {
        Ok(EvictAck::default())
    }
    async fn preempt_instances(&self, _req: EvictAgentRequest) -> RpcResult<EvictAck> {
        Ok(EvictAck::default())
    }
    async fn ping(&self) -> RpcResult<()> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Status::new(StatusCode::RequestTimeOut, "no pong"))
        }
    }
}

struct MockScaler {
    response: CreateAgentResponse,
    calls: AtomicUsize,
}

#[async_trait]
impl ScalerClient for MockScaler {
    async fn create_agent(&self, _req: CreateAgentRequest) -> RpcResult<CreateAgentResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.response.clone())
    }
    async fn delete_pod(&self, req: DeletePodRequest) -> RpcResult<DeletePodResponse> {
        Ok(DeletePodResponse { request_id: req.request_id, code: 0 })
    }
}

fn config() -> DomainConfig {
    DomainConfig {
        name: "domain-1".into(),
        heartbeat_interval: Duration::from_millis(20),
        heartbeat_max_times: 3,
        dispatch_timeout: Duration::from_millis(200),
        affinity_retry_intervals: vec![
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_millis(10),
        ],
        create_agent_await_retry_interval: Duration::from_millis(10),
        create_agent_await_retry_times: 3,
        ..Default::default()
    }
}

async fn domain_with_underlayer(
    scheduler: Arc<MockScheduler>,
    downlink: Arc<MockDownlink>,
) -> DomainScheduler {
    let view = ResourceViewMgr::spawn("domain-1", None);
    let domain = DomainScheduler::with_scheduler(config(), view, scheduler);
    domain.update_sched_topo(ScheduleTopology {
        leader: TopoMember { name: "domain-1".into(), address: "inproc://domain-1".into() },
        members: vec![TopoMember {
            name: "selected".into(),
            address: "inproc://selected".into(),
        }],
    });
    let register = Register {
        name: "selected".into(),
        address: "inproc://selected".into(),
        resources: [(
            ResourceType::Primary,
            ResourceUnit::new("selected").with_capacity(Resources::cpu_mem(1000.0, 1024.0)),
        )]
        .into_iter()
        .collect(),
    };
    let ack = domain.register(register, downlink).await.unwrap();
    assert!(ack.code.is_ok(), "register failed: {}", ack.message);
    domain
}

fn request(id: &str) -> ScheduleRequest {
    ScheduleRequest {
        request_id: id.into(),
        trace_id: format!("trace-{id}"),
        ..Default::default()
    }
}

#[tokio::test]
async fn schedule_instance_successful() {
    let scheduler = MockScheduler::new(vec![], selected_decision("selected"));
    let downlink = MockDownlink::new(vec![]);
    let domain = domain_with_underlayer(scheduler, downlink).await;

    let rsp = domain.schedule(request("request-123")).await;
    assert!(rsp.code.is_ok());
    assert_eq!(rsp.request_id, "request-123");
}

#[tokio::test]
async fn version_wrong_is_returned_verbatim() {
    let scheduler = MockScheduler::new(vec![], selected_decision("selected"));
    let downlink = MockDownlink::new(vec![Ok(ScheduleResponse::error(
        StatusCode::InstanceTransactionWrongVersion,
        "version moved",
        "request-123",
    ))]);
    let domain = domain_with_underlayer(scheduler, downlink).await;

    let rsp = domain.schedule(request("request-123")).await;
    assert_eq!(rsp.code, StatusCode::InstanceTransactionWrongVersion);
    assert_eq!(rsp.request_id, "request-123");
}

#[tokio::test]
async fn insufficient_resource_maps_to_user_codes() {
    let scheduler = MockScheduler::new(
        vec![],
        failed_decision(StatusCode::ResourceNotEnough, "resources not enough"),
    );
    let downlink = MockDownlink::new(vec![]);
    let domain = domain_with_underlayer(scheduler, downlink).await;

    let rsp = domain.schedule(request("request-123")).await;
    assert_eq!(rsp.code, StatusCode::ErrResourceNotEnough);
    assert!(rsp.message.contains("resources not enough"));

    let scheduler = MockScheduler::new(
        vec![],
        failed_decision(StatusCode::ParameterError, "parameter error"),
    );
    let downlink = MockDownlink::new(vec![]);
    let domain = domain_with_underlayer(scheduler, downlink).await;
    let rsp = domain.schedule(request("request-123")).await;
    assert_eq!(rsp.code, StatusCode::ErrResourceConfigError);
    assert!(rsp.message.contains("invalid resource parameter"));
}

#[tokio::test]
async fn dispatch_succeeds_after_transport_retries() {
    let scheduler = MockScheduler::new(vec![], selected_decision("selected"));
    let timeout_err = || Err(Status::new(StatusCode::RequestTimeOut, "timeout"));
    let downlink = MockDownlink::new(vec![
        timeout_err(),
        timeout_err(),
        Ok(ScheduleResponse::ok("request-123")),
    ]);
    let domain = domain_with_underlayer(scheduler, Arc::clone(&downlink)).await;

    let rsp = domain.schedule(request("request-123")).await;
    assert!(rsp.code.is_ok());
    assert_eq!(downlink.schedules.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn rescheduling_after_exhausted_dispatch_retries() {
    let scheduler = MockScheduler::new(vec![], selected_decision("selected"));
    let timeout_err = || Err(Status::new(StatusCode::RequestTimeOut, "timeout"));
    let downlink = MockDownlink::new(vec![
        timeout_err(),
        timeout_err(),
        timeout_err(),
        Ok(ScheduleResponse::ok("request-123")),
    ]);
    let domain = domain_with_underlayer(Arc::clone(&scheduler), Arc::clone(&downlink)).await;

    let rsp = domain.schedule(request("request-123")).await;
    assert!(rsp.code.is_ok());
    // three attempts on the first decision, one on the second
    assert_eq!(downlink.schedules.load(Ordering::SeqCst), 4);
    assert!(scheduler.calls.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn rescheduling_after_conflict() {
    let scheduler = MockScheduler::new(vec![], selected_decision("selected"));
    let downlink = MockDownlink::new(vec![
        Ok(ScheduleResponse::error(
            StatusCode::ResourceNotEnough,
            "lost the race",
            "request-123",
        )),
        Ok(ScheduleResponse::ok("request-123")),
    ]);
    let domain = domain_with_underlayer(scheduler, downlink).await;

    let rsp = domain.schedule(request("request-123")).await;
    assert!(rsp.code.is_ok());
}

#[tokio::test]
async fn conflict_loop_propagates_non_conflict_codes() {
    let scheduler = MockScheduler::new(vec![], selected_decision("selected"));
    let conflict = || {
        Ok(ScheduleResponse::error(
            StatusCode::ResourceNotEnough,
            "lost the race",
            "request-123",
        ))
    };
    let mut responses: Vec<RpcResult<ScheduleResponse>> = Vec::new();
    for _ in 0..10 {
        responses.push(conflict());
    }
    responses.push(Ok(ScheduleResponse::error(
        StatusCode::ErrScheduleCanceled,
        "schedule request canceled",
        "request-123",
    )));
    let downlink = MockDownlink::new(responses);
    let domain = domain_with_underlayer(scheduler, downlink).await;

    let rsp = domain.schedule(request("request-123")).await;
    assert_eq!(rsp.code, StatusCode::ErrScheduleCanceled);
}

#[tokio::test]
async fn create_agent_success_retries_schedule() {
    let scheduler = MockScheduler::new(
        vec![
            failed_decision(StatusCode::ResourceNotEnough, "resources not enough"),
            selected_decision("selected"),
        ],
        selected_decision("selected"),
    );
    let downlink = MockDownlink::new(vec![]);
    let domain = domain_with_underlayer(scheduler, downlink).await;
    let scaler = Arc::new(MockScaler {
        response: CreateAgentResponse {
            request_id: "request-123".into(),
            code: 0,
            updated_create_options: [("pool".to_string(), "gold".to_string())]
                .into_iter()
                .collect(),
            ..Default::default()
        },
        calls: AtomicUsize::new(0),
    });
    domain.set_scaler(Arc::clone(&scaler) as Arc<dyn ScalerClient>);

    let mut req = request("request-123");
    req.instance.schedule_option.sched_policy = SchedPolicy::Monopoly;
    let rsp = domain.schedule(req).await;
    assert!(rsp.code.is_ok());
    assert_eq!(scaler.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn create_agent_failure_fails_the_request() {
    let scheduler = MockScheduler::new(
        vec![failed_decision(StatusCode::ResourceNotEnough, "resources not enough")],
        selected_decision("selected"),
    );
    let downlink = MockDownlink::new(vec![]);
    let domain = domain_with_underlayer(scheduler, downlink).await;
    let scaler = Arc::new(MockScaler {
        response: CreateAgentResponse {
            request_id: "request-123".into(),
            code: -1,
            message: "no capacity in the pool".into(),
            ..Default::default()
        },
        calls: AtomicUsize::new(0),
    });
    domain.set_scaler(scaler);

    let mut req = request("request-123");
    req.instance.schedule_option.sched_policy = SchedPolicy::Monopoly;
    let rsp = domain.schedule(req).await;
    assert_eq!(rsp.code, StatusCode::Failed);
    assert!(rsp.message.contains("no capacity"));
}

#[tokio::test]
async fn create_agent_exhausted_await_returns_resource_not_enough() {
    let scheduler = MockScheduler::new(
        vec![],
        failed_decision(StatusCode::ResourceNotEnough, "resources not enough"),
    );
    let downlink = MockDownlink::new(vec![]);
    let domain = domain_with_underlayer(scheduler, downlink).await;
    let scaler = Arc::new(MockScaler {
        response: CreateAgentResponse { request_id: "request-123".into(), code: 0, ..Default::default() },
        calls: AtomicUsize::new(0),
    });
    domain.set_scaler(scaler);

    let mut req = request("request-123");
    req.instance.schedule_option.sched_policy = SchedPolicy::Monopoly;
    let rsp = domain.schedule(req).await;
    assert_eq!(rsp.code, StatusCode::ErrResourceNotEnough);
}

#[tokio::test]
async fn affinity_failure_retries_then_succeeds() {
    let scheduler = MockScheduler::new(
        vec![
            failed_decision(StatusCode::AffinityScheduleFailed, "Affinity can't be Satisfied"),
            selected_decision("selected"),
        ],
        selected_decision("selected"),
    );
    let downlink = MockDownlink::new(vec![]);
    let domain = domain_with_underlayer(scheduler, downlink).await;

    let rsp = domain.schedule(request("request-123")).await;
    assert!(rsp.code.is_ok());
}

#[tokio::test]
async fn affinity_failure_exhausts_backoff_schedule() {
    let scheduler = MockScheduler::new(
        vec![],
        failed_decision(StatusCode::AffinityScheduleFailed, "Affinity can't be Satisfied"),
    );
    let downlink = MockDownlink::new(vec![]);
    let domain = domain_with_underlayer(Arc::clone(&scheduler), downlink).await;

    let rsp = domain.schedule(request("request-123")).await;
    assert_eq!(rsp.code, StatusCode::AffinityScheduleFailed);
    // one initial attempt plus one per configured interval
    assert_eq!(scheduler.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn schedule_timeout_cancels_the_request() {
    let scheduler = MockScheduler::new(
        vec![],
        failed_decision(StatusCode::AffinityScheduleFailed, "Affinity can't be Satisfied"),
    );
    let downlink = MockDownlink::new(vec![]);
    let domain = domain_with_underlayer(scheduler, downlink).await;
    let domain_clone = domain.clone();

    let mut req = request("request-123");
    req.instance.schedule_option.schedule_timeout_secs = 1;
    // long backoffs so the deadline fires first
    domain_clone
        .instance_ctrl()
        .set_retry_schedule_intervals(vec![Duration::from_millis(1500); 3]);

    let rsp = domain.schedule(req).await;
    assert_eq!(rsp.code, StatusCode::ErrScheduleCanceled);
    assert!(rsp.message.contains("canceled"));
}

#[tokio::test]
async fn concurrent_forwards_of_one_request_are_deduplicated() {
    use hfs_types::rpc::SchedulerUplink;

    // Slow underlayer so the second forward arrives while the first
    // is still in flight.
    struct SlowDownlink(Arc<MockDownlink>);
    #[async_trait]
    impl SchedulerDownlink for SlowDownlink {
        async fn schedule(&self, req: ScheduleRequest) -> RpcResult<ScheduleResponse> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.0.schedule(req).await
        }
        async fn reserve(&self, req: ScheduleRequest) -> RpcResult<ScheduleResponse> {
            self.0.reserve(req).await
        }
        async fn un_reserve(&self, req: ScheduleRequest) -> RpcResult<GroupResponse> {
            self.0.un_reserve(req).await
        }
        async fn bind(&self, req: ScheduleRequest) -> RpcResult<GroupResponse> {
            self.0.bind(req).await
        }
        async fn un_bind(&self, req: ScheduleRequest) -> RpcResult<GroupResponse> {
            self.0.un_bind(req).await
        }
        async fn evict_agent(&self, req: EvictAgentRequest) -> RpcResult<EvictAck> {
            self.0.evict_agent(req).await
        }
        async fn preempt_instances(&self, req: EvictAgentRequest) -> RpcResult<EvictAck> {
            self.0.preempt_instances(req).await
        }
        async fn ping(&self) -> RpcResult<()> {
            self.0.ping().await
        }
    }

    let scheduler = MockScheduler::new(vec![], selected_decision("selected"));
    let inner = MockDownlink::new(vec![]);
    let view = ResourceViewMgr::spawn("domain-1", None);
    let domain = DomainScheduler::with_scheduler(config(), view, scheduler);
    domain.update_sched_topo(ScheduleTopology {
        leader: TopoMember { name: "domain-1".into(), address: "inproc://domain-1".into() },
        members: vec![TopoMember {
            name: "selected".into(),
            address: "inproc://selected".into(),
        }],
    });
    domain
        .register(
            Register {
                name: "selected".into(),
                address: "inproc://selected".into(),
                resources: Default::default(),
            },
            Arc::new(SlowDownlink(inner)),
        )
        .await
        .unwrap();

    let first = {
        let domain = domain.clone();
        tokio::spawn(async move { domain.forward_schedule(request("request-dup")).await })
    };
    // Give the first forward a moment to be admitted.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = domain.forward_schedule(request("request-dup")).await;
    match second {
        Err(status) => assert_eq!(status.code, StatusCode::DomainSchedulerForwardErr),
        Ok(rsp) => panic!("duplicate forward was admitted: {:?}", rsp.code),
    }
    assert!(first.await.unwrap().unwrap().code.is_ok());
}

#[tokio::test]
async fn heartbeat_loss_flushes_inflight_requests() {
    let scheduler = MockScheduler::new(vec![], selected_decision("selected"));
    // The dispatch never answers: the flush path must resolve it.
    let downlink = Arc::new(MockDownlink {
        responses: Mutex::new(VecDeque::new()),
        alive: AtomicBool::new(true),
        schedules: AtomicUsize::new(0),
    });

    // A downlink whose schedule call hangs forever.
    struct HangingDownlink(Arc<MockDownlink>);
    #[async_trait]
    impl SchedulerDownlink for HangingDownlink {
        async fn schedule(&self, _req: ScheduleRequest) -> RpcResult<ScheduleResponse> {
            futures::future::pending().await
        }
        async fn reserve(&self, req: ScheduleRequest) -> RpcResult<ScheduleResponse> {
            self.0.reserve(req).await
        }
        async fn un_reserve(&self, req: ScheduleRequest) -> RpcResult<GroupResponse> {
            self.0.un_reserve(req).await
        }
        async fn bind(&self, req: ScheduleRequest) -> RpcResult<GroupResponse> {
            self.0.bind(req).await
        }
        async fn un_bind(&self, req: ScheduleRequest) -> RpcResult<GroupResponse> {
            self.0.un_bind(req).await
        }
        async fn evict_agent(&self, req: EvictAgentRequest) -> RpcResult<EvictAck> {
            self.0.evict_agent(req).await
        }
        async fn preempt_instances(&self, req: EvictAgentRequest) -> RpcResult<EvictAck> {
            self.0.preempt_instances(req).await
        }
        async fn ping(&self) -> RpcResult<()> {
            self.0.ping().await
        }
    }

    let hanging = Arc::new(HangingDownlink(Arc::clone(&downlink)));
    let view = ResourceViewMgr::spawn("domain-1", None);
    let domain = DomainScheduler::with_scheduler(config(), view, scheduler);
    domain.update_sched_topo(ScheduleTopology {
        leader: TopoMember { name: "domain-1".into(), address: "inproc://domain-1".into() },
        members: vec![TopoMember {
            name: "selected".into(),
            address: "inproc://selected".into(),
        }],
    });
    let register = Register {
        name: "selected".into(),
        address: "inproc://selected".into(),
        resources: Default::default(),
    };
    domain.register(register, hanging).await.unwrap();

    let mgr = domain.underlayer_mgr().clone();
    let req = request("request-stuck");
    let dispatch = tokio::spawn(async move { mgr.dispatch_schedule("selected", &req).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    downlink.alive.store(false, Ordering::SeqCst);

    let rsp = tokio::time::timeout(Duration::from_secs(2), dispatch)
        .await
        .expect("flushed before the dispatch timeout")
        .unwrap()
        .unwrap();
    assert_eq!(rsp.code, StatusCode::DomainSchedulerUnavailableScheduler);
    assert_eq!(domain.underlayer_mgr().live_underlayers(), 0);
}
