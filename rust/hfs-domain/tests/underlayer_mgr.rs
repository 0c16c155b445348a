//! Underlayer manager behaviour: registration, heartbeats, group
//! methods and preemption fan-out.

use async_trait::async_trait;
use hfs_domain::{DomainConfig, UnderlayerSchedMgr};
use hfs_domain::underlayer::PreemptResult;
use hfs_resource_view::ResourceViewMgr;
use hfs_types::rpc::{RpcResult, SchedulerDownlink};
use hfs_types::{
    EvictAck, EvictAgentRequest, GroupResponse, Register, ResourceType, ResourceUnit, Resources,
    ScheduleRequest, ScheduleResponse, ScheduleTopology, Status, StatusCode, TopoMember,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct RecordingDownlink {
    alive: AtomicBool,
    reserve_calls: AtomicUsize,
    reserve_failures_left: AtomicUsize,
    evicted: Mutex<Vec<String>>,
}

impl RecordingDownlink {
    fn new() -> Arc<Self> {
        let downlink = Self::default();
        downlink.alive.store(true, Ordering::SeqCst);
        Arc::new(downlink)
    }
}

#[async_trait]
impl SchedulerDownlink for RecordingDownlink {
    async fn schedule(&self, req: ScheduleRequest) -> RpcResult<ScheduleResponse> {
        Ok(ScheduleResponse::ok(req.request_id))
    }
    async fn reserve(&self, req: ScheduleRequest) -> RpcResult<ScheduleResponse> {
        self.reserve_calls.fetch_add(1, Ordering::SeqCst);
        if self.reserve_failures_left.load(Ordering::SeqCst) > 0 {
            self.reserve_failures_left.fetch_sub(1, Ordering::SeqCst);
            // Simulate a dropped reply: the caller times out.
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(ScheduleResponse::ok(req.request_id))
    }
    async fn un_reserve(&self, req: ScheduleRequest) -> RpcResult<GroupResponse> {
        Ok(GroupResponse { request_id: req.request_id, ..Default::default() })
    }
    async fn bind(&self, req: ScheduleRequest) -> RpcResult<GroupResponse> {
        Ok(GroupResponse { request_id: req.request_id, ..Default::default() })
    }
    async fn un_bind(&self, req: ScheduleRequest) -> RpcResult<GroupResponse> {
        Ok(GroupResponse { request_id: req.request_id, ..Default::default() })
    }
    async fn evict_agent(&self, req: EvictAgentRequest) -> RpcResult<EvictAck> {
        Ok(EvictAck { request_id: req.request_id, code: StatusCode::Success })
    }
    async fn preempt_instances(&self, req: EvictAgentRequest) -> RpcResult<EvictAck> {
        self.evicted.lock().extend(req.instance_ids.clone());
        Ok(EvictAck { request_id: req.request_id, code: StatusCode::Success })
    }
    async fn ping(&self) -> RpcResult<()> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Status::new(StatusCode::RequestTimeOut, "no pong"))
        }
    }
}

fn config() -> DomainConfig {
    DomainConfig {
        name: "domain-1".into(),
        heartbeat_interval: Duration::from_millis(20),
        heartbeat_max_times: 3,
        group_timeout: Duration::from_millis(100),
        ..Default::default()
    }
}

fn mgr() -> UnderlayerSchedMgr {
    let view = ResourceViewMgr::spawn("domain-1", None);
    UnderlayerSchedMgr::new(config(), view, Arc::new(AtomicUsize::new(0)))
}

fn topology(members: &[(&str, &str)]) -> ScheduleTopology {
    ScheduleTopology {
        leader: TopoMember { name: "domain-1".into(), address: "inproc://domain-1".into() },
        members: members
            .iter()
            .map(|(name, address)| TopoMember {
                name: name.to_string(),
                address: address.to_string(),
            })
            .collect(),
    }
}

fn register_msg(name: &str, address: &str) -> Register {
    Register {
        name: name.into(),
        address: address.into(),
        resources: [(
            ResourceType::Primary,
            ResourceUnit::new(name).with_capacity(Resources::cpu_mem(1000.0, 1024.0)),
        )]
        .into_iter()
        .collect(),
    }
}

#[tokio::test]
async fn register_unknown_name_is_rejected() {
    let mgr = mgr();
    mgr.update_underlayer_topo(&topology(&[("local-1", "inproc://local-1")]));

    let ack = mgr.register(register_msg("stranger", "inproc://x"), RecordingDownlink::new()).await;
    assert_eq!(ack.code, StatusCode::Failed);
    assert!(ack.message.contains("not found in domain topology"));
}

#[tokio::test]
async fn register_address_mismatch_is_rejected() {
    let mgr = mgr();
    mgr.update_underlayer_topo(&topology(&[("local-1", "inproc://local-1")]));

    let ack =
        mgr.register(register_msg("local-1", "inproc://imposter"), RecordingDownlink::new()).await;
    assert_eq!(ack.code, StatusCode::Failed);
}

#[tokio::test]
async fn register_is_idempotent_and_seeds_the_view() {
    let mgr = mgr();
    mgr.update_underlayer_topo(&topology(&[("local-1", "inproc://local-1")]));

    let downlink = RecordingDownlink::new();
    let ack = mgr
        .register(register_msg("local-1", "inproc://local-1"), Arc::clone(&downlink) as _)
        .await;
    assert!(ack.code.is_ok());
    assert!(mgr.is_registered("local-1"));

    let again = mgr.register(register_msg("local-1", "inproc://local-1"), downlink).await;
    assert!(again.code.is_ok());

    let snapshot = mgr.view().get_resources().await;
    assert_eq!(
        snapshot[&ResourceType::Primary].fragment["local-1"].capacity.cpu(),
        Some(1000.0)
    );
}

#[tokio::test]
async fn topology_removal_drops_members_and_updates_retry_budget() {
    let budget = Arc::new(AtomicUsize::new(0));
    let view = ResourceViewMgr::spawn("domain-1", None);
    let mgr = UnderlayerSchedMgr::new(config(), view, Arc::clone(&budget));

    mgr.update_underlayer_topo(&topology(&[
        ("local-1", "inproc://local-1"),
        ("local-2", "inproc://local-2"),
    ]));
    assert_eq!(budget.load(Ordering::SeqCst), 2);

    mgr.update_underlayer_topo(&topology(&[("local-2", "inproc://local-2")]));
    assert_eq!(budget.load(Ordering::SeqCst), 1);
    assert!(!mgr.in_topology("local-1"));
}

#[tokio::test]
async fn reserve_retries_past_timeouts() {
    let mgr = mgr();
    mgr.update_underlayer_topo(&topology(&[("local-1", "inproc://local-1")]));
    let downlink = RecordingDownlink::new();
    downlink.reserve_failures_left.store(2, Ordering::SeqCst);
    mgr.register(register_msg("local-1", "inproc://local-1"), Arc::clone(&downlink) as _).await;

    let req = ScheduleRequest { request_id: "req-r".into(), ..Default::default() };
    let rsp = mgr.reserve("local-1", &req).await;
    assert!(rsp.code.is_ok());
    assert_eq!(downlink.reserve_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn reserve_against_unknown_underlayer_is_unavailable() {
    let mgr = mgr();
    let req = ScheduleRequest { request_id: "req-r".into(), ..Default::default() };
    let rsp = mgr.reserve("ghost", &req).await;
    assert_eq!(rsp.code, StatusCode::DomainSchedulerUnavailableScheduler);
}

#[tokio::test]
async fn preemption_groups_by_owning_proxy() {
    let mgr = mgr();
    mgr.update_underlayer_topo(&topology(&[("node-1", "inproc://node-1")]));
    let downlink = RecordingDownlink::new();
    mgr.register(register_msg("node-1", "inproc://node-1"), Arc::clone(&downlink) as _).await;

    mgr.preempt_instance(vec![
        PreemptResult {
            status: Status::ok(),
            unit_id: "agent-1".into(),
            owner_id: "node-1".into(),
            preempted_instances: vec!["ins-1".into(), "ins-2".into()],
        },
        // failed decisions are skipped
        PreemptResult {
            status: Status::new(StatusCode::Failed, "no"),
            unit_id: "agent-2".into(),
            owner_id: "node-1".into(),
            preempted_instances: vec!["ins-3".into()],
        },
    ]);

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if downlink.evicted.lock().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("preemption reached the proxy");
    let evicted = downlink.evicted.lock();
    assert!(evicted.contains(&"ins-1".to_string()));
    assert!(!evicted.contains(&"ins-3".to_string()));
}

#[tokio::test]
async fn heartbeat_loss_removes_the_underlayer_and_its_resources() {
    let mgr = mgr();
    mgr.update_underlayer_topo(&topology(&[("local-1", "inproc://local-1")]));
    let downlink = RecordingDownlink::new();
    mgr.register(register_msg("local-1", "inproc://local-1"), Arc::clone(&downlink) as _).await;
    assert_eq!(mgr.live_underlayers(), 1);

    downlink.alive.store(false, Ordering::SeqCst);
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if mgr.live_underlayers() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("underlayer declared lost");

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let snapshot = mgr.view().get_resources().await;
            if !snapshot[&ResourceType::Primary].fragment.contains_key("local-1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("resource subtree dropped");
}
