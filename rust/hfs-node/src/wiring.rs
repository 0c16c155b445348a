//! In-process wiring of the scheduler tiers.
//!
//! Production deployments put a transport behind the seam traits;
//! tests and single-process deployments wire tiers directly through
//! this resolver.

use anyhow::Context;
use async_trait::async_trait;
use hfs_domain::{DomainConfig, DomainScheduler};
use hfs_local::{AgentManager, LocalConfig, LocalSchedSrv, ServiceRegistry, TierResolver};
use hfs_metastore::keys::KeyLayout;
use hfs_metastore::{MemoryMetaStore, MetaStorageAccessor};
use hfs_observer::{Observer, ObserverParams};
use hfs_resource_view::ResourceViewMgr;
use hfs_types::rpc::{
    RegistrationTarget, RpcResult, SchedulerDownlink, SchedulerUplink,
};
use hfs_types::{
    EvictAck, EvictAgentRequest, GroupResponse, Register, Resources, ResourceType, ResourceUnit,
    ScheduleRequest, ScheduleResponse, ScheduleTopology, Status, StatusCode, TopoMember,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Address book of in-process tiers.
#[derive(Default)]
pub struct InProcResolver {
    domains: Mutex<HashMap<String, DomainScheduler>>,
}

impl InProcResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, address: impl Into<String>, domain: DomainScheduler) {
        self.domains.lock().insert(address.into(), domain);
    }

    fn domain_at(&self, address: &str) -> Option<DomainScheduler> {
        self.domains.lock().get(address).cloned()
    }
}

#[async_trait]
impl TierResolver for InProcResolver {
    async fn registration_target(
        &self,
        address: &str,
    ) -> Option<Arc<dyn RegistrationTarget>> {
        self.domain_at(address)
            .map(|domain| Arc::new(domain) as Arc<dyn RegistrationTarget>)
    }

    async fn uplink(&self, address: &str) -> Option<Arc<dyn SchedulerUplink>> {
        self.domain_at(address).map(|domain| Arc::new(domain) as Arc<dyn SchedulerUplink>)
    }
}

/// Downlink adapter letting the global tier treat a whole domain as
/// one underlayer. The group quartet stays between a domain and its
/// locals, so those methods are not routable here.
struct DomainAsUnderlayer {
    domain: DomainScheduler,
}

#[async_trait]
impl SchedulerDownlink for DomainAsUnderlayer {
    async fn schedule(&self, req: ScheduleRequest) -> RpcResult<ScheduleResponse> {
        Ok(self.domain.schedule(req).await)
    }

    async fn reserve(&self, _req: ScheduleRequest) -> RpcResult<ScheduleResponse> {
        Err(Status::new(StatusCode::ParameterError, "reserve is domain-to-local only"))
    }

    async fn un_reserve(&self, _req: ScheduleRequest) -> RpcResult<GroupResponse> {
        Err(Status::new(StatusCode::ParameterError, "unreserve is domain-to-local only"))
    }

    async fn bind(&self, _req: ScheduleRequest) -> RpcResult<GroupResponse> {
        Err(Status::new(StatusCode::ParameterError, "bind is domain-to-local only"))
    }

    async fn un_bind(&self, _req: ScheduleRequest) -> RpcResult<GroupResponse> {
        Err(Status::new(StatusCode::ParameterError, "unbind is domain-to-local only"))
    }

    async fn evict_agent(&self, _req: EvictAgentRequest) -> RpcResult<EvictAck> {
        Err(Status::new(StatusCode::ParameterError, "evict is domain-to-local only"))
    }

    async fn preempt_instances(&self, _req: EvictAgentRequest) -> RpcResult<EvictAck> {
        Err(Status::new(StatusCode::ParameterError, "preempt is domain-to-local only"))
    }

    async fn ping(&self) -> RpcResult<()> {
        Ok(())
    }
}

/// A whole scheduling tree living in one process: the global root,
/// its domains and their locals.
pub struct InProcCluster {
    pub resolver: Arc<InProcResolver>,
    pub global: DomainScheduler,
    pub domains: Vec<DomainScheduler>,
    pub locals: Vec<LocalSchedSrv>,
    pub accessor: Arc<MetaStorageAccessor>,
    pub layout: KeyLayout,
    domain_members: Mutex<HashMap<String, Vec<TopoMember>>>,
    registries: Mutex<Vec<Arc<ServiceRegistry>>>,
}

impl InProcCluster {
    pub const GLOBAL_ADDRESS: &'static str = "inproc://global";

    /// A root plus `domain_names` domains, all registered with the
    /// resolver and connected upward.
    pub async fn new(domain_names: &[&str], base: DomainConfig) -> Self {
        let resolver = InProcResolver::new();
        let global = DomainScheduler::new(DomainConfig {
            name: "global".into(),
            is_root: true,
            ..base.clone()
        });
        resolver.insert(Self::GLOBAL_ADDRESS, global.clone());

        let mut domains = Vec::new();
        let mut members = Vec::new();
        for name in domain_names {
            let domain = DomainScheduler::new(DomainConfig {
                name: name.to_string(),
                is_root: false,
                ..base.clone()
            });
            domain.set_uplink(Arc::new(global.clone()));
            resolver.insert(format!("inproc://{name}"), domain.clone());
            members.push(TopoMember {
                name: name.to_string(),
                address: format!("inproc://{name}"),
            });
            domains.push(domain);
        }
        let leader = members.first().cloned().unwrap_or_default();
        let topology = ScheduleTopology { leader, members: members.clone() };
        global.update_sched_topo(topology);
        for (domain, member) in domains.iter().zip(&members) {
            let register = Register {
                name: member.name.clone(),
                address: member.address.clone(),
                resources: Default::default(),
            };
            let downlink = Arc::new(DomainAsUnderlayer { domain: domain.clone() });
            let _ = global.register(register, downlink).await;
        }

        Self {
            resolver,
            global,
            domains,
            locals: Vec::new(),
            accessor: MetaStorageAccessor::new(Arc::new(MemoryMetaStore::new())),
            layout: KeyLayout::new("hfs", "default", "az0"),
            domain_members: Mutex::new(HashMap::new()),
            registries: Mutex::new(Vec::new()),
        }
    }

    /// Start a local under `domain_name` with the given agents and
    /// register it all the way up.
    pub async fn add_local(
        &mut self,
        domain_name: &str,
        node_id: &str,
        agents: &[(&str, Resources)],
        agent_mgr: Arc<dyn AgentManager>,
        config: LocalConfig,
    ) -> anyhow::Result<LocalSchedSrv> {
        let view = ResourceViewMgr::spawn(node_id, None);
        seed_local_view(&view, node_id, agents)
            .await
            .with_context(|| format!("seeding the resource view of {node_id}"))?;

        let config = LocalConfig {
            node_id: node_id.to_string(),
            address: format!("inproc://{node_id}"),
            global_address: Self::GLOBAL_ADDRESS.to_string(),
            ..config
        };
        let local = LocalSchedSrv::new(
            config,
            view,
            agent_mgr,
            Arc::clone(&self.resolver) as Arc<dyn TierResolver>,
        );

        // The domain must expect the local before it registers.
        let member = TopoMember {
            name: node_id.to_string(),
            address: format!("inproc://{node_id}"),
        };
        let domain = self
            .domains
            .iter()
            .find(|domain| domain.name() == domain_name)
            .with_context(|| format!("domain {domain_name} is not part of this cluster"))?
            .clone();
        let mut members = self.domain_members.lock();
        let entry = members.entry(domain_name.to_string()).or_default();
        entry.push(member);
        let topology = ScheduleTopology {
            leader: TopoMember {
                name: domain_name.to_string(),
                address: format!("inproc://{domain_name}"),
            },
            members: entry.clone(),
        };
        drop(members);
        domain.update_sched_topo(topology.clone());
        // The root hands this topology to locals registering there.
        self.global.update_sched_topo(ScheduleTopology {
            leader: topology.leader.clone(),
            members: self
                .domains
                .iter()
                .map(|domain| TopoMember {
                    name: domain.name().to_string(),
                    address: format!("inproc://{}", domain.name()),
                })
                .collect(),
        });

        // Metadata plane: observer caches plus the lease-backed
        // bus-proxy presence.
        let observer = Observer::new(
            node_id,
            Arc::clone(&self.accessor),
            self.layout.clone(),
            ObserverParams::default(),
        );
        observer
            .register()
            .await
            .with_context(|| format!("registering the observer of {node_id}"))?;
        local.set_observer(observer);
        let registry = Arc::new(ServiceRegistry::new(
            Arc::clone(&self.accessor),
            &self.layout,
            hfs_types::ProxyMeta {
                node: node_id.to_string(),
                aid: format!("inproc://{node_id}"),
                ak: String::new(),
            },
            8,
        ));
        registry
            .register()
            .await
            .with_context(|| format!("acquiring the bus proxy lease of {node_id}"))?;
        self.registries.lock().push(registry);

        let status = local.register().await;
        if status.is_err() {
            anyhow::bail!("local {node_id} registration failed: {status}");
        }
        self.locals.push(local.clone());
        Ok(local)
    }
}

/// Seed a local view with its agents as direct children of the node
/// root, so the local pipeline selects agents.
pub async fn seed_local_view(
    view: &ResourceViewMgr,
    node_id: &str,
    agents: &[(&str, Resources)],
) -> anyhow::Result<()> {
    for (agent_id, capacity) in agents {
        let register = Register {
            name: agent_id.to_string(),
            address: format!("inproc://{node_id}/{agent_id}"),
            resources: [(
                ResourceType::Primary,
                ResourceUnit::new(*agent_id).with_capacity(capacity.clone()),
            )]
            .into_iter()
            .collect(),
        };
        view.register_resource_unit(register, format!("inproc://{node_id}"))
            .await
            .with_context(|| format!("registering agent {agent_id}"))?;
    }
    // The seed is baseline state, not a delta to replay upward.
    let _ = view.get_changes().await;
    Ok(())
}
