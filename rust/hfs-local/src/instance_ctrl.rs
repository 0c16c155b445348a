//! Local-tier instance controller: binds instances onto this node's
//! agents.

use hfs_resource_view::ResourceViewMgr;
use hfs_sched_framework::context::PreAllocatedContext;
use hfs_sched_framework::{PipelineOptions, PluginRegistry};
use hfs_types::plugin::copy_plugin_context;
use hfs_types::{
    InstanceStatus, ResourceType, ResourceUnitChanges, ScheduleRequest, ScheduleResponse,
    ScheduleResult, Status, StatusCode, UnitChange, INIT_CALL_SUFFIX,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of a finished invocation routed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResult {
    pub request_id: String,
    pub instance_id: String,
    pub code: StatusCode,
    pub message: String,
}

/// Callback invoked for `@initcall` results: the create-time adapter
/// learns whether the freshly created instance finished its
/// initializer.
pub type InitCallAdapter = Arc<dyn Fn(&CallResult) + Send + Sync>;

struct RequestRecord {
    caller: String,
    instance_id: String,
    status: InstanceStatus,
}

struct CtrlInner {
    node_id: String,
    view: ResourceViewMgr,
    registry: PluginRegistry,
    requests: Mutex<HashMap<String, RequestRecord>>,
    init_call_adapter: Mutex<Option<InitCallAdapter>>,
    /// request id -> last schedule round this node filtered. Breaks
    /// forward cycles: a re-dispatch of the same round is rejected
    /// outright, the root bumps the round before coming back.
    filtered_rounds: Mutex<HashMap<String, u32>>,
}

/// Per-node request owner: schedules onto local agents, tracks the
/// caller of every request, and routes results and kills.
#[derive(Clone)]
pub struct LocalInstanceCtrl {
    inner: Arc<CtrlInner>,
}

impl LocalInstanceCtrl {
    pub fn new(node_id: impl Into<String>, view: ResourceViewMgr, relaxed: bool) -> Self {
        Self {
            inner: Arc::new(CtrlInner {
                node_id: node_id.into(),
                view,
                registry: PluginRegistry::default_pipeline(PipelineOptions {
                    relaxed,
                    root_level: false,
                }),
                requests: Mutex::new(HashMap::new()),
                init_call_adapter: Mutex::new(None),
                filtered_rounds: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn set_init_call_adapter(&self, adapter: InitCallAdapter) {
        *self.inner.init_call_adapter.lock() = Some(adapter);
    }

    /// Try to place the instance on one of this node's agents and
    /// consume the resources on success.
    pub async fn schedule(&self, req: &ScheduleRequest, caller: &str) -> ScheduleResponse {
        if self
            .inner
            .filtered_rounds
            .lock()
            .get(&req.request_id)
            .is_some_and(|round| *round == req.schedule_round)
        {
            debug!(
                request_id = %req.request_id,
                round = req.schedule_round,
                "round already filtered on this node"
            );
            return ScheduleResponse::error(
                StatusCode::ResourceNotEnough,
                "schedule round already filtered",
                req.request_id.clone(),
            );
        }
        let snapshot = self.inner.view.get_resources().await;
        let Some(root) = snapshot.get(&ResourceType::Primary) else {
            return ScheduleResponse::error(
                StatusCode::ResourceNotEnough,
                "No Resource In Cluster",
                req.request_id.clone(),
            );
        };

        let mut ctx = PreAllocatedContext::new(Default::default());
        copy_plugin_context(&mut ctx.plugin_context, &req.plugin_context);
        let decision = self.inner.registry.schedule(&mut ctx, &req.instance, root);
        if decision.status.is_err() {
            debug!(
                request_id = %req.request_id,
                status = %decision.status,
                "local schedule found no agent"
            );
            self.inner
                .filtered_rounds
                .lock()
                .insert(req.request_id.clone(), req.schedule_round);
            return ScheduleResponse::error(
                decision.status.code,
                decision.status.message,
                req.request_id.clone(),
            );
        }
        self.inner.filtered_rounds.lock().remove(&req.request_id);

        // Bind: consume the amounts on the chosen agent.
        let bind = ResourceUnitChanges::new(ResourceType::Primary, 0).with_change(
            UnitChange::Adjust {
                unit_id: decision.unit_id.clone(),
                allocatable_delta: req.instance.resources.clone(),
                label_delta: Default::default(),
            },
        );
        if let Err(error) = self.inner.view.update_resource_unit_delta(bind).await {
            warn!(request_id = %req.request_id, %error, "bind failed after decision");
            return ScheduleResponse::error(
                StatusCode::ResourceNotEnough,
                error.to_string(),
                req.request_id.clone(),
            );
        }

        self.inner.requests.lock().insert(
            req.request_id.clone(),
            RequestRecord {
                caller: caller.to_string(),
                instance_id: req.instance.instance_id.clone(),
                status: InstanceStatus::Binding,
            },
        );
        info!(
            request_id = %req.request_id,
            agent_id = %decision.unit_id,
            "instance bound locally"
        );
        // The view delta stays pending here; whoever answers the
        // domain next (downlink response or forward) carries it up.
        ScheduleResponse {
            code: StatusCode::Success,
            message: String::new(),
            request_id: req.request_id.clone(),
            instance_id: req.instance.instance_id.clone(),
            schedule_result: Some(ScheduleResult {
                agent_id: decision.unit_id,
                node_id: self.inner.node_id.clone(),
            }),
            update_resources: Vec::new(),
        }
    }

    /// Release a bound instance's resources (eviction, exit).
    pub async fn release(&self, req: &ScheduleRequest, agent_id: &str) {
        let release = ResourceUnitChanges::new(ResourceType::Primary, 0).with_change(
            UnitChange::Adjust {
                unit_id: agent_id.to_string(),
                allocatable_delta: req.instance.resources.negated(),
                label_delta: Default::default(),
            },
        );
        let _ = self.inner.view.update_resource_unit_delta(release).await;
        self.inner.requests.lock().remove(&req.request_id);
    }

    pub fn mark_running(&self, request_id: &str) {
        if let Some(record) = self.inner.requests.lock().get_mut(request_id) {
            record.status = InstanceStatus::Running;
        }
    }

    /// Route a completed invocation back. Results of `@initcall`
    /// requests go to the create-time adapter instead of the caller;
    /// unknown ids answer LS_REQUEST_NOT_FOUND, which callers treat
    /// as "already reported".
    pub fn call_result(&self, from: &str, result: &CallResult) -> Status {
        if result.request_id.ends_with(INIT_CALL_SUFFIX) {
            let adapter = self.inner.init_call_adapter.lock().clone();
            match adapter {
                Some(adapter) => {
                    adapter(result);
                    return Status::ok();
                }
                None => {
                    warn!(request_id = %result.request_id, "init call result without adapter");
                    return Status::new(StatusCode::LsRequestNotFound, "no init call adapter");
                }
            }
        }
        let requests = self.inner.requests.lock();
        let Some(record) = requests.get(&result.request_id) else {
            return Status::new(StatusCode::LsRequestNotFound, "request not found");
        };
        debug!(
            request_id = %result.request_id,
            from,
            caller = %record.caller,
            "routing call result to caller"
        );
        Status::ok()
    }

    /// A kill is honoured only when it comes from the request's
    /// original caller.
    pub fn check_kill_allowed(&self, from: &str, request_id: &str) -> Status {
        let requests = self.inner.requests.lock();
        match requests.get(request_id) {
            None => Status::new(StatusCode::LsRequestNotFound, "request not found"),
            Some(record) if record.caller != from => Status::new(
                StatusCode::ParameterError,
                format!("kill from {from} rejected, caller is {}", record.caller),
            ),
            Some(_) => Status::ok(),
        }
    }

    pub fn instance_of_request(&self, request_id: &str) -> Option<String> {
        self.inner.requests.lock().get(request_id).map(|r| r.instance_id.clone())
    }

    /// True once no request is in a pre-running state; graceful
    /// shutdown waits for this.
    pub fn is_quiesced(&self) -> bool {
        self.inner
            .requests
            .lock()
            .values()
            .all(|record| record.status == InstanceStatus::Running)
    }
}
