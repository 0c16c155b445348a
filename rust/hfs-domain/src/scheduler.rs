//! Schedule decisions over the tier's resource view.

use async_trait::async_trait;
use hfs_resource_view::ResourceViewMgr;
use hfs_sched_framework::context::PreAllocatedContext;
use hfs_sched_framework::{PipelineOptions, PluginRegistry, ScheduleDecision};
use hfs_types::plugin::copy_plugin_context;
use hfs_types::{ResourceType, ScheduleRequest};
use tracing::debug;

/// Seam between the instance controller and the pipeline, mockable in
/// tests.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// One decision over the current view. The request's plugin
    /// context is read and updated in place so verdicts survive
    /// across attempts and tiers.
    async fn schedule_decision(&self, req: &mut ScheduleRequest) -> ScheduleDecision;
}

/// Production implementation: the default pipeline over the PRIMARY
/// view of this tier.
pub struct FrameworkScheduler {
    registry: PluginRegistry,
    view: ResourceViewMgr,
}

impl FrameworkScheduler {
    pub fn new(view: ResourceViewMgr, options: PipelineOptions) -> Self {
        Self { registry: PluginRegistry::default_pipeline(options), view }
    }

    pub fn with_registry(view: ResourceViewMgr, registry: PluginRegistry) -> Self {
        Self { registry, view }
    }
}

#[async_trait]
impl Scheduler for FrameworkScheduler {
    async fn schedule_decision(&self, req: &mut ScheduleRequest) -> ScheduleDecision {
        let snapshot = self.view.get_resources().await;
        let Some(root) = snapshot.get(&ResourceType::Primary) else {
            return ScheduleDecision::failed(hfs_types::Status::new(
                hfs_types::StatusCode::ResourceNotEnough,
                "No Resource In Cluster",
            ));
        };

        let mut ctx = PreAllocatedContext::new(Default::default());
        copy_plugin_context(&mut ctx.plugin_context, &req.plugin_context);
        // Aggregate child labels per local so node-scope selectors see
        // the whole node.
        for local in root.fragment.values() {
            let mut merged = local.node_labels.clone();
            for agent in local.fragment.values() {
                hfs_types::resource::merge_labels(&mut merged, &agent.node_labels);
            }
            ctx.all_local_labels.insert(local.id.clone(), merged);
        }

        let decision = self.registry.schedule(&mut ctx, &req.instance, root);
        copy_plugin_context(&mut req.plugin_context, &ctx.plugin_context);
        debug!(
            request_id = %req.request_id,
            status = %decision.status,
            unit_id = %decision.unit_id,
            "schedule decision"
        );
        decision
    }
}
