//! End-to-end pipeline runs over a small cluster view.

use hfs_sched_framework::context::PreAllocatedContext;
use hfs_sched_framework::{PipelineOptions, PluginRegistry};
use hfs_types::resource::ValueCounter;
use hfs_types::{
    AffinityScope, AffinityTree, InstanceAffinity, InstanceInfo, LabelExpression, ResourceUnit,
    Resources, SchedPolicy, ScopedSelectors, Selector, StatusCode, SubCondition,
};

fn agent(id: &str, cpu: f64, mem: f64, labels: &[(&str, &str)]) -> ResourceUnit {
    let labels = labels
        .iter()
        .map(|(key, value)| (key.to_string(), ValueCounter::single(*value)))
        .collect();
    ResourceUnit::new(id).with_capacity(Resources::cpu_mem(cpu, mem)).with_labels(labels)
}

fn local(id: &str, agents: Vec<ResourceUnit>) -> ResourceUnit {
    let mut local = ResourceUnit::new(id);
    for unit in agents {
        local.add_fragment(unit);
    }
    local
}

fn shared_request(cpu: f64, mem: f64) -> InstanceInfo {
    InstanceInfo {
        instance_id: "ins-1".into(),
        request_id: "req-1".into(),
        resources: Resources::cpu_mem(cpu, mem),
        ..Default::default()
    }
}

#[test]
fn happy_path_selects_the_only_agent() {
    let root = local("local-1", vec![agent("agent-1", 1000.0, 1024.0, &[])]);
    let registry = PluginRegistry::default_pipeline(PipelineOptions::default());
    let mut ctx = PreAllocatedContext::default();

    let decision = registry.schedule(&mut ctx, &shared_request(500.0, 512.0), &root);
    assert!(decision.is_ok(), "unexpected: {:?}", decision.status);
    assert_eq!(decision.unit_id, "agent-1");
    assert_eq!(decision.dispatch_target, "agent-1");
    assert_eq!(decision.available_for_request, 2);
}

#[test]
fn insufficient_capacity_reports_resource_not_enough() {
    let root = local("local-1", vec![agent("agent-1", 500.0, 512.0, &[])]);
    let registry = PluginRegistry::default_pipeline(PipelineOptions::default());
    let mut ctx = PreAllocatedContext::default();

    let decision = registry.schedule(&mut ctx, &shared_request(1000.0, 1024.0), &root);
    assert_eq!(decision.status.code, StatusCode::ResourceNotEnough);
    assert!(decision.status.message.contains("Out Of Capacity"));
}

#[test]
fn emptier_agent_wins_and_ties_break_on_id() {
    let root = local(
        "local-1",
        vec![
            agent("agent-b", 1000.0, 1024.0, &[]),
            agent("agent-a", 1000.0, 1024.0, &[]),
            agent("agent-c", 500.0, 512.0, &[]),
        ],
    );
    let registry = PluginRegistry::default_pipeline(PipelineOptions::default());
    let mut ctx = PreAllocatedContext::default();

    let decision = registry.schedule(&mut ctx, &shared_request(250.0, 256.0), &root);
    assert!(decision.is_ok());
    // agent-a and agent-b score identically; the id order decides.
    assert_eq!(decision.unit_id, "agent-a");
}

#[test]
fn monopoly_request_picks_exact_footprint() {
    let mut root = local(
        "local-1",
        vec![
            agent("agent-big", 1000.0, 1024.0, &[]),
            agent("agent-fit", 500.0, 512.0, &[]),
        ],
    );
    rebuild_buckets(&mut root);
    let registry = PluginRegistry::default_pipeline(PipelineOptions::default());
    let mut ctx = PreAllocatedContext::default();

    let mut request = shared_request(500.0, 512.0);
    request.schedule_option.sched_policy = SchedPolicy::Monopoly;

    let decision = registry.schedule(&mut ctx, &request, &root);
    assert!(decision.is_ok(), "unexpected: {:?}", decision.status);
    assert_eq!(decision.unit_id, "agent-fit");
    assert!(ctx.selected_agent_set.contains("agent-fit"));
}

#[test]
fn two_monopoly_attempts_cannot_share_one_agent() {
    let mut root = local("local-1", vec![agent("agent-fit", 500.0, 512.0, &[])]);
    rebuild_buckets(&mut root);
    let registry = PluginRegistry::default_pipeline(PipelineOptions::default());
    let mut ctx = PreAllocatedContext::default();

    let mut first = shared_request(500.0, 512.0);
    first.schedule_option.sched_policy = SchedPolicy::Monopoly;
    let mut second = first.clone();
    second.instance_id = "ins-2".into();

    assert!(registry.schedule(&mut ctx, &first, &root).is_ok());
    let decision = registry.schedule(&mut ctx, &second, &root);
    assert_eq!(decision.status.code, StatusCode::ResourceNotEnough);
    assert!(decision.status.message.contains("Already Allocated To Other"));
}

#[test]
fn required_affinity_restricts_candidates() {
    let root = local(
        "local-1",
        vec![
            agent("agent-1", 1000.0, 1024.0, &[("zone", "az1")]),
            agent("agent-2", 1000.0, 1024.0, &[("zone", "az2")]),
        ],
    );
    let registry = PluginRegistry::default_pipeline(PipelineOptions::default());
    let mut ctx = PreAllocatedContext::default();

    let mut request = shared_request(100.0, 128.0);
    request.schedule_option.affinity = Some(AffinityTree {
        instance: Some(InstanceAffinity {
            scope: AffinityScope::Pod,
            selectors: ScopedSelectors {
                required_affinity: Some(Selector::new(
                    false,
                    vec![SubCondition::new(vec![LabelExpression::is_in(
                        "zone",
                        vec!["az2".into()],
                    )])],
                )),
                ..Default::default()
            },
        }),
        ..Default::default()
    });

    let decision = registry.schedule(&mut ctx, &request, &root);
    assert!(decision.is_ok());
    assert_eq!(decision.unit_id, "agent-2");
}

// Mirrors what the resource view maintains at runtime.
fn rebuild_buckets(root: &mut ResourceUnit) {
    use hfs_types::unit::{memory_key, proportion_key, Bucket, BucketIndex, BucketInfo};
    let mut indexes: std::collections::BTreeMap<String, BucketIndex> = Default::default();
    let agents: Vec<ResourceUnit> = root.fragment.values().cloned().collect();
    for agent in &agents {
        let (Some(cpu), Some(mem)) = (agent.capacity.cpu(), agent.capacity.mem()) else {
            continue;
        };
        let bucket = indexes
            .entry(proportion_key(mem, cpu))
            .or_default()
            .buckets
            .entry(memory_key(mem))
            .or_insert_with(Bucket::default);
        bucket.total.monopoly_num += 1;
        bucket.allocatable.insert(agent.id.clone(), BucketInfo::new(1, 0));
    }
    root.bucket_indexes = indexes.clone();
    for child in root.fragment.values_mut() {
        let (Some(cpu), Some(mem)) = (child.capacity.cpu(), child.capacity.mem()) else {
            continue;
        };
        let mut index = BucketIndex::default();
        let mut bucket = Bucket::default();
        bucket.total.monopoly_num = 1;
        bucket.allocatable.insert(child.id.clone(), BucketInfo::new(1, 0));
        index.buckets.insert(memory_key(mem), bucket);
        child.bucket_indexes.insert(proportion_key(mem, cpu), index);
    }
}
