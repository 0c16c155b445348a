//! Plugin context carried with a schedule request across tiers.
//!
//! Filters and scorers on different tiers communicate through these
//! named context slots: the affinity plugin records per-unit verdicts
//! and scores, the default filter keeps its feasibility notes, and the
//! group-schedule slot remembers reservations across attempts.

use crate::status::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const LABEL_AFFINITY_PLUGIN: &str = "LabelAffinityPlugin";
pub const DEFAULT_FILTER_PLUGIN: &str = "DefaultFilterPlugin";
pub const GROUP_SCHEDULE_CONTEXT: &str = "GroupScheduleContext";

/// Shared state of the label-affinity filters and scorers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AffinityContext {
    /// unit id -> verdict from an earlier pass (possibly on another
    /// tier); AFFINITY_SCHEDULE_FAILED entries are skipped outright.
    pub scheduled_result: BTreeMap<String, StatusCode>,
    /// unit id -> affinity score from an earlier pass.
    pub scheduled_score: BTreeMap<String, i64>,
    /// Set by the root-level scorer once the request starts flowing
    /// top-down; strict filters then enforce preferred-affinity
    /// optimality.
    pub is_top_down_scheduling: bool,
}

/// Feasibility notes of the default filter.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DefaultFilterContext {
    /// unit id -> identical-spec slots still available there.
    pub filter_ctx: BTreeMap<String, i64>,
}

/// Group scheduling state preserved across attempts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GroupScheduleContext {
    /// unit ids holding reservations for this request group.
    pub reserved: Vec<String>,
}

/// One named context slot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PluginContext {
    pub affinity: Option<AffinityContext>,
    pub default_filter: Option<DefaultFilterContext>,
    pub group_sched: Option<GroupScheduleContext>,
}

/// plugin name -> opaque per-plugin state.
pub type PluginContextMap = BTreeMap<String, PluginContext>;

/// Reset the per-attempt parts of the context, keeping top-down and
/// group reservations intact.
pub fn clear_plugin_context(ctx: &mut PluginContextMap) {
    if let Some(affinity) =
        ctx.entry(LABEL_AFFINITY_PLUGIN.to_string()).or_default().affinity.as_mut()
    {
        affinity.scheduled_result.clear();
        affinity.scheduled_score.clear();
    }
    if let Some(filter) =
        ctx.entry(DEFAULT_FILTER_PLUGIN.to_string()).or_default().default_filter.as_mut()
    {
        filter.filter_ctx.clear();
    }
    if let Some(group) =
        ctx.entry(GROUP_SCHEDULE_CONTEXT.to_string()).or_default().group_sched.as_mut()
    {
        group.reserved.clear();
    }
}

/// Copy each named slot exactly once, preserving the group-schedule
/// context so reservations made in an earlier attempt stay visible to
/// the retry.
pub fn copy_plugin_context(out: &mut PluginContextMap, input: &PluginContextMap) {
    for name in [LABEL_AFFINITY_PLUGIN, DEFAULT_FILTER_PLUGIN, GROUP_SCHEDULE_CONTEXT] {
        if let Some(slot) = input.get(name) {
            out.insert(name.to_string(), slot.clone());
        }
    }
}

/// Fetch (creating on demand) the affinity slot.
pub fn affinity_context(ctx: &mut PluginContextMap) -> &mut AffinityContext {
    ctx.entry(LABEL_AFFINITY_PLUGIN.to_string())
        .or_default()
        .affinity
        .get_or_insert_with(AffinityContext::default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_preserves_group_context() {
        let mut input = PluginContextMap::new();
        input.entry(GROUP_SCHEDULE_CONTEXT.to_string()).or_default().group_sched =
            Some(GroupScheduleContext { reserved: vec!["local-1".into()] });
        input.entry(LABEL_AFFINITY_PLUGIN.to_string()).or_default().affinity =
            Some(AffinityContext { is_top_down_scheduling: true, ..Default::default() });

        let mut out = PluginContextMap::new();
        copy_plugin_context(&mut out, &input);
        assert_eq!(out[GROUP_SCHEDULE_CONTEXT].group_sched.as_ref().unwrap().reserved.len(), 1);
        assert!(out[LABEL_AFFINITY_PLUGIN].affinity.as_ref().unwrap().is_top_down_scheduling);
    }

    #[test]
    fn clear_keeps_top_down_flag() {
        let mut ctx = PluginContextMap::new();
        let affinity = affinity_context(&mut ctx);
        affinity.is_top_down_scheduling = true;
        affinity.scheduled_score.insert("agent-1".into(), 100);

        clear_plugin_context(&mut ctx);
        let affinity = affinity_context(&mut ctx);
        assert!(affinity.is_top_down_scheduling);
        assert!(affinity.scheduled_score.is_empty());
    }
}
