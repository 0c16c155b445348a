//! Scheduling framework (C3) and affinity engine (C4).
//!
//! A schedule attempt runs the pluggable pipeline
//! prefilter → filters → scorers against a [`PreAllocatedContext`]
//! that accumulates tentative decisions across the batch of candidate
//! units. Plugins are owned by a [`PluginRegistry`] built per
//! scheduler instance; there is no global registration table.

pub mod context;
pub mod filter;
pub mod framework;
pub mod prefilter;
pub mod scorer;
pub mod selector;

pub use context::{PodInfo, PodSpec, PreAllocatedContext};
pub use framework::{
    Filtered, PipelineOptions, PluginRegistry, PreFilterPlugin, PreFilterResult, FilterPlugin,
    ScheduleDecision, ScorePlugin, INVALID_SCORE,
};

/// Plugin names; the registry and the per-request policy table key on
/// these.
pub mod names {
    pub const DEFAULT_PREFILTER: &str = "DefaultPreFilter";

    pub const DEFAULT_FILTER: &str = "DefaultFilter";
    pub const RESOURCE_SELECTOR_FILTER: &str = "ResourceSelectorFilter";
    pub const DEFAULT_HETEROGENEOUS_FILTER: &str = "DefaultHeterogeneousFilter";
    pub const RELAXED_ROOT_LABEL_AFFINITY_FILTER: &str = "RelaxedRootLabelAffinityFilter";
    pub const STRICT_ROOT_LABEL_AFFINITY_FILTER: &str = "StrictRootLabelAffinityFilter";
    pub const RELAXED_NON_ROOT_LABEL_AFFINITY_FILTER: &str = "RelaxedNonRootLabelAffinityFilter";
    pub const STRICT_NON_ROOT_LABEL_AFFINITY_FILTER: &str = "StrictNonRootLabelAffinityFilter";

    pub const DEFAULT_SCORER: &str = "DefaultScorer";
    pub const DEFAULT_HETEROGENEOUS_SCORER: &str = "DefaultHeterogeneousScorer";
    pub const RELAXED_LABEL_AFFINITY_SCORER: &str = "RelaxedLabelAffinityScorer";
    pub const STRICT_LABEL_AFFINITY_SCORER: &str = "StrictLabelAffinityScorer";
}

/// Base score of a unit when the instance carries no affinity at all.
pub const BASE_SCORE: f64 = 1.0;
