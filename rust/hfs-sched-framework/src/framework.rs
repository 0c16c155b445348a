//! Plugin traits, registry and the pipeline executor.

use crate::context::PreAllocatedContext;
use crate::names;
use hfs_types::{InstanceInfo, ResourceUnit, Status, StatusCode};
use std::sync::Arc;
use tracing::{debug, warn};

/// A scorer returning this value declares itself inapplicable to the
/// unit; the unit is excluded from selection.
pub const INVALID_SCORE: f64 = -1.0;

/// Result of one filter on one candidate unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Filtered {
    pub status: Status,
    /// Aborts the whole request regardless of retry budget.
    pub is_fatal_err: bool,
    /// Identical-spec slots the unit still has after this filter;
    /// -1 means unknown or not applicable.
    pub available_for_request: i64,
    /// Human-readable statement of the unmet requirement.
    pub required: String,
}

impl Filtered {
    pub fn ok() -> Self {
        Self {
            status: Status::ok(),
            is_fatal_err: false,
            available_for_request: -1,
            required: String::new(),
        }
    }

    pub fn ok_with_available(available_for_request: i64) -> Self {
        Self { available_for_request, ..Self::ok() }
    }

    pub fn fail(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status: Status::new(code, message),
            is_fatal_err: false,
            available_for_request: -1,
            required: String::new(),
        }
    }

    pub fn fatal(code: StatusCode, message: impl Into<String>) -> Self {
        Self { is_fatal_err: true, ..Self::fail(code, message) }
    }

    pub fn with_required(mut self, required: impl Into<String>) -> Self {
        self.required = required.into();
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

/// Candidate set produced by a prefilter: unit ids to evaluate, or a
/// terminal status.
#[derive(Debug, Clone)]
pub struct PreFilterResult {
    pub status: Status,
    pub candidates: Vec<String>,
}

impl PreFilterResult {
    pub fn ok(candidates: Vec<String>) -> Self {
        Self { status: Status::ok(), candidates }
    }

    pub fn fail(code: StatusCode, message: impl Into<String>) -> Self {
        Self { status: Status::new(code, message), candidates: Vec::new() }
    }
}

pub trait PreFilterPlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn pre_filter(
        &self,
        ctx: &mut PreAllocatedContext,
        instance: &InstanceInfo,
        unit: &ResourceUnit,
    ) -> PreFilterResult;
}

pub trait FilterPlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn filter(
        &self,
        ctx: &mut PreAllocatedContext,
        instance: &InstanceInfo,
        unit: &ResourceUnit,
    ) -> Filtered;
}

pub trait ScorePlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn score(
        &self,
        ctx: &mut PreAllocatedContext,
        instance: &InstanceInfo,
        unit: &ResourceUnit,
    ) -> f64;
}

/// Variant flags of the label-affinity plugins for one tier.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineOptions {
    /// Relaxed honours required constraints but lets preferred
    /// affinity go unmet; strict also demands the optimal preferred
    /// score once scheduling flows top-down.
    pub relaxed: bool,
    /// The top of the tree defers preferred affinity to child tiers.
    pub root_level: bool,
}

/// The plugin set owned by one scheduler instance.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    prefilters: Vec<Arc<dyn PreFilterPlugin>>,
    filters: Vec<Arc<dyn FilterPlugin>>,
    scorers: Vec<(Arc<dyn ScorePlugin>, f64)>,
}

impl PluginRegistry {
    pub fn builder() -> PluginRegistryBuilder {
        PluginRegistryBuilder::default()
    }

    /// The compiled-in default pipeline for a tier.
    pub fn default_pipeline(options: PipelineOptions) -> Self {
        let affinity_filter: Arc<dyn FilterPlugin> =
            Arc::new(crate::filter::label_affinity::LabelAffinityFilter::new(
                options.relaxed,
                options.root_level,
            ));
        let affinity_scorer: Arc<dyn ScorePlugin> =
            Arc::new(crate::scorer::label_affinity::LabelAffinityScorer::new(
                options.relaxed,
                options.root_level,
            ));
        Self::builder()
            .prefilter(Arc::new(crate::prefilter::DefaultPreFilter))
            .filter(Arc::new(crate::filter::default_filter::DefaultFilter))
            .filter(Arc::new(crate::filter::resource_selector::ResourceSelectorFilter))
            .filter(Arc::new(crate::filter::heterogeneous::DefaultHeterogeneousFilter))
            .filter(affinity_filter)
            .scorer(Arc::new(crate::scorer::default_scorer::DefaultScorer), 1.0)
            .scorer(Arc::new(crate::scorer::heterogeneous::DefaultHeterogeneousScorer), 1.0)
            .scorer(affinity_scorer, 1.0)
            .build()
    }

    pub fn filter_names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|filter| filter.name()).collect()
    }

    /// Execute the whole pipeline for one instance over `root`.
    pub fn schedule(
        &self,
        ctx: &mut PreAllocatedContext,
        instance: &InstanceInfo,
        root: &ResourceUnit,
    ) -> ScheduleDecision {
        let candidates = match self.run_prefilters(ctx, instance, root) {
            Ok(candidates) => candidates,
            Err(status) => return ScheduleDecision::failed(status),
        };

        let mut feasible: Vec<(&ResourceUnit, i64)> = Vec::new();
        let mut last_failure: Option<Filtered> = None;
        for candidate_id in &candidates {
            let Some(unit) = root.find(candidate_id) else {
                debug!(candidate_id, "prefilter candidate vanished from the view");
                continue;
            };
            match self.run_filters(ctx, instance, unit) {
                Ok(available) => feasible.push((unit, available)),
                Err(filtered) => {
                    if filtered.is_fatal_err {
                        warn!(
                            request_id = %instance.request_id,
                            unit_id = %unit.id,
                            status = %filtered.status,
                            "fatal filter error aborts scheduling"
                        );
                        return ScheduleDecision::failed(filtered.status);
                    }
                    last_failure = Some(filtered);
                }
            }
        }

        if feasible.is_empty() {
            let status = last_failure.map_or_else(
                || Status::new(StatusCode::ResourceNotEnough, "No Resources Available"),
                |filtered| filtered.status,
            );
            return ScheduleDecision::failed(status);
        }

        let mut best: Option<(&ResourceUnit, i64, f64)> = None;
        'units: for (unit, available) in feasible {
            let mut total = 0.0;
            for (scorer, weight) in &self.scorers {
                let score = scorer.score(ctx, instance, unit);
                if (score - INVALID_SCORE).abs() < f64::EPSILON {
                    debug!(unit_id = %unit.id, scorer = scorer.name(), "scorer excluded unit");
                    continue 'units;
                }
                total += score * weight;
            }
            let better = match &best {
                None => true,
                Some((best_unit, _, best_score)) => {
                    total > *best_score
                        || ((total - *best_score).abs() < f64::EPSILON
                            && unit.id < best_unit.id)
                }
            };
            if better {
                best = Some((unit, available, total));
            }
        }

        match best {
            None => ScheduleDecision::failed(Status::new(
                StatusCode::AffinityScheduleFailed,
                "no unit produced a valid score",
            )),
            Some((unit, available, score)) => {
                let dispatch_target = dispatch_target_of(root, unit);
                ScheduleDecision {
                    status: Status::ok(),
                    unit_id: unit.id.clone(),
                    owner_id: unit.owner_id.clone(),
                    dispatch_target,
                    available_for_request: available,
                    score,
                }
            }
        }
    }

    fn run_prefilters(
        &self,
        ctx: &mut PreAllocatedContext,
        instance: &InstanceInfo,
        root: &ResourceUnit,
    ) -> Result<Vec<String>, Status> {
        let mut candidates: Option<Vec<String>> = None;
        for prefilter in &self.prefilters {
            let result = prefilter.pre_filter(ctx, instance, root);
            if result.status.is_err() {
                return Err(result.status);
            }
            candidates = Some(match candidates {
                None => result.candidates,
                // Later prefilters narrow the candidate set.
                Some(existing) => {
                    result.candidates.into_iter().filter(|id| existing.contains(id)).collect()
                }
            });
        }
        Ok(candidates.unwrap_or_default())
    }

    fn run_filters(
        &self,
        ctx: &mut PreAllocatedContext,
        instance: &InstanceInfo,
        unit: &ResourceUnit,
    ) -> Result<i64, Filtered> {
        let mut available = -1;
        for filter in &self.filters {
            let filtered = filter.filter(ctx, instance, unit);
            if !filtered.is_ok() {
                debug!(
                    request_id = %instance.request_id,
                    unit_id = %unit.id,
                    filter = filter.name(),
                    status = %filtered.status,
                    "filter rejected unit"
                );
                return Err(filtered);
            }
            if filtered.available_for_request >= 0 {
                available = match available {
                    -1 => filtered.available_for_request,
                    current => current.min(filtered.available_for_request),
                };
            }
        }
        Ok(available)
    }
}

#[derive(Default)]
pub struct PluginRegistryBuilder {
    registry: PluginRegistry,
}

impl PluginRegistryBuilder {
    pub fn prefilter(mut self, plugin: Arc<dyn PreFilterPlugin>) -> Self {
        self.registry.prefilters.push(plugin);
        self
    }

    pub fn filter(mut self, plugin: Arc<dyn FilterPlugin>) -> Self {
        self.registry.filters.push(plugin);
        self
    }

    pub fn scorer(mut self, plugin: Arc<dyn ScorePlugin>, weight: f64) -> Self {
        self.registry.scorers.push((plugin, weight));
        self
    }

    pub fn build(self) -> PluginRegistry {
        self.registry
    }
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleDecision {
    pub status: Status,
    /// The selected unit (an agent on the local tier, possibly an
    /// agent deep below a local on the domain tier).
    pub unit_id: String,
    pub owner_id: String,
    /// Direct child of the scheduling root holding the selected unit;
    /// this is the underlayer the request is dispatched to.
    pub dispatch_target: String,
    pub available_for_request: i64,
    pub score: f64,
}

impl ScheduleDecision {
    pub fn failed(status: Status) -> Self {
        Self {
            status,
            unit_id: String::new(),
            owner_id: String::new(),
            dispatch_target: String::new(),
            available_for_request: -1,
            score: 0.0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

fn dispatch_target_of(root: &ResourceUnit, selected: &ResourceUnit) -> String {
    for (child_id, child) in &root.fragment {
        if child.find(&selected.id).is_some() {
            return child_id.clone();
        }
    }
    selected.id.clone()
}

/// Names of the compiled-in default pipeline given the tier flags
/// (diagnostic surface; the registry itself is already assembled).
pub fn default_pipeline_names(options: PipelineOptions) -> Vec<&'static str> {
    let affinity_filter = match (options.relaxed, options.root_level) {
        (true, true) => names::RELAXED_ROOT_LABEL_AFFINITY_FILTER,
        (true, false) => names::RELAXED_NON_ROOT_LABEL_AFFINITY_FILTER,
        (false, true) => names::STRICT_ROOT_LABEL_AFFINITY_FILTER,
        (false, false) => names::STRICT_NON_ROOT_LABEL_AFFINITY_FILTER,
    };
    let affinity_scorer = if options.relaxed {
        names::RELAXED_LABEL_AFFINITY_SCORER
    } else {
        names::STRICT_LABEL_AFFINITY_SCORER
    };
    vec![
        names::DEFAULT_PREFILTER,
        names::DEFAULT_FILTER,
        names::RESOURCE_SELECTOR_FILTER,
        names::DEFAULT_HETEROGENEOUS_FILTER,
        affinity_filter,
        names::DEFAULT_SCORER,
        names::DEFAULT_HETEROGENEOUS_SCORER,
        affinity_scorer,
    ]
}
