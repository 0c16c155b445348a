//! Label affinity scorer.
//!
//! The score of a unit is the sum over every scope of its selector
//! contributions: preferred and preferred-anti always count, required
//! selectors count when they carry `order_priority` (the ranking *is*
//! the preference). A unit failing a required selector scores 0
//! outright; an instance with no affinity at all gets the base score
//! so the default scorer decides.
//!
//! Strict scorers outside top-down mode return the theoretical
//! maximum for every unit — preferred scoring is deferred to the
//! tiers below, which see finer labels. The root-level scorer flips
//! `is_top_down_scheduling` after its pass so downstream strict
//! plugins start enforcing.

use crate::context::PreAllocatedContext;
use crate::framework::ScorePlugin;
use crate::names;
use crate::selector::{
    affinity_score, anti_affinity_score, is_affinity_priority, required_affinity_pass,
    required_anti_affinity_pass,
};
use crate::BASE_SCORE;
use hfs_types::plugin::affinity_context;
use hfs_types::resource::{merged_labels, LabelMap};
use hfs_types::{AffinityScope, AffinityTree, InstanceInfo, ResourceUnit, ScopedSelectors};

pub struct LabelAffinityScorer {
    relaxed: bool,
    root_level: bool,
}

impl LabelAffinityScorer {
    pub fn new(relaxed: bool, root_level: bool) -> Self {
        Self { relaxed, root_level }
    }

    /// Sum of the best weights of every selector the scorer would
    /// rank; what a perfectly-matching unit would score.
    fn theoretical_max(affinity: &AffinityTree) -> i64 {
        let scoped = |selectors: &ScopedSelectors| {
            let mut max = 0;
            if let Some(selector) = &selectors.preferred_affinity {
                max += selector.max_weight();
            }
            if let Some(selector) = &selectors.preferred_anti_affinity {
                max += selector.max_weight();
            }
            if let Some(selector) = &selectors.required_affinity {
                if is_affinity_priority(selector) {
                    max += selector.max_weight();
                }
            }
            if let Some(selector) = &selectors.required_anti_affinity {
                if is_affinity_priority(selector) {
                    max += selector.max_weight();
                }
            }
            max
        };
        let mut max = 0;
        if let Some(instance) = &affinity.instance {
            max += scoped(&instance.selectors);
        }
        if let Some(resource) = &affinity.resource {
            max += scoped(&resource.selectors);
        }
        if let Some(inner) = &affinity.inner {
            if let Some(preempt) = &inner.preempt {
                max += scoped(preempt);
            }
            if let Some(data) = &inner.data {
                if let Some(selector) = &data.preferred_affinity {
                    max += selector.max_weight();
                }
            }
            if let Some(grouplb) = &inner.grouplb {
                max += scoped(grouplb);
            }
        }
        max
    }

    /// Contribution of one scope. `None` means a required selector
    /// failed and the unit scores 0 overall.
    fn scoped_score(selectors: &ScopedSelectors, labels: &LabelMap) -> Option<i64> {
        if let Some(selector) = &selectors.required_affinity {
            if !required_affinity_pass(selector, labels) {
                return None;
            }
        }
        if let Some(selector) = &selectors.required_anti_affinity {
            if !required_anti_affinity_pass(selector, labels) {
                return None;
            }
        }
        let mut score = 0;
        if let Some(selector) = &selectors.preferred_affinity {
            score += affinity_score(selector, labels);
        }
        if let Some(selector) = &selectors.preferred_anti_affinity {
            score += anti_affinity_score(selector, labels);
        }
        if let Some(selector) = &selectors.required_affinity {
            if is_affinity_priority(selector) {
                score += affinity_score(selector, labels);
            }
        }
        if let Some(selector) = &selectors.required_anti_affinity {
            if is_affinity_priority(selector) {
                score += anti_affinity_score(selector, labels);
            }
        }
        Some(score)
    }

    fn total_score(
        ctx: &PreAllocatedContext,
        affinity: &AffinityTree,
        unit: &ResourceUnit,
    ) -> i64 {
        let unit_labels = merged_labels(
            &unit.node_labels,
            ctx.allocated_labels.get(&unit.id).unwrap_or(&LabelMap::new()),
        );
        let owner_labels =
            ctx.all_local_labels.get(&unit.owner_id).cloned().unwrap_or_default();

        let mut total = 0;
        if let Some(instance) = &affinity.instance {
            let labels = if instance.scope == AffinityScope::Node {
                &owner_labels
            } else {
                &unit_labels
            };
            match Self::scoped_score(&instance.selectors, labels) {
                None => return 0,
                Some(score) => total += score,
            }
        }
        if let Some(resource) = &affinity.resource {
            match Self::scoped_score(&resource.selectors, &unit.node_labels) {
                None => return 0,
                Some(score) => total += score,
            }
        }
        if let Some(inner) = &affinity.inner {
            if let Some(preempt) = &inner.preempt {
                if let Some(score) = Self::scoped_score(preempt, &owner_labels) {
                    total += score;
                }
            }
            if let Some(data) = &inner.data {
                if let Some(selector) = &data.preferred_affinity {
                    total += affinity_score(selector, &unit.node_labels);
                }
            }
            if let Some(grouplb) = &inner.grouplb {
                if let Some(score) = Self::scoped_score(grouplb, &unit_labels) {
                    total += score;
                }
            }
        }
        total
    }
}

impl ScorePlugin for LabelAffinityScorer {
    fn name(&self) -> &'static str {
        if self.relaxed {
            names::RELAXED_LABEL_AFFINITY_SCORER
        } else {
            names::STRICT_LABEL_AFFINITY_SCORER
        }
    }

    fn score(
        &self,
        ctx: &mut PreAllocatedContext,
        instance: &InstanceInfo,
        unit: &ResourceUnit,
    ) -> f64 {
        let top_down = ctx.is_top_down_scheduling();
        if self.root_level {
            // The root pass commits the request to top-down flow;
            // strict plugins below now enforce optimality.
            affinity_context(&mut ctx.plugin_context).is_top_down_scheduling = true;
        }

        let Some(affinity) = instance.schedule_option.affinity.clone() else {
            return BASE_SCORE;
        };
        if affinity.is_empty() {
            return BASE_SCORE;
        }

        let score = if !self.relaxed && !top_down {
            // Preferred scoring deferred: every unit looks equally
            // good at this tier.
            Self::theoretical_max(&affinity)
        } else {
            Self::total_score(ctx, &affinity, unit)
        };

        affinity_context(&mut ctx.plugin_context)
            .scheduled_score
            .insert(unit.id.clone(), score);
        score as f64
    }
}
