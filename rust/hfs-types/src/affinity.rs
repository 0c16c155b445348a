//! Affinity selector trees.
//!
//! A selector is a condition over unit labels: one or more
//! subconditions, each a conjunction of label expressions with a
//! weight. Subconditions combine by maximum — the selector scores the
//! best-matching subcondition. With `order_priority` the subconditions
//! are a preference ranking and their nominal weights are re-ranked
//! (first 100, next 90, ...) before any scoring.

use serde::{Deserialize, Serialize};

/// Weight assigned to the first subcondition under order-priority
/// re-ranking; each following subcondition steps down by
/// [`PRIORITY_WEIGHT_STEP`].
pub const PRIORITY_TOP_WEIGHT: i64 = 100;
pub const PRIORITY_WEIGHT_STEP: i64 = 10;
/// Default weight of a subcondition without explicit configuration.
pub const DEFAULT_SUBCONDITION_WEIGHT: i64 = 100;

/// Operation of a single label expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelOp {
    Exist,
    NotExist,
    In(Vec<String>),
    NotIn(Vec<String>),
}

/// One label expression, matched against a unit's label counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelExpression {
    pub key: String,
    pub op: LabelOp,
}

impl LabelExpression {
    pub fn exist(key: impl Into<String>) -> Self {
        Self { key: key.into(), op: LabelOp::Exist }
    }

    pub fn not_exist(key: impl Into<String>) -> Self {
        Self { key: key.into(), op: LabelOp::NotExist }
    }

    pub fn is_in(key: impl Into<String>, values: Vec<String>) -> Self {
        Self { key: key.into(), op: LabelOp::In(values) }
    }

    pub fn not_in(key: impl Into<String>, values: Vec<String>) -> Self {
        Self { key: key.into(), op: LabelOp::NotIn(values) }
    }
}

/// Conjunction of expressions plus its scoring weight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubCondition {
    pub expressions: Vec<LabelExpression>,
    pub weight: i64,
}

impl SubCondition {
    pub fn new(expressions: Vec<LabelExpression>) -> Self {
        Self { expressions, weight: DEFAULT_SUBCONDITION_WEIGHT }
    }

    pub fn with_weight(mut self, weight: i64) -> Self {
        self.weight = weight;
        self
    }
}

/// The selector tree evaluated per scope.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Selector {
    pub sub_conditions: Vec<SubCondition>,
    pub order_priority: bool,
}

impl Selector {
    pub fn new(order_priority: bool, sub_conditions: Vec<SubCondition>) -> Self {
        Self { sub_conditions, order_priority }
    }

    pub fn is_empty(&self) -> bool {
        self.sub_conditions.is_empty()
    }

    /// Effective weight of subcondition `idx` after order-priority
    /// re-ranking.
    pub fn effective_weight(&self, idx: usize) -> i64 {
        if self.order_priority {
            (PRIORITY_TOP_WEIGHT - PRIORITY_WEIGHT_STEP * idx as i64).max(0)
        } else {
            self.sub_conditions[idx].weight
        }
    }

    /// The theoretical best score of this selector: the effective
    /// weight of the first subcondition; empty selectors score 0.
    pub fn max_weight(&self) -> i64 {
        if self.sub_conditions.is_empty() {
            0
        } else {
            self.effective_weight(0)
        }
    }
}

/// Which label set an instance-scope selector is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AffinityScope {
    /// Labels of the candidate agent plus tentative allocations on it.
    #[default]
    Pod,
    /// Aggregated labels of the node owning the candidate agent.
    Node,
}

/// The four selector slots shared by most scopes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScopedSelectors {
    pub required_affinity: Option<Selector>,
    pub required_anti_affinity: Option<Selector>,
    pub preferred_affinity: Option<Selector>,
    pub preferred_anti_affinity: Option<Selector>,
}

impl ScopedSelectors {
    pub fn has_required(&self) -> bool {
        self.required_affinity.is_some() || self.required_anti_affinity.is_some()
    }

    pub fn has_preferred(&self) -> bool {
        self.preferred_affinity.is_some() || self.preferred_anti_affinity.is_some()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_required() && !self.has_preferred()
    }
}

/// Instance scope: selectors plus where to evaluate them.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InstanceAffinity {
    pub scope: AffinityScope,
    #[serde(flatten)]
    pub selectors: ScopedSelectors,
}

/// Resource scope: evaluated against the unit's own labels only.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceAffinity {
    #[serde(flatten)]
    pub selectors: ScopedSelectors,
}

/// Required selectors of one pending resource; candidate units that
/// satisfy them are held back for the pending instance.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PendingResource {
    pub required_affinity: Option<Selector>,
    pub required_anti_affinity: Option<Selector>,
}

/// Scheduler-internal scopes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InnerAffinity {
    /// Preferred-only: steer toward preemptible capacity.
    pub preempt: Option<ScopedSelectors>,
    /// Preferred-only: steer toward data locality.
    pub data: Option<ScopedSelectors>,
    /// Required-only: resource-group placement.
    pub rgroup: Option<ScopedSelectors>,
    /// Group load-balancing: spread via required-anti, pack via
    /// preferred.
    pub grouplb: Option<ScopedSelectors>,
    /// Resources reserved for instances scheduled later.
    pub pending: Vec<PendingResource>,
}

impl InnerAffinity {
    pub fn is_empty(&self) -> bool {
        self.preempt.is_none()
            && self.data.is_none()
            && self.rgroup.is_none()
            && self.grouplb.is_none()
            && self.pending.is_empty()
    }
}

/// The full affinity tree of one schedule option.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AffinityTree {
    pub instance: Option<InstanceAffinity>,
    pub resource: Option<ResourceAffinity>,
    pub inner: Option<InnerAffinity>,
}

impl AffinityTree {
    pub fn is_empty(&self) -> bool {
        self.instance.as_ref().is_none_or(|a| a.selectors.is_empty())
            && self.resource.as_ref().is_none_or(|a| a.selectors.is_empty())
            && self.inner.as_ref().is_none_or(InnerAffinity::is_empty)
    }
}
