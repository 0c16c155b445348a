//! Resource amounts and label counters.
//!
//! Scalar resources (CPU millicores, memory MB) and vector resources
//! (per-card accelerator memory) share one value type. Labels are
//! counted, not flat: the same label key may recur with multiplicity
//! across the instances packed onto a unit, so a label maps to a
//! counter over its values.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Well-known scalar resource names.
pub const CPU_RESOURCE_NAME: &str = "CPU";
pub const MEMORY_RESOURCE_NAME: &str = "Memory";
/// Prefix of heterogeneous (vector) resource names, `NPU/<model>`.
pub const NPU_RESOURCE_PREFIX: &str = "NPU";
/// A heterogeneous request name has the shape `NPU/<regex>/<key>`.
pub const HETERO_RESOURCE_FIELD_NUM: usize = 3;

/// Comparison slack for scalar amounts.
pub const EPSILON: f64 = 1e-9;

/// A scalar amount or a per-card vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum ResourceValue {
    Scalar(f64),
    Vector(Vec<f64>),
}

impl ResourceValue {
    pub fn scalar(&self) -> Option<f64> {
        match self {
            ResourceValue::Scalar(v) => Some(*v),
            ResourceValue::Vector(_) => None,
        }
    }

    pub fn vector(&self) -> Option<&[f64]> {
        match self {
            ResourceValue::Scalar(_) => None,
            ResourceValue::Vector(v) => Some(v),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            ResourceValue::Scalar(v) => v.abs() < EPSILON,
            ResourceValue::Vector(v) => v.iter().all(|c| c.abs() < EPSILON),
        }
    }
}

/// Named resource amounts. Ordered map so serialised forms are
/// deterministic.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Resources {
    pub resources: BTreeMap<String, ResourceValue>,
}

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor for the common CPU/memory pair.
    pub fn cpu_mem(cpu: f64, mem: f64) -> Self {
        let mut resources = BTreeMap::new();
        resources.insert(CPU_RESOURCE_NAME.to_string(), ResourceValue::Scalar(cpu));
        resources.insert(MEMORY_RESOURCE_NAME.to_string(), ResourceValue::Scalar(mem));
        Self { resources }
    }

    pub fn with(mut self, name: impl Into<String>, value: ResourceValue) -> Self {
        self.resources.insert(name.into(), value);
        self
    }

    pub fn get_scalar(&self, name: &str) -> Option<f64> {
        self.resources.get(name).and_then(ResourceValue::scalar)
    }

    pub fn cpu(&self) -> Option<f64> {
        self.get_scalar(CPU_RESOURCE_NAME)
    }

    pub fn mem(&self) -> Option<f64> {
        self.get_scalar(MEMORY_RESOURCE_NAME)
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// A request is valid when every amount is finite and non-negative
    /// (vector cards individually so).
    pub fn is_valid(&self) -> bool {
        self.resources.values().all(|v| match v {
            ResourceValue::Scalar(s) => s.is_finite() && *s >= 0.0,
            ResourceValue::Vector(cards) => cards.iter().all(|c| c.is_finite() && *c >= 0.0),
        })
    }

    /// Element-wise addition; vector values are added per card, with the
    /// shorter side padded with zeros.
    pub fn add(&mut self, other: &Resources) {
        for (name, value) in &other.resources {
            match self.resources.get_mut(name) {
                None => {
                    self.resources.insert(name.clone(), value.clone());
                }
                Some(ResourceValue::Scalar(mine)) => {
                    if let ResourceValue::Scalar(theirs) = value {
                        *mine += theirs;
                    }
                }
                Some(ResourceValue::Vector(mine)) => {
                    if let ResourceValue::Vector(theirs) = value {
                        if mine.len() < theirs.len() {
                            mine.resize(theirs.len(), 0.0);
                        }
                        for (i, card) in theirs.iter().enumerate() {
                            mine[i] += card;
                        }
                    }
                }
            }
        }
    }

    /// Element-wise subtraction. Missing names are treated as zero on
    /// the right-hand side.
    pub fn sub(&mut self, other: &Resources) {
        let negated = other.negated();
        self.add(&negated);
    }

    /// The same amounts with each value negated; used to encode
    /// "release" deltas.
    pub fn negated(&self) -> Resources {
        let resources = self
            .resources
            .iter()
            .map(|(name, value)| {
                let value = match value {
                    ResourceValue::Scalar(v) => ResourceValue::Scalar(-v),
                    ResourceValue::Vector(cards) => {
                        ResourceValue::Vector(cards.iter().map(|c| -c).collect())
                    }
                };
                (name.clone(), value)
            })
            .collect();
        Resources { resources }
    }

    /// True when every amount in `self` is >= the matching amount in
    /// `other` (elementwise, vectors per card).
    pub fn covers(&self, other: &Resources) -> bool {
        other.resources.iter().all(|(name, req)| match (self.resources.get(name), req) {
            (Some(ResourceValue::Scalar(have)), ResourceValue::Scalar(want)) => {
                *have + EPSILON >= *want
            }
            (Some(ResourceValue::Vector(have)), ResourceValue::Vector(want)) => {
                want.iter().enumerate().all(|(i, w)| {
                    have.get(i).copied().unwrap_or(0.0) + EPSILON >= *w
                })
            }
            (_, v) if v.is_empty() => true,
            _ => false,
        })
    }
}

/// Counter over the values a label key was observed with.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValueCounter {
    pub items: BTreeMap<String, i64>,
}

impl ValueCounter {
    pub fn single(value: impl Into<String>) -> Self {
        let mut items = BTreeMap::new();
        items.insert(value.into(), 1);
        Self { items }
    }

    pub fn contains(&self, value: &str) -> bool {
        self.items.get(value).is_some_and(|count| *count > 0)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Labels of a unit: key -> counter over values. Counters merge by
/// semantic addition and entries that reach zero are dropped.
pub type LabelMap = BTreeMap<String, ValueCounter>;

/// Merge `delta` into `labels`; negative counts subtract and exhausted
/// entries are removed so counters stay non-negative and minimal.
pub fn merge_labels(labels: &mut LabelMap, delta: &LabelMap) {
    for (key, counter) in delta {
        let entry = labels.entry(key.clone()).or_default();
        for (value, count) in &counter.items {
            let slot = entry.items.entry(value.clone()).or_insert(0);
            *slot += count;
            if *slot <= 0 {
                entry.items.remove(value);
            }
        }
        if entry.items.is_empty() {
            labels.remove(key);
        }
    }
}

/// The union of two label maps, leaving both inputs untouched.
pub fn merged_labels(a: &LabelMap, b: &LabelMap) -> LabelMap {
    let mut out = a.clone();
    merge_labels(&mut out, b);
    out
}

/// Negate every counter in `labels`; used to roll labels back.
pub fn negated_labels(labels: &LabelMap) -> LabelMap {
    labels
        .iter()
        .map(|(key, counter)| {
            let items = counter.items.iter().map(|(v, c)| (v.clone(), -c)).collect();
            (key.clone(), ValueCounter { items })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covers_checks_elementwise() {
        let have = Resources::cpu_mem(1000.0, 1024.0);
        let want = Resources::cpu_mem(500.0, 512.0);
        assert!(have.covers(&want));
        assert!(!want.covers(&have));
    }

    #[test]
    fn covers_handles_vectors_per_card() {
        let have = Resources::new()
            .with("NPU/Ascend910", ResourceValue::Vector(vec![32.0, 16.0]));
        let want = Resources::new()
            .with("NPU/Ascend910", ResourceValue::Vector(vec![16.0, 16.0]));
        assert!(have.covers(&want));
        let too_much = Resources::new()
            .with("NPU/Ascend910", ResourceValue::Vector(vec![16.0, 32.0]));
        assert!(!have.covers(&too_much));
    }

    #[test]
    fn sub_then_add_round_trips() {
        let mut base = Resources::cpu_mem(1000.0, 1024.0);
        let req = Resources::cpu_mem(300.0, 256.0);
        base.sub(&req);
        assert_eq!(base.cpu(), Some(700.0));
        base.add(&req);
        assert_eq!(base.cpu(), Some(1000.0));
        assert_eq!(base.mem(), Some(1024.0));
    }

    #[test]
    fn label_counters_drop_at_zero() {
        let mut labels = LabelMap::new();
        let delta: LabelMap =
            [("zone".to_string(), ValueCounter::single("az1"))].into_iter().collect();
        merge_labels(&mut labels, &delta);
        assert!(labels["zone"].contains("az1"));

        merge_labels(&mut labels, &negated_labels(&delta));
        assert!(labels.is_empty());
    }
}
