//! Selector evaluation: matching, filtering and scoring.

use hfs_types::resource::LabelMap;
use hfs_types::{LabelExpression, LabelOp, Selector, SubCondition};

/// Does one expression hold against the label counters?
pub fn expression_matches(expression: &LabelExpression, labels: &LabelMap) -> bool {
    let counter = labels.get(&expression.key);
    match &expression.op {
        LabelOp::Exist => counter.is_some_and(|c| !c.is_empty()),
        LabelOp::NotExist => counter.is_none_or(|c| c.is_empty()),
        LabelOp::In(values) => {
            counter.is_some_and(|c| values.iter().any(|value| c.contains(value)))
        }
        LabelOp::NotIn(values) => {
            counter.is_none_or(|c| !values.iter().any(|value| c.contains(value)))
        }
    }
}

/// A subcondition holds when every expression in it holds.
pub fn subcondition_matches(sub: &SubCondition, labels: &LabelMap) -> bool {
    sub.expressions.iter().all(|expression| expression_matches(expression, labels))
}

/// `order_priority` selectors are preference rankings: the strongest
/// matching subcondition must also be the optimal one before the
/// selector counts as fully met.
pub fn is_affinity_priority(selector: &Selector) -> bool {
    selector.order_priority
}

/// Required affinity: at least one subcondition fully satisfied.
/// An empty subcondition list passes, and so does an empty label map
/// (nothing is known about the unit yet, nothing can contradict it).
pub fn required_affinity_pass(selector: &Selector, labels: &LabelMap) -> bool {
    if selector.sub_conditions.is_empty() || labels.is_empty() {
        return true;
    }
    selector.sub_conditions.iter().any(|sub| subcondition_matches(sub, labels))
}

/// Required anti-affinity: no subcondition fully satisfied.
pub fn required_anti_affinity_pass(selector: &Selector, labels: &LabelMap) -> bool {
    !selector.sub_conditions.iter().any(|sub| subcondition_matches(sub, labels))
}

/// Affinity score: the best effective weight over satisfied
/// subconditions; 0 when none matches. An empty label map scores the
/// theoretical maximum (vacuously best).
pub fn affinity_score(selector: &Selector, labels: &LabelMap) -> i64 {
    if selector.sub_conditions.is_empty() {
        return 0;
    }
    if labels.is_empty() {
        return selector.max_weight();
    }
    selector
        .sub_conditions
        .iter()
        .enumerate()
        .filter(|(_, sub)| subcondition_matches(sub, labels))
        .map(|(idx, _)| selector.effective_weight(idx))
        .max()
        .unwrap_or(0)
}

/// Anti-affinity score: full weight when nothing matches, 0 otherwise.
/// An empty label map scores 0 — nothing is known about the unit, so
/// it earns no avoidance credit.
pub fn anti_affinity_score(selector: &Selector, labels: &LabelMap) -> i64 {
    if selector.sub_conditions.is_empty() || labels.is_empty() {
        return 0;
    }
    if selector.sub_conditions.iter().any(|sub| subcondition_matches(sub, labels)) {
        0
    } else {
        selector.max_weight()
    }
}

/// Does the unit reach the selector's theoretical best score?
pub fn meets_optimal(selector: &Selector, labels: &LabelMap, anti: bool) -> bool {
    if selector.sub_conditions.is_empty() {
        return true;
    }
    let score =
        if anti { anti_affinity_score(selector, labels) } else { affinity_score(selector, labels) };
    score == selector.max_weight()
}

/// Compact human-readable rendering used in `Filtered::required`.
pub fn describe(selector: &Selector) -> String {
    let subs: Vec<String> = selector
        .sub_conditions
        .iter()
        .enumerate()
        .map(|(idx, sub)| {
            let exprs: Vec<String> = sub
                .expressions
                .iter()
                .map(|expression| match &expression.op {
                    LabelOp::Exist => format!("Exist({})", expression.key),
                    LabelOp::NotExist => format!("NotExist({})", expression.key),
                    LabelOp::In(values) => format!("In({}, {:?})", expression.key, values),
                    LabelOp::NotIn(values) => format!("NotIn({}, {:?})", expression.key, values),
                })
                .collect();
            format!("{{{} weight: {}}}", exprs.join(" && "), selector.effective_weight(idx))
        })
        .collect();
    format!(
        "{{ subConditions: [{}]{} }}",
        subs.join(", "),
        if selector.order_priority { " orderPriority: true" } else { "" }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use hfs_types::resource::ValueCounter;

    fn labels(pairs: &[(&str, &str)]) -> LabelMap {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), ValueCounter::single(*value)))
            .collect()
    }

    fn exist_selector(priority: bool, keys: &[&str]) -> Selector {
        Selector::new(
            priority,
            keys.iter()
                .map(|key| SubCondition::new(vec![LabelExpression::exist(*key)]))
                .collect(),
        )
    }

    #[test]
    fn expressions_cover_all_ops() {
        let unit_labels = labels(&[("zone", "az1")]);
        assert!(expression_matches(&LabelExpression::exist("zone"), &unit_labels));
        assert!(!expression_matches(&LabelExpression::exist("rack"), &unit_labels));
        assert!(expression_matches(&LabelExpression::not_exist("rack"), &unit_labels));
        assert!(expression_matches(
            &LabelExpression::is_in("zone", vec!["az1".into(), "az2".into()]),
            &unit_labels
        ));
        assert!(!expression_matches(
            &LabelExpression::is_in("zone", vec!["az9".into()]),
            &unit_labels
        ));
        assert!(expression_matches(
            &LabelExpression::not_in("zone", vec!["az9".into()]),
            &unit_labels
        ));
    }

    #[test]
    fn required_affinity_needs_one_subcondition() {
        let selector = exist_selector(false, &["key1", "key2"]);
        assert!(required_affinity_pass(&selector, &labels(&[("key1", "v")])));
        assert!(required_affinity_pass(&selector, &labels(&[("key2", "v")])));
        assert!(!required_affinity_pass(&selector, &labels(&[("key3", "v")])));
    }

    #[test]
    fn required_affinity_empty_cases_pass() {
        let empty = Selector::default();
        assert!(required_affinity_pass(&empty, &labels(&[("key3", "v")])));
        let selector = exist_selector(false, &["key1"]);
        assert!(required_affinity_pass(&selector, &LabelMap::new()));
    }

    #[test]
    fn anti_affinity_rejects_any_match() {
        let selector = exist_selector(false, &["bad"]);
        assert!(required_anti_affinity_pass(&selector, &labels(&[("good", "v")])));
        assert!(!required_anti_affinity_pass(&selector, &labels(&[("bad", "v")])));
    }

    #[test]
    fn scoring_with_priority_reranks() {
        let selector = exist_selector(true, &["key1", "key2"]);
        assert_eq!(affinity_score(&selector, &labels(&[("key1", "v")])), 100);
        assert_eq!(affinity_score(&selector, &labels(&[("key2", "v")])), 90);
        assert_eq!(affinity_score(&selector, &labels(&[("key3", "v")])), 0);
        // both match: max wins
        assert_eq!(
            affinity_score(&selector, &labels(&[("key1", "v"), ("key2", "v")])),
            100
        );
    }

    #[test]
    fn anti_scoring_is_all_or_nothing() {
        let selector = exist_selector(true, &["key3"]);
        assert_eq!(anti_affinity_score(&selector, &labels(&[("key1", "v")])), 100);
        assert_eq!(anti_affinity_score(&selector, &labels(&[("key3", "v")])), 0);
        // unknown labels earn no avoidance credit
        assert_eq!(anti_affinity_score(&selector, &LabelMap::new()), 0);
    }

    #[test]
    fn optimality_requires_top_weight() {
        let selector = exist_selector(true, &["key1", "key2"]);
        assert!(meets_optimal(&selector, &labels(&[("key1", "v")]), false));
        assert!(!meets_optimal(&selector, &labels(&[("key2", "v")]), false));
        assert!(meets_optimal(&Selector::default(), &labels(&[]), false));
    }
}
