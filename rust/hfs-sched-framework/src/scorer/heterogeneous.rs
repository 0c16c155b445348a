//! Heterogeneous scorer: prefer units whose cards fit tightest.

use crate::context::PreAllocatedContext;
use crate::filter::heterogeneous::{hetero_requests, matching_free_cards};
use crate::framework::{ScorePlugin, INVALID_SCORE};
use crate::names;
use hfs_types::resource::EPSILON;
use hfs_types::{InstanceInfo, ResourceUnit};

pub struct DefaultHeterogeneousScorer;

impl ScorePlugin for DefaultHeterogeneousScorer {
    fn name(&self) -> &'static str {
        names::DEFAULT_HETEROGENEOUS_SCORER
    }

    /// Bin-packing bias: a card that would be left nearly full after
    /// placement scores low, a card filled tightly scores high, so
    /// fragments concentrate. Units without matching devices are
    /// excluded outright.
    fn score(
        &self,
        ctx: &mut PreAllocatedContext,
        instance: &InstanceInfo,
        unit: &ResourceUnit,
    ) -> f64 {
        let Ok(requests) = hetero_requests(instance) else {
            return INVALID_SCORE;
        };
        if requests.is_empty() {
            return 0.0;
        }

        let mut accumulated = 0.0;
        let mut counted = 0;
        for request in &requests {
            if request.per_card_mem.abs() < EPSILON {
                continue;
            }
            let Some(cards) = matching_free_cards(ctx, unit, &request.pattern) else {
                return INVALID_SCORE;
            };
            // Tightest feasible card decides the score of this entry.
            let best = cards
                .iter()
                .filter(|free| **free + EPSILON >= request.per_card_mem)
                .map(|free| (request.per_card_mem / free) * 100.0)
                .fold(None, |best: Option<f64>, score| {
                    Some(best.map_or(score, |b| b.max(score)))
                });
            match best {
                None => return INVALID_SCORE,
                Some(score) => {
                    accumulated += score;
                    counted += 1;
                }
            }
        }
        if counted == 0 {
            0.0
        } else {
            (accumulated / counted as f64).floor()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hfs_types::resource::ResourceValue;
    use hfs_types::Resources;

    fn npu_instance(per_card_mem: f64) -> InstanceInfo {
        InstanceInfo {
            resources: Resources::cpu_mem(100.0, 128.0).with(
                "NPU/Ascend910.*/memory",
                ResourceValue::Vector(vec![1.0, per_card_mem]),
            ),
            ..Default::default()
        }
    }

    fn npu_unit(id: &str, cards: Vec<f64>) -> ResourceUnit {
        ResourceUnit::new(id).with_capacity(
            Resources::cpu_mem(1000.0, 1024.0)
                .with("NPU/Ascend910", ResourceValue::Vector(cards)),
        )
    }

    #[test]
    fn tighter_fit_scores_higher() {
        let scorer = DefaultHeterogeneousScorer;
        let mut ctx = PreAllocatedContext::default();
        let tight = npu_unit("a", vec![20.0]);
        let roomy = npu_unit("b", vec![64.0]);
        let request = npu_instance(16.0);
        assert!(
            scorer.score(&mut ctx, &request, &tight) > scorer.score(&mut ctx, &request, &roomy)
        );
    }

    #[test]
    fn unit_without_matching_device_is_excluded() {
        let scorer = DefaultHeterogeneousScorer;
        let mut ctx = PreAllocatedContext::default();
        let plain =
            ResourceUnit::new("c").with_capacity(Resources::cpu_mem(1000.0, 1024.0));
        assert_eq!(scorer.score(&mut ctx, &npu_instance(16.0), &plain), INVALID_SCORE);
    }

    #[test]
    fn no_hetero_request_is_neutral() {
        let scorer = DefaultHeterogeneousScorer;
        let mut ctx = PreAllocatedContext::default();
        let instance = InstanceInfo {
            resources: Resources::cpu_mem(100.0, 128.0),
            ..Default::default()
        };
        assert_eq!(scorer.score(&mut ctx, &instance, &npu_unit("a", vec![32.0])), 0.0);
    }
}
