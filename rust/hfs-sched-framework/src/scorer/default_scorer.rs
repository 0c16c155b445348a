//! Default scorer: prefer units that keep the most headroom.

use crate::context::PreAllocatedContext;
use crate::filter::is_heterogeneous_name;
use crate::framework::ScorePlugin;
use crate::names;
use hfs_types::resource::EPSILON;
use hfs_types::{InstanceInfo, ResourceUnit};
use tracing::debug;

pub struct DefaultScorer;

impl ScorePlugin for DefaultScorer {
    fn name(&self) -> &'static str {
        names::DEFAULT_SCORER
    }

    /// Per scalar kind: `floor((1 - requested/available) * 100)`,
    /// averaged over the kinds actually scored. Heterogeneous kinds
    /// are scored by the heterogeneous scorer, zero requests carry no
    /// signal, and kinds the unit lacks are skipped (a monopoly agent
    /// only advertises CPU and memory).
    fn score(
        &self,
        ctx: &mut PreAllocatedContext,
        instance: &InstanceInfo,
        unit: &ResourceUnit,
    ) -> f64 {
        let available = ctx.available_of(unit);
        let mut accumulated: i64 = 0;
        let mut counted: i64 = 0;
        for (name, requested) in &instance.resources.resources {
            if is_heterogeneous_name(name) {
                continue;
            }
            let Some(requested) = requested.scalar() else {
                continue;
            };
            if requested.abs() < EPSILON {
                continue;
            }
            let Some(free) = available.get_scalar(name) else {
                debug!(name, unit_id = %unit.id, "kind not present on unit, skipping score");
                continue;
            };
            if free.abs() < EPSILON {
                continue;
            }
            accumulated += ((1.0 - requested / free) * 100.0) as i64;
            counted += 1;
        }
        let score = if counted > 0 { accumulated / counted } else { accumulated };
        score as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hfs_types::Resources;

    fn instance(cpu: f64, mem: f64) -> InstanceInfo {
        InstanceInfo { resources: Resources::cpu_mem(cpu, mem), ..Default::default() }
    }

    #[test]
    fn emptier_unit_scores_higher() {
        let scorer = DefaultScorer;
        let mut ctx = PreAllocatedContext::default();
        let big = ResourceUnit::new("a").with_capacity(Resources::cpu_mem(2000.0, 2048.0));
        let small = ResourceUnit::new("b").with_capacity(Resources::cpu_mem(500.0, 512.0));
        let request = instance(250.0, 256.0);
        assert!(scorer.score(&mut ctx, &request, &big) > scorer.score(&mut ctx, &request, &small));
    }

    #[test]
    fn tentative_reservations_lower_the_score() {
        let scorer = DefaultScorer;
        let unit = ResourceUnit::new("a").with_capacity(Resources::cpu_mem(1000.0, 1024.0));
        let request = instance(250.0, 256.0);

        let mut fresh = PreAllocatedContext::default();
        let untouched = scorer.score(&mut fresh, &request, &unit);

        let mut loaded = PreAllocatedContext::default();
        loaded.reserve("a", &Resources::cpu_mem(500.0, 512.0), &Default::default());
        let after = scorer.score(&mut loaded, &request, &unit);
        assert!(after < untouched);
    }

    #[test]
    fn exact_fit_scores_zero() {
        let scorer = DefaultScorer;
        let mut ctx = PreAllocatedContext::default();
        let unit = ResourceUnit::new("a").with_capacity(Resources::cpu_mem(500.0, 512.0));
        assert_eq!(scorer.score(&mut ctx, &instance(500.0, 512.0), &unit), 0.0);
    }
}
