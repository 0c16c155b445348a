//! Heterogeneous (vector resource) filter.
//!
//! A heterogeneous request is named `NPU/<regex>/<key>` and carries a
//! `Vector([count, per_card_mem])` value: `count` whole cards (or a
//! fraction of one card) each needing `per_card_mem` free memory. The
//! regex matches vector resources of the unit (`NPU/Ascend910`,
//! `NPU/Ascend910B4`, ...) and is anchored implicitly; a pattern that
//! tries to anchor itself with `^` never matches.

use super::is_heterogeneous_name;
use crate::context::PreAllocatedContext;
use crate::framework::{FilterPlugin, Filtered};
use crate::names;
use hfs_types::resource::{ResourceValue, EPSILON};
use hfs_types::{InstanceInfo, ResourceUnit, StatusCode};
use tracing::debug;

pub struct DefaultHeterogeneousFilter;

/// Decoded form of one heterogeneous request entry.
pub(crate) struct HeteroRequest {
    pub pattern: String,
    pub count: f64,
    pub per_card_mem: f64,
}

/// Decode the heterogeneous entries out of a request; `None` when a
/// heterogeneous name carries a malformed value.
pub(crate) fn hetero_requests(instance: &InstanceInfo) -> Result<Vec<HeteroRequest>, String> {
    let mut requests = Vec::new();
    for (name, value) in &instance.resources.resources {
        if !is_heterogeneous_name(name) {
            continue;
        }
        let mut fields = name.splitn(3, '/');
        let family = fields.next().unwrap_or_default();
        let pattern = fields.next().unwrap_or_default();
        let ResourceValue::Vector(parts) = value else {
            return Err(format!("{name}: heterogeneous request must be a vector"));
        };
        let [count, per_card_mem] = parts.as_slice() else {
            return Err(format!("{name}: expected [count, per_card_mem]"));
        };
        requests.push(HeteroRequest {
            pattern: format!("{family}/{pattern}"),
            count: *count,
            per_card_mem: *per_card_mem,
        });
    }
    Ok(requests)
}

/// Cards of every matching vector resource with their free memory
/// after this attempt's tentative reservations.
pub(crate) fn matching_free_cards(
    ctx: &PreAllocatedContext,
    unit: &ResourceUnit,
    pattern: &str,
) -> Option<Vec<f64>> {
    // Anchored; a caller-supplied '^' can never match a resource name.
    let regex = regex::Regex::new(&format!("^{pattern}$")).ok()?;
    let available = ctx.available_of(unit);
    let mut cards = Vec::new();
    let mut matched = false;
    for (name, value) in &available.resources {
        let ResourceValue::Vector(free) = value else {
            continue;
        };
        if !regex.is_match(name) {
            continue;
        }
        matched = true;
        cards.extend(free.iter().copied());
    }
    matched.then_some(cards)
}

impl FilterPlugin for DefaultHeterogeneousFilter {
    fn name(&self) -> &'static str {
        names::DEFAULT_HETEROGENEOUS_FILTER
    }

    fn filter(
        &self,
        ctx: &mut PreAllocatedContext,
        instance: &InstanceInfo,
        unit: &ResourceUnit,
    ) -> Filtered {
        let requests = match hetero_requests(instance) {
            Ok(requests) => requests,
            Err(message) => {
                // A malformed request can never succeed anywhere.
                return Filtered::fatal(StatusCode::ParameterError, message);
            }
        };
        if requests.is_empty() {
            return Filtered::ok();
        }

        let mut slots = i64::MAX;
        for request in &requests {
            let fractional = (request.count.fract()).abs() > EPSILON;
            if fractional && request.count > 1.0 + EPSILON {
                return Filtered::fatal(
                    StatusCode::ParameterError,
                    format!("fractional card count {} exceeds one card", request.count),
                );
            }
            if request.count < EPSILON {
                continue;
            }
            let Some(cards) = matching_free_cards(ctx, unit, &request.pattern) else {
                debug!(
                    request_id = %instance.request_id,
                    unit_id = %unit.id,
                    pattern = %request.pattern,
                    "no vector resource matches pattern"
                );
                return Filtered {
                    available_for_request: 0,
                    ..Filtered::fail(
                        StatusCode::HeterogeneousScheduleFailed,
                        format!("no device matches {}", request.pattern),
                    )
                };
            };
            let feasible = cards
                .iter()
                .filter(|free| **free + EPSILON >= request.per_card_mem)
                .count() as i64;
            let needed = if fractional { 1 } else { request.count as i64 };
            if feasible < needed {
                return Filtered {
                    available_for_request: 0,
                    ..Filtered::fail(
                        StatusCode::HeterogeneousScheduleFailed,
                        format!(
                            "need {} card(s) with {}MB free on {}, found {}",
                            needed, request.per_card_mem as i64, request.pattern, feasible
                        ),
                    )
                };
            }
            slots = slots.min(feasible / needed);
        }
        if slots == i64::MAX {
            Filtered::ok()
        } else {
            Filtered::ok_with_available(slots)
        }
    }
}
