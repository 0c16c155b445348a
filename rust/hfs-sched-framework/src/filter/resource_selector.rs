//! Resource selector filter: label/value requirements a unit must
//! advertise.

use crate::context::PreAllocatedContext;
use crate::framework::{FilterPlugin, Filtered};
use crate::names;
use hfs_types::{InstanceInfo, ResourceUnit, StatusCode, DEFAULT_OWNER_VALUE, RESOURCE_OWNER_KEY};
use tracing::debug;

pub struct ResourceSelectorFilter;

impl FilterPlugin for ResourceSelectorFilter {
    fn name(&self) -> &'static str {
        names::RESOURCE_SELECTOR_FILTER
    }

    fn filter(
        &self,
        _ctx: &mut PreAllocatedContext,
        instance: &InstanceInfo,
        unit: &ResourceUnit,
    ) -> Filtered {
        let selector = &instance.schedule_option.resource_selector;
        if selector.is_empty() {
            return Filtered::ok();
        }
        for (label, required_value) in selector {
            let default_owner =
                label == RESOURCE_OWNER_KEY && required_value == DEFAULT_OWNER_VALUE;
            match unit.node_labels.get(label) {
                // The default owner may land on unlabelled resources.
                None if default_owner => continue,
                None => {
                    debug!(
                        request_id = %instance.request_id,
                        unit_id = %unit.id,
                        label, "resource selector label missing"
                    );
                    return Filtered::fail(
                        StatusCode::ResourceNotEnough,
                        "Resource Require Label Not Found",
                    );
                }
                Some(counter) if !counter.contains(required_value) => {
                    debug!(
                        request_id = %instance.request_id,
                        unit_id = %unit.id,
                        label, required_value, "resource selector value missing"
                    );
                    return Filtered::fail(
                        StatusCode::ResourceNotEnough,
                        "Resource Require Value Not Found",
                    );
                }
                Some(_) => {}
            }
        }
        Filtered::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hfs_types::resource::ValueCounter;
    use hfs_types::Resources;

    fn instance_with_selector(pairs: &[(&str, &str)]) -> InstanceInfo {
        let mut instance = InstanceInfo {
            request_id: "req-1".into(),
            resources: Resources::cpu_mem(100.0, 128.0),
            ..Default::default()
        };
        for (label, value) in pairs {
            instance
                .schedule_option
                .resource_selector
                .insert(label.to_string(), value.to_string());
        }
        instance
    }

    fn unit_with_labels(pairs: &[(&str, &str)]) -> ResourceUnit {
        let labels = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), ValueCounter::single(*value)))
            .collect();
        ResourceUnit::new("agent-1")
            .with_capacity(Resources::cpu_mem(1000.0, 1024.0))
            .with_labels(labels)
    }

    #[test]
    fn empty_selector_passes() {
        let mut ctx = PreAllocatedContext::default();
        let res = ResourceSelectorFilter.filter(
            &mut ctx,
            &instance_with_selector(&[]),
            &unit_with_labels(&[]),
        );
        assert!(res.is_ok());
        assert_eq!(res.available_for_request, -1);
    }

    #[test]
    fn missing_label_fails() {
        let mut ctx = PreAllocatedContext::default();
        let res = ResourceSelectorFilter.filter(
            &mut ctx,
            &instance_with_selector(&[("pool", "gold")]),
            &unit_with_labels(&[]),
        );
        assert_eq!(res.status.code, StatusCode::ResourceNotEnough);
        assert_eq!(res.status.message, "Resource Require Label Not Found");
    }

    #[test]
    fn missing_value_fails() {
        let mut ctx = PreAllocatedContext::default();
        let res = ResourceSelectorFilter.filter(
            &mut ctx,
            &instance_with_selector(&[("pool", "gold")]),
            &unit_with_labels(&[("pool", "silver")]),
        );
        assert_eq!(res.status.message, "Resource Require Value Not Found");
    }

    #[test]
    fn default_owner_passes_on_unlabelled_unit() {
        let mut ctx = PreAllocatedContext::default();
        let res = ResourceSelectorFilter.filter(
            &mut ctx,
            &instance_with_selector(&[(RESOURCE_OWNER_KEY, DEFAULT_OWNER_VALUE)]),
            &unit_with_labels(&[]),
        );
        assert!(res.is_ok());
    }

    #[test]
    fn matching_value_passes() {
        let mut ctx = PreAllocatedContext::default();
        let res = ResourceSelectorFilter.filter(
            &mut ctx,
            &instance_with_selector(&[("pool", "gold")]),
            &unit_with_labels(&[("pool", "gold")]),
        );
        assert!(res.is_ok());
    }
}
