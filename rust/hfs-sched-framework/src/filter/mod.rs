//! Filter plugins.

pub mod default_filter;
pub mod heterogeneous;
pub mod label_affinity;
pub mod resource_selector;

use hfs_types::resource::HETERO_RESOURCE_FIELD_NUM;

/// Heterogeneous request names have the shape `NPU/<regex>/<key>`;
/// the default filter and scorer skip them.
pub(crate) fn is_heterogeneous_name(name: &str) -> bool {
    name.split('/').count() == HETERO_RESOURCE_FIELD_NUM
}

/// Render a requirement the way operators read it: CPU in millicores,
/// memory in MB, anything else as a bare amount.
pub(crate) fn format_required(name: &str, value: f64) -> String {
    match name {
        hfs_types::resource::CPU_RESOURCE_NAME => format!("{}: {}m", name, value as i64),
        hfs_types::resource::MEMORY_RESOURCE_NAME => format!("{}: {}MB", name, value as i64),
        _ => format!("{}: {}", name, value as i64),
    }
}
