//! Listener traits attached by higher tiers.

use hfs_types::InstanceInfo;

/// Notified on instance cache changes. Implementations must be cheap;
/// they run on the observer's event path.
pub trait InstanceListener: Send + Sync {
    fn notify_update_instance(&self, instance_id: &str, info: &InstanceInfo, is_force_update: bool);
    fn notify_delete_instance(&self, instance_id: &str);
}

/// Per-tenant instance event.
#[derive(Debug, Clone, PartialEq)]
pub struct TenantEvent {
    pub tenant_id: String,
    pub instance_id: String,
    pub info: Option<InstanceInfo>,
}

/// Notified on tenant-scoped instance changes.
pub trait TenantListener: Send + Sync {
    fn notify_update_tenant_instance(&self, event: &TenantEvent);
    fn notify_delete_tenant_instance(&self, event: &TenantEvent);
}
