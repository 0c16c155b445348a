//! Lease-backed service registry: the node's bus-proxy presence.

use hfs_metastore::keys::KeyLayout;
use hfs_metastore::{MetaStorageAccessor, MetaStoreError};
use hfs_types::ProxyMeta;
use std::sync::Arc;
use tracing::info;

/// Publishes `{node, aid, ak}` under the bus-proxy prefix with a
/// short TTL; the accessor's keeper renews it and re-grants after a
/// lost lease. Absence of the key tells every observer the node is
/// gone.
pub struct ServiceRegistry {
    accessor: Arc<MetaStorageAccessor>,
    key: String,
    meta: ProxyMeta,
    ttl_secs: i64,
}

impl ServiceRegistry {
    pub fn new(
        accessor: Arc<MetaStorageAccessor>,
        layout: &KeyLayout,
        meta: ProxyMeta,
        ttl_secs: i64,
    ) -> Self {
        let key = layout.bus_proxy(&meta.node);
        Self { accessor, key, meta, ttl_secs }
    }

    pub async fn register(&self) -> Result<(), MetaStoreError> {
        let body = serde_json::to_string(&self.meta).expect("proxy meta serializes");
        self.accessor.put_with_lease(&self.key, &body, self.ttl_secs).await?;
        info!(node = %self.meta.node, key = %self.key, "bus proxy presence registered");
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), MetaStoreError> {
        info!(node = %self.meta.node, "bus proxy presence withdrawn");
        self.accessor.revoke(&self.key).await
    }
}
