//! Storage accessor: the convenience layer every component talks to.
//!
//! Wraps a [`MetaStoreClient`] with typed helpers and owns the lease
//! keeper: `put_with_lease` grants a lease, publishes the value under
//! it and then keeps it alive every TTL/4. A keep-alive answering with
//! ttl 0 means the lease is gone — the keeper grants a fresh one and
//! republishes, so a proxy advertisement survives meta-store hiccups
//! as long as the process lives.

use crate::client::{
    DeleteOptions, GetOptions, GetResponse, MetaStoreClient, MetaStoreError, MetaStoreResult,
    PutOptions, WatchOptions, WatchStream,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct LeasedKey {
    value: String,
    ttl_secs: i64,
    lease_id: i64,
    keeper: JoinHandle<()>,
}

/// Shared accessor over one meta-store client.
pub struct MetaStorageAccessor {
    client: Arc<dyn MetaStoreClient>,
    leased: Mutex<HashMap<String, LeasedKey>>,
}

impl MetaStorageAccessor {
    pub fn new(client: Arc<dyn MetaStoreClient>) -> Arc<Self> {
        Arc::new(Self { client, leased: Mutex::new(HashMap::new()) })
    }

    pub fn client(&self) -> Arc<dyn MetaStoreClient> {
        Arc::clone(&self.client)
    }

    pub async fn put(&self, key: &str, value: &str) -> MetaStoreResult<i64> {
        self.client.put(key, value, PutOptions::default()).await
    }

    pub async fn get(&self, key: &str) -> MetaStoreResult<Option<String>> {
        let response = self.client.get(key, GetOptions::default()).await?;
        Ok(response.kvs.into_iter().next().map(|kv| kv.value))
    }

    pub async fn get_raw(&self, key: &str, prefix: bool) -> MetaStoreResult<GetResponse> {
        self.client.get(key, GetOptions { prefix }).await
    }

    pub async fn get_all_with_prefix(
        &self,
        prefix: &str,
    ) -> MetaStoreResult<Vec<(String, String)>> {
        let response = self.client.get(prefix, GetOptions { prefix: true }).await?;
        Ok(response.kvs.into_iter().map(|kv| (kv.key, kv.value)).collect())
    }

    pub async fn delete(&self, key: &str) -> MetaStoreResult<i64> {
        self.client.delete(key, DeleteOptions::default()).await
    }

    pub async fn delete_prefix(&self, prefix: &str) -> MetaStoreResult<i64> {
        self.client.delete(prefix, DeleteOptions { prefix: true }).await
    }

    /// Range-read a prefix and hand back the events plus the revision
    /// to watch from.
    pub async fn sync(&self, key: &str, prefix: bool) -> MetaStoreResult<GetResponse> {
        debug!(key, "sync from meta store");
        self.client.get(key, GetOptions { prefix }).await
    }

    pub async fn watch(&self, key: &str, options: WatchOptions) -> MetaStoreResult<WatchStream> {
        self.client.watch(key, options).await
    }

    /// Publish `value` under `key` attached to a fresh TTL lease and
    /// keep it alive until [`revoke`](Self::revoke) or drop.
    pub async fn put_with_lease(
        self: &Arc<Self>,
        key: &str,
        value: &str,
        ttl_secs: i64,
    ) -> MetaStoreResult<()> {
        if ttl_secs <= 0 {
            return Err(MetaStoreError::InvalidRequest("lease ttl must be positive".into()));
        }
        // Re-publishing an already leased key replaces the old keeper.
        self.stop_keeper(key);

        let grant = self.client.grant(ttl_secs).await?;
        self.client.put(key, value, PutOptions { lease: grant.lease_id }).await?;

        let keeper = tokio::spawn(Self::keeper_loop(
            Arc::clone(self),
            key.to_string(),
            value.to_string(),
            ttl_secs,
        ));
        self.leased.lock().insert(
            key.to_string(),
            LeasedKey { value: value.to_string(), ttl_secs, lease_id: grant.lease_id, keeper },
        );
        Ok(())
    }

    /// Drop the lease behind `key`, deleting the published value.
    pub async fn revoke(&self, key: &str) -> MetaStoreResult<()> {
        let Some(leased) = self.remove_leased(key) else {
            return Ok(());
        };
        leased.keeper.abort();
        self.client.revoke(leased.lease_id).await
    }

    fn stop_keeper(&self, key: &str) {
        if let Some(leased) = self.remove_leased(key) {
            leased.keeper.abort();
        }
    }

    fn remove_leased(&self, key: &str) -> Option<LeasedKey> {
        self.leased.lock().remove(key)
    }

    fn current_lease(&self, key: &str) -> Option<i64> {
        self.leased.lock().get(key).map(|leased| leased.lease_id)
    }

    fn replace_lease(&self, key: &str, lease_id: i64) {
        if let Some(leased) = self.leased.lock().get_mut(key) {
            leased.lease_id = lease_id;
        }
    }

    async fn keeper_loop(accessor: Arc<Self>, key: String, value: String, ttl_secs: i64) {
        let interval = Duration::from_millis((ttl_secs as u64 * 1000) / 4);
        loop {
            tokio::time::sleep(interval).await;
            let Some(lease_id) = accessor.current_lease(&key) else {
                return;
            };
            match accessor.client.keep_alive_once(lease_id).await {
                Ok(alive) if alive.ttl_secs > 0 => continue,
                Ok(_) => warn!(key, lease_id, "lease lost, re-granting"),
                Err(error) => warn!(key, lease_id, %error, "keep alive failed, re-granting"),
            }
            match accessor.regrant(&key, &value, ttl_secs).await {
                Ok(()) => debug!(key, "lease re-granted and value republished"),
                Err(error) => warn!(key, %error, "lease re-grant failed, will retry"),
            }
        }
    }

    async fn regrant(&self, key: &str, value: &str, ttl_secs: i64) -> MetaStoreResult<()> {
        let grant = self.client.grant(ttl_secs).await?;
        self.client.put(key, value, PutOptions { lease: grant.lease_id }).await?;
        self.replace_lease(key, grant.lease_id);
        Ok(())
    }

    /// Value last published with a lease for `key` (test hook).
    pub fn leased_value(&self, key: &str) -> Option<String> {
        self.leased.lock().get(key).map(|leased| leased.value.clone())
    }

    /// Configured TTL of a leased key (test hook).
    pub fn leased_ttl(&self, key: &str) -> Option<i64> {
        self.leased.lock().get(key).map(|leased| leased.ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryMetaStore;

    fn accessor() -> Arc<MetaStorageAccessor> {
        MetaStorageAccessor::new(Arc::new(MemoryMetaStore::new()))
    }

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let accessor = accessor();
        accessor.put("/k", "v").await.unwrap();
        assert_eq!(accessor.get("/k").await.unwrap().as_deref(), Some("v"));
        accessor.delete("/k").await.unwrap();
        assert_eq!(accessor.get("/k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn leased_key_survives_keepalives() {
        let accessor = accessor();
        accessor.put_with_lease("/proxy/n1", "{}", 4).await.unwrap();
        // Three keeper periods: the key must still be there.
        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }
        assert_eq!(accessor.get("/proxy/n1").await.unwrap().as_deref(), Some("{}"));
    }

    #[tokio::test(start_paused = true)]
    async fn revoke_removes_value() {
        let accessor = accessor();
        accessor.put_with_lease("/proxy/n1", "{}", 4).await.unwrap();
        accessor.revoke("/proxy/n1").await.unwrap();
        assert_eq!(accessor.get("/proxy/n1").await.unwrap(), None);
    }
}
