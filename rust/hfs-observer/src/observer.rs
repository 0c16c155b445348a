//! The observer itself.

use crate::listener::{InstanceListener, TenantEvent, TenantListener};
use dashmap::DashMap;
use hfs_metastore::keys::KeyLayout;
use hfs_metastore::{
    EventType, MetaStorageAccessor, MetaStoreError, WatchEvent, WatchOptions,
};
use hfs_types::{FunctionKey, FunctionMeta, InstanceInfo, ProxyMeta, RouteInfo};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ObserverError {
    #[error("invalid function key: {0}")]
    InvalidFunction(String),
    #[error(transparent)]
    MetaStore(#[from] MetaStoreError),
    #[error("instance {0} not found")]
    InstanceNotFound(String),
}

pub type ObserverResult<T> = Result<T, ObserverError>;

/// Tuning knobs of one observer.
#[derive(Debug, Clone, Default)]
pub struct ObserverParams {
    /// Watch one key per instance instead of the whole route prefix.
    pub partial_watch_instances: bool,
}

/// Callback invoked for every surviving route after an initial sync;
/// used to rebuild data-plane clients without waiting for events.
pub type RouteSyncer = Arc<dyn Fn(&RouteInfo) + Send + Sync>;

struct Caches {
    /// instance id -> full instance document.
    instances: DashMap<String, InstanceInfo>,
    /// instance id -> mod revision of the latest applied event.
    instance_revisions: DashMap<String, i64>,
    /// instance id -> published route.
    routes: DashMap<String, RouteInfo>,
    /// function key string -> meta (regular tenants).
    functions: DashMap<String, FunctionMeta>,
    /// functions of the system tenant, exempt from lease TTLs.
    system_functions: DashMap<String, FunctionMeta>,
    /// node id -> proxy advertisement.
    proxies: DashMap<String, ProxyMeta>,
    /// agent id -> instance ids hosted there.
    agent_instances: DashMap<String, Vec<String>>,
}

struct Inner {
    node_id: String,
    accessor: Arc<MetaStorageAccessor>,
    layout: KeyLayout,
    params: ObserverParams,
    caches: Caches,
    instance_listeners: RwLock<Vec<Arc<dyn InstanceListener>>>,
    tenant_listeners: RwLock<Vec<Arc<dyn TenantListener>>>,
    route_syncer: RwLock<Option<RouteSyncer>>,
    /// instance id -> partial watcher task.
    instance_watchers: parking_lot::Mutex<HashMap<String, JoinHandle<()>>>,
    pump_tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to one tier's observer. Clones share caches and watches.
#[derive(Clone)]
pub struct Observer {
    inner: Arc<Inner>,
}

impl Observer {
    pub fn new(
        node_id: impl Into<String>,
        accessor: Arc<MetaStorageAccessor>,
        layout: KeyLayout,
        params: ObserverParams,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                node_id: node_id.into(),
                accessor,
                layout,
                params,
                caches: Caches {
                    instances: DashMap::new(),
                    instance_revisions: DashMap::new(),
                    routes: DashMap::new(),
                    functions: DashMap::new(),
                    system_functions: DashMap::new(),
                    proxies: DashMap::new(),
                    agent_instances: DashMap::new(),
                },
                instance_listeners: RwLock::new(Vec::new()),
                tenant_listeners: RwLock::new(Vec::new()),
                route_syncer: RwLock::new(None),
                instance_watchers: parking_lot::Mutex::new(HashMap::new()),
                pump_tasks: parking_lot::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Run the three-phase protocol for every prefix and start the
    /// event pumps. Called on startup and again whenever the
    /// meta-store reports healthy after an outage.
    pub async fn register(&self) -> ObserverResult<()> {
        let function_rev = self.sync_functions().await?;
        let proxy_rev = self.sync_proxies().await?;
        let route_rev = self.sync_routes().await?;

        self.spawn_pump(self.inner.layout.function_prefix(), function_rev, PumpKind::Function)
            .await?;
        self.spawn_pump(self.inner.layout.bus_proxy_prefix(), proxy_rev, PumpKind::Proxy)
            .await?;
        if !self.inner.params.partial_watch_instances {
            self.spawn_pump(self.inner.layout.route_prefix(), route_rev, PumpKind::Route)
                .await?;
        }
        info!(node_id = %self.inner.node_id, "observer registered");
        Ok(())
    }

    pub fn attach(&self, listener: Arc<dyn InstanceListener>) {
        self.inner.instance_listeners.write().push(listener);
    }

    pub fn detach_all(&self) {
        self.inner.instance_listeners.write().clear();
    }

    pub fn attach_tenant_listener(&self, listener: Arc<dyn TenantListener>) {
        self.inner.tenant_listeners.write().push(listener);
    }

    pub fn set_route_syncer(&self, syncer: RouteSyncer) {
        *self.inner.route_syncer.write() = Some(syncer);
    }

    // ------------------------------------------------------------------
    // Instance operations
    // ------------------------------------------------------------------

    /// Store an instance document. The key is deterministic from
    /// tenant, function, request id and instance id; the body is
    /// canonical JSON.
    pub async fn put_instance(&self, info: &InstanceInfo) -> ObserverResult<()> {
        if !info.function.is_valid() {
            return Err(ObserverError::InvalidFunction(info.function.to_string()));
        }
        let key =
            self.inner.layout.instance(&info.function, &info.request_id, &info.instance_id);
        let body = serde_json::to_string(info).expect("instance info serializes");
        let revision = self.inner.accessor.put(&key, &body).await?;
        self.apply_instance_put(info.clone(), revision, false);
        Ok(())
    }

    /// Idempotent delete by instance id.
    pub async fn del_instance(&self, instance_id: &str) -> ObserverResult<()> {
        let Some(info) = self.inner.caches.instances.get(instance_id).map(|e| e.clone()) else {
            debug!(instance_id, "delete of unknown instance ignored");
            return Ok(());
        };
        let key = self.inner.layout.instance(&info.function, &info.request_id, instance_id);
        self.inner.accessor.delete(&key).await?;
        self.apply_instance_delete(instance_id);
        Ok(())
    }

    /// Cache first; a miss or `is_force_update` reads through to the
    /// meta-store. The cache is never authoritative.
    pub async fn get_instance_info_by_id(
        &self,
        instance_id: &str,
        is_force_update: bool,
    ) -> ObserverResult<Option<InstanceInfo>> {
        if !is_force_update {
            if let Some(info) = self.inner.caches.instances.get(instance_id) {
                return Ok(Some(info.clone()));
            }
        }
        let prefix = self.inner.layout.instance_prefix();
        let response = self.inner.accessor.get_raw(&prefix, true).await?;
        for kv in response.kvs {
            if KeyLayout::instance_id_of(&kv.key) != Some(instance_id) {
                continue;
            }
            match serde_json::from_str::<InstanceInfo>(&kv.value) {
                Ok(info) => {
                    self.apply_instance_put(info.clone(), kv.mod_revision, is_force_update);
                    return Ok(Some(info));
                }
                Err(error) => {
                    warn!(key = %kv.key, %error, "undecodable instance document");
                    return Ok(None);
                }
            }
        }
        Ok(None)
    }

    /// Instances hosted by one agent.
    pub fn get_agent_instance_info_by_id(
        &self,
        agent_id: &str,
    ) -> HashMap<String, InstanceInfo> {
        let ids = self
            .inner
            .caches
            .agent_instances
            .get(agent_id)
            .map(|entry| entry.clone())
            .unwrap_or_default();
        ids.into_iter()
            .filter_map(|id| {
                self.inner.caches.instances.get(&id).map(|info| (id.clone(), info.clone()))
            })
            .collect()
    }

    /// All instances whose proxy is this node.
    pub fn get_local_instance_info(&self) -> HashMap<String, InstanceInfo> {
        self.inner
            .caches
            .instances
            .iter()
            .filter(|entry| entry.function_proxy_id == self.inner.node_id)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Accept a pre-fetched route from a peer, but only when it is
    /// strictly newer than what the cache holds; otherwise fall back
    /// to a read-through.
    pub async fn fast_put_remote_instance_event(
        &self,
        route: RouteInfo,
    ) -> ObserverResult<()> {
        let cached = self
            .inner
            .caches
            .instance_revisions
            .get(&route.instance_id)
            .map(|entry| *entry)
            .unwrap_or(0);
        if route.mod_revision > cached {
            let instance_id = route.instance_id.clone();
            self.inner
                .caches
                .instance_revisions
                .insert(instance_id.clone(), route.mod_revision);
            self.inner.caches.routes.insert(instance_id, route);
            return Ok(());
        }
        debug!(
            instance_id = %route.instance_id,
            offered = route.mod_revision,
            cached, "stale fast-put, reading through"
        );
        let key = self.inner.layout.route(&route.instance_id);
        if let Some(body) = self.inner.accessor.get(&key).await? {
            if let Ok(fresh) = serde_json::from_str::<RouteInfo>(&body) {
                self.inner
                    .caches
                    .instance_revisions
                    .insert(fresh.instance_id.clone(), fresh.mod_revision);
                self.inner.caches.routes.insert(fresh.instance_id.clone(), fresh);
            }
        }
        Ok(())
    }

    pub fn get_route(&self, instance_id: &str) -> Option<RouteInfo> {
        self.inner.caches.routes.get(instance_id).map(|entry| entry.clone())
    }

    /// Per-instance watch, used when the caller already knows which
    /// instances it cares about. Torn down automatically on DELETE.
    pub async fn watch_instance(&self, instance_id: &str) -> ObserverResult<()> {
        let key = self.inner.layout.route(instance_id);
        let mut stream = self
            .inner
            .accessor
            .watch(&key, WatchOptions { prefix: false, start_revision: 0 })
            .await?;
        let observer = self.clone();
        let id = instance_id.to_string();
        let task = tokio::spawn(async move {
            while let Some(events) = stream.recv().await {
                for event in events {
                    let deleted = event.event_type == EventType::Delete;
                    observer.handle_route_event(event);
                    if deleted {
                        observer.cancel_watch_instance(&id);
                        return;
                    }
                }
            }
        });
        if let Some(previous) =
            self.inner.instance_watchers.lock().insert(instance_id.to_string(), task)
        {
            previous.abort();
        }
        Ok(())
    }

    pub fn cancel_watch_instance(&self, instance_id: &str) {
        if let Some(task) = self.inner.instance_watchers.lock().remove(instance_id) {
            task.abort();
        }
    }

    // ------------------------------------------------------------------
    // Function metadata
    // ------------------------------------------------------------------

    pub async fn get_func_meta(&self, key: &FunctionKey) -> ObserverResult<Option<FunctionMeta>> {
        let cache_key = key.to_string();
        if let Some(meta) = self.inner.caches.system_functions.get(&cache_key) {
            return Ok(Some(meta.clone()));
        }
        if let Some(meta) = self.inner.caches.functions.get(&cache_key) {
            return Ok(Some(meta.clone()));
        }
        let stored = self.inner.accessor.get(&self.inner.layout.function(key)).await?;
        let Some(body) = stored else {
            return Ok(None);
        };
        match serde_json::from_str::<FunctionMeta>(&body) {
            Ok(meta) => {
                self.cache_function(meta.clone());
                Ok(Some(meta))
            }
            Err(error) => {
                warn!(function = %key, %error, "undecodable function meta");
                Ok(None)
            }
        }
    }

    pub fn is_system_function(&self, key: &FunctionKey) -> bool {
        self.inner.caches.system_functions.contains_key(&key.to_string())
    }

    // ------------------------------------------------------------------
    // Proxies
    // ------------------------------------------------------------------

    pub fn get_proxy(&self, node_id: &str) -> Option<ProxyMeta> {
        self.inner.caches.proxies.get(node_id).map(|entry| entry.clone())
    }

    /// Address of the scheduler actor on a peer node.
    pub fn get_local_scheduler_aid(&self, proxy_id: &str) -> Option<String> {
        self.get_proxy(proxy_id).map(|meta| meta.aid)
    }

    // ------------------------------------------------------------------
    // Sync phases
    // ------------------------------------------------------------------

    async fn sync_functions(&self) -> ObserverResult<i64> {
        let prefix = self.inner.layout.function_prefix();
        let response = self.inner.accessor.sync(&prefix, true).await?;
        for kv in &response.kvs {
            match serde_json::from_str::<FunctionMeta>(&kv.value) {
                Ok(meta) => self.cache_function(meta),
                Err(error) => warn!(key = %kv.key, %error, "skipping bad function meta"),
            }
        }
        Ok(response.revision)
    }

    async fn sync_proxies(&self) -> ObserverResult<i64> {
        let prefix = self.inner.layout.bus_proxy_prefix();
        let response = self.inner.accessor.sync(&prefix, true).await?;
        let mut remote: Vec<String> = Vec::new();
        for kv in &response.kvs {
            match serde_json::from_str::<ProxyMeta>(&kv.value) {
                Ok(meta) => {
                    remote.push(meta.node.clone());
                    self.inner.caches.proxies.insert(meta.node.clone(), meta);
                }
                Err(error) => warn!(key = %kv.key, %error, "skipping bad proxy meta"),
            }
        }
        // Drop proxies that vanished remotely, except our own entry:
        // the owner may republish after a lease hiccup.
        self.inner.caches.proxies.retain(|node, _| {
            remote.iter().any(|seen| seen == node) || *node == self.inner.node_id
        });
        Ok(response.revision)
    }

    async fn sync_routes(&self) -> ObserverResult<i64> {
        let prefix = self.inner.layout.route_prefix();
        let response = self.inner.accessor.sync(&prefix, true).await?;
        let mut remote: Vec<String> = Vec::new();
        for kv in &response.kvs {
            let Ok(route) = serde_json::from_str::<RouteInfo>(&kv.value) else {
                warn!(key = %kv.key, "skipping bad route document");
                continue;
            };
            remote.push(route.instance_id.clone());
            let stale = self
                .inner
                .caches
                .instance_revisions
                .get(&route.instance_id)
                .is_some_and(|cached| *cached >= kv.mod_revision);
            if stale {
                continue;
            }
            self.inner
                .caches
                .instance_revisions
                .insert(route.instance_id.clone(), kv.mod_revision);
            self.inner.caches.routes.insert(route.instance_id.clone(), route);
        }
        // Keys owned by this node are retained even when absent
        // remotely; everything else follows the remote set.
        let node_id = self.inner.node_id.clone();
        let mut deleted: Vec<String> = Vec::new();
        self.inner.caches.routes.retain(|instance_id, route| {
            let keep = remote.iter().any(|seen| seen == instance_id) || route.proxy_id == node_id;
            if !keep {
                deleted.push(instance_id.clone());
            }
            keep
        });
        for instance_id in deleted {
            self.inner.caches.instance_revisions.remove(&instance_id);
            self.notify_delete(&instance_id);
        }
        if let Some(syncer) = self.inner.route_syncer.read().clone() {
            for route in self.inner.caches.routes.iter() {
                syncer(route.value());
            }
        }
        Ok(response.revision)
    }

    // ------------------------------------------------------------------
    // Event pumps
    // ------------------------------------------------------------------

    async fn spawn_pump(
        &self,
        prefix: String,
        start_revision: i64,
        kind: PumpKind,
    ) -> ObserverResult<()> {
        let mut stream = self
            .inner
            .accessor
            .watch(&prefix, WatchOptions { prefix: true, start_revision })
            .await?;
        let observer = self.clone();
        let task = tokio::spawn(async move {
            while let Some(events) = stream.recv().await {
                for event in events {
                    match kind {
                        PumpKind::Function => observer.handle_function_event(event),
                        PumpKind::Proxy => observer.handle_proxy_event(event),
                        PumpKind::Route => observer.handle_route_event(event),
                    }
                }
            }
        });
        self.inner.pump_tasks.lock().push(task);
        Ok(())
    }

    fn handle_function_event(&self, event: WatchEvent) {
        match event.event_type {
            EventType::Put => {
                if let Ok(meta) = serde_json::from_str::<FunctionMeta>(&event.kv.value) {
                    self.cache_function(meta);
                }
            }
            EventType::Delete => {
                // The cache key equals the function key string, which
                // the storage key ends with after "tenant/".
                let tail: Vec<&str> = event.kv.key.split('/').collect();
                if tail.len() >= 6 {
                    let cache_key = format!(
                        "{}/{}/{}",
                        tail[tail.len() - 5],
                        tail[tail.len() - 3],
                        tail[tail.len() - 1]
                    );
                    self.inner.caches.functions.remove(&cache_key);
                    self.inner.caches.system_functions.remove(&cache_key);
                }
            }
        }
    }

    fn handle_proxy_event(&self, event: WatchEvent) {
        match event.event_type {
            EventType::Put => {
                if let Ok(meta) = serde_json::from_str::<ProxyMeta>(&event.kv.value) {
                    debug!(node = %meta.node, "proxy advertised");
                    self.inner.caches.proxies.insert(meta.node.clone(), meta);
                }
            }
            EventType::Delete => {
                if let Some(node_id) = KeyLayout::node_id_of(&event.kv.key) {
                    debug!(node = node_id, "proxy lease expired");
                    self.inner.caches.proxies.remove(node_id);
                }
            }
        }
    }

    fn handle_route_event(&self, event: WatchEvent) {
        match event.event_type {
            EventType::Put => {
                let Ok(mut route) = serde_json::from_str::<RouteInfo>(&event.kv.value) else {
                    warn!(key = %event.kv.key, "undecodable route event");
                    return;
                };
                route.mod_revision = event.kv.mod_revision;
                let stale = self
                    .inner
                    .caches
                    .instance_revisions
                    .get(&route.instance_id)
                    .is_some_and(|cached| *cached >= route.mod_revision);
                if stale {
                    return;
                }
                self.inner
                    .caches
                    .instance_revisions
                    .insert(route.instance_id.clone(), route.mod_revision);
                let instance_id = route.instance_id.clone();
                self.inner.caches.routes.insert(instance_id.clone(), route);
                if let Some(info) =
                    self.inner.caches.instances.get(&instance_id).map(|e| e.clone())
                {
                    self.notify_update(&instance_id, &info, false);
                }
            }
            EventType::Delete => {
                if let Some(instance_id) = KeyLayout::instance_id_of(&event.kv.key) {
                    let instance_id = instance_id.to_string();
                    self.inner.caches.routes.remove(&instance_id);
                    self.apply_instance_delete(&instance_id);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Cache plumbing
    // ------------------------------------------------------------------

    fn cache_function(&self, meta: FunctionMeta) {
        let cache_key = meta.function.to_string();
        if meta.function.is_system() {
            self.inner.caches.system_functions.insert(cache_key, meta);
        } else {
            self.inner.caches.functions.insert(cache_key, meta);
        }
    }

    fn apply_instance_put(&self, info: InstanceInfo, revision: i64, is_force_update: bool) {
        let instance_id = info.instance_id.clone();
        if !info.function_agent_id.is_empty() {
            let mut hosted = self
                .inner
                .caches
                .agent_instances
                .entry(info.function_agent_id.clone())
                .or_default();
            if !hosted.contains(&instance_id) {
                hosted.push(instance_id.clone());
            }
        }
        self.inner.caches.instance_revisions.insert(instance_id.clone(), revision);
        self.inner.caches.instances.insert(instance_id.clone(), info.clone());
        self.notify_update(&instance_id, &info, is_force_update);
        let event = TenantEvent {
            tenant_id: info.tenant_id.clone(),
            instance_id: instance_id.clone(),
            info: Some(info),
        };
        for listener in self.inner.tenant_listeners.read().iter() {
            listener.notify_update_tenant_instance(&event);
        }
    }

    fn apply_instance_delete(&self, instance_id: &str) {
        let removed = self.inner.caches.instances.remove(instance_id);
        self.inner.caches.instance_revisions.remove(instance_id);
        if let Some((_, info)) = &removed {
            if let Some(mut hosted) =
                self.inner.caches.agent_instances.get_mut(&info.function_agent_id)
            {
                hosted.retain(|id| id != instance_id);
            }
        }
        self.notify_delete(instance_id);
        if let Some((_, info)) = removed {
            let event = TenantEvent {
                tenant_id: info.tenant_id.clone(),
                instance_id: instance_id.to_string(),
                info: None,
            };
            for listener in self.inner.tenant_listeners.read().iter() {
                listener.notify_delete_tenant_instance(&event);
            }
        }
    }

    fn notify_update(&self, instance_id: &str, info: &InstanceInfo, is_force_update: bool) {
        for listener in self.inner.instance_listeners.read().iter() {
            listener.notify_update_instance(instance_id, info, is_force_update);
        }
    }

    fn notify_delete(&self, instance_id: &str) {
        for listener in self.inner.instance_listeners.read().iter() {
            listener.notify_delete_instance(instance_id);
        }
    }
}

#[derive(Clone, Copy)]
enum PumpKind {
    Function,
    Proxy,
    Route,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in self.pump_tasks.lock().drain(..) {
            task.abort();
        }
        for (_, task) in self.instance_watchers.lock().drain() {
            task.abort();
        }
    }
}
