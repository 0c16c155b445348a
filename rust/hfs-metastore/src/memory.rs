//! In-memory meta-store.
//!
//! Backs tests and single-process deployments. Revisions are global
//! and monotonic like an etcd store; watches are fanned out over
//! bounded channels and dead subscribers are pruned on the next
//! notification. Lease expiry is checked lazily against the tokio
//! clock, so `tokio::time::pause` works in tests.

use crate::client::{
    DeleteOptions, EventType, GetOptions, GetResponse, KeyValue, LeaseGrant, LeaseKeepAlive,
    MetaStoreClient, MetaStoreError, MetaStoreResult, PutOptions, WatchEvent, WatchOptions,
    WatchStream,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

const WATCH_CHANNEL_CAPACITY: usize = 256;

struct Lease {
    ttl_secs: i64,
    expires_at: Instant,
    keys: Vec<String>,
}

struct Watcher {
    key: String,
    prefix: bool,
    tx: mpsc::Sender<Vec<WatchEvent>>,
}

#[derive(Default)]
struct StoreState {
    kvs: BTreeMap<String, KeyValue>,
    revision: i64,
    leases: HashMap<i64, Lease>,
    next_lease: i64,
    watchers: Vec<Watcher>,
}

impl StoreState {
    fn expire_leases(&mut self) -> Vec<WatchEvent> {
        let now = Instant::now();
        let expired: Vec<i64> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        let mut events = Vec::new();
        for id in expired {
            let lease = self.leases.remove(&id).expect("lease id just listed");
            for key in lease.keys {
                if let Some(kv) = self.kvs.remove(&key) {
                    self.revision += 1;
                    events.push(WatchEvent {
                        event_type: EventType::Delete,
                        kv: KeyValue { mod_revision: self.revision, ..kv },
                    });
                }
            }
        }
        events
    }

    fn notify(&mut self, events: &[WatchEvent]) {
        if events.is_empty() {
            return;
        }
        self.watchers.retain(|watcher| {
            let matched: Vec<WatchEvent> = events
                .iter()
                .filter(|event| {
                    if watcher.prefix {
                        event.kv.key.starts_with(&watcher.key)
                    } else {
                        event.kv.key == watcher.key
                    }
                })
                .cloned()
                .collect();
            if matched.is_empty() {
                return true;
            }
            // A full channel or a dropped receiver both mean the
            // subscriber is gone for our purposes.
            watcher.tx.try_send(matched).is_ok()
        });
    }
}

/// In-process implementation of [`MetaStoreClient`].
#[derive(Default)]
pub struct MemoryMetaStore {
    state: Mutex<StoreState>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current store revision (test hook).
    pub fn revision(&self) -> i64 {
        self.state.lock().revision
    }
}

#[async_trait]
impl MetaStoreClient for MemoryMetaStore {
    async fn get(&self, key: &str, options: GetOptions) -> MetaStoreResult<GetResponse> {
        let mut state = self.state.lock();
        let expired = state.expire_leases();
        state.notify(&expired);
        let kvs = if options.prefix {
            state
                .kvs
                .range(key.to_string()..)
                .take_while(|(stored, _)| stored.starts_with(key))
                .map(|(_, kv)| kv.clone())
                .collect()
        } else {
            state.kvs.get(key).cloned().into_iter().collect()
        };
        Ok(GetResponse { kvs, revision: state.revision })
    }

    async fn put(&self, key: &str, value: &str, options: PutOptions) -> MetaStoreResult<i64> {
        let mut state = self.state.lock();
        let expired = state.expire_leases();
        state.notify(&expired);
        if options.lease != 0 {
            match state.leases.get_mut(&options.lease) {
                None => return Err(MetaStoreError::LeaseNotFound(options.lease)),
                Some(lease) => lease.keys.push(key.to_string()),
            }
        }
        state.revision += 1;
        let kv = KeyValue {
            key: key.to_string(),
            value: value.to_string(),
            mod_revision: state.revision,
            lease: options.lease,
        };
        state.kvs.insert(key.to_string(), kv.clone());
        let revision = state.revision;
        state.notify(&[WatchEvent { event_type: EventType::Put, kv }]);
        debug!(key, revision, "meta store put");
        Ok(revision)
    }

    async fn delete(&self, key: &str, options: DeleteOptions) -> MetaStoreResult<i64> {
        let mut state = self.state.lock();
        let expired = state.expire_leases();
        state.notify(&expired);
        let keys: Vec<String> = if options.prefix {
            state
                .kvs
                .range(key.to_string()..)
                .take_while(|(stored, _)| stored.starts_with(key))
                .map(|(stored, _)| stored.clone())
                .collect()
        } else {
            state.kvs.contains_key(key).then(|| key.to_string()).into_iter().collect()
        };
        let mut events = Vec::new();
        for stored in &keys {
            if let Some(kv) = state.kvs.remove(stored) {
                state.revision += 1;
                events.push(WatchEvent {
                    event_type: EventType::Delete,
                    kv: KeyValue { mod_revision: state.revision, ..kv },
                });
            }
        }
        let deleted = events.len() as i64;
        state.notify(&events);
        Ok(deleted)
    }

    async fn watch(&self, key: &str, options: WatchOptions) -> MetaStoreResult<WatchStream> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let mut state = self.state.lock();
        // Replay history is not kept; a start revision older than the
        // store head only yields entries still present.
        if options.start_revision > 0 && options.start_revision < state.revision {
            let backlog: Vec<WatchEvent> = state
                .kvs
                .values()
                .filter(|kv| {
                    kv.mod_revision > options.start_revision
                        && (if options.prefix {
                            kv.key.starts_with(key)
                        } else {
                            kv.key == key
                        })
                })
                .map(|kv| WatchEvent { event_type: EventType::Put, kv: kv.clone() })
                .collect();
            if !backlog.is_empty() {
                let _ = tx.try_send(backlog);
            }
        }
        state.watchers.push(Watcher { key: key.to_string(), prefix: options.prefix, tx });
        Ok(rx)
    }

    async fn grant(&self, ttl_secs: i64) -> MetaStoreResult<LeaseGrant> {
        if ttl_secs <= 0 {
            return Err(MetaStoreError::InvalidRequest("lease ttl must be positive".into()));
        }
        let mut state = self.state.lock();
        state.next_lease += 1;
        let lease_id = state.next_lease;
        state.leases.insert(
            lease_id,
            Lease {
                ttl_secs,
                expires_at: Instant::now() + std::time::Duration::from_secs(ttl_secs as u64),
                keys: Vec::new(),
            },
        );
        Ok(LeaseGrant { lease_id, ttl_secs })
    }

    async fn keep_alive_once(&self, lease_id: i64) -> MetaStoreResult<LeaseKeepAlive> {
        let mut state = self.state.lock();
        let expired = state.expire_leases();
        state.notify(&expired);
        match state.leases.get_mut(&lease_id) {
            None => Ok(LeaseKeepAlive { lease_id, ttl_secs: 0 }),
            Some(lease) => {
                lease.expires_at =
                    Instant::now() + std::time::Duration::from_secs(lease.ttl_secs as u64);
                Ok(LeaseKeepAlive { lease_id, ttl_secs: lease.ttl_secs })
            }
        }
    }

    async fn revoke(&self, lease_id: i64) -> MetaStoreResult<()> {
        let mut state = self.state.lock();
        let Some(lease) = state.leases.remove(&lease_id) else {
            return Err(MetaStoreError::LeaseNotFound(lease_id));
        };
        let mut events = Vec::new();
        for key in lease.keys {
            if let Some(kv) = state.kvs.remove(&key) {
                state.revision += 1;
                events.push(WatchEvent {
                    event_type: EventType::Delete,
                    kv: KeyValue { mod_revision: state.revision, ..kv },
                });
            }
        }
        state.notify(&events);
        Ok(())
    }
}
