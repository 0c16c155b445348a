//! The meta-store client contract.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors surfaced by meta-store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetaStoreError {
    #[error("meta store unavailable: {0}")]
    Unavailable(String),
    #[error("lease {0} not found")]
    LeaseNotFound(i64),
    #[error("invalid meta store request: {0}")]
    InvalidRequest(String),
    #[error("meta store operation timed out")]
    Timeout,
}

pub type MetaStoreResult<T> = Result<T, MetaStoreError>;

/// One stored key-value pair with its modification revision.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    pub mod_revision: i64,
    pub lease: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    /// Treat the key as a prefix and return the whole range.
    pub prefix: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PutOptions {
    /// Attach the entry to a previously granted lease.
    pub lease: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteOptions {
    pub prefix: bool,
}

#[derive(Debug, Clone, Default)]
pub struct GetResponse {
    pub kvs: Vec<KeyValue>,
    /// Store revision at read time; watches resume from here.
    pub revision: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Put,
    Delete,
}

/// One watch notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub event_type: EventType,
    pub kv: KeyValue,
}

/// Receiver half of a watch subscription. Dropping it cancels the
/// watch.
pub type WatchStream = mpsc::Receiver<Vec<WatchEvent>>;

#[derive(Debug, Clone, Copy, Default)]
pub struct WatchOptions {
    pub prefix: bool,
    /// Deliver events with revision strictly greater than this.
    pub start_revision: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct LeaseGrant {
    pub lease_id: i64,
    pub ttl_secs: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct LeaseKeepAlive {
    pub lease_id: i64,
    /// Remaining TTL; zero means the lease is gone and must be
    /// re-granted.
    pub ttl_secs: i64,
}

/// Contract of the external meta-store (key-value store with watch
/// and lease).
#[async_trait]
pub trait MetaStoreClient: Send + Sync {
    async fn get(&self, key: &str, options: GetOptions) -> MetaStoreResult<GetResponse>;

    async fn put(&self, key: &str, value: &str, options: PutOptions) -> MetaStoreResult<i64>;

    async fn delete(&self, key: &str, options: DeleteOptions) -> MetaStoreResult<i64>;

    async fn watch(&self, key: &str, options: WatchOptions) -> MetaStoreResult<WatchStream>;

    async fn grant(&self, ttl_secs: i64) -> MetaStoreResult<LeaseGrant>;

    async fn keep_alive_once(&self, lease_id: i64) -> MetaStoreResult<LeaseKeepAlive>;

    async fn revoke(&self, lease_id: i64) -> MetaStoreResult<()>;
}
