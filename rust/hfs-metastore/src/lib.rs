//! Meta-store access for HFS.
//!
//! The scheduler treats the meta-store as an external collaborator
//! with a small contract: ranged gets, puts (optionally under a
//! lease), deletes, watches starting at a revision, and lease
//! grant/keepalive/revoke. [`MetaStoreClient`] captures that contract,
//! [`MemoryMetaStore`] implements it in-process for tests and
//! single-node deployments, and [`MetaStorageAccessor`] layers the
//! lease keeper and typed helpers every component actually uses.

pub mod accessor;
pub mod client;
pub mod keys;
pub mod memory;

pub use accessor::MetaStorageAccessor;
pub use client::{
    DeleteOptions, EventType, GetOptions, GetResponse, KeyValue, LeaseGrant, LeaseKeepAlive,
    MetaStoreClient, MetaStoreError, MetaStoreResult, PutOptions, WatchEvent, WatchOptions,
    WatchStream,
};
pub use memory::MemoryMetaStore;
