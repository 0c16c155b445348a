//! Cluster-wide metadata observer (C2).
//!
//! One observer per tier watches three meta-store prefixes —
//! function-meta, instance-route and bus-proxy — and maintains local
//! caches with listener fan-out. Each prefix runs the same
//! three-phase protocol: an initial range sync reconciled against the
//! cache, an event stream subscribed from the sync revision, and an
//! optional syncer callback invoked for every surviving entry.

mod listener;
mod observer;

pub use listener::{InstanceListener, TenantEvent, TenantListener};
pub use observer::{Observer, ObserverError, ObserverParams, ObserverResult};
