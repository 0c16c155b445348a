//! Authoritative snapshot of cluster capacity and allocation (C1).
//!
//! Each tier owns one [`ResourceViewMgr`]: an actor holding the
//! PRIMARY (physical) and VIRTUAL (overlay) unit trees. Mutations
//! arrive as registrations from underlayers or as delta batches
//! piggy-backed on schedule traffic; every successful mutation is
//! recorded so the next [`ResourceViewMgr::get_changes`] call can
//! replay it to the tier above.

mod view;

pub use view::{ResourceView, ResourceViewError, ResourceViewResult};

use hfs_types::{Register, ResourceType, ResourceUnit, ResourceUnitChanges};
use std::collections::BTreeMap;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

const COMMAND_CHANNEL_CAPACITY: usize = 128;

enum ViewCommand {
    Register {
        register: Register,
        url: String,
        reply: oneshot::Sender<ResourceViewResult<()>>,
    },
    UnRegister {
        unit_id: String,
        reply: oneshot::Sender<ResourceViewResult<()>>,
    },
    UpdateDelta {
        changes: ResourceUnitChanges,
        reply: oneshot::Sender<ResourceViewResult<()>>,
    },
    GetResources {
        reply: oneshot::Sender<BTreeMap<ResourceType, ResourceUnit>>,
    },
    GetChanges {
        reply: oneshot::Sender<Vec<ResourceUnitChanges>>,
    },
    TriggerTryPull,
}

/// Handle to the resource-view actor. Cheap to clone; all clones talk
/// to the same serialized state.
#[derive(Clone)]
pub struct ResourceViewMgr {
    tx: mpsc::Sender<ViewCommand>,
}

impl ResourceViewMgr {
    /// Spawn the view actor for a tier whose local root carries
    /// `root_id`. `try_pull` is invoked when a consumer asks the
    /// parent to resend its view (after heartbeat loss).
    pub fn spawn(root_id: impl Into<String>, try_pull: Option<mpsc::Sender<()>>) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let actor = ViewActor::new(root_id.into(), try_pull);
        tokio::spawn(actor.run(rx));
        Self { tx }
    }

    /// Insert or replace a child unit under the local root;
    /// idempotent.
    pub async fn register_resource_unit(
        &self,
        register: Register,
        url: impl Into<String>,
    ) -> ResourceViewResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ViewCommand::Register { register, url: url.into(), reply }).await;
        rx.await.unwrap_or(Err(ResourceViewError::ViewClosed))
    }

    /// Remove a child subtree and roll aggregates back.
    pub async fn unregister_resource_unit(
        &self,
        unit_id: impl Into<String>,
    ) -> ResourceViewResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ViewCommand::UnRegister { unit_id: unit_id.into(), reply }).await;
        rx.await.unwrap_or(Err(ResourceViewError::ViewClosed))
    }

    /// Apply a batch of additions, removals and adjustments.
    pub async fn update_resource_unit_delta(
        &self,
        changes: ResourceUnitChanges,
    ) -> ResourceViewResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ViewCommand::UpdateDelta { changes, reply }).await;
        rx.await.unwrap_or(Err(ResourceViewError::ViewClosed))
    }

    /// Immutable snapshot of every view.
    pub async fn get_resources(&self) -> BTreeMap<ResourceType, ResourceUnit> {
        let (reply, rx) = oneshot::channel();
        self.send(ViewCommand::GetResources { reply }).await;
        rx.await.unwrap_or_default()
    }

    /// Deltas accumulated since the previous call; draining.
    pub async fn get_changes(&self) -> Vec<ResourceUnitChanges> {
        let (reply, rx) = oneshot::channel();
        self.send(ViewCommand::GetChanges { reply }).await;
        rx.await.unwrap_or_default()
    }

    /// Ask the parent tier to resend its view.
    pub async fn trigger_try_pull(&self) {
        self.send(ViewCommand::TriggerTryPull).await;
    }

    async fn send(&self, command: ViewCommand) {
        if self.tx.send(command).await.is_err() {
            warn!("resource view actor is gone");
        }
    }
}

struct ViewActor {
    views: BTreeMap<ResourceType, ResourceView>,
    try_pull: Option<mpsc::Sender<()>>,
}

impl ViewActor {
    fn new(root_id: String, try_pull: Option<mpsc::Sender<()>>) -> Self {
        let mut views = BTreeMap::new();
        views.insert(
            ResourceType::Primary,
            ResourceView::new(root_id.clone(), ResourceType::Primary),
        );
        views.insert(ResourceType::Virtual, ResourceView::new(root_id, ResourceType::Virtual));
        Self { views, try_pull }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<ViewCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                ViewCommand::Register { register, url, reply } => {
                    let _ = reply.send(self.register(register, &url));
                }
                ViewCommand::UnRegister { unit_id, reply } => {
                    let mut result = Ok(());
                    for view in self.views.values_mut() {
                        if let Err(error) = view.unregister(&unit_id) {
                            result = Err(error);
                        }
                    }
                    let _ = reply.send(result);
                }
                ViewCommand::UpdateDelta { changes, reply } => {
                    let result = match self.views.get_mut(&changes.resource_type) {
                        Some(view) => view.apply_delta(changes),
                        None => Err(ResourceViewError::UnknownResourceType),
                    };
                    let _ = reply.send(result);
                }
                ViewCommand::GetResources { reply } => {
                    let snapshot = self
                        .views
                        .iter()
                        .map(|(resource_type, view)| (*resource_type, view.snapshot()))
                        .collect();
                    let _ = reply.send(snapshot);
                }
                ViewCommand::GetChanges { reply } => {
                    let changes =
                        self.views.values_mut().filter_map(ResourceView::drain_changes).collect();
                    let _ = reply.send(changes);
                }
                ViewCommand::TriggerTryPull => {
                    if let Some(tx) = &self.try_pull {
                        let _ = tx.try_send(());
                    }
                }
            }
        }
    }

    fn register(&mut self, register: Register, url: &str) -> ResourceViewResult<()> {
        for (resource_type, unit) in register.resources {
            let Some(view) = self.views.get_mut(&resource_type) else {
                continue;
            };
            view.register(unit, &register.name, url)?;
        }
        Ok(())
    }
}
