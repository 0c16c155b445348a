//! Local group controller: the Reserve/Bind quartet.
//!
//! A Reserve consumes the decided amounts from the local view and
//! remembers the delta under the request id; UnReserve replays the
//! inverse. Bind finalises the reservation (the amounts stay
//! consumed and the ledger entry is dropped); UnBind releases a
//! previously bound reservation. All four are idempotent per request
//! id so retried messages replay cleanly.

use hfs_resource_view::ResourceViewMgr;
use hfs_types::{
    GroupResponse, ResourceType, ResourceUnitChanges, ScheduleRequest, ScheduleResponse,
    StatusCode, UnitChange,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

struct Reservation {
    delta: ResourceUnitChanges,
    bound: bool,
}

#[derive(Clone)]
pub struct LocalGroupCtrl {
    view: ResourceViewMgr,
    reservations: Arc<Mutex<HashMap<String, Reservation>>>,
}

impl LocalGroupCtrl {
    pub fn new(view: ResourceViewMgr) -> Self {
        Self { view, reservations: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Reserve the requested amounts on the agent the request names.
    pub async fn reserve(&self, req: &ScheduleRequest) -> ScheduleResponse {
        if self.reservations.lock().contains_key(&req.request_id) {
            info!(request_id = %req.request_id, "reserve replayed");
            return ScheduleResponse::ok(req.request_id.clone());
        }
        let agent_id = &req.instance.function_agent_id;
        if agent_id.is_empty() {
            return ScheduleResponse::error(
                StatusCode::ParameterError,
                "reserve without a selected agent",
                req.request_id.clone(),
            );
        }
        let delta = ResourceUnitChanges::new(ResourceType::Primary, 0).with_change(
            UnitChange::Adjust {
                unit_id: agent_id.clone(),
                allocatable_delta: req.instance.resources.clone(),
                label_delta: Default::default(),
            },
        );
        if let Err(error) = self.view.update_resource_unit_delta(delta.clone()).await {
            warn!(request_id = %req.request_id, %error, "reserve failed");
            return ScheduleResponse::error(
                StatusCode::ResourceNotEnough,
                error.to_string(),
                req.request_id.clone(),
            );
        }
        self.reservations
            .lock()
            .insert(req.request_id.clone(), Reservation { delta, bound: false });
        let mut rsp = ScheduleResponse::ok(req.request_id.clone());
        rsp.update_resources = self.view.get_changes().await;
        rsp
    }

    /// Roll an unbound reservation back; replays and unknown ids are
    /// fine.
    pub async fn un_reserve(&self, req: &ScheduleRequest) -> GroupResponse {
        let reservation = self.reservations.lock().remove(&req.request_id);
        match reservation {
            Some(reservation) if !reservation.bound => {
                let _ = self.view.update_resource_unit_delta(reservation.delta.inverted()).await;
            }
            Some(reservation) => {
                // Bound entries stay consumed; put the ledger entry
                // back so UnBind can still find it.
                self.reservations.lock().insert(req.request_id.clone(), reservation);
                return self.group_error(req, "cannot unreserve a bound request");
            }
            None => {
                info!(request_id = %req.request_id, "unreserve of unknown request ignored");
            }
        }
        self.group_ok(req).await
    }

    /// Finalise: the amounts stay consumed.
    pub async fn bind(&self, req: &ScheduleRequest) -> GroupResponse {
        let reserved = {
            let mut reservations = self.reservations.lock();
            match reservations.get_mut(&req.request_id) {
                Some(reservation) => {
                    reservation.bound = true;
                    true
                }
                None => false,
            }
        };
        if !reserved {
            return self.group_error(req, "bind without reserve");
        }
        self.group_ok(req).await
    }

    /// Release a bound reservation.
    pub async fn un_bind(&self, req: &ScheduleRequest) -> GroupResponse {
        let reservation = self.reservations.lock().remove(&req.request_id);
        if let Some(reservation) = reservation {
            let _ = self.view.update_resource_unit_delta(reservation.delta.inverted()).await;
        } else {
            info!(request_id = %req.request_id, "unbind of unknown request ignored");
        }
        self.group_ok(req).await
    }

    async fn group_ok(&self, req: &ScheduleRequest) -> GroupResponse {
        GroupResponse {
            request_id: req.request_id.clone(),
            trace_id: req.trace_id.clone(),
            code: StatusCode::Success,
            message: String::new(),
            update_resources: self.view.get_changes().await,
        }
    }

    fn group_error(&self, req: &ScheduleRequest, message: &str) -> GroupResponse {
        GroupResponse {
            request_id: req.request_id.clone(),
            trace_id: req.trace_id.clone(),
            code: StatusCode::ParameterError,
            message: message.to_string(),
            update_resources: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hfs_types::{InstanceInfo, Register, ResourceUnit, Resources};

    async fn view_with_agent() -> ResourceViewMgr {
        let view = ResourceViewMgr::spawn("local-1", None);
        let register = Register {
            name: "node".into(),
            address: "inproc://node".into(),
            resources: [(
                ResourceType::Primary,
                ResourceUnit::new("agent-1").with_capacity(Resources::cpu_mem(1000.0, 1024.0)),
            )]
            .into_iter()
            .collect(),
        };
        view.register_resource_unit(register, "inproc://node").await.unwrap();
        let _ = view.get_changes().await;
        view
    }

    fn reserve_request(id: &str) -> ScheduleRequest {
        ScheduleRequest {
            request_id: id.into(),
            instance: InstanceInfo {
                instance_id: format!("ins-{id}"),
                function_agent_id: "agent-1".into(),
                resources: Resources::cpu_mem(500.0, 512.0),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn allocatable_cpu(view: &ResourceViewMgr) -> f64 {
        let snapshot = view.get_resources().await;
        snapshot[&ResourceType::Primary].allocatable.cpu().unwrap()
    }

    #[tokio::test]
    async fn reserve_then_unreserve_restores_baseline() {
        let view = view_with_agent().await;
        let ctrl = LocalGroupCtrl::new(view.clone());
        let req = reserve_request("req-1");

        let rsp = ctrl.reserve(&req).await;
        assert!(rsp.code.is_ok());
        assert!(!rsp.update_resources.is_empty());
        assert_eq!(allocatable_cpu(&view).await, 500.0);

        let rsp = ctrl.un_reserve(&req).await;
        assert!(rsp.code.is_ok());
        assert_eq!(allocatable_cpu(&view).await, 1000.0);
    }

    #[tokio::test]
    async fn reserve_is_idempotent() {
        let view = view_with_agent().await;
        let ctrl = LocalGroupCtrl::new(view.clone());
        let req = reserve_request("req-1");

        ctrl.reserve(&req).await;
        ctrl.reserve(&req).await;
        assert_eq!(allocatable_cpu(&view).await, 500.0);
    }

    #[tokio::test]
    async fn bind_keeps_amounts_until_unbind() {
        let view = view_with_agent().await;
        let ctrl = LocalGroupCtrl::new(view.clone());
        let req = reserve_request("req-1");

        ctrl.reserve(&req).await;
        let rsp = ctrl.bind(&req).await;
        assert!(rsp.code.is_ok());
        // an unreserve after bind must not release anything
        let rsp = ctrl.un_reserve(&req).await;
        assert!(!rsp.code.is_ok());
        assert_eq!(allocatable_cpu(&view).await, 500.0);

        let rsp = ctrl.un_bind(&req).await;
        assert!(rsp.code.is_ok());
        assert_eq!(allocatable_cpu(&view).await, 1000.0);
    }

    #[tokio::test]
    async fn bind_without_reserve_is_rejected() {
        let view = view_with_agent().await;
        let ctrl = LocalGroupCtrl::new(view);
        let rsp = ctrl.bind(&reserve_request("req-9")).await;
        assert_eq!(rsp.code, StatusCode::ParameterError);
    }
}
