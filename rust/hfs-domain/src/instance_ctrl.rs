//! Domain-tier instance controller (C5).

use crate::config::DomainConfig;
use crate::scheduler::Scheduler;
use crate::underlayer::UnderlayerSchedMgr;
use hfs_types::rpc::ScalerClient;
use hfs_types::{
    CancelSchedule, CreateAgentRequest, CreateTarget, ScheduleRequest, ScheduleResponse,
    StatusCode, TryCancelResponse,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const SCHEDULE_CANCELED_MSG: &str = "schedule request canceled";
const RESOURCE_CONFIG_ERR_MSG: &str =
    "invalid resource parameter, request resource is greater than each node's max resource";

struct CtrlInner {
    config: DomainConfig,
    scheduler: Arc<dyn Scheduler>,
    underlayer_mgr: UnderlayerSchedMgr,
    scaler: Mutex<Option<Arc<dyn ScalerClient>>>,
    is_domain_level: AtomicBool,
    /// Decision-retry budget; kept equal to the live underlayer count
    /// by the manager.
    max_sched_retry_times: Arc<AtomicUsize>,
    retry_intervals: Mutex<Vec<Duration>>,
    /// Requests this controller currently owns.
    active: Mutex<HashSet<String>>,
    /// Requests cancelled while in flight.
    canceled: Mutex<HashSet<String>>,
}

/// Owns every schedule request accepted by this tier.
#[derive(Clone)]
pub struct InstanceCtrl {
    inner: Arc<CtrlInner>,
}

impl InstanceCtrl {
    pub fn new(
        config: DomainConfig,
        scheduler: Arc<dyn Scheduler>,
        underlayer_mgr: UnderlayerSchedMgr,
        max_sched_retry_times: Arc<AtomicUsize>,
    ) -> Self {
        let retry_intervals = config.affinity_retry_intervals.clone();
        Self {
            inner: Arc::new(CtrlInner {
                config,
                scheduler,
                underlayer_mgr,
                scaler: Mutex::new(None),
                is_domain_level: AtomicBool::new(false),
                max_sched_retry_times,
                retry_intervals: Mutex::new(retry_intervals),
                active: Mutex::new(HashSet::new()),
                canceled: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn set_domain_level(&self, is_domain_level: bool) {
        self.inner.is_domain_level.store(is_domain_level, Ordering::SeqCst);
    }

    pub fn set_scaler(&self, scaler: Arc<dyn ScalerClient>) {
        *self.inner.scaler.lock() = Some(scaler);
    }

    pub fn set_retry_schedule_intervals(&self, intervals: Vec<Duration>) {
        *self.inner.retry_intervals.lock() = intervals;
    }

    pub fn update_max_sched_retry_times(&self, times: usize) {
        self.inner.max_sched_retry_times.store(times, Ordering::SeqCst);
    }

    /// Cancel an in-flight request. Too-late cancels answer
    /// LS_REQUEST_NOT_FOUND so the caller knows the result was (or
    /// will be) delivered.
    pub fn try_cancel_schedule(&self, cancel: &CancelSchedule) -> TryCancelResponse {
        if !self.inner.active.lock().contains(&cancel.request_id) {
            return TryCancelResponse {
                request_id: cancel.request_id.clone(),
                code: StatusCode::LsRequestNotFound,
                message: "request already finished".into(),
            };
        }
        self.inner.canceled.lock().insert(cancel.request_id.clone());
        info!(request_id = %cancel.request_id, caller = %cancel.caller, "schedule canceled");
        TryCancelResponse {
            request_id: cancel.request_id.clone(),
            code: StatusCode::Success,
            message: String::new(),
        }
    }

    /// Schedule one request to an agent somewhere below this tier.
    pub async fn schedule(&self, req: ScheduleRequest) -> ScheduleResponse {
        self.inner.active.lock().insert(req.request_id.clone());
        let response = self.do_schedule(req.clone()).await;
        self.inner.active.lock().remove(&req.request_id);
        self.inner.canceled.lock().remove(&req.request_id);
        let outcome = if response.code.is_ok() { "success" } else { "failure" };
        metrics::counter!("hfs_schedule_total", "outcome" => outcome).increment(1);
        response
    }

    async fn do_schedule(&self, mut req: ScheduleRequest) -> ScheduleResponse {
        let deadline = schedule_deadline(&req);
        let mut decision_retries = 0usize;
        let mut created_agent = false;

        loop {
            if let Some(rsp) = self.canceled_response(&req, deadline) {
                return rsp;
            }

            let decision = self.inner.scheduler.schedule_decision(&mut req).await;
            match decision.status.code {
                StatusCode::Success => {
                    match self.dispatch_phase(&decision.dispatch_target, &req).await {
                        DispatchOutcome::Done(rsp) => return rsp,
                        DispatchOutcome::Reschedule => continue,
                    }
                }
                StatusCode::ResourceNotEnough => {
                    // Monopoly requests with no matching agent may ask
                    // the scaler to provision one.
                    if !created_agent && self.can_create_agent(&req) {
                        match self.create_agent(&mut req).await {
                            Ok(()) => {
                                created_agent = true;
                                continue;
                            }
                            Err(rsp) => return rsp,
                        }
                    }
                    let budget = self.retry_budget(created_agent);
                    if decision_retries >= budget {
                        return ScheduleResponse::error(
                            StatusCode::ErrResourceNotEnough,
                            decision.status.message,
                            req.request_id.clone(),
                        );
                    }
                    self.sleep_retry(decision_retries, created_agent).await;
                    decision_retries += 1;
                }
                StatusCode::AffinityScheduleFailed => {
                    let intervals = self.inner.retry_intervals.lock().clone();
                    if decision_retries >= intervals.len() {
                        return ScheduleResponse::error(
                            StatusCode::AffinityScheduleFailed,
                            decision.status.message,
                            req.request_id.clone(),
                        );
                    }
                    tokio::time::sleep(intervals[decision_retries]).await;
                    decision_retries += 1;
                }
                StatusCode::ParameterError | StatusCode::InvalidResourceParameter => {
                    return ScheduleResponse::error(
                        StatusCode::ErrResourceConfigError,
                        format!("{RESOURCE_CONFIG_ERR_MSG}: {}", decision.status.message),
                        req.request_id.clone(),
                    );
                }
                code => {
                    warn!(
                        request_id = %req.request_id,
                        %code, "schedule decision failed"
                    );
                    return ScheduleResponse::error(
                        code,
                        decision.status.message,
                        req.request_id.clone(),
                    );
                }
            }
        }
    }

    /// Dispatch with bounded same-underlayer timeout retries. A
    /// RESOURCE_NOT_ENOUGH answer is a race lost against another
    /// request; the caller reschedules on the refreshed view.
    async fn dispatch_phase(
        &self,
        selected_name: &str,
        req: &ScheduleRequest,
    ) -> DispatchOutcome {
        let mut attempts = 0;
        loop {
            match self.inner.underlayer_mgr.dispatch_schedule(selected_name, req).await {
                Ok(rsp) => match rsp.code {
                    StatusCode::Success
                    | StatusCode::InstanceTransactionWrongVersion => {
                        return DispatchOutcome::Done(rsp);
                    }
                    StatusCode::ResourceNotEnough => {
                        info!(
                            request_id = %req.request_id,
                            selected_name, "dispatch lost a resource race, rescheduling"
                        );
                        return DispatchOutcome::Reschedule;
                    }
                    StatusCode::DomainSchedulerUnavailableScheduler => {
                        return DispatchOutcome::Reschedule;
                    }
                    _ => return DispatchOutcome::Done(rsp),
                },
                Err(status) => {
                    attempts += 1;
                    if attempts >= self.inner.config.dispatch_retry_times {
                        warn!(
                            request_id = %req.request_id,
                            selected_name, attempts, %status,
                            "dispatch kept failing, rescheduling from scratch"
                        );
                        return DispatchOutcome::Reschedule;
                    }
                    debug!(
                        request_id = %req.request_id,
                        selected_name, attempts, "dispatch retry on same underlayer"
                    );
                }
            }
        }
    }

    fn can_create_agent(&self, req: &ScheduleRequest) -> bool {
        self.inner.is_domain_level.load(Ordering::SeqCst)
            && req.instance.is_monopoly()
            && req.instance.schedule_option.target != CreateTarget::ResourceGroup
            && self.inner.scaler.lock().is_some()
    }

    /// Ask the scaler for an agent matching the request; merges the
    /// returned create options (e.g. the affinity pool's labels) back
    /// into the request.
    async fn create_agent(&self, req: &mut ScheduleRequest) -> Result<(), ScheduleResponse> {
        let scaler = self.inner.scaler.lock().clone().expect("checked by can_create_agent");
        let create = CreateAgentRequest {
            request_id: req.request_id.clone(),
            instance: req.instance.clone(),
        };
        info!(request_id = %req.request_id, "requesting agent creation from scaler");
        match scaler.create_agent(create).await {
            Ok(rsp) if rsp.code == 0 => {
                for (key, value) in rsp.updated_create_options {
                    req.instance.create_options.insert(key, value);
                }
                Ok(())
            }
            Ok(rsp) => {
                warn!(request_id = %req.request_id, code = rsp.code, "scaler refused");
                Err(ScheduleResponse::error(
                    StatusCode::Failed,
                    rsp.message,
                    req.request_id.clone(),
                ))
            }
            Err(status) => Err(ScheduleResponse::error(
                status.code,
                status.message,
                req.request_id.clone(),
            )),
        }
    }

    fn retry_budget(&self, created_agent: bool) -> usize {
        if created_agent {
            self.inner.config.create_agent_await_retry_times as usize
        } else {
            let live = self.inner.max_sched_retry_times.load(Ordering::SeqCst);
            let intervals = self.inner.retry_intervals.lock().len();
            live.max(1).min(intervals.max(1))
        }
    }

    async fn sleep_retry(&self, attempt: usize, created_agent: bool) {
        let interval = if created_agent {
            self.inner.config.create_agent_await_retry_interval
        } else {
            let intervals = self.inner.retry_intervals.lock().clone();
            intervals
                .get(attempt)
                .or_else(|| intervals.last())
                .copied()
                .unwrap_or(Duration::from_millis(100))
        };
        tokio::time::sleep(interval).await;
    }

    fn canceled_response(
        &self,
        req: &ScheduleRequest,
        deadline: Option<Instant>,
    ) -> Option<ScheduleResponse> {
        let canceled = self.inner.canceled.lock().contains(&req.request_id);
        let expired = deadline.is_some_and(|deadline| Instant::now() >= deadline);
        if canceled || expired {
            info!(request_id = %req.request_id, canceled, expired, "schedule canceled");
            return Some(ScheduleResponse::error(
                StatusCode::ErrScheduleCanceled,
                SCHEDULE_CANCELED_MSG,
                req.request_id.clone(),
            ));
        }
        None
    }
}

enum DispatchOutcome {
    Done(ScheduleResponse),
    Reschedule,
}

fn schedule_deadline(req: &ScheduleRequest) -> Option<Instant> {
    let secs = req.instance.schedule_option.schedule_timeout_secs;
    (secs > 0).then(|| Instant::now() + Duration::from_secs(secs as u64))
}
