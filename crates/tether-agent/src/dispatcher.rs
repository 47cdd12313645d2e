//! Task dispatch: turns task events into supervised executions.
//!
//! Each accepted assignment is reserved in the registry, then handled by a
//! worker that waits for a concurrency permit, acquires the package from
//! the control plane and hands it to the supervisor. Abort events cancel
//! whatever attempt currently owns the task.

use crate::metrics::AgentMetrics;
use crate::registry::{ExecutionStatus, Reservation, TaskRegistry};
use crate::secrets::SecretInjector;
use crate::state::AgentRuntimeState;
use crate::supervisor::TaskSupervisor;
use std::sync::Arc;
use std::time::Duration;
use tether_core::Error;
use tether_core::ids::{AccountId, TaskId};
use tether_core::ports::ControlPlane;
use tether_core::task::{TaskEvent, TaskEventKind, TaskOutcome, TaskPackage};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// How a task event was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchDecision {
    /// A worker was started for the assignment.
    Submitted,
    /// The task is already tracked by this agent.
    Duplicate,
    /// The agent is over its memory threshold.
    Rejected,
    /// The agent is shutting itself down.
    SelfDestructing,
    /// The tracked task was cancelled.
    Aborted,
    /// Abort for a task this agent does not track.
    NotTracked,
}

pub struct TaskDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    control_plane: Arc<dyn ControlPlane>,
    state: Arc<AgentRuntimeState>,
    registry: Arc<TaskRegistry>,
    metrics: Arc<AgentMetrics>,
    injector: SecretInjector,
    supervisor: TaskSupervisor,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
}

/// Removes the attempt's registry entries when the worker exits, however it exits.
struct FinishGuard {
    registry: Arc<TaskRegistry>,
    task_id: TaskId,
    attempt: u64,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.registry.finish(&self.task_id, self.attempt);
    }
}

impl TaskDispatcher {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        state: Arc<AgentRuntimeState>,
        registry: Arc<TaskRegistry>,
        metrics: Arc<AgentMetrics>,
        injector: SecretInjector,
        supervisor: TaskSupervisor,
        max_concurrent: usize,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            inner: Arc::new(DispatcherInner {
                control_plane,
                state,
                registry,
                metrics,
                injector,
                supervisor,
                permits: Arc::new(Semaphore::new(max_concurrent)),
                max_concurrent,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.inner.registry
    }

    /// Handle one task event from either transport.
    pub fn on_task_event(&self, event: TaskEvent) -> DispatchDecision {
        match event.kind {
            TaskEventKind::Abort => self.abort(&event.task_id),
            TaskEventKind::Assign => self.assign(event),
        }
    }

    fn abort(&self, task_id: &TaskId) -> DispatchDecision {
        match self.inner.registry.abort(task_id) {
            Some(record) => {
                self.inner.metrics.record_cancelled();
                info!(task_id = %task_id, attempt = record.attempt, "Task aborted");
                DispatchDecision::Aborted
            }
            None => {
                debug!(task_id = %task_id, "Abort for untracked task");
                DispatchDecision::NotTracked
            }
        }
    }

    fn assign(&self, event: TaskEvent) -> DispatchDecision {
        let inner = &self.inner;
        if inner.state.is_self_destructing() {
            inner.metrics.record_rejected();
            debug!(task_id = %event.task_id, "Dropping task, agent is self destructing");
            return DispatchDecision::SelfDestructing;
        }
        if inner.state.resources.is_rejecting() {
            inner.metrics.record_rejected();
            warn!(task_id = %event.task_id, "Rejecting task, memory threshold exceeded");
            return DispatchDecision::Rejected;
        }

        let Some(reservation) = inner.registry.try_reserve(&event.task_id) else {
            inner.metrics.record_duplicate();
            debug!(task_id = %event.task_id, "Task already tracked, ignoring");
            return DispatchDecision::Duplicate;
        };

        inner.metrics.record_received();
        inner.metrics.observe_load(
            inner.registry.executing_count(),
            inner.registry.in_flight_count(),
        );
        debug!(
            task_id = %reservation.task_id,
            attempt = reservation.attempt,
            "Task queued"
        );

        let worker = self.inner.clone();
        tokio::spawn(async move {
            worker.run_worker(reservation, event.account_id).await;
        });
        DispatchDecision::Submitted
    }

    /// Stop acquiring, let running tasks finish within `grace`, then cancel
    /// whatever is left.
    pub async fn shutdown(&self, grace: Duration) {
        let inner = &self.inner;
        inner.state.set_acquiring(false);
        let permits = inner.max_concurrent as u32;

        info!(
            in_flight = inner.registry.in_flight_count(),
            grace_secs = grace.as_secs(),
            "Draining task dispatcher"
        );
        if timeout(grace, inner.permits.acquire_many(permits)).await.is_ok() {
            return;
        }

        let cancelled = inner.registry.cancel_all();
        warn!(cancelled, "Drain timed out, cancelling remaining tasks");
        if timeout(crate::supervisor::WIND_DOWN, inner.permits.acquire_many(permits))
            .await
            .is_err()
        {
            error!(
                in_flight = inner.registry.in_flight_count(),
                "Tasks still running after cancellation"
            );
        }
    }
}

impl DispatcherInner {
    async fn run_worker(&self, reservation: Reservation, account_id: AccountId) {
        let _guard = FinishGuard {
            registry: self.registry.clone(),
            task_id: reservation.task_id.clone(),
            attempt: reservation.attempt,
        };

        let _permit = tokio::select! {
            biased;
            _ = reservation.cancel.cancelled() => {
                debug!(task_id = %reservation.task_id, "Task cancelled while queued");
                return;
            }
            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };
        self.metrics.observe_load(
            self.registry.executing_count(),
            self.registry.in_flight_count(),
        );

        let Some(package) = self.acquire(&reservation, &account_id).await else {
            return;
        };
        self.prepare_and_execute(&reservation, package).await;
    }

    /// Acquire the package. `None` when the task should be dropped.
    async fn acquire(&self, reservation: &Reservation, account_id: &AccountId) -> Option<TaskPackage> {
        let task_id = &reservation.task_id;
        if self.state.is_frozen() || !self.state.is_acquiring() {
            debug!(task_id = %task_id, "Not acquiring tasks, dropping");
            return None;
        }
        let Some(identity) = self.state.identity() else {
            warn!(task_id = %task_id, "Agent is not registered, dropping task");
            return None;
        };
        if !self.registry.begin_acquire(task_id, reservation.attempt) {
            debug!(task_id = %task_id, "Task is already being acquired");
            return None;
        }
        self.registry
            .set_status(task_id, reservation.attempt, ExecutionStatus::Acquiring);

        let acquired = tokio::select! {
            biased;
            _ = reservation.cancel.cancelled() => {
                info!(task_id = %task_id, "Task aborted during acquisition");
                self.registry.end_acquire(task_id, reservation.attempt);
                return None;
            }
            result = self.control_plane.acquire_task(
                &identity.agent_id,
                task_id,
                account_id,
                &identity.instance_id,
            ) => result,
        };
        self.registry.end_acquire(task_id, reservation.attempt);

        let package = match acquired {
            Ok(Some(package)) if package.data.is_some() => package,
            Ok(_) => {
                self.metrics.record_acquire_miss();
                warn!(task_id = %task_id, "No task data returned, task may belong to another agent");
                return None;
            }
            Err(e) => {
                self.metrics.record_acquire_miss();
                warn!(task_id = %task_id, error = %e, "Failed to acquire task");
                return None;
            }
        };

        if reservation.cancel.is_cancelled() {
            info!(task_id = %task_id, "Task aborted during acquisition, discarding package");
            return None;
        }
        if let Some(target) = &package.target_instance_id
            && !package.is_for_instance(&identity.instance_id)
        {
            let e = Error::InstanceMismatch {
                task_id: task_id.clone(),
                target: target.clone(),
            };
            error!(error = %e, "Dropping task addressed to another instance");
            return None;
        }

        self.metrics.record_acquired();
        Some(package)
    }

    async fn prepare_and_execute(&self, reservation: &Reservation, mut package: TaskPackage) {
        let task_id = &reservation.task_id;
        self.registry.begin_validation(task_id, reservation.attempt);
        let injected = self.injector.inject(&mut package);
        self.registry.end_validation(task_id, reservation.attempt);

        match injected {
            Ok(context) => {
                self.supervisor.execute(reservation, package, context).await;
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Failed to prepare task");
                let outcome = TaskOutcome::ParametersFailure {
                    message: e.to_string(),
                };
                self.supervisor
                    .report_failure(reservation, &package, outcome)
                    .await;
            }
        }
    }
}
