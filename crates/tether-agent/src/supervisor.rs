//! Task execution supervisor.
//!
//! Runs an acquired package to an outcome, enforcing the task timeout, and
//! reports the outcome to the control plane. A task moves through
//! Queued -> Acquiring -> Executing -> {Completed | TimedOut | Cancelled | Failed}
//! and is then reported and removed.

use crate::metrics::AgentMetrics;
use crate::registry::{ExecutionStatus, Reservation, TaskRegistry};
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::state::AgentRuntimeState;
use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tether_core::ids::TaskId;
use tether_core::ports::{ControlPlane, TaskRunner};
use tether_core::secrets::{ExpressionContext, LogSanitizer};
use tether_core::task::{TaskOutcome, TaskPackage, TaskResult, TaskType};
use tokio::time::{Instant, MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Added to the task's own timeout before the watcher intervenes.
pub const TIMEOUT_GRACE: Duration = Duration::from_secs(30);
/// How often the watcher checks the deadline.
pub const WATCH_INTERVAL: Duration = Duration::from_secs(5);
/// How long the watcher waits for a cancelled task to stop.
pub const WIND_DOWN: Duration = Duration::from_secs(5);

enum ExecutionEnd {
    Finished(TaskOutcome),
    TimedOut,
    Cancelled,
}

pub struct TaskSupervisor {
    control_plane: Arc<dyn ControlPlane>,
    runner: Arc<dyn TaskRunner>,
    state: Arc<AgentRuntimeState>,
    registry: Arc<TaskRegistry>,
    metrics: Arc<AgentMetrics>,
    report_policy: RetryPolicy,
}

impl TaskSupervisor {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        runner: Arc<dyn TaskRunner>,
        state: Arc<AgentRuntimeState>,
        registry: Arc<TaskRegistry>,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        Self {
            control_plane,
            runner,
            state,
            registry,
            metrics,
            report_policy: RetryPolicy::reporting(),
        }
    }

    pub fn with_report_policy(mut self, policy: RetryPolicy) -> Self {
        self.report_policy = policy;
        self
    }

    /// Execute the package and report its outcome.
    ///
    /// Returns the reported outcome, or `None` when the task did not run to
    /// an outcome (already executing, or cancelled by an abort).
    pub async fn execute(
        &self,
        reservation: &Reservation,
        package: TaskPackage,
        context: ExpressionContext,
    ) -> Option<TaskOutcome> {
        let task_id = &reservation.task_id;
        let sanitizer = LogSanitizer::new(&package.secrets);
        let (task_type, timeout_ms) = package
            .data
            .as_ref()
            .map(|d| (d.task_type.clone(), d.timeout_ms))
            .unwrap_or_default();

        if !self
            .registry
            .begin_execution(task_id, reservation.attempt, &task_type)
        {
            error!(task_id = %task_id, "Task is already executing, aborting duplicate execution");
            return None;
        }
        self.registry
            .set_status(task_id, reservation.attempt, ExecutionStatus::Executing);
        let started = Instant::now();

        let end = if let Some(message) = self.unsupported_type(&task_type) {
            warn!(task_id = %task_id, task_type = %task_type, "Rejecting task type");
            ExecutionEnd::Finished(TaskOutcome::ParametersFailure { message })
        } else {
            info!(task_id = %task_id, task_type = %task_type, timeout_ms, "Executing task");
            self.run_with_watchdog(reservation, &package, &context, &sanitizer, timeout_ms)
                .await
        };

        self.registry.end_execution(task_id, reservation.attempt);

        let (outcome, status) = match end {
            ExecutionEnd::Cancelled => {
                self.registry
                    .set_status(task_id, reservation.attempt, ExecutionStatus::Cancelled);
                info!(task_id = %task_id, "Task cancelled, not reporting");
                return None;
            }
            ExecutionEnd::TimedOut => {
                self.metrics.record_failed();
                (
                    TaskOutcome::TimedOut { timeout_ms },
                    ExecutionStatus::TimedOut,
                )
            }
            ExecutionEnd::Finished(outcome) if outcome.is_success() => {
                self.metrics.record_succeeded();
                (outcome, ExecutionStatus::Completed)
            }
            ExecutionEnd::Finished(outcome) => {
                self.metrics.record_failed();
                (outcome, ExecutionStatus::Failed)
            }
        };
        self.registry.set_status(task_id, reservation.attempt, status);

        info!(
            task_id = %task_id,
            outcome = outcome.kind(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Task finished"
        );
        self.report(&package, &outcome, started.elapsed()).await;
        Some(outcome)
    }

    /// Report an outcome for a package that never reached execution.
    pub async fn report_failure(&self, reservation: &Reservation, package: &TaskPackage, outcome: TaskOutcome) {
        self.registry
            .set_status(&reservation.task_id, reservation.attempt, ExecutionStatus::Failed);
        self.metrics.record_failed();
        self.report(package, &outcome, Duration::ZERO).await;
    }

    fn unsupported_type(&self, task_type: &str) -> Option<String> {
        let capabilities = self
            .state
            .identity()
            .map(|identity| identity.capabilities.clone())
            .unwrap_or_default();
        match TaskType::parse(task_type) {
            Some(t) if capabilities.contains(&t) => None,
            Some(t) => Some(format!("Task type {t} is not enabled on this agent")),
            None => Some(format!("Unsupported task type: {task_type}")),
        }
    }

    async fn run_with_watchdog(
        &self,
        reservation: &Reservation,
        package: &TaskPackage,
        context: &ExpressionContext,
        sanitizer: &LogSanitizer,
        timeout_ms: u64,
    ) -> ExecutionEnd {
        let cancel = reservation.cancel.clone();
        let finished = CancellationToken::new();
        let timed_out = Arc::new(AtomicBool::new(false));

        let watcher = tokio::spawn(watch_timeout(
            reservation.task_id.clone(),
            Duration::from_millis(timeout_ms) + TIMEOUT_GRACE,
            cancel.clone(),
            finished.clone(),
            timed_out.clone(),
            self.metrics.clone(),
        ));

        let body = AssertUnwindSafe(self.runner.run(package, context, sanitizer)).catch_unwind();
        let end = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if timed_out.load(Ordering::SeqCst) {
                    ExecutionEnd::TimedOut
                } else {
                    ExecutionEnd::Cancelled
                }
            }
            result = body => match result {
                Ok(outcome) => ExecutionEnd::Finished(outcome),
                Err(panic) => {
                    let message = sanitizer.sanitize(&panic_message(panic.as_ref()));
                    error!(task_id = %reservation.task_id, error = %message, "Task panicked");
                    ExecutionEnd::Finished(TaskOutcome::StepException {
                        message,
                        exit_code: None,
                    })
                }
            },
        };

        finished.cancel();
        let _ = watcher.await;
        end
    }

    async fn report(&self, package: &TaskPackage, outcome: &TaskOutcome, duration: Duration) {
        if !self.state.should_contact_control_plane() {
            warn!(task_id = %package.task_id, "Not reporting result, agent is self destructing");
            return;
        }
        let Some(agent_id) = self.state.agent_id() else {
            error!(task_id = %package.task_id, "Cannot report result, agent is not registered");
            return;
        };

        let result = TaskResult {
            task_id: package.task_id.clone(),
            account_id: package.account_id.clone(),
            outcome: outcome.clone(),
            duration_ms: duration.as_millis() as u64,
            completed_at: Utc::now(),
        };

        let control_plane = &self.control_plane;
        let agent_id = &agent_id;
        let result = &result;
        let delivered = retry_with_backoff(
            &self.report_policy,
            "report_task_result",
            |_| true,
            move |_| async move {
                control_plane
                    .report_task_result(agent_id, &result.task_id, &result.account_id, result)
                    .await
            },
        )
        .await;

        match delivered {
            Ok(()) => debug!(task_id = %package.task_id, "Task result reported"),
            Err(e) => {
                self.metrics.record_report_failure();
                error!(
                    task_id = %package.task_id,
                    error = %e,
                    "Giving up reporting task result"
                );
            }
        }
    }
}

/// Cancel the task once `deadline` passes while it is still running.
async fn watch_timeout(
    task_id: TaskId,
    deadline: Duration,
    cancel: CancellationToken,
    finished: CancellationToken,
    timed_out: Arc<AtomicBool>,
    metrics: Arc<AgentMetrics>,
) {
    let started = Instant::now();
    let mut ticker = interval(WATCH_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = finished.cancelled() => return,
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if started.elapsed() < deadline {
            continue;
        }

        warn!(
            task_id = %task_id,
            deadline_ms = deadline.as_millis() as u64,
            "Task timed out, cancelling"
        );
        timed_out.store(true, Ordering::SeqCst);
        metrics.record_timed_out();
        cancel.cancel();

        if timeout(WIND_DOWN, finished.cancelled()).await.is_err() {
            error!(task_id = %task_id, "Task did not stop after cancellation");
        }
        return;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("Task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("Task panicked: {s}")
    } else {
        "Task panicked".to_string()
    }
}
