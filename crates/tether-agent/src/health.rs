//! Agent health derived from runtime state and metrics.

use crate::metrics::AgentMetrics;
use crate::registry::TaskRegistry;
use crate::state::{AgentRuntimeState, SocketStatus};
use chrono::Utc;

/// Health status of the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// Registered, heartbeating and accepting tasks.
    Healthy,
    /// Working, but not at full capacity.
    Degraded { reason: String },
    /// Not able to take work.
    Unhealthy { reason: String },
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    /// Healthy or degraded.
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded { .. })
    }
}

/// Health check result with details.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub registered: bool,
    pub heartbeat_healthy: bool,
    pub socket_status: SocketStatus,
    pub rejecting_tasks: bool,
    pub executing_tasks: usize,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub report_failures: u64,
}

impl HealthCheck {
    /// `streaming` says whether the socket state matters.
    pub fn evaluate(
        state: &AgentRuntimeState,
        registry: &TaskRegistry,
        metrics: &AgentMetrics,
        streaming: bool,
    ) -> Self {
        let snapshot = metrics.snapshot();
        let registered = state.identity().is_some();
        let heartbeat_healthy = !state.heartbeat.has_sent_first()
            || state
                .heartbeat
                .is_heartbeat_healthy(Utc::now().timestamp_millis());
        let socket_status = state.socket_status();
        let rejecting_tasks = state.resources.is_rejecting();

        let status = if state.is_self_destructing() {
            HealthStatus::Unhealthy {
                reason: "Agent is self destructing".to_string(),
            }
        } else if !registered {
            HealthStatus::Unhealthy {
                reason: "Agent is not registered".to_string(),
            }
        } else if state.is_frozen() {
            HealthStatus::Unhealthy {
                reason: "Agent is frozen".to_string(),
            }
        } else if !heartbeat_healthy {
            HealthStatus::Degraded {
                reason: "No heartbeat sent within the health window".to_string(),
            }
        } else if streaming && !socket_status.is_writable() {
            HealthStatus::Degraded {
                reason: format!("Stream socket is {socket_status:?}"),
            }
        } else if rejecting_tasks {
            HealthStatus::Degraded {
                reason: "Memory threshold exceeded, rejecting tasks".to_string(),
            }
        } else if snapshot.report_failures > 0 {
            HealthStatus::Degraded {
                reason: format!("{} task results could not be reported", snapshot.report_failures),
            }
        } else {
            HealthStatus::Healthy
        };

        Self {
            status,
            registered,
            heartbeat_healthy,
            socket_status,
            rejecting_tasks,
            executing_tasks: registry.executing_count(),
            tasks_succeeded: snapshot.tasks_succeeded,
            tasks_failed: snapshot.tasks_failed,
            report_failures: snapshot.report_failures,
        }
    }
}
