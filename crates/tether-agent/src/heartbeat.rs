//! Heartbeat controller.

use crate::metrics::AgentMetrics;
use crate::registry::TaskRegistry;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::state::AgentRuntimeState;
use crate::transport::StreamingTransport;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{ProcessesToUpdate, System};
use tether_core::Error;
use tether_core::agent::{HeartbeatRequest, HeartbeatResponse, InstanceStatus};
use tether_core::ports::ControlPlane;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, error, info, warn};

/// Upper bound on a single REST heartbeat.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);

/// A response arriving later than this after its heartbeat is logged at WARN.
pub const SLOW_RESPONSE_THRESHOLD: Duration = Duration::from_secs(3 * 60);

/// Where heartbeats are sent.
pub enum HeartbeatChannel {
    Rest,
    Stream(Arc<StreamingTransport>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Frozen,
    NotAcquiring,
    SelfDestructing,
    NotRegistered,
    SocketNotOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Sent,
    Skipped(SkipReason),
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseLatency {
    Normal(Duration),
    Slow(Duration),
}

/// Sends periodic liveness reports with the executing task set.
pub struct HeartbeatController {
    control_plane: Arc<dyn ControlPlane>,
    state: Arc<AgentRuntimeState>,
    registry: Arc<TaskRegistry>,
    metrics: Arc<AgentMetrics>,
    channel: HeartbeatChannel,
    interval: Duration,
}

impl HeartbeatController {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        state: Arc<AgentRuntimeState>,
        registry: Arc<TaskRegistry>,
        metrics: Arc<AgentMetrics>,
        channel: HeartbeatChannel,
        interval: Duration,
    ) -> Self {
        Self {
            control_plane,
            state,
            registry,
            metrics,
            channel,
            interval,
        }
    }

    /// Run the heartbeat loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sys = System::new();

        info!(
            interval_secs = self.interval.as_secs(),
            "Starting heartbeat controller"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = self.tick().await;
                    debug!(outcome = ?outcome, "Heartbeat tick");
                    self.log_performance(&mut sys);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Heartbeat controller shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Send one heartbeat unless the agent is in a state that forbids it.
    pub async fn tick(&self) -> HeartbeatOutcome {
        if self.state.is_frozen() {
            return HeartbeatOutcome::Skipped(SkipReason::Frozen);
        }
        if !self.state.is_acquiring() {
            return HeartbeatOutcome::Skipped(SkipReason::NotAcquiring);
        }
        if !self.state.should_contact_control_plane() {
            return HeartbeatOutcome::Skipped(SkipReason::SelfDestructing);
        }
        let Some(identity) = self.state.identity() else {
            return HeartbeatOutcome::Skipped(SkipReason::NotRegistered);
        };

        let now = Utc::now();
        let request = HeartbeatRequest {
            agent_id: identity.agent_id.clone(),
            account_id: identity.account_id.clone(),
            instance_id: identity.instance_id,
            connection_id: identity.connection_id,
            version: identity.version.clone(),
            polling_mode_enabled: matches!(self.channel, HeartbeatChannel::Rest),
            frozen: self.state.is_frozen(),
            executing_task_ids: self.registry.executing_task_ids(),
            last_heartbeat: now,
        };

        match &self.channel {
            HeartbeatChannel::Rest => {
                self.state.heartbeat.record_sent(now.timestamp_millis());
                let control_plane = &self.control_plane;
                let account_id = &identity.account_id;
                let request = &request;
                let result = retry_with_backoff(
                    &RetryPolicy::heartbeat(),
                    "heartbeat",
                    Error::is_retryable,
                    move |_| async move {
                        timeout(
                            HEARTBEAT_TIMEOUT,
                            control_plane.send_heartbeat(account_id, request),
                        )
                        .await
                        .map_err(|_| Error::Timeout(HEARTBEAT_TIMEOUT))?
                    },
                )
                .await;

                match result {
                    Ok(response) => {
                        self.metrics.record_heartbeat(true);
                        self.on_heartbeat_response(&response, Utc::now().timestamp_millis());
                        HeartbeatOutcome::Sent
                    }
                    Err(e) => {
                        self.metrics.record_heartbeat(false);
                        warn!(error = %e, "Failed to send heartbeat");
                        HeartbeatOutcome::Failed
                    }
                }
            }
            HeartbeatChannel::Stream(transport) => {
                if !self.state.socket_status().is_writable() {
                    return HeartbeatOutcome::Skipped(SkipReason::SocketNotOpen);
                }
                let frame = match serde_json::to_string(&request) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!(error = %e, "Failed to encode heartbeat");
                        return HeartbeatOutcome::Failed;
                    }
                };
                self.state.heartbeat.record_sent(now.timestamp_millis());
                match transport.send_text(frame).await {
                    Ok(()) => {
                        self.metrics.record_heartbeat(true);
                        HeartbeatOutcome::Sent
                    }
                    Err(e) => {
                        self.metrics.record_heartbeat(false);
                        warn!(error = %e, "Failed to send heartbeat on stream");
                        HeartbeatOutcome::Failed
                    }
                }
            }
        }
    }

    /// Record a heartbeat response and act on the status it carries.
    pub fn on_heartbeat_response(
        &self,
        response: &HeartbeatResponse,
        now_ms: i64,
    ) -> ResponseLatency {
        let gap = self.state.heartbeat.record_received(now_ms);
        let latency = if gap > SLOW_RESPONSE_THRESHOLD {
            warn!(
                agent_id = %response.agent_id,
                gap_ms = gap.as_millis() as u64,
                "Heartbeat response received late"
            );
            ResponseLatency::Slow(gap)
        } else {
            info!(
                agent_id = %response.agent_id,
                status = ?response.status,
                gap_ms = gap.as_millis() as u64,
                "Heartbeat response received"
            );
            ResponseLatency::Normal(gap)
        };

        if response.status == InstanceStatus::Deleted {
            error!(agent_id = %response.agent_id, "Agent deleted by control plane");
            self.state.initiate_self_destruct();
        }
        latency
    }

    fn log_performance(&self, sys: &mut System) {
        let perf = self.metrics.take_performance(
            self.registry.executing_count(),
            self.registry.in_flight_count(),
        );
        let (cpu_percent, memory_bytes) = match sysinfo::get_current_pid() {
            Ok(pid) => {
                sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                sys.process(pid)
                    .map(|p| (p.cpu_usage(), p.memory()))
                    .unwrap_or_default()
            }
            Err(_) => (0.0, 0),
        };
        info!(
            max_executing_tasks = perf.max_executing_tasks,
            max_executing_futures = perf.max_executing_futures,
            executing_tasks = perf.executing_tasks,
            cpu_percent,
            memory_bytes,
            "Performance snapshot"
        );
    }
}
