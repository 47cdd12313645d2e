//! Polling transport.

use super::Inbound;
use crate::state::AgentRuntimeState;
use std::sync::Arc;
use std::time::Duration;
use tether_core::Error;
use tether_core::ports::ControlPlane;
use tokio::sync::{mpsc, watch};
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, info, warn};

/// Upper bound on a single poll.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(15);

/// Fetches pending task events on a fixed interval.
pub struct PollingTransport {
    control_plane: Arc<dyn ControlPlane>,
    state: Arc<AgentRuntimeState>,
    interval: Duration,
}

impl PollingTransport {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        state: Arc<AgentRuntimeState>,
        interval: Duration,
    ) -> Self {
        Self {
            control_plane,
            state,
            interval,
        }
    }

    /// Poll until shutdown. Failures are logged and retried on the next tick.
    pub async fn run(self, inbound: mpsc::Sender<Inbound>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_ms = self.interval.as_millis() as u64, "Polling for task events");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.poll_once(&inbound).await {
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Polling transport shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run one poll. Returns false when the inbound channel has closed.
    pub async fn poll_once(&self, inbound: &mpsc::Sender<Inbound>) -> bool {
        if self.state.is_frozen()
            || !self.state.is_acquiring()
            || !self.state.should_contact_control_plane()
        {
            return true;
        }
        let Some(identity) = self.state.identity() else {
            debug!("Skipping poll, agent not registered");
            return true;
        };

        let events = match timeout(
            POLL_TIMEOUT,
            self.control_plane
                .poll_task_events(&identity.agent_id, &identity.account_id),
        )
        .await
        {
            Ok(Ok(response)) => response.events,
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to poll task events");
                return true;
            }
            Err(_) => {
                warn!(error = %Error::Timeout(POLL_TIMEOUT), "Polling task events timed out");
                return true;
            }
        };

        if !events.is_empty() {
            debug!(count = events.len(), "Received task events");
        }
        for event in events {
            if inbound.send(Inbound::Task(event)).await.is_err() {
                return false;
            }
        }
        true
    }
}
