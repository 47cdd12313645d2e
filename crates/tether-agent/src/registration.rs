//! Registration and session management.

use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::state::AgentRuntimeState;
use std::sync::Arc;
use std::time::Duration;
use tether_core::agent::{AgentIdentity, RegistrationAction, RegistrationDraft, UnregisterRequest};
use tether_core::ports::ControlPlane;
use tether_core::{Error, Result};
use tracing::{error, info, warn};

/// Registers the agent and keeps its identity current.
pub struct Registrar {
    control_plane: Arc<dyn ControlPlane>,
    state: Arc<AgentRuntimeState>,
    retry_interval: Duration,
}

impl Registrar {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        state: Arc<AgentRuntimeState>,
        retry_interval: Duration,
    ) -> Self {
        Self {
            control_plane,
            state,
            retry_interval,
        }
    }

    /// Register until the control plane assigns an id.
    ///
    /// Retries at a fixed interval for as long as the agent may acquire tasks.
    /// A self destruct action is obeyed immediately.
    pub async fn register(&self, draft: &RegistrationDraft) -> Result<Arc<AgentIdentity>> {
        info!(
            name = %draft.name,
            account_id = %draft.account_id,
            instance_id = %draft.instance_id,
            "Registering agent"
        );

        let policy = RetryPolicy::registration(self.retry_interval);
        let agent_id = retry_with_backoff(
            &policy,
            "register",
            |e| !matches!(e, Error::RegistrationAbandoned | Error::SelfDestruct),
            move |attempt| self.attempt(draft, attempt),
        )
        .await
        .inspect_err(|e| error!(error = %e, "Registration stopped"))?;

        let identity = draft.clone().into_identity(agent_id);
        info!(
            agent_id = %identity.agent_id,
            name = %identity.name,
            "Agent registered"
        );
        self.state.publish_identity(identity);
        self.state
            .identity()
            .ok_or_else(|| Error::Internal("identity not published".into()))
    }

    async fn attempt(
        &self,
        draft: &RegistrationDraft,
        attempt: u32,
    ) -> Result<tether_core::ids::AgentId> {
        if !self.state.is_acquiring() {
            return Err(Error::RegistrationAbandoned);
        }

        let response = match self.control_plane.register(draft).await {
            Ok(response) => response,
            Err(e) => {
                if self.state.is_self_destructing() {
                    return Err(Error::SelfDestruct);
                }
                return Err(e);
            }
        };

        match response.action {
            RegistrationAction::SelfDestruct => {
                warn!(attempt, "Control plane requested self destruct during registration");
                self.state.initiate_self_destruct();
                Err(Error::SelfDestruct)
            }
            RegistrationAction::Proceed => match response.agent_id {
                Some(agent_id) if !agent_id.is_empty() => Ok(agent_id),
                _ => Err(Error::Registration(
                    "control plane did not assign an agent id".into(),
                )),
            },
        }
    }

    /// Best-effort removal of this agent's registration.
    pub async fn unregister(
        &self,
        org_identifier: Option<String>,
        project_identifier: Option<String>,
    ) -> Result<()> {
        let Some(identity) = self.state.identity() else {
            return Err(Error::NotRegistered);
        };
        let request = UnregisterRequest {
            agent_id: identity.agent_id.clone(),
            host_name: identity.host_name.clone(),
            agent_type: identity.agent_type.clone(),
            ip: local_ip(),
            org_identifier,
            project_identifier,
        };
        match self
            .control_plane
            .unregister(&identity.account_id, &request)
            .await
        {
            Ok(()) => {
                info!(agent_id = %identity.agent_id, "Agent unregistered");
                Ok(())
            }
            Err(e) => {
                warn!(agent_id = %identity.agent_id, error = %e, "Failed to unregister agent");
                Err(e)
            }
        }
    }
}

/// Best-effort local address, resolved from the host name.
pub fn local_ip() -> String {
    use std::net::ToSocketAddrs;
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .and_then(|h| (h.as_str(), 0).to_socket_addrs().ok())
        .and_then(|mut addrs| addrs.find(|a| a.is_ipv4()))
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string())
}
