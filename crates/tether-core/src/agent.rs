//! Agent session types: identity, registration, heartbeats and control directives.

use crate::ids::{AccountId, AgentId, ConnectionId, GroupId, InstanceId, TaskId};
use crate::task::TaskType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a registered agent. Published once registration succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentity {
    pub agent_id: AgentId,
    pub account_id: AccountId,
    pub group_id: Option<GroupId>,
    pub name: String,
    pub tags: Vec<String>,
    pub capabilities: Vec<TaskType>,
    pub instance_id: InstanceId,
    pub connection_id: ConnectionId,
    pub host_name: String,
    pub agent_type: String,
    pub version: String,
}

/// What the agent tells the control plane about itself when registering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationDraft {
    pub account_id: AccountId,
    pub name: String,
    pub host_name: String,
    pub ip: String,
    pub group_name: Option<String>,
    pub group_id: Option<GroupId>,
    pub org_identifier: Option<String>,
    pub project_identifier: Option<String>,
    pub tags: Vec<String>,
    pub agent_type: String,
    pub version: String,
    pub instance_id: InstanceId,
    pub connection_id: ConnectionId,
    pub supported_task_types: Vec<TaskType>,
    pub polling_mode_enabled: bool,
    pub token_name: Option<String>,
}

impl RegistrationDraft {
    /// Build the identity this draft becomes once the control plane assigns an id.
    pub fn into_identity(self, agent_id: AgentId) -> AgentIdentity {
        AgentIdentity {
            agent_id,
            account_id: self.account_id,
            group_id: self.group_id,
            name: self.name,
            tags: self.tags,
            capabilities: self.supported_task_types,
            instance_id: self.instance_id,
            connection_id: self.connection_id,
            host_name: self.host_name,
            agent_type: self.agent_type,
            version: self.version,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistrationAction {
    Proceed,
    SelfDestruct,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    pub agent_id: Option<AgentId>,
    pub action: RegistrationAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnregisterRequest {
    pub agent_id: AgentId,
    pub host_name: String,
    pub agent_type: String,
    pub ip: String,
    pub org_identifier: Option<String>,
    pub project_identifier: Option<String>,
}

/// Status the control plane has recorded for this agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Enabled,
    WaitingForApproval,
    Disabled,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub agent_id: AgentId,
    pub account_id: AccountId,
    pub instance_id: InstanceId,
    pub connection_id: ConnectionId,
    pub version: String,
    pub polling_mode_enabled: bool,
    pub frozen: bool,
    pub executing_task_ids: Vec<TaskId>,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub agent_id: AgentId,
    pub status: InstanceStatus,
}

/// Session-level instruction carried by a control-plane response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlDirective {
    /// Stop acquiring, close transports and terminate.
    SelfDestruct,
    /// Stop acquiring new work but stay alive to drain in-flight tasks.
    Freeze,
}

const INVALID_TOKEN: &str = "INVALID_TOKEN";
const EXPIRED_TOKEN: &str = "EXPIRED_TOKEN";
const REVOKED_TOKEN: &str = "REVOKED_TOKEN";
const REVOKED_TOKEN_MESSAGE: &str = "Revoked Delegate Token";
const SELF_DESTRUCT: &str = "SELF_DESTRUCT";

impl ControlDirective {
    /// Inspect an error response body for token or duplicate-session problems.
    pub fn from_error_body(
        body: &str,
        agent_id: Option<&AgentId>,
        connection_id: &ConnectionId,
    ) -> Option<Self> {
        if body.contains(INVALID_TOKEN) {
            return Some(ControlDirective::SelfDestruct);
        }
        if let Some(agent_id) = agent_id {
            let duplicate = format!(
                "Duplicate delegate with same delegateId:{} and connectionId:{} exists",
                agent_id,
                connection_id.as_uuid()
            );
            if body.contains(&duplicate) {
                return Some(ControlDirective::SelfDestruct);
            }
        }
        if body.contains(EXPIRED_TOKEN)
            || body.contains(REVOKED_TOKEN)
            || body.contains(REVOKED_TOKEN_MESSAGE)
        {
            return Some(ControlDirective::Freeze);
        }
        None
    }

    /// Recognise plain-text directives pushed over the stream.
    pub fn from_frame(message: &str, agent_id: Option<&AgentId>) -> Option<Self> {
        let message = message.trim();
        if message == SELF_DESTRUCT {
            return Some(ControlDirective::SelfDestruct);
        }
        let rest = message.strip_prefix(SELF_DESTRUCT)?.trim();
        match agent_id {
            Some(id) if rest == id.as_str() => Some(ControlDirective::SelfDestruct),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_token_self_destructs() {
        let body = r#"{"code":"INVALID_TOKEN","message":"Token is invalid"}"#;
        assert_eq!(
            ControlDirective::from_error_body(body, None, &ConnectionId::new()),
            Some(ControlDirective::SelfDestruct)
        );
    }

    #[test]
    fn test_expired_and_revoked_tokens_freeze() {
        let conn = ConnectionId::new();
        for body in [
            "EXPIRED_TOKEN",
            r#"{"code":"REVOKED_TOKEN"}"#,
            "Revoked Delegate Token used",
        ] {
            assert_eq!(
                ControlDirective::from_error_body(body, None, &conn),
                Some(ControlDirective::Freeze),
                "{body}"
            );
        }
    }

    #[test]
    fn test_duplicate_session_only_matches_own_ids() {
        let conn = ConnectionId::new();
        let agent = AgentId::from("agent-1");
        let body = format!(
            "Duplicate delegate with same delegateId:agent-1 and connectionId:{} exists",
            conn.as_uuid()
        );
        assert_eq!(
            ControlDirective::from_error_body(&body, Some(&agent), &conn),
            Some(ControlDirective::SelfDestruct)
        );
        assert_eq!(
            ControlDirective::from_error_body(&body, Some(&agent), &ConnectionId::new()),
            None
        );
    }

    #[test]
    fn test_unrelated_error_has_no_directive() {
        assert_eq!(
            ControlDirective::from_error_body("internal error", None, &ConnectionId::new()),
            None
        );
    }

    #[test]
    fn test_frame_directive() {
        let agent = AgentId::from("agent-1");
        assert_eq!(
            ControlDirective::from_frame("SELF_DESTRUCT", None),
            Some(ControlDirective::SelfDestruct)
        );
        assert_eq!(
            ControlDirective::from_frame("SELF_DESTRUCT agent-1", Some(&agent)),
            Some(ControlDirective::SelfDestruct)
        );
        assert_eq!(
            ControlDirective::from_frame("SELF_DESTRUCT agent-2", Some(&agent)),
            None
        );
        assert_eq!(ControlDirective::from_frame("hello", Some(&agent)), None);
    }

    #[test]
    fn test_registration_action_wire_format() {
        let resp: RegistrationResponse =
            serde_json::from_str(r#"{"agentId":"a1","action":"SELF_DESTRUCT"}"#).unwrap();
        assert_eq!(resp.action, RegistrationAction::SelfDestruct);
        assert_eq!(resp.agent_id, Some(AgentId::from("a1")));
    }
}
