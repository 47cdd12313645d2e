//! Classification of inbound stream frames.

use serde::Deserialize;
use tether_core::agent::{HeartbeatResponse, InstanceStatus};
use tether_core::ids::AgentId;
use tether_core::task::TaskEvent;
use tether_core::{Error, Result};

pub const TASK_EVENT_MARKER: &str = r#"{"eventType":"DelegateTaskEvent""#;
pub const TASK_ABORT_MARKER: &str = r#"{"eventType":"DelegateTaskAbortEvent""#;
pub const HEARTBEAT_MARKER: &str = r#"{"eventType":"DelegateHeartbeatResponseStreaming""#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    TaskEvent,
    AbortEvent,
    HeartbeatResponse,
    Other,
}

/// Classify a text frame by its marker prefix.
pub fn classify(frame: &str) -> FrameKind {
    let frame = frame.trim_start();
    if frame.starts_with(TASK_EVENT_MARKER) {
        FrameKind::TaskEvent
    } else if frame.starts_with(TASK_ABORT_MARKER) {
        FrameKind::AbortEvent
    } else if frame.starts_with(HEARTBEAT_MARKER) {
        FrameKind::HeartbeatResponse
    } else {
        FrameKind::Other
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Task(TaskEvent),
    HeartbeatResponse(HeartbeatResponse),
    Other(String),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamingHeartbeat {
    #[serde(alias = "agentId")]
    delegate_id: AgentId,
    status: InstanceStatus,
}

/// Parse a text frame into its typed form.
pub fn parse(frame: &str) -> Result<Frame> {
    match classify(frame) {
        FrameKind::TaskEvent | FrameKind::AbortEvent => {
            let event: TaskEvent = serde_json::from_str(frame)?;
            Ok(Frame::Task(event))
        }
        FrameKind::HeartbeatResponse => {
            let hb: StreamingHeartbeat = serde_json::from_str(frame)
                .map_err(|e| Error::Serialization(format!("heartbeat frame: {e}")))?;
            Ok(Frame::HeartbeatResponse(HeartbeatResponse {
                agent_id: hb.delegate_id,
                status: hb.status,
            }))
        }
        FrameKind::Other => Ok(Frame::Other(frame.to_string())),
    }
}
