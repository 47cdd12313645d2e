//! Transports that deliver control plane events to the agent.
//!
//! Polling asks the control plane for pending task events on a fixed
//! interval. Streaming holds a websocket open and receives events as they
//! are pushed. Both forward what they receive as [`Inbound`] messages.

pub mod frames;
pub mod polling;
pub mod streaming;

pub use polling::PollingTransport;
pub use streaming::{StreamConnector, StreamError, StreamErrorKind, StreamEvent, StreamingTransport, WsConnector};

use tether_core::agent::HeartbeatResponse;
use tether_core::task::TaskEvent;

/// Something a transport received that another component must handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Task(TaskEvent),
    HeartbeatResponse(HeartbeatResponse),
}
