//! Shared runtime state of the agent.
//!
//! Every long-running component holds an `Arc<AgentRuntimeState>` and
//! coordinates through its atomic flags and watch channels. There is no
//! global lock.

use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;
use tether_core::agent::{AgentIdentity, ControlDirective};
use tether_core::ids::{AgentId, ConnectionId, InstanceId};
use tokio::sync::watch;
use tracing::{info, warn};

/// No heartbeat sent within this window marks the agent unhealthy.
pub const HEARTBEAT_HEALTH_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Connection status of the streaming transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SocketStatus {
    Init = 0,
    Open = 1,
    Reopened = 2,
    Closed = 3,
    Error = 4,
}

impl SocketStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SocketStatus::Open,
            2 => SocketStatus::Reopened,
            3 => SocketStatus::Closed,
            4 => SocketStatus::Error,
            _ => SocketStatus::Init,
        }
    }

    /// Whether frames can be written to the socket.
    pub fn is_writable(&self) -> bool {
        matches!(self, SocketStatus::Open | SocketStatus::Reopened)
    }
}

/// Session flags, identity and the shutdown signal.
pub struct AgentRuntimeState {
    instance_id: InstanceId,
    connection_id: ConnectionId,
    identity_tx: watch::Sender<Option<Arc<AgentIdentity>>>,
    frozen: AtomicBool,
    frozen_at_ms: AtomicI64,
    acquire_tasks: AtomicBool,
    self_destruct: AtomicBool,
    socket_status: AtomicU8,
    shutdown_tx: watch::Sender<bool>,
    pub heartbeat: HeartbeatState,
    pub resources: ResourceThresholdState,
}

impl AgentRuntimeState {
    pub fn new(instance_id: InstanceId, connection_id: ConnectionId) -> Arc<Self> {
        let (identity_tx, _) = watch::channel(None);
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            instance_id,
            connection_id,
            identity_tx,
            frozen: AtomicBool::new(false),
            frozen_at_ms: AtomicI64::new(0),
            acquire_tasks: AtomicBool::new(true),
            self_destruct: AtomicBool::new(false),
            socket_status: AtomicU8::new(SocketStatus::Init as u8),
            shutdown_tx,
            heartbeat: HeartbeatState::default(),
            resources: ResourceThresholdState::default(),
        })
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Publish the identity obtained by (re-)registration.
    pub fn publish_identity(&self, identity: AgentIdentity) {
        info!(agent_id = %identity.agent_id, "Agent identity published");
        self.identity_tx.send_replace(Some(Arc::new(identity)));
    }

    pub fn identity(&self) -> Option<Arc<AgentIdentity>> {
        self.identity_tx.borrow().clone()
    }

    pub fn agent_id(&self) -> Option<AgentId> {
        self.identity_tx
            .borrow()
            .as_ref()
            .map(|identity| identity.agent_id.clone())
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Unix millis at which the agent froze, if it has.
    pub fn frozen_at_ms(&self) -> Option<i64> {
        let at = self.frozen_at_ms.load(Ordering::SeqCst);
        (at > 0).then_some(at)
    }

    /// Stop acquiring new work. In-flight tasks continue.
    pub fn freeze(&self) {
        if !self.frozen.swap(true, Ordering::SeqCst) {
            self.frozen_at_ms
                .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
            warn!("Agent frozen by control plane, no new tasks will be acquired");
        }
    }

    pub fn is_acquiring(&self) -> bool {
        self.acquire_tasks.load(Ordering::SeqCst)
    }

    pub fn set_acquiring(&self, acquiring: bool) {
        self.acquire_tasks.store(acquiring, Ordering::SeqCst);
    }

    pub fn is_self_destructing(&self) -> bool {
        self.self_destruct.load(Ordering::SeqCst)
    }

    /// Stop acquiring, stop contacting the control plane and signal shutdown.
    /// Returns false when self destruct was already in progress.
    pub fn initiate_self_destruct(&self) -> bool {
        if self.self_destruct.swap(true, Ordering::SeqCst) {
            return false;
        }
        warn!("Self destruct initiated");
        self.acquire_tasks.store(false, Ordering::SeqCst);
        self.request_shutdown();
        true
    }

    pub fn should_contact_control_plane(&self) -> bool {
        !self.is_self_destructing()
    }

    pub fn apply_directive(&self, directive: ControlDirective) {
        match directive {
            ControlDirective::SelfDestruct => {
                self.initiate_self_destruct();
            }
            ControlDirective::Freeze => self.freeze(),
        }
    }

    /// Inspect a control plane error body and apply any directive it carries.
    pub fn handle_error_body(&self, body: &str) -> Option<ControlDirective> {
        let agent_id = self.agent_id();
        let directive =
            ControlDirective::from_error_body(body, agent_id.as_ref(), &self.connection_id)?;
        self.apply_directive(directive);
        Some(directive)
    }

    pub fn socket_status(&self) -> SocketStatus {
        SocketStatus::from_u8(self.socket_status.load(Ordering::SeqCst))
    }

    pub fn set_socket_status(&self, status: SocketStatus) {
        self.socket_status.store(status as u8, Ordering::SeqCst);
    }

    pub fn request_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }
}

/// Heartbeat bookkeeping. Written by the heartbeat controller only.
#[derive(Debug, Default)]
pub struct HeartbeatState {
    last_sent_at_ms: AtomicI64,
    last_received_at_ms: AtomicI64,
    success_count: AtomicU64,
    sent_first: AtomicBool,
}

impl HeartbeatState {
    pub fn record_sent(&self, now_ms: i64) {
        self.last_sent_at_ms.store(now_ms, Ordering::SeqCst);
        self.sent_first.store(true, Ordering::SeqCst);
    }

    /// Record a response and return the gap since the matching send.
    pub fn record_received(&self, now_ms: i64) -> Duration {
        self.last_received_at_ms.store(now_ms, Ordering::SeqCst);
        self.success_count.fetch_add(1, Ordering::SeqCst);
        let sent = self.last_sent_at_ms.load(Ordering::SeqCst);
        Duration::from_millis(now_ms.saturating_sub(sent).max(0) as u64)
    }

    pub fn last_sent_at_ms(&self) -> Option<i64> {
        let at = self.last_sent_at_ms.load(Ordering::SeqCst);
        (at > 0).then_some(at)
    }

    pub fn last_received_at_ms(&self) -> Option<i64> {
        let at = self.last_received_at_ms.load(Ordering::SeqCst);
        (at > 0).then_some(at)
    }

    pub fn success_count(&self) -> u64 {
        self.success_count.load(Ordering::SeqCst)
    }

    pub fn has_sent_first(&self) -> bool {
        self.sent_first.load(Ordering::SeqCst)
    }

    /// A heartbeat went out within the health window.
    pub fn is_heartbeat_healthy(&self, now_ms: i64) -> bool {
        match self.last_sent_at_ms() {
            Some(sent) => {
                now_ms.saturating_sub(sent) <= HEARTBEAT_HEALTH_WINDOW.as_millis() as i64
            }
            None => false,
        }
    }
}

/// Memory pressure flag. Written by the resource governor only.
#[derive(Debug)]
pub struct ResourceThresholdState {
    reject: AtomicBool,
    /// Fraction of a memory limit at which new work is rejected.
    pub threshold_ratio: f64,
}

impl Default for ResourceThresholdState {
    fn default() -> Self {
        Self {
            reject: AtomicBool::new(false),
            threshold_ratio: 0.9,
        }
    }
}

impl ResourceThresholdState {
    pub fn is_rejecting(&self) -> bool {
        self.reject.load(Ordering::SeqCst)
    }

    /// Flip false to true. Returns whether this call made the transition.
    pub fn try_set_reject(&self) -> bool {
        self.reject
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Flip true to false. Returns whether this call made the transition.
    pub fn try_clear_reject(&self) -> bool {
        self.reject
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::ids::{AccountId, ConnectionId};

    fn state() -> Arc<AgentRuntimeState> {
        AgentRuntimeState::new(InstanceId::new(), ConnectionId::new())
    }

    fn identity(state: &AgentRuntimeState, agent_id: &str) -> AgentIdentity {
        AgentIdentity {
            agent_id: AgentId::from(agent_id),
            account_id: AccountId::from("acc"),
            group_id: None,
            name: "a".into(),
            tags: vec![],
            capabilities: vec![],
            instance_id: state.instance_id(),
            connection_id: state.connection_id(),
            host_name: "h".into(),
            agent_type: "DOCKER".into(),
            version: "0".into(),
        }
    }

    #[test]
    fn test_self_destruct_is_single_shot() {
        let state = state();
        let shutdown = state.subscribe_shutdown();
        assert!(state.initiate_self_destruct());
        assert!(!state.initiate_self_destruct());
        assert!(!state.is_acquiring());
        assert!(!state.should_contact_control_plane());
        assert!(*shutdown.borrow());
    }

    #[test]
    fn test_error_body_directives() {
        let state = state();
        state.publish_identity(identity(&state, "agent-1"));

        assert_eq!(
            state.handle_error_body("EXPIRED_TOKEN"),
            Some(ControlDirective::Freeze)
        );
        assert!(state.is_frozen());
        assert!(state.frozen_at_ms().is_some());
        assert!(!state.is_self_destructing());

        let duplicate = format!(
            "Duplicate delegate with same delegateId:agent-1 and connectionId:{} exists",
            state.connection_id().as_uuid()
        );
        assert_eq!(
            state.handle_error_body(&duplicate),
            Some(ControlDirective::SelfDestruct)
        );
        assert!(state.is_self_destructing());
    }

    #[test]
    fn test_identity_replaced_on_reregistration() {
        let state = state();
        assert!(state.agent_id().is_none());
        state.publish_identity(identity(&state, "agent-1"));
        state.publish_identity(identity(&state, "agent-2"));
        assert_eq!(state.agent_id(), Some(AgentId::from("agent-2")));
    }

    #[test]
    fn test_heartbeat_health_window() {
        let hb = HeartbeatState::default();
        assert!(!hb.is_heartbeat_healthy(1_000));
        hb.record_sent(1_000);
        assert!(hb.is_heartbeat_healthy(1_000 + 60_000));
        assert!(!hb.is_heartbeat_healthy(1_000 + 16 * 60_000));

        let gap = hb.record_received(1_000 + 4_000);
        assert_eq!(gap, Duration::from_secs(4));
        assert_eq!(hb.success_count(), 1);
    }

    #[test]
    fn test_reject_flag_transitions_once() {
        let resources = ResourceThresholdState::default();
        assert!(resources.try_set_reject());
        assert!(!resources.try_set_reject());
        assert!(resources.is_rejecting());
        assert!(resources.try_clear_reject());
        assert!(!resources.try_clear_reject());
    }

    #[test]
    fn test_socket_status() {
        let state = state();
        assert_eq!(state.socket_status(), SocketStatus::Init);
        state.set_socket_status(SocketStatus::Reopened);
        assert!(state.socket_status().is_writable());
        state.set_socket_status(SocketStatus::Closed);
        assert!(!state.socket_status().is_writable());
    }
}
