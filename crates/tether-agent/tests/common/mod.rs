//! Shared fixtures for agent integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_agent::agent::SUPPORTED_TASK_TYPES;
use tether_agent::dispatcher::TaskDispatcher;
use tether_agent::metrics::AgentMetrics;
use tether_agent::registry::TaskRegistry;
use tether_agent::retry::{Backoff, RetryPolicy};
use tether_agent::secrets::{AesGcmDecryptor, SecretInjector};
use tether_agent::state::AgentRuntimeState;
use tether_agent::supervisor::TaskSupervisor;
use tether_core::agent::{
    HeartbeatRequest, HeartbeatResponse, InstanceStatus, RegistrationAction, RegistrationDraft,
    RegistrationResponse, UnregisterRequest,
};
use tether_core::ids::{AccountId, AgentId, ConnectionId, InstanceId, TaskId};
use tether_core::ports::{ControlPlane, TaskRunner};
use tether_core::secrets::{ExpressionContext, LogSanitizer};
use tether_core::task::{TaskData, TaskEventsResponse, TaskOutcome, TaskPackage, TaskResult};
use tether_core::{Error, Result};

pub const ACCOUNT: &str = "acc-1";
pub const AGENT: &str = "agent-1";

/// In-memory control plane with scriptable responses.
#[derive(Default)]
pub struct MockControlPlane {
    pub registrations: Mutex<VecDeque<Result<RegistrationResponse>>>,
    pub register_calls: AtomicUsize,
    pub packages: Mutex<HashMap<TaskId, TaskPackage>>,
    pub acquire_calls: Mutex<Vec<TaskId>>,
    pub acquire_delay: Mutex<Option<Duration>>,
    pub reports: Mutex<Vec<TaskResult>>,
    pub report_calls: AtomicUsize,
    pub report_failures_left: AtomicUsize,
    pub heartbeats: Mutex<Vec<HeartbeatRequest>>,
    pub heartbeat_failures_left: AtomicUsize,
    pub heartbeat_status: Mutex<Option<InstanceStatus>>,
    pub unregistered: AtomicBool,
}

impl MockControlPlane {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_package(&self, package: TaskPackage) {
        self.packages
            .lock()
            .unwrap()
            .insert(package.task_id.clone(), package);
    }

    pub fn acquire_count(&self) -> usize {
        self.acquire_calls.lock().unwrap().len()
    }

    pub fn reports(&self) -> Vec<TaskResult> {
        self.reports.lock().unwrap().clone()
    }

    pub fn heartbeats(&self) -> Vec<HeartbeatRequest> {
        self.heartbeats.lock().unwrap().clone()
    }
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    async fn register(&self, _draft: &RegistrationDraft) -> Result<RegistrationResponse> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        self.registrations
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(RegistrationResponse {
                    agent_id: Some(AgentId::from(AGENT)),
                    action: RegistrationAction::Proceed,
                })
            })
    }

    async fn unregister(&self, _account_id: &AccountId, _request: &UnregisterRequest) -> Result<()> {
        self.unregistered.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn poll_task_events(
        &self,
        _agent_id: &AgentId,
        _account_id: &AccountId,
    ) -> Result<TaskEventsResponse> {
        Ok(TaskEventsResponse::default())
    }

    async fn acquire_task(
        &self,
        _agent_id: &AgentId,
        task_id: &TaskId,
        _account_id: &AccountId,
        _instance_id: &InstanceId,
    ) -> Result<Option<TaskPackage>> {
        self.acquire_calls.lock().unwrap().push(task_id.clone());
        let delay = *self.acquire_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.packages.lock().unwrap().get(task_id).cloned())
    }

    async fn send_heartbeat(
        &self,
        _account_id: &AccountId,
        heartbeat: &HeartbeatRequest,
    ) -> Result<HeartbeatResponse> {
        self.heartbeats.lock().unwrap().push(heartbeat.clone());
        if self
            .heartbeat_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Network("connection reset".into()));
        }
        Ok(HeartbeatResponse {
            agent_id: heartbeat.agent_id.clone(),
            status: self
                .heartbeat_status
                .lock()
                .unwrap()
                .unwrap_or(InstanceStatus::Enabled),
        })
    }

    async fn report_task_result(
        &self,
        _agent_id: &AgentId,
        _task_id: &TaskId,
        _account_id: &AccountId,
        result: &TaskResult,
    ) -> Result<()> {
        self.report_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .report_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::ControlPlane {
                status: 503,
                body: "unavailable".into(),
            });
        }
        self.reports.lock().unwrap().push(result.clone());
        Ok(())
    }
}

/// Runner driven by the package parameters:
/// `{"mode": "ok" | "fail" | "panic", "sleepSecs": n}`.
#[derive(Default)]
pub struct FakeRunner {
    pub calls: AtomicUsize,
}

#[async_trait]
impl TaskRunner for FakeRunner {
    async fn run(
        &self,
        package: &TaskPackage,
        _context: &ExpressionContext,
        _sanitizer: &LogSanitizer,
    ) -> TaskOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let params = package
            .data
            .as_ref()
            .map(|d| d.parameters.clone())
            .unwrap_or_default();
        if let Some(secs) = params["sleepSecs"].as_u64() {
            tokio::time::sleep(Duration::from_secs(secs)).await;
        }
        match params["mode"].as_str().unwrap_or("ok") {
            "panic" => panic!("boom"),
            "fail" => TaskOutcome::StepException {
                message: "step failed".into(),
                exit_code: Some(1),
            },
            _ => TaskOutcome::Success {
                output: "done".into(),
                exit_code: 0,
            },
        }
    }
}

pub fn package(task_id: &str, parameters: serde_json::Value) -> TaskPackage {
    TaskPackage {
        task_id: TaskId::from(task_id),
        account_id: AccountId::from(ACCOUNT),
        data: Some(TaskData {
            task_type: "SHELL_SCRIPT_TASK_NG".into(),
            parameters,
            timeout_ms: 600_000,
            is_async: false,
        }),
        secrets: BTreeSet::new(),
        encryption_configs: HashMap::new(),
        secret_references: vec![],
        target_instance_id: None,
    }
}

pub fn ok_package(task_id: &str) -> TaskPackage {
    package(task_id, json!({ "mode": "ok" }))
}

pub fn draft(state: &AgentRuntimeState) -> RegistrationDraft {
    RegistrationDraft {
        account_id: AccountId::from(ACCOUNT),
        name: "tether-test".into(),
        host_name: "localhost".into(),
        ip: "127.0.0.1".into(),
        group_name: None,
        group_id: None,
        org_identifier: None,
        project_identifier: None,
        tags: vec!["test".into()],
        agent_type: "DOCKER".into(),
        version: "0.1.0".into(),
        instance_id: state.instance_id(),
        connection_id: state.connection_id(),
        supported_task_types: SUPPORTED_TASK_TYPES.to_vec(),
        polling_mode_enabled: true,
        token_name: None,
    }
}

/// State with a published identity, as after registration.
pub fn registered_state() -> Arc<AgentRuntimeState> {
    let state = AgentRuntimeState::new(InstanceId::new(), ConnectionId::new());
    let identity = draft(&state).into_identity(AgentId::from(AGENT));
    state.publish_identity(identity);
    state
}

/// Route agent logs to the test writer. Safe to call from every test.
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,tether_agent=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub struct Harness {
    pub control_plane: Arc<MockControlPlane>,
    pub runner: Arc<FakeRunner>,
    pub state: Arc<AgentRuntimeState>,
    pub registry: Arc<TaskRegistry>,
    pub metrics: Arc<AgentMetrics>,
    pub dispatcher: Arc<TaskDispatcher>,
}

impl Harness {
    pub fn new(max_concurrent: usize) -> Self {
        init_test_logging();
        let control_plane = MockControlPlane::new();
        let runner = Arc::new(FakeRunner::default());
        let state = registered_state();
        let registry = Arc::new(TaskRegistry::new());
        let metrics = AgentMetrics::new();

        let supervisor = TaskSupervisor::new(
            control_plane.clone(),
            runner.clone(),
            state.clone(),
            registry.clone(),
            metrics.clone(),
        )
        .with_report_policy(RetryPolicy {
            max_attempts: Some(5),
            backoff: Backoff::Fibonacci {
                unit: Duration::from_secs(1),
                max: Duration::from_secs(30),
            },
        });
        let dispatcher = Arc::new(TaskDispatcher::new(
            control_plane.clone(),
            state.clone(),
            registry.clone(),
            metrics.clone(),
            SecretInjector::new(Arc::new(AesGcmDecryptor)),
            supervisor,
            max_concurrent,
        ));

        Self {
            control_plane,
            runner,
            state,
            registry,
            metrics,
            dispatcher,
        }
    }

    pub fn runner_calls(&self) -> usize {
        self.runner.calls.load(Ordering::SeqCst)
    }
}

/// Poll `condition` until it holds. Panics after `limit`.
pub async fn wait_until<F>(limit: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let step = Duration::from_millis(10);
    let mut waited = Duration::ZERO;
    while !condition() {
        assert!(waited < limit, "condition not met within {limit:?}");
        tokio::time::sleep(step).await;
        waited += step;
    }
}
