//! Main agent implementation.

use crate::client::HttpControlPlane;
use crate::config::AgentConfig;
use crate::dispatcher::TaskDispatcher;
use crate::executor::ShellScriptRunner;
use crate::governor::{ResourceGovernor, SysinfoProbe};
use crate::health::HealthCheck;
use crate::heartbeat::{HeartbeatChannel, HeartbeatController};
use crate::metrics::AgentMetrics;
use crate::registration::{Registrar, local_ip};
use crate::registry::TaskRegistry;
use crate::retry::Backoff;
use crate::secrets::{AesGcmDecryptor, SecretInjector};
use crate::state::AgentRuntimeState;
use crate::supervisor::TaskSupervisor;
use crate::transport::{Inbound, PollingTransport, StreamConnector, StreamingTransport, WsConnector};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tether_core::Result;
use tether_core::agent::{AgentIdentity, RegistrationDraft};
use tether_core::ids::{AccountId, ConnectionId, GroupId, InstanceId};
use tether_core::ports::{ControlPlane, SecretDecryptor, TaskRunner};
use tether_core::task::TaskType;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// How long running tasks get to finish on graceful shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Task types this agent executes.
pub const SUPPORTED_TASK_TYPES: [TaskType; 2] = [TaskType::Script, TaskType::ShellScriptTaskNg];

const INBOUND_BUFFER: usize = 1024;

/// The delegate agent.
pub struct DelegateAgent {
    config: AgentConfig,
    control_plane: Arc<dyn ControlPlane>,
    state: Arc<AgentRuntimeState>,
    registry: Arc<TaskRegistry>,
    metrics: Arc<AgentMetrics>,
    dispatcher: Arc<TaskDispatcher>,
    registrar: Registrar,
    connector: Option<Arc<dyn StreamConnector>>,
    handles: Vec<JoinHandle<()>>,
}

impl DelegateAgent {
    /// Create an agent that talks to the control plane over HTTP and runs
    /// shell script tasks.
    pub fn from_config(config: AgentConfig) -> Result<Self> {
        config.validate()?;
        let state = AgentRuntimeState::new(InstanceId::new(), ConnectionId::new());
        let control_plane = Arc::new(HttpControlPlane::new(&config, state.clone())?);
        Ok(Self::new(
            config,
            state,
            control_plane,
            Arc::new(ShellScriptRunner::default()),
            Arc::new(AesGcmDecryptor),
        ))
    }

    pub fn new(
        config: AgentConfig,
        state: Arc<AgentRuntimeState>,
        control_plane: Arc<dyn ControlPlane>,
        runner: Arc<dyn TaskRunner>,
        decryptor: Arc<dyn SecretDecryptor>,
    ) -> Self {
        let registry = Arc::new(TaskRegistry::new());
        let metrics = AgentMetrics::new();

        let supervisor = TaskSupervisor::new(
            Arc::clone(&control_plane),
            runner,
            Arc::clone(&state),
            Arc::clone(&registry),
            Arc::clone(&metrics),
        );
        let dispatcher = Arc::new(TaskDispatcher::new(
            Arc::clone(&control_plane),
            Arc::clone(&state),
            Arc::clone(&registry),
            Arc::clone(&metrics),
            SecretInjector::new(decryptor),
            supervisor,
            config.max_concurrent_tasks,
        ));
        let registrar = Registrar::new(
            Arc::clone(&control_plane),
            Arc::clone(&state),
            config.registration_retry(),
        );

        Self {
            config,
            control_plane,
            state,
            registry,
            metrics,
            dispatcher,
            registrar,
            connector: None,
            handles: Vec::new(),
        }
    }

    /// Use `connector` instead of a websocket in streaming mode.
    pub fn with_stream_connector(mut self, connector: Arc<dyn StreamConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn state(&self) -> &Arc<AgentRuntimeState> {
        &self.state
    }

    pub fn metrics(&self) -> &Arc<AgentMetrics> {
        &self.metrics
    }

    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.dispatcher
    }

    /// Register and start the background loops.
    pub async fn start(&mut self) -> Result<Arc<AgentIdentity>> {
        info!(
            name = %self.config.name,
            polling = self.config.poll_for_tasks,
            max_concurrent_tasks = self.config.max_concurrent_tasks,
            "Starting delegate agent"
        );

        let draft = self.registration_draft();
        let identity = self.registrar.register(&draft).await?;

        let shutdown = self.state.subscribe_shutdown();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);

        let channel = if self.config.poll_for_tasks {
            let polling = PollingTransport::new(
                Arc::clone(&self.control_plane),
                Arc::clone(&self.state),
                self.config.poll_interval(),
            );
            let shutdown = shutdown.clone();
            self.handles.push(tokio::spawn(async move {
                polling.run(inbound_tx, shutdown).await;
            }));
            HeartbeatChannel::Rest
        } else {
            let connector = match &self.connector {
                Some(connector) => Arc::clone(connector),
                None => Arc::new(WsConnector::new(&self.config, &identity)?),
            };
            let transport = StreamingTransport::new(
                connector,
                Arc::clone(&self.state),
                Arc::clone(&self.metrics),
                inbound_tx,
                Backoff::Fibonacci {
                    unit: Duration::from_secs(1),
                    max: Duration::from_secs(self.config.reconnect_max_backoff_secs),
                },
            );
            transport.start().await;
            self.handles
                .push(tokio::spawn(Arc::clone(&transport).run(shutdown.clone())));
            HeartbeatChannel::Stream(transport)
        };

        let heartbeat = Arc::new(HeartbeatController::new(
            Arc::clone(&self.control_plane),
            Arc::clone(&self.state),
            Arc::clone(&self.registry),
            Arc::clone(&self.metrics),
            channel,
            self.config.heartbeat_interval(),
        ));
        {
            let heartbeat = Arc::clone(&heartbeat);
            let shutdown = shutdown.clone();
            self.handles.push(tokio::spawn(async move {
                heartbeat.run(shutdown).await;
            }));
        }

        self.handles.push(tokio::spawn(route_inbound(
            inbound_rx,
            Arc::clone(&self.dispatcher),
            heartbeat,
            shutdown.clone(),
        )));

        if self.config.dynamic_request_handling {
            let governor = ResourceGovernor::new(
                Arc::clone(&self.state),
                Box::new(SysinfoProbe::new(self.config.max_memory_bytes)),
            );
            self.handles.push(tokio::spawn(async move {
                governor.run(shutdown).await;
            }));
        }

        info!(agent_id = %identity.agent_id, "Agent started and ready for tasks");
        Ok(identity)
    }

    /// Wait until shutdown is requested, by the caller or by self destruct.
    pub async fn wait_for_shutdown(&self) {
        let mut shutdown = self.state.subscribe_shutdown();
        let _ = shutdown.wait_for(|stop| *stop).await;
    }

    /// Drain running tasks, stop the loops and unregister.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Initiating graceful shutdown");
        self.state.request_shutdown();
        self.dispatcher.shutdown(SHUTDOWN_GRACE).await;

        if self.state.is_self_destructing() {
            info!("Self destructed, skipping unregister");
        } else if self.config.unregister_on_shutdown && self.state.identity().is_some() {
            let _ = self
                .registrar
                .unregister(
                    self.config.org_identifier.clone(),
                    self.config.project_identifier.clone(),
                )
                .await;
        }

        for handle in self.handles.drain(..) {
            if timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("Background task did not stop in time");
            }
        }

        info!(metrics = ?self.metrics.snapshot(), "Agent shutdown complete");
        Ok(())
    }

    pub fn health_check(&self) -> HealthCheck {
        HealthCheck::evaluate(
            &self.state,
            &self.registry,
            &self.metrics,
            !self.config.poll_for_tasks,
        )
    }

    fn registration_draft(&self) -> RegistrationDraft {
        let host_name = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());

        RegistrationDraft {
            account_id: AccountId::from(self.config.account_id.clone()),
            name: self.config.name.clone(),
            host_name,
            ip: local_ip(),
            group_name: self.config.group_name.clone(),
            group_id: self.config.group_id.clone().map(GroupId::from),
            org_identifier: self.config.org_identifier.clone(),
            project_identifier: self.config.project_identifier.clone(),
            tags: self.config.tags.clone(),
            agent_type: self.config.agent_type.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            instance_id: self.state.instance_id(),
            connection_id: self.state.connection_id(),
            supported_task_types: SUPPORTED_TASK_TYPES.to_vec(),
            polling_mode_enabled: self.config.poll_for_tasks,
            token_name: self.config.token_name.clone(),
        }
    }
}

/// Hand transport messages to the component that owns them.
async fn route_inbound(
    mut inbound: mpsc::Receiver<Inbound>,
    dispatcher: Arc<TaskDispatcher>,
    heartbeat: Arc<HeartbeatController>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            message = inbound.recv() => match message {
                Some(Inbound::Task(event)) => {
                    let task_id = event.task_id.clone();
                    let decision = dispatcher.on_task_event(event);
                    debug!(task_id = %task_id, decision = ?decision, "Task event handled");
                }
                Some(Inbound::HeartbeatResponse(response)) => {
                    heartbeat.on_heartbeat_response(&response, Utc::now().timestamp_millis());
                }
                None => break,
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
