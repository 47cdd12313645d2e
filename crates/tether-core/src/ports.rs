//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the agent runtime and its adapters.

use crate::Result;
use crate::agent::{
    HeartbeatRequest, HeartbeatResponse, RegistrationDraft, RegistrationResponse,
    UnregisterRequest,
};
use crate::ids::{AccountId, AgentId, InstanceId, TaskId};
use crate::secrets::{ExpressionContext, LogSanitizer};
use crate::task::{EncryptedSecretRef, EncryptionConfig, TaskEventsResponse, TaskOutcome, TaskPackage, TaskResult};
use async_trait::async_trait;

/// The remote service that assigns tasks and receives heartbeats and results.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Register this agent and obtain its identity.
    async fn register(&self, draft: &RegistrationDraft) -> Result<RegistrationResponse>;

    /// Remove this agent's registration.
    async fn unregister(&self, account_id: &AccountId, request: &UnregisterRequest) -> Result<()>;

    /// Fetch pending task events (polling mode).
    async fn poll_task_events(
        &self,
        agent_id: &AgentId,
        account_id: &AccountId,
    ) -> Result<TaskEventsResponse>;

    /// Claim a task and fetch its full package. `None` when nothing is available.
    async fn acquire_task(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
        account_id: &AccountId,
        instance_id: &InstanceId,
    ) -> Result<Option<TaskPackage>>;

    /// Report liveness and the executing task set.
    async fn send_heartbeat(
        &self,
        account_id: &AccountId,
        heartbeat: &HeartbeatRequest,
    ) -> Result<HeartbeatResponse>;

    /// Deliver a task result.
    async fn report_task_result(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
        account_id: &AccountId,
        result: &TaskResult,
    ) -> Result<()>;
}

/// Runs the body of an acquired task.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Execute the task. Failures are expressed in the outcome, never as a panic.
    /// The future may be dropped at any await point when the task is cancelled.
    async fn run(
        &self,
        package: &TaskPackage,
        context: &ExpressionContext,
        sanitizer: &LogSanitizer,
    ) -> TaskOutcome;
}

/// Decrypts secret references carried by a task package.
pub trait SecretDecryptor: Send + Sync {
    fn decrypt(&self, secret: &EncryptedSecretRef, config: &EncryptionConfig) -> Result<String>;
}
