//! Task events, packages and outcomes.

use crate::ids::{AccountId, InstanceId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Task families this agent knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Script,
    ShellScriptTaskNg,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Script => "SCRIPT",
            TaskType::ShellScriptTaskNg => "SHELL_SCRIPT_TASK_NG",
        }
    }

    /// Parse the wire name of a task type. Unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "SCRIPT" => Some(TaskType::Script),
            "SHELL_SCRIPT_TASK_NG" => Some(TaskType::ShellScriptTaskNg),
            _ => None,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskEventKind {
    #[serde(rename = "DelegateTaskEvent")]
    Assign,
    #[serde(rename = "DelegateTaskAbortEvent")]
    Abort,
}

/// A task assignment or abort notification. Consumed once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    #[serde(rename = "eventType")]
    pub kind: TaskEventKind,
    #[serde(rename = "delegateTaskId")]
    pub task_id: TaskId,
    pub account_id: AccountId,
}

impl TaskEvent {
    pub fn assign(task_id: impl Into<TaskId>, account_id: impl Into<AccountId>) -> Self {
        Self {
            kind: TaskEventKind::Assign,
            task_id: task_id.into(),
            account_id: account_id.into(),
        }
    }

    pub fn abort(task_id: impl Into<TaskId>, account_id: impl Into<AccountId>) -> Self {
        Self {
            kind: TaskEventKind::Abort,
            task_id: task_id.into(),
            account_id: account_id.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEventsResponse {
    #[serde(default)]
    pub events: Vec<TaskEvent>,
}

fn default_timeout_ms() -> u64 {
    10 * 60 * 1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskData {
    pub task_type: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default = "default_timeout_ms", rename = "timeout")]
    pub timeout_ms: u64,
    #[serde(default, rename = "async")]
    pub is_async: bool,
}

/// Key material a secret reference is encrypted with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionConfig {
    pub uuid: String,
    pub name: String,
    /// Master key, hashed to 256 bits by the decryptor.
    pub key: String,
}

/// An encrypted secret the task refers to by expression name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedSecretRef {
    pub name: String,
    pub encryption_config_id: String,
    /// Base64 of `nonce (12 bytes) || ciphertext`.
    pub encrypted_value: String,
}

/// Full task payload returned by acquisition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPackage {
    #[serde(rename = "delegateTaskId")]
    pub task_id: TaskId,
    pub account_id: AccountId,
    pub data: Option<TaskData>,
    /// Values to redact from any output and log line.
    #[serde(default)]
    pub secrets: BTreeSet<String>,
    #[serde(default)]
    pub encryption_configs: HashMap<String, EncryptionConfig>,
    #[serde(default)]
    pub secret_references: Vec<EncryptedSecretRef>,
    /// Instance the control plane addressed the task to, as sent on the wire.
    #[serde(
        default,
        rename = "delegateInstanceId",
        deserialize_with = "blank_as_none"
    )]
    pub target_instance_id: Option<String>,
}

impl TaskPackage {
    /// Whether this package may be executed by the given agent instance.
    /// An unset target matches any instance; an unparseable one matches none.
    pub fn is_for_instance(&self, instance_id: &InstanceId) -> bool {
        match &self.target_instance_id {
            None => true,
            Some(target) => target
                .parse::<InstanceId>()
                .is_ok_and(|target| target == *instance_id),
        }
    }
}

fn blank_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}

/// Parameters of a shell script task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptParameters {
    pub script: String,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

/// Outcome of a task, reported back to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success { output: String, exit_code: i32 },
    StartupScriptFailure { message: String },
    ParametersFailure { message: String },
    StepException { message: String, exit_code: Option<i32> },
    TimedOut { timeout_ms: u64 },
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TaskOutcome::Success { .. } => "success",
            TaskOutcome::StartupScriptFailure { .. } => "startup_script_failure",
            TaskOutcome::ParametersFailure { .. } => "parameters_failure",
            TaskOutcome::StepException { .. } => "step_exception",
            TaskOutcome::TimedOut { .. } => "timed_out",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: TaskId,
    pub account_id: AccountId,
    pub outcome: TaskOutcome,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}
