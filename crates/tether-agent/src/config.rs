//! Agent configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tether_core::{Error, Result};

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Account this agent belongs to.
    #[serde(default)]
    pub account_id: String,
    /// Control plane base URL, e.g. `https://manager.example.com`.
    #[serde(default)]
    pub manager_url: String,
    /// Streaming endpoint base URL. Derived from `manager_url` when absent.
    #[serde(default)]
    pub stream_url: Option<String>,
    /// Agent token sent with every control plane call.
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub token_name: Option<String>,
    /// Agent name (must be unique within the account).
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub group_id: Option<String>,
    /// Tags for task selection.
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_agent_type")]
    pub agent_type: String,
    #[serde(default)]
    pub org_identifier: Option<String>,
    #[serde(default)]
    pub project_identifier: Option<String>,
    /// Poll for task events instead of holding a stream open.
    #[serde(default = "default_poll_for_tasks")]
    pub poll_for_tasks: bool,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Backoff between registration attempts.
    #[serde(default = "default_registration_retry")]
    pub registration_retry_secs: u64,
    /// Maximum concurrent tasks.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: usize,
    /// Reject new work under memory pressure.
    #[serde(default)]
    pub dynamic_request_handling: bool,
    /// Process memory ceiling used by the governor. Defaults to total system memory.
    #[serde(default)]
    pub max_memory_bytes: Option<u64>,
    /// Upper bound on the reconnect backoff.
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_backoff_secs: u64,
    /// Unregister from the control plane on graceful shutdown.
    #[serde(default = "default_unregister_on_shutdown")]
    pub unregister_on_shutdown: bool,
}

fn default_name() -> String {
    "tether-agent".to_string()
}

fn default_agent_type() -> String {
    "DOCKER".to_string()
}

fn default_poll_for_tasks() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    3
}

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_registration_retry() -> u64 {
    60
}

fn default_max_concurrent() -> usize {
    10
}

fn default_reconnect_max() -> u64 {
    60
}

fn default_unregister_on_shutdown() -> bool {
    true
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            account_id: String::new(),
            manager_url: String::new(),
            stream_url: None,
            token: String::new(),
            token_name: None,
            name: default_name(),
            group_name: None,
            group_id: None,
            tags: vec![],
            agent_type: default_agent_type(),
            org_identifier: None,
            project_identifier: None,
            poll_for_tasks: default_poll_for_tasks(),
            poll_interval_secs: default_poll_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            registration_retry_secs: default_registration_retry(),
            max_concurrent_tasks: default_max_concurrent(),
            dynamic_request_handling: false,
            max_memory_bytes: None,
            reconnect_max_backoff_secs: default_reconnect_max(),
            unregister_on_shutdown: default_unregister_on_shutdown(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("ACCOUNT_ID") {
            self.account_id = v;
        }
        if let Some(v) = get("MANAGER_HOST_AND_PORT") {
            self.manager_url = v;
        }
        if let Some(v) = get("STREAM_HOST_AND_PORT") {
            self.stream_url = Some(v);
        }
        if let Some(v) = get("DELEGATE_TOKEN") {
            self.token = v;
        }
        if let Some(v) = get("DELEGATE_NAME") {
            self.name = v;
        }
        if let Some(v) = get("DELEGATE_GROUP_NAME") {
            self.group_name = Some(v);
        }
        if let Some(v) = get("DELEGATE_GROUP_ID") {
            self.group_id = Some(v);
        }
        if let Some(v) = get("DELEGATE_TAGS") {
            self.tags = v
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = get("DELEGATE_TYPE") {
            self.agent_type = v;
        }
        if let Some(v) = get("DELEGATE_ORG_IDENTIFIER") {
            self.org_identifier = Some(v);
        }
        if let Some(v) = get("DELEGATE_PROJECT_IDENTIFIER") {
            self.project_identifier = Some(v);
        }
        if let Some(v) = get("POLL_FOR_TASKS") {
            self.poll_for_tasks = parse_env("POLL_FOR_TASKS", &v)?;
        }
        if let Some(v) = get("HEARTBEAT_INTERVAL_SECS") {
            self.heartbeat_interval_secs = parse_env("HEARTBEAT_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("MAX_CONCURRENT_TASKS") {
            self.max_concurrent_tasks = parse_env("MAX_CONCURRENT_TASKS", &v)?;
        }
        if let Some(v) = get("DYNAMIC_REQUEST_HANDLING") {
            self.dynamic_request_handling = parse_env("DYNAMIC_REQUEST_HANDLING", &v)?;
        }
        if let Some(v) = get("MAX_MEMORY_BYTES") {
            self.max_memory_bytes = Some(parse_env("MAX_MEMORY_BYTES", &v)?);
        }
        Ok(())
    }

    /// Check that the configuration can start an agent.
    pub fn validate(&self) -> Result<()> {
        if self.account_id.trim().is_empty() {
            return Err(Error::Config("account_id is required".into()));
        }
        if self.manager_url.trim().is_empty() {
            return Err(Error::Config("manager_url is required".into()));
        }
        if self.token.trim().is_empty() {
            return Err(Error::Config("token is required".into()));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(Error::Config("heartbeat_interval_secs must be positive".into()));
        }
        if self.poll_interval_secs == 0 {
            return Err(Error::Config("poll_interval_secs must be positive".into()));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(Error::Config("max_concurrent_tasks must be positive".into()));
        }
        Ok(())
    }

    /// Streaming base URL: explicit, or the manager URL with a websocket scheme.
    pub fn stream_base_url(&self) -> String {
        let base = self.stream_url.as_deref().unwrap_or(&self.manager_url);
        let base = base.trim_end_matches('/');
        if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn registration_retry(&self) -> Duration {
        Duration::from_secs(self.registration_retry_secs)
    }

    /// Copy of this configuration with the token blanked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.token.is_empty() {
            copy.token = tether_core::secrets::SECRET_MASK.to_string();
        }
        copy
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("invalid value for {key}: {value}")))
}
