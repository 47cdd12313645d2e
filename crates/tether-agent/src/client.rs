//! HTTP binding of the control plane port.

use crate::config::AgentConfig;
use crate::state::AgentRuntimeState;
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tether_core::agent::{
    HeartbeatRequest, HeartbeatResponse, RegistrationDraft, RegistrationResponse,
    UnregisterRequest,
};
use tether_core::ids::{AccountId, AgentId, InstanceId, TaskId};
use tether_core::ports::ControlPlane;
use tether_core::task::{TaskEventsResponse, TaskPackage, TaskResult};
use tether_core::{Error, Result};
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Control plane responses wrap their payload in `{"resource": ...}`.
#[derive(Debug, Deserialize)]
struct RestResponse<T> {
    resource: Option<T>,
}

pub struct HttpControlPlane {
    client: Client,
    base_url: String,
    token: String,
    state: Arc<AgentRuntimeState>,
}

impl HttpControlPlane {
    pub fn new(config: &AgentConfig, state: Arc<AgentRuntimeState>) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(format!("delegate/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: format!(
                "{}/api/agent/delegates",
                config.manager_url.trim_end_matches('/')
            ),
            token: config.token.clone(),
            state,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        self.client
            .request(method, &url)
            .header("Authorization", format!("Delegate {}", self.token))
    }

    /// Send a request and unwrap the `resource` field of a successful response.
    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<Option<T>> {
        let res = self.send_status(req).await?;
        if res.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let body = res.text().await.map_err(map_reqwest)?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        let wrapped: RestResponse<T> = serde_json::from_str(&body)?;
        Ok(wrapped.resource)
    }

    /// Send a request and succeed on any 2xx without reading the body.
    /// Error bodies are checked for control directives before being returned.
    async fn send_status(&self, req: RequestBuilder) -> Result<Response> {
        let res = req.send().await.map_err(map_reqwest)?;
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }

        let body = res.text().await.unwrap_or_default();
        if let Some(directive) = self.state.handle_error_body(&body) {
            warn!(status = status.as_u16(), directive = ?directive, "Control plane returned a directive");
        }
        Err(Error::ControlPlane {
            status: status.as_u16(),
            body,
        })
    }
}

fn map_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(REQUEST_TIMEOUT)
    } else {
        Error::Network(e.to_string())
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn register(&self, draft: &RegistrationDraft) -> Result<RegistrationResponse> {
        let req = self
            .request(Method::POST, "/register")
            .query(&[("accountId", draft.account_id.as_str())])
            .json(draft);
        self.send(req)
            .await?
            .ok_or_else(|| Error::Registration("empty registration response".into()))
    }

    async fn unregister(&self, account_id: &AccountId, request: &UnregisterRequest) -> Result<()> {
        let req = self
            .request(Method::POST, "/unregister")
            .query(&[("accountId", account_id.as_str())])
            .json(request);
        self.send_status(req).await?;
        Ok(())
    }

    async fn poll_task_events(
        &self,
        agent_id: &AgentId,
        account_id: &AccountId,
    ) -> Result<TaskEventsResponse> {
        let req = self
            .request(Method::GET, &format!("/{agent_id}/task-events"))
            .query(&[("accountId", account_id.as_str())]);
        Ok(self.send(req).await?.unwrap_or_default())
    }

    async fn acquire_task(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
        account_id: &AccountId,
        instance_id: &InstanceId,
    ) -> Result<Option<TaskPackage>> {
        let instance = instance_id.as_uuid().to_string();
        let req = self
            .request(
                Method::PUT,
                &format!("/{agent_id}/tasks/{task_id}/acquire"),
            )
            .query(&[
                ("accountId", account_id.as_str()),
                ("delegateInstanceId", instance.as_str()),
            ]);
        let package = self.send(req).await?;
        debug!(task_id = %task_id, found = package.is_some(), "Acquire response");
        Ok(package)
    }

    async fn send_heartbeat(
        &self,
        account_id: &AccountId,
        heartbeat: &HeartbeatRequest,
    ) -> Result<HeartbeatResponse> {
        let req = self
            .request(Method::POST, "/heartbeat-with-polling")
            .query(&[("accountId", account_id.as_str())])
            .json(heartbeat);
        self.send(req).await?.ok_or_else(|| Error::ControlPlane {
            status: 200,
            body: "empty heartbeat response".into(),
        })
    }

    async fn report_task_result(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
        account_id: &AccountId,
        result: &TaskResult,
    ) -> Result<()> {
        let req = self
            .request(Method::POST, &format!("/{agent_id}/tasks/{task_id}/report"))
            .query(&[("accountId", account_id.as_str())])
            .json(result);
        self.send_status(req).await?;
        Ok(())
    }
}
