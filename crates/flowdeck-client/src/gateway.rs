use std::collections::HashMap;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("instruction must not be empty")]
    InvalidInput,
    #[error("a task is already running")]
    TaskAlreadyRunning,
    #[error("backend unavailable: {message}")]
    BackendUnavailable { message: String },
    #[error("invalid endpoint url: {0}")]
    Url(#[from] url::ParseError),
}

impl From<reqwest::Error> for CommandError {
    fn from(err: reqwest::Error) -> Self {
        CommandError::BackendUnavailable {
            message: err.to_string(),
        }
    }
}

/// Parameters for one task submission. An attachment is folded into the
/// instruction text before dispatch; the backend has no separate field for
/// it.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SubmitRequest {
    pub instruction: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
}

impl SubmitRequest {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            initial_url: None,
            provider: None,
            flow_id: None,
        }
    }

    pub fn with_initial_url(mut self, url: impl Into<String>) -> Self {
        self.initial_url = Some(url.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_attachment(mut self, name: &str, content: &str) -> Self {
        self.instruction = format!(
            "{}\n\nAttached file `{}`:\n{}",
            self.instruction, name, content
        );
        self
    }

    pub fn is_blank(&self) -> bool {
        self.instruction.trim().is_empty()
    }
}

/// The backend's answer to a submit. The task endpoint responds only once
/// the run reaches a terminal state, so this doubles as the final outcome.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TaskOutcome {
    pub success: bool,
    #[serde(default)]
    pub result: String,
    pub flow_id: String,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    #[serde(default)]
    pub browser_running: bool,
    #[serde(default)]
    pub task_running: bool,
    #[serde(default)]
    pub current_task: Option<Value>,
    #[serde(default)]
    pub connected_clients: u32,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AgentControlReply {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ProfileStatus {
    #[serde(default)]
    pub profile_browser_running: bool,
    #[serde(default)]
    pub profile_exists: bool,
    #[serde(default)]
    pub profile_dir: Option<String>,
    #[serde(default)]
    pub profile_size_mb: f64,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ProviderCost {
    #[serde(default)]
    pub workflows: u64,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub input_cost: f64,
    #[serde(default)]
    pub output_cost: f64,
    #[serde(default)]
    pub cost: f64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct WorkflowCost {
    pub id: String,
    pub instruction: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub cost: f64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CostSummary {
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub total_workflows: u64,
    #[serde(default)]
    pub avg_cost_per_workflow: f64,
    #[serde(default)]
    pub by_provider: HashMap<String, ProviderCost>,
    #[serde(default)]
    pub recent_workflows: Vec<WorkflowCost>,
}

/// Request/response boundary for operator commands. Decoupled from the
/// event stream; callers coordinate the two through the session supervisor.
#[derive(Clone)]
pub struct CommandGateway {
    base_url: Url,
    http: reqwest::Client,
}

impl CommandGateway {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Submits a task. The call suspends until the backend finishes the run
    /// (the task endpoint is synchronous); live progress arrives on the
    /// event stream in the meantime.
    pub async fn submit(&self, request: &SubmitRequest) -> Result<TaskOutcome, CommandError> {
        if request.is_blank() {
            return Err(CommandError::InvalidInput);
        }
        let url = self.base_url.join("task")?;
        debug!("submit_task: provider={:?}", request.provider);
        let response = self.http.post(url).json(request).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    /// Asks the backend to stop the active run. Advisory only: a success
    /// here does not guarantee a terminal event will follow promptly, and
    /// callers must not block awaiting one.
    pub async fn cancel(&self) -> Result<AgentControlReply, CommandError> {
        let url = self.base_url.join("stop")?;
        let response = self.http.post(url).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    /// Starts the agent's browser process. Idempotent: an already-running
    /// agent answers `already_running`.
    pub async fn start(
        &self,
        provider: Option<&str>,
        headless: bool,
    ) -> Result<AgentControlReply, CommandError> {
        let mut url = self.base_url.join("start")?;
        if let Some(provider) = provider {
            url.query_pairs_mut().append_pair("provider", provider);
        }
        url.query_pairs_mut()
            .append_pair("headless", if headless { "true" } else { "false" });
        let response = self.http.post(url).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    /// Stops the agent's browser process. Idempotent: a stopped agent
    /// answers `not_running`.
    pub async fn stop(&self) -> Result<AgentControlReply, CommandError> {
        let url = self.base_url.join("stop")?;
        let response = self.http.post(url).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    pub async fn status(&self) -> Result<StatusSnapshot, CommandError> {
        let url = self.base_url.join("status")?;
        let response = self.http.get(url).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    pub async fn costs(&self, time_range: &str) -> Result<CostSummary, CommandError> {
        let mut url = self.base_url.join("costs")?;
        url.query_pairs_mut().append_pair("time_range", time_range);
        let response = self.http.get(url).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    pub async fn profile_start(&self, url_hint: Option<&str>) -> Result<AgentControlReply, CommandError> {
        let mut url = self.base_url.join("profile/start")?;
        if let Some(hint) = url_hint {
            url.query_pairs_mut().append_pair("url", hint);
        }
        let response = self.http.post(url).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    pub async fn profile_stop(&self) -> Result<AgentControlReply, CommandError> {
        let url = self.base_url.join("profile/stop")?;
        let response = self.http.post(url).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    pub async fn profile_status(&self) -> Result<ProfileStatus, CommandError> {
        let url = self.base_url.join("profile/status")?;
        let response = self.http.get(url).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    pub async fn profile_clear(&self) -> Result<AgentControlReply, CommandError> {
        let url = self.base_url.join("profile/clear")?;
        let response = self.http.delete(url).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }
}

/// Maps a non-2xx response to `BackendUnavailable` with the human-readable
/// detail string the backend puts in the body.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, CommandError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(CommandError::BackendUnavailable {
        message: extract_detail(status, &body),
    })
}

/// Pulls the `detail` field out of an error body, falling back to the raw
/// body or the status line.
pub(crate) fn extract_detail(status: StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("detail")
                .and_then(Value::as_str)
                .map(str::to_string)
        });
    match detail {
        Some(detail) => detail,
        None if body.trim().is_empty() => status.to_string(),
        None => format!("{status}: {body}"),
    }
}
