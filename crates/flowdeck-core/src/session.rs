use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::events::{ActionPayload, EventFrame, ServerEvent};

/// Connectivity of the push channel. Owned by the transport; the reducer
/// never touches it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Idle,
    Initializing,
    Running,
    Completed,
    Failed,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Idle
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Initializing => "initializing",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "idle" => Ok(TaskStatus::Idle),
            "initializing" => Ok(TaskStatus::Initializing),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}

/// Closed set of action kinds in the log. Wire frames carry the loose
/// string; mapping happens here so exhaustiveness is enforced at the fold.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    Start,
    Navigate,
    Thinking,
    Complete,
    ToolInvocation,
    ToolResult,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Start => "start",
            ActionKind::Navigate => "navigate",
            ActionKind::Thinking => "thinking",
            ActionKind::Complete => "complete",
            ActionKind::ToolInvocation => "tool-invocation",
            ActionKind::ToolResult => "tool-result",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "start" => Ok(ActionKind::Start),
            "navigate" => Ok(ActionKind::Navigate),
            "thinking" => Ok(ActionKind::Thinking),
            "complete" => Ok(ActionKind::Complete),
            "tool_call" | "tool-invocation" => Ok(ActionKind::ToolInvocation),
            "tool_result" | "tool-result" => Ok(ActionKind::ToolResult),
            other => Err(format!("Unknown action kind: {other}")),
        }
    }
}

/// Step N of M in the agent's reasoning loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct IterationProgress {
    pub current: u32,
    pub max: u32,
}

/// Immutable, append-only record of one agent action. `received_at` is the
/// client-observed arrival time; wire timestamps are display-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionLogEntry {
    pub kind: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub iteration: u32,
    pub received_at: DateTime<Utc>,
}

/// Agent-process level notifications. These bypass the task state machine
/// and go straight to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentSignal {
    BrowserStarted { provider: Option<String> },
    BrowserStopped,
    ProfileBrowserStarted { url: Option<String> },
    ProfileBrowserStopped,
    ProfileCleared,
}

/// The single authoritative view of the current run. Mutated only by its
/// owner (one fold task); everything else reads clones.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionState {
    pub task_status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<IterationProgress>,
    #[serde(default)]
    pub action_log: Vec<ActionLogEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SessionState {
    /// The one atomic reset shared by submit and rerun. Clears everything a
    /// new run must not inherit, before any event of that run is folded.
    pub fn begin_session(&mut self) {
        self.task_status = TaskStatus::Initializing;
        self.iteration = None;
        self.action_log.clear();
        self.last_error = None;
    }

    /// Records a command-path failure (the backend rejected or never saw the
    /// submit). Event-stream activity is not expected after this.
    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.task_status = TaskStatus::Failed;
        self.last_error = Some(message.into());
    }

    /// Folds one frame into the state. Pure: the same frame sequence applied
    /// from the same starting state always yields the same result.
    /// Agent-process events are handed back instead of being folded.
    pub fn apply(
        &mut self,
        frame: &EventFrame,
        received_at: DateTime<Utc>,
    ) -> Option<AgentSignal> {
        match &frame.event {
            ServerEvent::Connected(payload) => {
                self.task_status = if payload.has_active_task() {
                    TaskStatus::Running
                } else {
                    TaskStatus::Idle
                };
                None
            }
            ServerEvent::Status(payload) => {
                if let Ok(status) = payload.status.parse::<TaskStatus>() {
                    self.task_status = status;
                }
                None
            }
            ServerEvent::Iteration(payload) => {
                self.iteration = Some(IterationProgress {
                    current: payload.current,
                    max: payload.max,
                });
                None
            }
            ServerEvent::Action(payload) => {
                if let Some(entry) = action_entry(payload, received_at) {
                    self.action_log.push(entry);
                }
                None
            }
            ServerEvent::Complete(_) => {
                self.task_status = TaskStatus::Completed;
                self.iteration = None;
                None
            }
            ServerEvent::Error(payload) => {
                self.task_status = TaskStatus::Failed;
                self.last_error = Some(payload.message.clone());
                None
            }
            ServerEvent::BrowserStarted(payload) => Some(AgentSignal::BrowserStarted {
                provider: payload.provider.clone(),
            }),
            ServerEvent::BrowserStopped(_) => Some(AgentSignal::BrowserStopped),
            ServerEvent::ProfileBrowserStarted(payload) => {
                Some(AgentSignal::ProfileBrowserStarted {
                    url: payload.url.clone(),
                })
            }
            ServerEvent::ProfileBrowserStopped(_) => Some(AgentSignal::ProfileBrowserStopped),
            ServerEvent::ProfileCleared(_) => Some(AgentSignal::ProfileCleared),
            ServerEvent::Keepalive | ServerEvent::Unknown => None,
        }
    }
}

/// Builds a log entry from a wire action payload. Unrecognized action kinds
/// are skipped, mirroring how unrecognized event kinds fold as no-ops.
fn action_entry(payload: &ActionPayload, received_at: DateTime<Utc>) -> Option<ActionLogEntry> {
    let kind = payload.kind.parse::<ActionKind>().ok()?;
    Some(ActionLogEntry {
        kind,
        tool_name: payload.tool.clone(),
        arguments: payload.arguments.clone(),
        message: payload.message.clone(),
        success: payload.success,
        url: payload.url.clone(),
        iteration: payload.iteration,
        received_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::decode_frame;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn frame(raw: &str) -> EventFrame {
        decode_frame(raw).expect("decode").expect("fold-eligible")
    }

    #[test]
    fn submit_then_iterate_then_act_then_complete() {
        let mut state = SessionState::default();
        state.begin_session();
        assert_eq!(state.task_status, TaskStatus::Initializing);
        assert!(state.action_log.is_empty());

        state.apply(
            &frame(r#"{"type":"iteration","data":{"current":1,"max":20}}"#),
            ts(),
        );
        assert_eq!(
            state.iteration,
            Some(IterationProgress { current: 1, max: 20 })
        );

        state.apply(
            &frame(
                r#"{"type":"action","data":{"type":"tool_call","tool":"navigate","url":"https://a.test","message":"Executing: navigate","iteration":1}}"#,
            ),
            ts(),
        );
        assert_eq!(state.action_log.len(), 1);
        assert_eq!(state.action_log[0].kind, ActionKind::ToolInvocation);
        assert_eq!(state.action_log[0].tool_name.as_deref(), Some("navigate"));

        state.apply(&frame(r#"{"type":"complete","data":{}}"#), ts());
        assert_eq!(state.task_status, TaskStatus::Completed);
        assert!(state.iteration.is_none());
        assert_eq!(state.action_log.len(), 1);
    }

    #[test]
    fn folding_is_deterministic() {
        let frames = [
            r#"{"type":"status","data":{"status":"running","message":"Task started"}}"#,
            r#"{"type":"iteration","data":{"current":2,"max":10}}"#,
            r#"{"type":"action","data":{"type":"thinking","message":"Agent is thinking...","iteration":2}}"#,
            r#"{"type":"action","data":{"type":"tool_result","tool":"click","success":true,"message":"click succeeded","iteration":2}}"#,
            r#"{"type":"complete","data":{"status":"completed"}}"#,
        ];

        let replay = || {
            let mut state = SessionState::default();
            state.begin_session();
            for raw in &frames {
                state.apply(&frame(raw), ts());
            }
            state
        };

        assert_eq!(replay(), replay());
    }

    #[test]
    fn error_event_sets_failed_and_last_error() {
        let mut state = SessionState::default();
        state.begin_session();
        state.apply(
            &frame(r#"{"type":"error","data":{"message":"LLM Error: timeout"}}"#),
            ts(),
        );
        assert_eq!(state.task_status, TaskStatus::Failed);
        assert_eq!(state.last_error.as_deref(), Some("LLM Error: timeout"));
    }

    #[test]
    fn complete_clears_iteration_but_not_the_log() {
        let mut state = SessionState::default();
        state.begin_session();
        state.apply(
            &frame(r#"{"type":"iteration","data":{"current":7,"max":20}}"#),
            ts(),
        );
        state.apply(
            &frame(r#"{"type":"action","data":{"type":"start","message":"Starting","iteration":0}}"#),
            ts(),
        );
        state.apply(&frame(r#"{"type":"complete","data":{}}"#), ts());
        assert_eq!(state.task_status, TaskStatus::Completed);
        assert!(state.iteration.is_none());
        assert_eq!(state.action_log.len(), 1);
    }

    #[test]
    fn second_submit_without_terminal_event_still_resets() {
        let mut state = SessionState::default();
        state.begin_session();
        state.apply(
            &frame(r#"{"type":"status","data":{"status":"running"}}"#),
            ts(),
        );
        state.apply(
            &frame(r#"{"type":"action","data":{"type":"start","message":"Starting","iteration":0}}"#),
            ts(),
        );
        assert_eq!(state.action_log.len(), 1);

        state.begin_session();
        assert_eq!(state.task_status, TaskStatus::Initializing);
        assert!(state.action_log.is_empty());
        assert!(state.iteration.is_none());
        assert!(state.last_error.is_none());
    }

    #[test]
    fn connected_snapshot_maps_active_task_to_running() {
        let mut state = SessionState::default();
        state.apply(
            &frame(
                r#"{"type":"connected","data":{"running":true,"current_task":{"flow_id":"f-1"}}}"#,
            ),
            ts(),
        );
        assert_eq!(state.task_status, TaskStatus::Running);

        state.apply(
            &frame(r#"{"type":"connected","data":{"running":true,"current_task":null}}"#),
            ts(),
        );
        assert_eq!(state.task_status, TaskStatus::Idle);
    }

    #[test]
    fn process_events_signal_without_touching_task_state() {
        let mut state = SessionState::default();
        state.begin_session();
        state.apply(
            &frame(r#"{"type":"status","data":{"status":"running"}}"#),
            ts(),
        );

        let signal = state.apply(
            &frame(r#"{"type":"browser_started","data":{"provider":"anthropic"}}"#),
            ts(),
        );
        assert_eq!(
            signal,
            Some(AgentSignal::BrowserStarted {
                provider: Some("anthropic".to_string()),
            })
        );
        assert_eq!(state.task_status, TaskStatus::Running);

        let signal = state.apply(&frame(r#"{"type":"browser_stopped","data":{}}"#), ts());
        assert_eq!(signal, Some(AgentSignal::BrowserStopped));
        assert_eq!(state.task_status, TaskStatus::Running);
    }

    #[test]
    fn unknown_status_and_action_kinds_are_ignored() {
        let mut state = SessionState::default();
        state.begin_session();
        state.apply(
            &frame(r#"{"type":"status","data":{"status":"warming_up"}}"#),
            ts(),
        );
        assert_eq!(state.task_status, TaskStatus::Initializing);

        state.apply(
            &frame(r#"{"type":"action","data":{"type":"screenshot_v2","message":"?","iteration":1}}"#),
            ts(),
        );
        assert!(state.action_log.is_empty());
    }

    #[test]
    fn command_path_failure_marks_failed() {
        let mut state = SessionState::default();
        state.begin_session();
        state.mark_failed("A task is already running. Please wait or stop it first.");
        assert_eq!(state.task_status, TaskStatus::Failed);
        assert!(state
            .last_error
            .as_deref()
            .unwrap()
            .contains("already running"));
    }
}
