use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

/// Bare keepalive token exchanged on the push channel. The client sends
/// `ping`, the server answers `pong`; neither is JSON.
pub const PING_TOKEN: &str = "ping";
pub const PONG_TOKEN: &str = "pong";

/// One decoded frame from the push channel. `timestamp` and `flow_id` are
/// informational only; ordering is always by arrival.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(flatten)]
    pub event: ServerEvent,
}

/// Closed set of event kinds the backend emits. Kinds added server-side
/// after this build decode as [`ServerEvent::Unknown`] and fold as no-ops.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected(ConnectedPayload),
    Status(StatusPayload),
    Iteration(IterationPayload),
    Action(ActionPayload),
    Complete(CompletePayload),
    Error(ErrorPayload),
    BrowserStarted(BrowserStartedPayload),
    BrowserStopped(EmptyPayload),
    ProfileBrowserStarted(ProfileBrowserStartedPayload),
    ProfileBrowserStopped(EmptyPayload),
    ProfileCleared(EmptyPayload),
    Keepalive,
    #[serde(other)]
    Unknown,
}

/// Snapshot the server pushes immediately after a connection is accepted.
/// `current_task` is non-null while a run is in flight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectedPayload {
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub current_task: Option<Value>,
}

impl ConnectedPayload {
    pub fn has_active_task(&self) -> bool {
        self.current_task.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusPayload {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct IterationPayload {
    pub current: u32,
    pub max: u32,
}

/// One agent action. The nested `type` discriminator is kept as a string at
/// the wire boundary; [`crate::session::ActionKind`] closes the set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionPayload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletePayload {
    #[serde(default)]
    pub flow_id: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BrowserStartedPayload {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub headless: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileBrowserStartedPayload {
    #[serde(default)]
    pub url: Option<String>,
}

/// Events that carry `"data": {}` on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmptyPayload {}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("malformed frame: {source}")]
    Malformed {
        #[from]
        source: serde_json::Error,
    },
}

/// Decode one raw text frame. Returns `Ok(None)` for keepalive noise (the
/// bare `pong` token and `keepalive` frames). A decode failure means the
/// frame is dropped by the caller; it is never fatal to the channel.
pub fn decode_frame(raw: &str) -> Result<Option<EventFrame>, ProtocolError> {
    if raw.len() > DEFAULT_MAX_FRAME_BYTES {
        return Err(ProtocolError::OversizedFrame {
            size: raw.len(),
            max: DEFAULT_MAX_FRAME_BYTES,
        });
    }
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == PONG_TOKEN {
        return Ok(None);
    }
    let frame: EventFrame = serde_json::from_str(trimmed)?;
    if matches!(frame.event, ServerEvent::Keepalive) {
        return Ok(None);
    }
    Ok(Some(frame))
}
