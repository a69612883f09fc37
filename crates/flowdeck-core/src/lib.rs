pub mod events;
pub mod session;

pub use events::{decode_frame, EventFrame, ProtocolError, ServerEvent, DEFAULT_MAX_FRAME_BYTES};
pub use session::{
    ActionKind, ActionLogEntry, AgentSignal, ConnectionState, IterationProgress, SessionState,
    TaskStatus,
};
