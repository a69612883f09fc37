pub mod gateway;
pub mod history;
pub mod session;
pub mod stream;

pub use gateway::{CommandError, CommandGateway, SubmitRequest, TaskOutcome};
pub use history::{FlowDetail, FlowRecord, FlowsPage, HistoryClient, HistoryError};
pub use session::SessionSupervisor;
pub use stream::{StreamClient, StreamConfig};
