use std::sync::Arc;

use chrono::Utc;
use flowdeck_core::events::EventFrame;
use flowdeck_core::session::{AgentSignal, SessionState, TaskStatus};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::gateway::{
    AgentControlReply, CommandError, CommandGateway, SubmitRequest, TaskOutcome,
};
use crate::history::{rerun_request, FlowDetail};

const SIGNAL_CHANNEL_CAPACITY: usize = 16;

/// Single writer over the one [`SessionState`]. All event folds happen on
/// the supervisor's fold task, in arrival order; every other component reads
/// snapshots or submits intents.
pub struct SessionSupervisor {
    state: Arc<Mutex<SessionState>>,
    gateway: CommandGateway,
    signals_tx: broadcast::Sender<AgentSignal>,
    fold_task: JoinHandle<()>,
}

impl SessionSupervisor {
    /// Takes ownership of the stream's event feed and starts folding.
    pub fn new(gateway: CommandGateway, mut events: mpsc::Receiver<EventFrame>) -> Self {
        let state = Arc::new(Mutex::new(SessionState::default()));
        let (signals_tx, _) = broadcast::channel(SIGNAL_CHANNEL_CAPACITY);

        let fold_state = Arc::clone(&state);
        let fold_signals = signals_tx.clone();
        let fold_task = tokio::spawn(async move {
            while let Some(frame) = events.recv().await {
                let received_at = Utc::now();
                let signal = {
                    let mut state = fold_state.lock().await;
                    state.apply(&frame, received_at)
                };
                if let Some(signal) = signal {
                    // No subscribers is fine; signals are advisory.
                    let _ = fold_signals.send(signal);
                }
            }
            debug!("fold_task_done");
        });

        Self {
            state,
            gateway,
            signals_tx,
            fold_task,
        }
    }

    pub async fn snapshot(&self) -> SessionState {
        self.state.lock().await.clone()
    }

    /// Agent-process notifications (browser/profile lifecycle), separate
    /// from task state.
    pub fn signals(&self) -> broadcast::Receiver<AgentSignal> {
        self.signals_tx.subscribe()
    }

    /// Submits a new run. Resets the session state atomically before the
    /// command is dispatched, so the first event of the new run never lands
    /// on stale state. Last-submit-wins: a submit while a prior run is
    /// unconfirmed still resets.
    pub async fn submit(&self, request: SubmitRequest) -> Result<TaskOutcome, CommandError> {
        if request.is_blank() {
            return Err(CommandError::InvalidInput);
        }
        {
            let mut state = self.state.lock().await;
            // The presentation layer already refuses this; re-checked here
            // because two call sites must agree.
            if state.task_status == TaskStatus::Running {
                return Err(CommandError::TaskAlreadyRunning);
            }
            state.begin_session();
        }

        match self.gateway.submit(&request).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                // The reset already happened; any dispatch failure ends the
                // session rather than leaving it parked at Initializing.
                self.state.lock().await.mark_failed(err.to_string());
                Err(err)
            }
        }
    }

    /// Re-submits a past run's parameters through the normal submit path.
    pub async fn rerun(&self, record: &FlowDetail) -> Result<TaskOutcome, CommandError> {
        self.submit(rerun_request(record)).await
    }

    /// Requests cancellation of the active run. Deliberately does not touch
    /// task status: the authoritative transition comes from the event
    /// stream, or stays indeterminate if the channel is down.
    pub async fn cancel(&self) -> Result<AgentControlReply, CommandError> {
        self.gateway.cancel().await
    }

    pub fn gateway(&self) -> &CommandGateway {
        &self.gateway
    }
}

impl Drop for SessionSupervisor {
    fn drop(&mut self) {
        self.fold_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowdeck_core::events::decode_frame;
    use std::time::Duration;
    use tokio::time::timeout;
    use url::Url;

    fn frame(raw: &str) -> EventFrame {
        decode_frame(raw).expect("decode").expect("fold-eligible")
    }

    fn unreachable_gateway() -> CommandGateway {
        CommandGateway::new(Url::parse("http://127.0.0.1:9/").unwrap())
    }

    async fn wait_for<F>(supervisor: &SessionSupervisor, predicate: F) -> SessionState
    where
        F: Fn(&SessionState) -> bool,
    {
        timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = supervisor.snapshot().await;
                if predicate(&snapshot) {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("state never matched")
    }

    #[tokio::test]
    async fn events_fold_in_arrival_order() {
        let (tx, rx) = mpsc::channel(8);
        let supervisor = SessionSupervisor::new(unreachable_gateway(), rx);

        for raw in [
            r#"{"type":"status","data":{"status":"running"}}"#,
            r#"{"type":"action","data":{"type":"start","message":"Starting","iteration":0}}"#,
            r#"{"type":"action","data":{"type":"thinking","message":"thinking","iteration":1}}"#,
        ] {
            tx.send(frame(raw)).await.unwrap();
        }

        let snapshot = wait_for(&supervisor, |s| s.action_log.len() == 2).await;
        assert_eq!(snapshot.task_status, TaskStatus::Running);
        assert_eq!(snapshot.action_log[0].message, "Starting");
        assert_eq!(snapshot.action_log[1].message, "thinking");
    }

    #[tokio::test]
    async fn submit_failure_marks_session_failed() {
        let (_tx, rx) = mpsc::channel(8);
        let supervisor = SessionSupervisor::new(unreachable_gateway(), rx);

        let err = supervisor
            .submit(SubmitRequest::new("go to a.test"))
            .await
            .expect_err("backend is unreachable");
        assert!(matches!(err, CommandError::BackendUnavailable { .. }));

        let snapshot = supervisor.snapshot().await;
        assert_eq!(snapshot.task_status, TaskStatus::Failed);
        assert!(snapshot.last_error.is_some());
        assert!(snapshot.action_log.is_empty());
    }

    #[tokio::test]
    async fn submit_url_error_marks_session_failed() {
        let (_tx, rx) = mpsc::channel(8);
        // A cannot-be-a-base URL makes the endpoint join fail before any
        // network traffic happens.
        let gateway = CommandGateway::new(Url::parse("data:text/plain,agent").unwrap());
        let supervisor = SessionSupervisor::new(gateway, rx);

        let err = supervisor
            .submit(SubmitRequest::new("go to a.test"))
            .await
            .expect_err("endpoint join fails");
        assert!(matches!(err, CommandError::Url(_)));

        let snapshot = supervisor.snapshot().await;
        assert_eq!(snapshot.task_status, TaskStatus::Failed);
        assert!(snapshot.last_error.is_some());
    }

    #[tokio::test]
    async fn blank_submit_is_rejected_without_clearing_state() {
        let (tx, rx) = mpsc::channel(8);
        let supervisor = SessionSupervisor::new(unreachable_gateway(), rx);

        tx.send(frame(
            r#"{"type":"action","data":{"type":"start","message":"Starting","iteration":0}}"#,
        ))
        .await
        .unwrap();
        wait_for(&supervisor, |s| s.action_log.len() == 1).await;

        let err = supervisor
            .submit(SubmitRequest::new("   "))
            .await
            .expect_err("blank instruction");
        assert!(matches!(err, CommandError::InvalidInput));

        let snapshot = supervisor.snapshot().await;
        assert_eq!(snapshot.action_log.len(), 1);
    }

    #[tokio::test]
    async fn submit_while_running_is_rejected_defensively() {
        let (tx, rx) = mpsc::channel(8);
        let supervisor = SessionSupervisor::new(unreachable_gateway(), rx);

        tx.send(frame(r#"{"type":"status","data":{"status":"running"}}"#))
            .await
            .unwrap();
        wait_for(&supervisor, |s| s.task_status == TaskStatus::Running).await;

        let err = supervisor
            .submit(SubmitRequest::new("second task"))
            .await
            .expect_err("one run at a time");
        assert!(matches!(err, CommandError::TaskAlreadyRunning));
    }

    #[tokio::test]
    async fn process_signals_reach_subscribers() {
        let (tx, rx) = mpsc::channel(8);
        let supervisor = SessionSupervisor::new(unreachable_gateway(), rx);
        let mut signals = supervisor.signals();

        tx.send(frame(r#"{"type":"browser_started","data":{"provider":"openai"}}"#))
            .await
            .unwrap();

        let signal = timeout(Duration::from_secs(5), signals.recv())
            .await
            .expect("signal in time")
            .expect("channel open");
        assert_eq!(
            signal,
            AgentSignal::BrowserStarted {
                provider: Some("openai".to_string()),
            }
        );
    }
}
