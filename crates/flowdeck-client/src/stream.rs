use std::time::Duration;

use flowdeck_core::events::{decode_frame, EventFrame, PING_TOKEN};
use flowdeck_core::session::ConnectionState;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(25);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Transport configuration. One instance per [`StreamClient`]; nothing here
/// is process-global.
///
/// Liveness is fire-and-forget: the client sends the bare `ping` token every
/// `ping_interval` but never checks for a reply. A dead peer is only noticed
/// through the socket's own close/error signal.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// WebSocket endpoint, e.g. `ws://127.0.0.1:8000/ws`.
    pub endpoint: Url,
    pub ping_interval: Duration,
    /// Fixed delay before each reconnect attempt. Retries are unbounded;
    /// only [`StreamClient::close`] stops the loop.
    pub reconnect_delay: Duration,
}

impl StreamConfig {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            ping_interval: DEFAULT_PING_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

/// Owns the one persistent connection to the backend's push channel.
///
/// Decoded frames are delivered in arrival order on the receiver handed out
/// by [`StreamClient::new`]. Connection state transitions are published on a
/// watch channel so dependents observe them without polling. There is no
/// buffering across the reconnect boundary: events the backend emits while
/// the channel is down are lost to this client.
pub struct StreamClient {
    config: StreamConfig,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    events_tx: Option<mpsc::Sender<EventFrame>>,
    pump: Option<JoinHandle<()>>,
}

impl StreamClient {
    /// Builds the client together with its ordered event feed. The feed has
    /// exactly one receiver, so it is handed out here rather than through a
    /// fallible accessor.
    pub fn new(config: StreamConfig) -> (Self, mpsc::Receiver<EventFrame>) {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let client = Self {
            config,
            state_tx,
            shutdown_tx,
            events_tx: Some(events_tx),
            pump: None,
        };
        (client, events_rx)
    }

    /// Observable connection state; the receiver is independent of the pump
    /// lifecycle.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Starts the connect/pump loop. Idempotent: a call while the pump is
    /// already running is a no-op.
    pub fn open(&mut self) {
        if self.pump.is_some() {
            return;
        }
        let events_tx = match self.events_tx.take() {
            Some(tx) => tx,
            None => return,
        };
        let config = self.config.clone();
        let state_tx = self.state_tx.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.pump = Some(tokio::spawn(run_pump(
            config,
            state_tx,
            events_tx,
            shutdown_rx,
        )));
    }

    /// Tears the connection down and cancels any pending reconnect. This is
    /// the only way to stop the retry loop.
    pub async fn close(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
    }
}

async fn run_pump(
    config: StreamConfig,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: mpsc::Sender<EventFrame>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        let _ = state_tx.send(ConnectionState::Connecting);

        let connect = tokio::select! {
            result = connect_async(config.endpoint.clone()) => result,
            _ = shutdown_rx.changed() => break,
        };
        let mut ws = match connect {
            Ok((ws, _)) => ws,
            Err(err) => {
                warn!("ws_connect_error: {err}");
                let _ = state_tx.send(ConnectionState::Disconnected);
                tokio::select! {
                    _ = tokio::time::sleep(config.reconnect_delay) => continue,
                    _ = shutdown_rx.changed() => break,
                }
            }
        };
        let _ = state_tx.send(ConnectionState::Connected);
        debug!("ws_connected: {}", config.endpoint);

        let mut ping = interval_at(
            Instant::now() + config.ping_interval,
            config.ping_interval,
        );
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    let _ = ws.close(None).await;
                    let _ = state_tx.send(ConnectionState::Disconnected);
                    return;
                }
                _ = ping.tick() => {
                    if ws.send(Message::Text(PING_TOKEN.to_string())).await.is_err() {
                        break;
                    }
                }
                msg = ws.next() => match msg {
                    Some(Ok(Message::Text(text))) => match decode_frame(&text) {
                        Ok(Some(frame)) => {
                            if events_tx.send(frame).await.is_err() {
                                // Receiver gone; nobody is folding anymore.
                                let _ = ws.close(None).await;
                                let _ = state_tx.send(ConnectionState::Disconnected);
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(err) => warn!("ws_frame_error: {err}"),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!("ws_read_error: {err}");
                        break;
                    }
                }
            }
        }

        let _ = state_tx.send(ConnectionState::Disconnected);
        debug!(
            "ws_disconnected, retrying in {}ms",
            config.reconnect_delay.as_millis()
        );
        tokio::select! {
            _ = tokio::time::sleep(config.reconnect_delay) => {}
            _ = shutdown_rx.changed() => break,
        }
    }
    let _ = state_tx.send(ConnectionState::Disconnected);
}

/// Derives the push-channel endpoint from the backend's HTTP base URL.
pub fn ws_endpoint(base_url: &Url) -> Result<Url, url::ParseError> {
    let mut url = base_url.join("ws")?;
    match url.scheme() {
        "http" => {
            let _ = url.set_scheme("ws");
        }
        "https" => {
            let _ = url.set_scheme("wss");
        }
        _ => {}
    }
    Ok(url)
}
