//! Gateway connection manager.
//!
//! A single spawned worker task owns the websocket handle and drives the
//! fetch, upgrade, monitor, reconnect cycle on a fixed health-check cadence.
//! Serializing every handle mutation through that one task is what keeps the
//! at-most-one-connection invariant without locks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::post_api::{PostClient, PostClientOptions, PostError};
use crate::stream::outbound::Messenger;
use crate::stream::proto::{ConnectInfo, EventRecord};
use crate::stream::recent::{RecentEvents, DEFAULT_RECENT_CAPACITY};

/// Production session endpoint handing out one-time socket URLs.
pub const SESSION_ENDPOINT: &str = "https://slack.com/api/rtm.connect";

const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_millis(10_000);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Error type application hooks may return; captured, never propagated.
pub type HookError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Application-side lifecycle and event hooks.
///
/// All three default to no-ops. A failing hook is recorded as an `exception`
/// entry in the recent-activity buffer and never disturbs the connection.
pub trait GatewayHandler: Send {
    /// Called after the socket session is established.
    fn on_connect(&mut self, messenger: &Messenger) -> Result<(), HookError> {
        let _ = messenger;
        Ok(())
    }

    /// Called for every decoded inbound event, in wire order.
    fn on_event(&mut self, messenger: &Messenger, event: &EventRecord) -> Result<(), HookError> {
        let _ = (messenger, event);
        Ok(())
    }

    /// Called after the socket is lost or closed.
    fn on_disconnect(&mut self, messenger: &Messenger) -> Result<(), HookError> {
        let _ = messenger;
        Ok(())
    }
}

/// Errors surfaced by gateway construction and lifecycle control.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Session HTTP client could not be built.
    #[error("failed to build http client: {0}")]
    Http(#[from] reqwest::Error),

    /// Web API post client could not be built.
    #[error(transparent)]
    Post(#[from] PostError),

    /// The worker task is gone and no longer accepts control commands.
    #[error("gateway worker is gone")]
    ControlClosed,
}

/// Entry point for configuring and launching gateway connections.
#[derive(Clone)]
pub struct GatewayClient {
    token: SecretString,
    session_endpoint: String,
    post_endpoint: Option<String>,
    health_check_interval: Duration,
    connect_timeout: Duration,
    recent_capacity: usize,
    post_options: PostClientOptions,
}

impl GatewayClient {
    pub fn new(token: SecretString) -> Self {
        Self {
            token,
            session_endpoint: SESSION_ENDPOINT.to_string(),
            post_endpoint: None,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            recent_capacity: DEFAULT_RECENT_CAPACITY,
            post_options: PostClientOptions::default(),
        }
    }

    /// Sets an explicit session endpoint override.
    pub fn with_session_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.session_endpoint = endpoint.trim_end().to_string();
        self
    }

    /// Sets an explicit message-post endpoint override.
    pub fn with_post_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.post_endpoint = Some(endpoint.into().trim_end().to_string());
        self
    }

    /// Interval between health checks (and therefore reconnect attempts).
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Upper bound on one fetch-plus-upgrade connect cycle.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Capacity of the recent-activity buffer.
    pub fn with_recent_capacity(mut self, capacity: usize) -> Self {
        self.recent_capacity = capacity;
        self
    }

    /// Timeouts and retry policy for the web API post path.
    pub fn with_post_options(mut self, options: PostClientOptions) -> Self {
        self.post_options = options;
        self
    }

    /// Spawns the connection worker and returns its control handle.
    ///
    /// The worker starts idle; call [`Gateway::start`] to begin connecting.
    /// Must be called from within a tokio runtime.
    pub fn launch<H>(self, handler: H) -> Result<Gateway, GatewayError>
    where
        H: GatewayHandler + 'static,
    {
        let http = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .build()?;

        let mut post = PostClient::with_options(self.token.clone(), self.post_options)?;
        if let Some(endpoint) = &self.post_endpoint {
            post = post.with_endpoint(endpoint.clone());
        }

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let next_id = Arc::new(AtomicU64::new(0));
        let recent = Arc::new(Mutex::new(RecentEvents::new(self.recent_capacity)));

        let messenger = Messenger::new(
            outbound_tx,
            Arc::clone(&connected),
            next_id,
            post,
            Arc::clone(&recent),
        );

        let worker = GatewayWorker {
            token: self.token,
            session_endpoint: self.session_endpoint,
            http,
            handler,
            messenger: messenger.clone(),
            recent: Arc::clone(&recent),
            connected: Arc::clone(&connected),
            connect_timeout: self.connect_timeout,
            health_check_interval: self.health_check_interval,
            socket: None,
            running: false,
            control_rx,
            outbound_rx,
        };
        tokio::spawn(worker.run());

        Ok(Gateway {
            control: control_tx,
            messenger,
            recent,
            connected,
        })
    }
}

/// Control handle for a launched gateway connection.
///
/// Dropping the handle closes the control channel; the worker then closes
/// any live socket and exits, so a gateway cannot outlive its owner.
pub struct Gateway {
    control: mpsc::UnboundedSender<Control>,
    messenger: Messenger,
    recent: Arc<Mutex<RecentEvents>>,
    connected: Arc<AtomicBool>,
}

impl Gateway {
    /// Starts (or restarts) the health-check cadence and performs one
    /// immediate health check. Idempotent.
    pub fn start(&self) -> Result<(), GatewayError> {
        self.control
            .send(Control::Start)
            .map_err(|_| GatewayError::ControlClosed)
    }

    /// Halts the health-check cadence and closes any live socket.
    /// Idempotent.
    pub fn stop(&self) -> Result<(), GatewayError> {
        self.control
            .send(Control::Stop)
            .map_err(|_| GatewayError::ControlClosed)
    }

    /// Cloneable outbound dispatch handle.
    pub fn messenger(&self) -> Messenger {
        self.messenger.clone()
    }

    /// Whether a live socket currently exists.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Snapshot of the recent-activity buffer, oldest-first.
    pub fn recent_events(&self) -> Vec<EventRecord> {
        self.recent
            .lock()
            .map(|recent| recent.snapshot())
            .unwrap_or_default()
    }
}

enum Control {
    Start,
    Stop,
}

struct GatewayWorker<H> {
    token: SecretString,
    session_endpoint: String,
    http: reqwest::Client,
    handler: H,
    messenger: Messenger,
    recent: Arc<Mutex<RecentEvents>>,
    connected: Arc<AtomicBool>,
    connect_timeout: Duration,
    health_check_interval: Duration,
    socket: Option<WsStream>,
    running: bool,
    control_rx: mpsc::UnboundedReceiver<Control>,
    outbound_rx: mpsc::UnboundedReceiver<String>,
}

impl<H: GatewayHandler> GatewayWorker<H> {
    async fn run(mut self) {
        let mut ticker = new_ticker(self.health_check_interval);

        loop {
            tokio::select! {
                control = self.control_rx.recv() => match control {
                    Some(Control::Start) => {
                        self.running = true;
                        ticker = new_ticker(self.health_check_interval);
                        self.check_health().await;
                    }
                    Some(Control::Stop) => {
                        self.running = false;
                        self.shutdown_socket().await;
                    }
                    None => {
                        self.shutdown_socket().await;
                        return;
                    }
                },
                _ = ticker.tick(), if self.running => {
                    self.check_health().await;
                }
                frame = next_frame(&mut self.socket), if self.socket.is_some() => {
                    self.handle_frame(frame).await;
                }
                outbound = self.outbound_rx.recv() => {
                    // The worker holds a messenger clone, so the queue can
                    // only close during teardown.
                    if let Some(text) = outbound {
                        self.write_frame(text).await;
                    }
                }
            }
        }
    }

    async fn check_health(&mut self) {
        if self.socket.is_some() {
            return;
        }
        self.record(EventRecord::log("reconnecting gateway socket"));

        match tokio::time::timeout(self.connect_timeout, self.connect_cycle()).await {
            Ok(Some(socket)) => {
                info!("gateway socket established");
                self.socket = Some(socket);
                self.connected.store(true, Ordering::SeqCst);
                self.record(EventRecord::log("connected to gateway socket"));
                self.invoke(|handler, messenger| handler.on_connect(messenger), "connect hook failed");
            }
            Ok(None) => {
                // Failure already recorded by the cycle; next tick retries.
            }
            Err(_elapsed) => {
                warn!(timeout_ms = self.connect_timeout.as_millis() as u64, "gateway connect attempt timed out");
                self.record(EventRecord::log("gateway connect attempt timed out"));
            }
        }
    }

    /// One fetch-plus-upgrade pass. Failures are recorded in the activity
    /// buffer and reported as `None`; retrying is the ticker's job.
    async fn connect_cycle(&mut self) -> Option<WsStream> {
        self.record(EventRecord::log("fetching gateway socket url"));

        let response = match self
            .http
            .get(&self.session_endpoint)
            .bearer_auth(self.token.expose_secret())
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "session endpoint request failed");
                self.record(EventRecord::log_with_error(
                    "failed to fetch gateway socket url",
                    Value::String(err.to_string()),
                ));
                return None;
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => {
                warn!(error = %err, "session endpoint response unreadable");
                self.record(EventRecord::log_with_error(
                    "failed to fetch gateway socket url",
                    Value::String(err.to_string()),
                ));
                return None;
            }
        };

        if status.is_client_error() || status.is_server_error() {
            warn!(status = status.as_u16(), "session endpoint refused request");
            self.record(EventRecord::log_with_error(
                "failed to fetch gateway socket url",
                json!({"status": status.as_u16()}),
            ));
            return None;
        }

        let info = match ConnectInfo::from_text(&body) {
            Ok(info) => info,
            Err(err) => {
                self.record(EventRecord::log_with_error(
                    "session endpoint returned invalid json",
                    Value::String(err.to_string()),
                ));
                return None;
            }
        };

        if !info.ok {
            warn!(error = info.error.as_deref().unwrap_or("unknown"), "session request rejected");
            self.record(EventRecord::log_with_error(
                "session request rejected",
                json!({"error": info.error}),
            ));
            return None;
        }

        let Some(url) = info.url else {
            self.record(EventRecord::log("session response missing socket url"));
            return None;
        };

        self.record(EventRecord::log("connecting to gateway socket"));
        match connect_async(url.as_str()).await {
            Ok((socket, _response)) => Some(socket),
            Err(err) => {
                warn!(error = %err, "gateway socket upgrade failed");
                self.record(EventRecord::log_with_error(
                    "gateway socket upgrade failed",
                    Value::String(err.to_string()),
                ));
                None
            }
        }
    }

    async fn handle_frame(&mut self, frame: Option<Result<Message, WsError>>) {
        match frame {
            Some(Ok(Message::Text(text))) => match EventRecord::from_frame(&text) {
                Ok(event) => {
                    self.record(event.clone());
                    self.invoke(
                        |handler, messenger| handler.on_event(messenger, &event),
                        "event hook failed",
                    );
                }
                Err(err) => {
                    debug!(error = %err, "discarding malformed gateway frame");
                    self.record(EventRecord::log_with_error(
                        "received malformed gateway frame",
                        Value::String(err.to_string()),
                    ));
                }
            },
            Some(Ok(Message::Ping(payload))) => {
                if let Some(socket) = self.socket.as_mut() {
                    if let Err(err) = socket.send(Message::Pong(payload)).await {
                        self.mark_disconnected(Some(Value::String(err.to_string())));
                    }
                }
            }
            Some(Ok(Message::Close(_))) | None => {
                self.mark_disconnected(None);
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                self.mark_disconnected(Some(Value::String(err.to_string())));
            }
        }
    }

    async fn write_frame(&mut self, text: String) {
        let Some(socket) = self.socket.as_mut() else {
            self.record(EventRecord::log("dropped outbound frame without live socket"));
            return;
        };
        if let Err(err) = socket.send(Message::Text(text)).await {
            warn!(error = %err, "gateway socket write failed");
            self.mark_disconnected(Some(Value::String(err.to_string())));
        }
    }

    /// Remote-initiated loss of the socket.
    fn mark_disconnected(&mut self, detail: Option<Value>) {
        self.socket = None;
        self.connected.store(false, Ordering::SeqCst);
        info!("gateway socket lost");
        let entry = match detail {
            Some(detail) => EventRecord::log_with_error("disconnected from gateway socket", detail),
            None => EventRecord::log("disconnected from gateway socket"),
        };
        self.record(entry);
        self.invoke(
            |handler, messenger| handler.on_disconnect(messenger),
            "disconnect hook failed",
        );
    }

    /// Local close, on stop or teardown.
    async fn shutdown_socket(&mut self) {
        let Some(mut socket) = self.socket.take() else {
            return;
        };
        let _ = socket.close(None).await;
        self.connected.store(false, Ordering::SeqCst);
        self.record(EventRecord::log("closed gateway socket"));
        self.invoke(
            |handler, messenger| handler.on_disconnect(messenger),
            "disconnect hook failed",
        );
    }

    fn invoke<F>(&mut self, call: F, context: &str)
    where
        F: FnOnce(&mut H, &Messenger) -> Result<(), HookError>,
    {
        if let Err(err) = call(&mut self.handler, &self.messenger) {
            warn!(error = %err, "{context}");
            self.record(EventRecord::exception(context, &err));
        }
    }

    fn record(&self, entry: EventRecord) {
        if let Ok(mut recent) = self.recent.lock() {
            recent.record(entry);
        }
    }
}

fn new_ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn next_frame(socket: &mut Option<WsStream>) -> Option<Result<Message, WsError>> {
    match socket.as_mut() {
        Some(socket) => socket.next().await,
        None => std::future::pending().await,
    }
}
