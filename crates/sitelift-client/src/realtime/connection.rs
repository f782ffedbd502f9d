//! Persistent duplex connection with heartbeat and automatic reconnection.
//!
//! One [`RealtimeConnection`] owns at most one open transport at a time.
//! While open, a background session task:
//! - Writes outbound frames in order and reports each write back to its caller
//! - Sends a `ping` envelope every heartbeat interval
//! - Parses inbound envelopes and dispatches them to subscribers
//!
//! When an open connection drops unexpectedly a reconnect task retries with
//! capped exponential backoff until the attempt budget runs out.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use sitelift_core::backoff::ReconnectPolicy;
use sitelift_core::error::AppError;
use sitelift_core::events::{
    ConnectionError, ConnectionEvent, EventRegistry, HandlerId, RealtimeEvent, Topic,
};
use sitelift_core::models::Envelope;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::transport::{InboundStream, OutboundSink, Transport, WebSocketTransport};

/// Lifecycle state of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    Closing,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Closed => "closed",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Configuration for the realtime connection.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// WebSocket endpoint; the credential is appended as `?token=`.
    pub endpoint: String,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Silence after which a failed heartbeat forces a reconnect.
    pub liveness_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl RealtimeConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(15),
            liveness_timeout: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}

/// A frame queued for the session task, with a channel for the write result.
struct Outbound {
    text: String,
    ack: oneshot::Sender<Result<(), AppError>>,
}

struct ConnState {
    status: ConnectionState,
    reconnect_attempts: u32,
    reconnect_delay: Duration,
    last_message_at: Option<Instant>,
    credential: Option<String>,
    /// Bumped by every connect attempt and every disconnect; stale sessions
    /// and connect attempts compare against it and back off.
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    session_cancel: Option<CancellationToken>,
    session_task: Option<JoinHandle<()>>,
    reconnect_cancel: Option<CancellationToken>,
}

struct Shared<T> {
    transport: T,
    config: RealtimeConfig,
    state: Mutex<ConnState>,
    status_tx: watch::Sender<ConnectionState>,
    events: EventRegistry,
}

/// Handle to one realtime connection. Cheap to clone; clones share state.
pub struct RealtimeConnection<T: Transport = WebSocketTransport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for RealtimeConnection<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl RealtimeConnection<WebSocketTransport> {
    /// Connection over real WebSockets.
    pub fn websocket(config: RealtimeConfig) -> Self {
        Self::new(WebSocketTransport, config)
    }
}

impl<T: Transport> RealtimeConnection<T> {
    pub fn new(transport: T, config: RealtimeConfig) -> Self {
        let (status_tx, _) = watch::channel(ConnectionState::Closed);
        let reconnect_delay = config.reconnect.base_delay;
        Self {
            shared: Arc::new(Shared {
                transport,
                config,
                state: Mutex::new(ConnState {
                    status: ConnectionState::Closed,
                    reconnect_attempts: 0,
                    reconnect_delay,
                    last_message_at: None,
                    credential: None,
                    generation: 0,
                    outbound: None,
                    session_cancel: None,
                    session_task: None,
                    reconnect_cancel: None,
                }),
                status_tx,
                events: EventRegistry::new(),
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnState> {
        self.shared.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned connection state mutex");
            poisoned.into_inner()
        })
    }

    /// Set the status and notify watchers. Call with the state lock held.
    fn set_status(&self, state: &mut ConnState, status: ConnectionState) {
        if state.status != status {
            tracing::debug!(from = %state.status, to = %status, "Connection state changed");
        }
        state.status = status;
        self.shared.status_tx.send_replace(status);
    }

    // ---- accessors ----

    pub fn state(&self) -> ConnectionState {
        self.lock_state().status
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.lock_state().reconnect_attempts
    }

    /// Delay used by the most recent reconnect attempt.
    pub fn reconnect_delay(&self) -> Duration {
        self.lock_state().reconnect_delay
    }

    pub fn last_message_at(&self) -> Option<Instant> {
        self.lock_state().last_message_at
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.status_tx.subscribe()
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.shared.config
    }

    // ---- subscriptions ----

    pub fn on<F>(&self, topic: Topic, handler: F) -> HandlerId
    where
        F: Fn(&RealtimeEvent) + Send + Sync + 'static,
    {
        self.shared.events.on(topic, handler)
    }

    pub fn off(&self, topic: &Topic, id: HandlerId) -> bool {
        self.shared.events.off(topic, id)
    }

    pub fn events(&self) -> &EventRegistry {
        &self.shared.events
    }

    fn emit_connection(&self, event: ConnectionEvent) {
        self.shared
            .events
            .dispatch(&Topic::Connection, &RealtimeEvent::Connection(event));
    }

    fn emit_error(&self, error: ConnectionError) {
        self.shared
            .events
            .dispatch(&Topic::Error, &RealtimeEvent::Error(error));
    }

    // ---- lifecycle ----

    /// Open the connection, storing `credential` for later reconnects.
    ///
    /// A no-op when already open. While another attempt is in progress this
    /// waits for it instead of opening a second transport.
    pub async fn connect(&self, credential: Option<&str>) -> Result<(), AppError> {
        enum Next {
            Ready,
            Wait,
            Open { generation: u64, url: Url },
        }

        let next = {
            let mut state = self.lock_state();
            if let Some(credential) = credential {
                state.credential = Some(credential.to_string());
            }
            match state.status {
                ConnectionState::Open => Next::Ready,
                ConnectionState::Connecting => Next::Wait,
                ConnectionState::Closed | ConnectionState::Closing => {
                    let url = self.endpoint_url(state.credential.as_deref())?;
                    state.generation += 1;
                    self.set_status(&mut state, ConnectionState::Connecting);
                    Next::Open {
                        generation: state.generation,
                        url,
                    }
                }
            }
        };

        match next {
            Next::Ready => Ok(()),
            Next::Wait => self.wait_for_attempt().await,
            Next::Open { generation, url } => self.open(generation, url).await,
        }
    }

    async fn wait_for_attempt(&self) -> Result<(), AppError> {
        let mut rx = self.watch_state();
        let status = *rx
            .wait_for(|s| *s != ConnectionState::Connecting)
            .await
            .map_err(|_| AppError::ConnectionClosed("Connection dropped".into()))?;
        match status {
            ConnectionState::Open => Ok(()),
            other => Err(AppError::ConnectionClosed(format!(
                "Pending connect attempt ended in state {other}"
            ))),
        }
    }

    fn endpoint_url(&self, credential: Option<&str>) -> Result<Url, AppError> {
        let endpoint = &self.shared.config.endpoint;
        let mut url = Url::parse(endpoint).map_err(|e| {
            AppError::ConfigError(format!("Invalid realtime endpoint '{endpoint}': {e}"))
        })?;
        if let Some(token) = credential {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url)
    }

    async fn open(&self, generation: u64, url: Url) -> Result<(), AppError> {
        let timeout = self.shared.config.connect_timeout;
        tracing::info!(endpoint = %self.shared.config.endpoint, "Connecting realtime channel");

        let opened =
            tokio::time::timeout(timeout, self.shared.transport.open(url.as_str())).await;
        let (mut sink, inbound) = match opened {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(self.fail_connect(generation, e)),
            Err(_) => return Err(self.fail_connect(generation, AppError::ConnectionTimeout(timeout))),
        };

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let superseded = {
            let mut state = self.lock_state();
            if state.generation != generation {
                true
            } else {
                state.reconnect_attempts = 0;
                state.reconnect_delay = self.shared.config.reconnect.base_delay;
                state.last_message_at = Some(Instant::now());
                state.outbound = Some(tx);
                state.session_cancel = Some(cancel.clone());
                self.set_status(&mut state, ConnectionState::Open);
                false
            }
        };

        if superseded {
            tracing::debug!("Connect attempt superseded by disconnect; closing transport");
            let _ = sink.close().await;
            return Err(AppError::ConnectionClosed(
                "Disconnected while connecting".into(),
            ));
        }

        let task = tokio::spawn(
            self.clone()
                .run_session(generation, sink, inbound, rx, cancel),
        );
        {
            let mut state = self.lock_state();
            if state.generation == generation {
                state.session_task = Some(task);
            }
        }

        tracing::info!("Realtime channel open");
        self.emit_connection(ConnectionEvent::Connected);
        Ok(())
    }

    /// Put a failed attempt back to Closed (unless superseded) and surface it.
    fn fail_connect(&self, generation: u64, error: AppError) -> AppError {
        {
            let mut state = self.lock_state();
            if state.generation == generation && state.status == ConnectionState::Connecting {
                self.set_status(&mut state, ConnectionState::Closed);
            }
        }
        tracing::warn!(%error, "Realtime connect failed");
        self.emit_error(ConnectionError::recoverable(error.to_string()));
        error
    }

    /// Serialize `{type, data, timestamp}` and write it.
    ///
    /// A closed connection is opened first with the stored credential.
    /// Write failures are returned and leave the connection state alone.
    pub async fn send(&self, kind: &str, data: serde_json::Value) -> Result<(), AppError> {
        self.ensure_open().await?;
        let text = serde_json::to_string(&Envelope::new(kind, data))?;
        self.write(text).await
    }

    async fn ensure_open(&self) -> Result<(), AppError> {
        if self.is_connected() {
            return Ok(());
        }
        tracing::debug!("Send on a closed connection; connecting first");
        self.connect(None).await
    }

    async fn write(&self, text: String) -> Result<(), AppError> {
        let outbound = self
            .lock_state()
            .outbound
            .clone()
            .ok_or_else(|| AppError::ConnectionClosed("Connection is not open".into()))?;

        let (ack, done) = oneshot::channel();
        outbound
            .send(Outbound { text, ack })
            .map_err(|_| AppError::ConnectionClosed("Connection session ended".into()))?;
        done.await.map_err(|_| {
            AppError::ConnectionClosed("Connection session ended before the write".into())
        })?
    }

    /// Close the connection and cancel any pending reconnect. Never reconnects.
    pub async fn disconnect(&self) {
        let (was_open, session_cancel, session_task, reconnect_cancel) = {
            let mut state = self.lock_state();
            state.generation += 1;
            let was_open = state.status == ConnectionState::Open;
            if state.status != ConnectionState::Closed {
                self.set_status(&mut state, ConnectionState::Closing);
            }
            state.outbound = None;
            (
                was_open,
                state.session_cancel.take(),
                state.session_task.take(),
                state.reconnect_cancel.take(),
            )
        };

        if let Some(token) = reconnect_cancel {
            token.cancel();
        }
        if let Some(token) = session_cancel {
            token.cancel();
        }
        if let Some(task) = session_task
            && let Err(e) = task.await
        {
            tracing::warn!(error = %e, "Session task ended abnormally");
        }

        {
            let mut state = self.lock_state();
            if state.status == ConnectionState::Closing {
                self.set_status(&mut state, ConnectionState::Closed);
            }
        }

        if was_open {
            tracing::info!("Realtime channel closed by client");
            self.emit_connection(ConnectionEvent::Disconnected {
                permanent: false,
                reason: Some("Client disconnected".into()),
            });
        }
    }

    /// Disconnect and drop every subscription.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        self.shared.events.clear();
    }

    // ---- session ----

    async fn run_session(
        self,
        generation: u64,
        mut sink: OutboundSink,
        mut inbound: InboundStream,
        mut commands: mpsc::UnboundedReceiver<Outbound>,
        cancel: CancellationToken,
    ) {
        let config = &self.shared.config;
        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + config.heartbeat_interval,
            config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();

        let reason = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    let _ = sink.close().await;
                    return;
                }

                cmd = commands.recv() => match cmd {
                    Some(Outbound { text, ack }) => {
                        let result = sink.send(text).await;
                        if let Err(e) = &result {
                            tracing::warn!(error = %e, "Realtime write failed");
                        }
                        let _ = ack.send(result);
                    }
                    None => break "Outbound channel closed".to_string(),
                },

                _ = heartbeat.tick() => {
                    let silent_for = last_seen.elapsed();
                    let stale = silent_for >= config.liveness_timeout;
                    let ping = match serde_json::to_string(&Envelope::ping()) {
                        Ok(ping) => ping,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to encode heartbeat");
                            continue;
                        }
                    };
                    match sink.send(ping).await {
                        Ok(()) => {
                            tracing::debug!(silent_ms = silent_for.as_millis() as u64, "Heartbeat ping sent");
                        }
                        Err(e) if stale => {
                            tracing::warn!(error = %e, silent_ms = silent_for.as_millis() as u64, "Heartbeat failed on a silent connection");
                            self.emit_error(ConnectionError::recoverable(e.to_string()));
                            break format!("Heartbeat failed: {e}");
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "Heartbeat ping failed");
                        }
                    }
                }

                frame = inbound.next() => match frame {
                    Some(Ok(text)) => {
                        last_seen = Instant::now();
                        self.handle_inbound(&text, last_seen);
                    }
                    Some(Err(e)) => {
                        self.emit_error(ConnectionError::recoverable(e.to_string()));
                        break e.to_string();
                    }
                    None => break "Connection closed by server".to_string(),
                },
            }
        };

        self.handle_close(generation, reason);
    }

    fn handle_inbound(&self, text: &str, at: Instant) {
        self.lock_state().last_message_at = Some(at);

        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to parse realtime message");
                self.emit_error(ConnectionError::recoverable(format!(
                    "Invalid message: {e}"
                )));
                return;
            }
        };

        if envelope.is_heartbeat() {
            tracing::debug!(kind = %envelope.kind, "Heartbeat received");
            return;
        }

        let topic = Topic::Message(envelope.kind.clone());
        let event = RealtimeEvent::Message(envelope);
        self.shared.events.dispatch(&topic, &event);
        self.shared.events.dispatch(&Topic::AnyMessage, &event);
    }

    /// The session ended without a disconnect request.
    fn handle_close(&self, generation: u64, reason: String) {
        let was_open = {
            let mut state = self.lock_state();
            if state.generation != generation {
                return;
            }
            let was_open = state.status == ConnectionState::Open;
            state.outbound = None;
            state.session_cancel = None;
            state.session_task = None;
            self.set_status(&mut state, ConnectionState::Closed);
            was_open
        };

        tracing::warn!(%reason, "Realtime channel lost");
        self.emit_connection(ConnectionEvent::Disconnected {
            permanent: false,
            reason: Some(reason),
        });

        if was_open {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&self) {
        let token = CancellationToken::new();
        {
            let mut state = self.lock_state();
            if let Some(previous) = state.reconnect_cancel.replace(token.clone()) {
                previous.cancel();
            }
        }
        let this = self.clone();
        tokio::spawn(async move { this.reconnect_loop(token).await });
    }

    async fn reconnect_loop(self, cancel: CancellationToken) {
        let policy = &self.shared.config.reconnect;
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let next = {
                let mut state = self.lock_state();
                if policy.is_exhausted(state.reconnect_attempts) {
                    None
                } else {
                    state.reconnect_attempts += 1;
                    let delay = policy.delay_for_attempt(state.reconnect_attempts);
                    state.reconnect_delay = delay;
                    Some((state.reconnect_attempts, delay))
                }
            };

            let Some((attempt, delay)) = next else {
                let reason = AppError::MaxReconnectAttemptsExceeded {
                    attempts: policy.max_attempts,
                }
                .to_string();
                tracing::error!(%reason, "Giving up on realtime channel");
                {
                    let mut state = self.lock_state();
                    state.reconnect_cancel = None;
                }
                self.emit_connection(ConnectionEvent::Disconnected {
                    permanent: true,
                    reason: Some(reason),
                });
                return;
            };

            tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.connect(None).await {
                Ok(()) => {
                    tracing::info!(attempt, "Reconnected");
                    return;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Reconnect attempt failed");
                }
            }
        }
    }
}
