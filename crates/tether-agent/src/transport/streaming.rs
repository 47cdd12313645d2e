//! Streaming transport over a persistent websocket.
//!
//! Socket activity arrives as [`StreamEvent`]s on one channel and is handled
//! by a single loop. Each connection gets a generation number; events from a
//! connection that has since been replaced or closed on purpose are ignored.

use super::Inbound;
use super::frames::{self, Frame};
use crate::config::AgentConfig;
use crate::metrics::AgentMetrics;
use crate::retry::Backoff;
use crate::state::{AgentRuntimeState, SocketStatus};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tether_core::Error;
use tether_core::agent::{AgentIdentity, ControlDirective};
use thiserror::Error as ThisError;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::{
    self, Message, client::IntoClientRequest, http::HeaderValue, http::StatusCode,
};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorKind {
    /// TLS handshake or certificate problem.
    Ssl,
    /// The endpoint refused the websocket upgrade.
    TransportNotSupported,
    /// The endpoint could not be reached.
    ConnectFailed,
    Unexpected,
}

#[derive(Debug, Clone, ThisError)]
#[error("{kind:?}: {message}")]
pub struct StreamError {
    pub kind: StreamErrorKind,
    pub message: String,
}

impl StreamError {
    pub fn new(kind: StreamErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Opened,
    Message(String),
    Error(StreamError),
    Closed,
}

/// Opens stream connections.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// Open a connection. Socket activity is delivered on `events`; text
    /// written to the returned sender goes out on the socket.
    async fn connect(
        &self,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<mpsc::Sender<String>, StreamError>;
}

/// Holds the stream open and routes what arrives on it.
pub struct StreamingTransport {
    connector: Arc<dyn StreamConnector>,
    state: Arc<AgentRuntimeState>,
    metrics: Arc<AgentMetrics>,
    inbound: mpsc::Sender<Inbound>,
    backoff: Backoff,
    writer: Mutex<Option<mpsc::Sender<String>>>,
    events_tx: mpsc::Sender<(u64, StreamEvent)>,
    events_rx: Mutex<Option<mpsc::Receiver<(u64, StreamEvent)>>>,
    generation: AtomicU64,
    opened_before: AtomicBool,
    closing: AtomicBool,
    reconnecting: AtomicBool,
    /// Generation whose reconnect request arrived while one was in flight; 0 if none.
    missed_reconnect: AtomicU64,
}

impl StreamingTransport {
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        state: Arc<AgentRuntimeState>,
        metrics: Arc<AgentMetrics>,
        inbound: mpsc::Sender<Inbound>,
        backoff: Backoff,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(256);
        Arc::new(Self {
            connector,
            state,
            metrics,
            inbound,
            backoff,
            writer: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            generation: AtomicU64::new(0),
            opened_before: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            missed_reconnect: AtomicU64::new(0),
        })
    }

    /// Generation of the current connection.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }

    /// Open the first connection. Failures follow the usual error handling.
    pub async fn start(self: &Arc<Self>) {
        if let Err(e) = self.connect_once().await {
            let generation = self.generation();
            self.handle_event(generation, StreamEvent::Error(e)).await;
        }
    }

    /// Process socket events until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let Some(mut events) = self.events_rx.lock().await.take() else {
            warn!("Stream event loop already running");
            return;
        };
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some((generation, event)) => self.handle_event(generation, event).await,
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.close().await;
        info!("Streaming transport stopped");
    }

    /// Connect and install the writer for the new connection.
    pub async fn connect_once(&self) -> Result<(), StreamError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (conn_tx, mut conn_rx) = mpsc::channel::<StreamEvent>(256);
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = conn_rx.recv().await {
                if events_tx.send((generation, event)).await.is_err() {
                    break;
                }
            }
        });

        let writer = self.connector.connect(conn_tx).await?;
        if self.is_closing() {
            return Err(StreamError::new(
                StreamErrorKind::Unexpected,
                "transport closed while connecting",
            ));
        }
        *self.writer.lock().await = Some(writer);
        debug!(generation, "Stream connection established");
        Ok(())
    }

    pub async fn handle_event(self: &Arc<Self>, generation: u64, event: StreamEvent) {
        if generation != self.generation() {
            debug!(generation, current = self.generation(), "Ignoring event from stale connection");
            return;
        }
        match event {
            StreamEvent::Opened => {
                let status = if self.opened_before.swap(true, Ordering::SeqCst) {
                    SocketStatus::Reopened
                } else {
                    SocketStatus::Open
                };
                self.state.set_socket_status(status);
                info!(status = ?status, "Stream opened");
            }
            StreamEvent::Message(text) => self.on_message(text).await,
            StreamEvent::Error(err) => match err.kind {
                StreamErrorKind::Ssl | StreamErrorKind::TransportNotSupported => {
                    warn!(error = %err, "Stream error, reconnecting");
                    self.state.set_socket_status(SocketStatus::Error);
                    self.trigger_reconnect();
                }
                StreamErrorKind::ConnectFailed => {
                    error!(error = %err, "Failed to connect to stream");
                    self.state.set_socket_status(SocketStatus::Error);
                }
                StreamErrorKind::Unexpected => {
                    error!(error = %err, "Unexpected stream error, closing socket");
                    self.close_socket().await;
                }
            },
            StreamEvent::Closed => {
                self.state.set_socket_status(SocketStatus::Closed);
                if self.is_closing() {
                    debug!("Stream closed");
                } else {
                    warn!("Stream closed by remote, reconnecting");
                    self.trigger_reconnect();
                }
            }
        }
    }

    async fn on_message(self: &Arc<Self>, text: String) {
        match frames::parse(&text) {
            Ok(Frame::Task(event)) => {
                debug!(task_id = %event.task_id, kind = ?event.kind, "Task event received on stream");
                if self.inbound.send(Inbound::Task(event)).await.is_err() {
                    warn!("Inbound channel closed, dropping task event");
                }
            }
            Ok(Frame::HeartbeatResponse(response)) => {
                if self
                    .inbound
                    .send(Inbound::HeartbeatResponse(response))
                    .await
                    .is_err()
                {
                    warn!("Inbound channel closed, dropping heartbeat response");
                }
            }
            Ok(Frame::Other(text)) => {
                let agent_id = self.state.agent_id();
                match ControlDirective::from_frame(&text, agent_id.as_ref()) {
                    Some(directive) => {
                        warn!(directive = ?directive, "Control directive received on stream");
                        self.state.apply_directive(directive);
                        if directive == ControlDirective::SelfDestruct {
                            self.close().await;
                        }
                    }
                    None => debug!(len = text.len(), "Unhandled stream frame"),
                }
            }
            Err(e) => warn!(error = %e, "Failed to parse stream frame"),
        }
    }

    /// Start a reconnect unless one is running or the transport is closing.
    pub fn trigger_reconnect(self: &Arc<Self>) -> bool {
        if self.is_closing() {
            debug!("Transport closing, not reconnecting");
            return false;
        }
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Reconnect already in progress");
            self.missed_reconnect.store(self.generation(), Ordering::SeqCst);
            return false;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.reconnect_loop().await;
            this.reconnecting.store(false, Ordering::SeqCst);
            // The connection that just came up may already have dropped.
            let missed = this.missed_reconnect.swap(0, Ordering::SeqCst);
            if missed != 0 && missed == this.generation() {
                info!(generation = missed, "New stream connection dropped during reconnect");
                this.trigger_reconnect();
            }
        });
        true
    }

    async fn reconnect_loop(&self) {
        *self.writer.lock().await = None;
        let mut attempt = 1;
        loop {
            if self.is_closing() {
                return;
            }
            let delay = self.backoff.delay(attempt);
            info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting stream");
            sleep(delay).await;
            if self.is_closing() {
                return;
            }
            self.metrics.record_reconnect();
            match self.connect_once().await {
                Ok(()) => {
                    info!(attempt, "Stream reconnected");
                    return;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Stream reconnect failed");
                    attempt += 1;
                }
            }
        }
    }

    /// Write a text frame to the socket.
    pub async fn send_text(&self, text: String) -> tether_core::Result<()> {
        let writer = self.writer.lock().await.clone();
        let Some(writer) = writer else {
            return Err(Error::Transport("stream is not connected".into()));
        };
        writer
            .send(text)
            .await
            .map_err(|_| Error::Transport("stream writer closed".into()))
    }

    /// Drop the current connection without disabling reconnection.
    async fn close_socket(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.writer.lock().await.take();
        self.state.set_socket_status(SocketStatus::Closed);
    }

    /// Close the stream for good.
    pub async fn close(&self) {
        if !self.closing.swap(true, Ordering::SeqCst) {
            info!("Closing stream");
        }
        self.close_socket().await;
    }
}

/// Websocket connector for the control plane streaming endpoint.
pub struct WsConnector {
    url: url::Url,
    headers: Vec<(&'static str, String)>,
}

impl WsConnector {
    pub fn new(config: &AgentConfig, identity: &AgentIdentity) -> tether_core::Result<Self> {
        let mut url = url::Url::parse(&format!(
            "{}/stream/delegate/{}",
            config.stream_base_url(),
            identity.account_id
        ))
        .map_err(|e| Error::Config(format!("invalid stream url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("delegateId", identity.agent_id.as_str())
            .append_pair(
                "delegateTokenName",
                config.token_name.as_deref().unwrap_or_default(),
            )
            .append_pair(
                "delegateConnectionId",
                &identity.connection_id.as_uuid().to_string(),
            )
            .append_pair("token", &config.token)
            .append_pair("version", &identity.version);

        let headers = vec![
            ("accountid", identity.account_id.to_string()),
            ("delegateid", identity.agent_id.to_string()),
            ("user-agent", format!("delegate/{}", identity.version)),
        ];
        Ok(Self { url, headers })
    }

    pub fn url(&self) -> &url::Url {
        &self.url
    }
}

#[async_trait]
impl StreamConnector for WsConnector {
    async fn connect(
        &self,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<mpsc::Sender<String>, StreamError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| connect_error(&e))?;
        for (name, value) in &self.headers {
            let value = HeaderValue::from_str(value)
                .map_err(|e| StreamError::new(StreamErrorKind::Unexpected, e.to_string()))?;
            request.headers_mut().insert(*name, value);
        }

        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| connect_error(&e))?;
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::channel::<String>(64);

        let _ = events.send(StreamEvent::Opened).await;

        tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    warn!(error = %e, "Failed to write stream frame");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text.as_str().to_owned(),
                    Ok(Message::Binary(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        if let Some(err) = read_error(&e) {
                            let _ = events.send(StreamEvent::Error(err)).await;
                        }
                        break;
                    }
                };
                if events.send(StreamEvent::Message(text)).await.is_err() {
                    return;
                }
            }
            let _ = events.send(StreamEvent::Closed).await;
        });

        Ok(tx)
    }
}

fn connect_error(e: &tungstenite::Error) -> StreamError {
    let kind = match e {
        tungstenite::Error::Tls(_) => StreamErrorKind::Ssl,
        tungstenite::Error::Url(_) => StreamErrorKind::TransportNotSupported,
        tungstenite::Error::Http(response) => match response.status() {
            StatusCode::UPGRADE_REQUIRED
            | StatusCode::NOT_IMPLEMENTED
            | StatusCode::HTTP_VERSION_NOT_SUPPORTED => StreamErrorKind::TransportNotSupported,
            _ => StreamErrorKind::ConnectFailed,
        },
        tungstenite::Error::Io(_) => StreamErrorKind::ConnectFailed,
        _ => StreamErrorKind::Unexpected,
    };
    StreamError::new(kind, e.to_string())
}

/// Errors on a live socket. Plain disconnects surface as a close instead.
fn read_error(e: &tungstenite::Error) -> Option<StreamError> {
    match e {
        tungstenite::Error::Tls(_) => Some(StreamError::new(StreamErrorKind::Ssl, e.to_string())),
        tungstenite::Error::Io(_)
        | tungstenite::Error::ConnectionClosed
        | tungstenite::Error::AlreadyClosed
        | tungstenite::Error::Protocol(_) => None,
        _ => Some(StreamError::new(StreamErrorKind::Unexpected, e.to_string())),
    }
}
