//! Persistent push-update client that reconnects on a fixed timer.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::StreamError;
use crate::events::{event_names, EventBus, SubscriptionId};
use crate::feed::{FeedFrame, LineBuffer, MAX_LINE_BYTES};
use crate::scheduler::Timer;
use crate::types::config::StreamSettings;

pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for StreamConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamConnectionState::Disconnected => "disconnected",
            StreamConnectionState::Connecting => "connecting",
            StreamConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Opens server-push channels.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn StreamConnection>, StreamError>;
}

/// An open channel yielding text frames.
#[async_trait]
pub trait StreamConnection: Send {
    /// Next text frame, or `Ok(None)` once the peer has closed.
    async fn next_message(&mut self) -> Result<Option<String>, StreamError>;

    async fn close(&mut self) {}

    /// Frames this connection discarded before they reached `next_message`.
    fn dropped_frames(&self) -> u64 {
        0
    }
}

/// Long-lived HTTP GET whose body is read as newline-delimited frames
/// (NDJSON or server-sent events).
pub struct HttpLineTransport {
    client: reqwest::Client,
    line_limit: usize,
}

impl HttpLineTransport {
    pub fn new() -> Result<Self, StreamError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| StreamError::Connect(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            line_limit: MAX_LINE_BYTES,
        })
    }

    /// Longest frame accepted; longer ones are dropped and counted.
    pub fn with_line_limit(mut self, limit: usize) -> Self {
        self.line_limit = limit;
        self
    }
}

#[async_trait]
impl StreamTransport for HttpLineTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn StreamConnection>, StreamError> {
        let response = self
            .client
            .get(url)
            .header(
                reqwest::header::ACCEPT,
                "text/event-stream, application/x-ndjson",
            )
            .send()
            .await
            .map_err(|e| StreamError::Connect(e.to_string()))?;
        if !response.status().is_success() {
            return Err(StreamError::Connect(format!(
                "unexpected status {}",
                response.status()
            )));
        }
        Ok(Box::new(HttpLineConnection {
            response: Some(response),
            buffer: LineBuffer::with_limit(self.line_limit),
            pending: VecDeque::new(),
        }))
    }
}

struct HttpLineConnection {
    response: Option<reqwest::Response>,
    buffer: LineBuffer,
    pending: VecDeque<String>,
}

#[async_trait]
impl StreamConnection for HttpLineConnection {
    async fn next_message(&mut self) -> Result<Option<String>, StreamError> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Ok(Some(line));
            }
            let Some(response) = self.response.as_mut() else {
                return Ok(None);
            };
            match response.chunk().await {
                Ok(Some(bytes)) => self.pending.extend(self.buffer.push(&bytes)),
                Ok(None) => {
                    self.response = None;
                    self.pending.extend(self.buffer.finish());
                }
                Err(e) => {
                    self.response = None;
                    return Err(StreamError::Transport(e.to_string()));
                }
            }
        }
    }

    async fn close(&mut self) {
        self.response = None;
    }

    fn dropped_frames(&self) -> u64 {
        self.buffer.oversized()
    }
}

struct ClientState {
    url: String,
    transport: Arc<dyn StreamTransport>,
    reconnect_interval: Duration,
    state: Mutex<StreamConnectionState>,
    should_run: AtomicBool,
    /// Bumped by `stop`; a driver from an older generation may not mutate state.
    generation: AtomicU64,
    shutdown: watch::Sender<u64>,
    timer: Timer,
    state_events: EventBus<StreamConnectionState>,
    payloads: EventBus<Value>,
    attempts: AtomicU64,
    received: AtomicU64,
    malformed: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap to clone; clones drive the same connection.
#[derive(Clone)]
pub struct ReconnectingStreamClient {
    state: Arc<ClientState>,
}

impl ReconnectingStreamClient {
    pub fn new(url: &str, transport: Arc<dyn StreamTransport>) -> Self {
        Self::with_interval(url, transport, DEFAULT_RECONNECT_INTERVAL)
    }

    pub fn with_interval(
        url: &str,
        transport: Arc<dyn StreamTransport>,
        reconnect_interval: Duration,
    ) -> Self {
        let (shutdown, _) = watch::channel(0);
        Self {
            state: Arc::new(ClientState {
                url: url.to_string(),
                transport,
                reconnect_interval,
                state: Mutex::new(StreamConnectionState::Disconnected),
                should_run: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                shutdown,
                timer: Timer::new(),
                state_events: EventBus::new(event_names::STREAM_STATE),
                payloads: EventBus::new(event_names::STREAM_PAYLOAD),
                attempts: AtomicU64::new(0),
                received: AtomicU64::new(0),
                malformed: AtomicU64::new(0),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn from_settings(settings: &StreamSettings, transport: Arc<dyn StreamTransport>) -> Self {
        Self::with_interval(&settings.url, transport, settings.reconnect_interval())
    }

    pub fn url(&self) -> &str {
        &self.state.url
    }

    pub fn state(&self) -> StreamConnectionState {
        *self.state.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.state.should_run.load(Ordering::SeqCst)
    }

    /// Connection attempts made so far.
    pub fn attempts(&self) -> u64 {
        self.state.attempts.load(Ordering::SeqCst)
    }

    pub fn received_count(&self) -> u64 {
        self.state.received.load(Ordering::SeqCst)
    }

    /// Frames dropped because they were not valid JSON or were too long.
    pub fn malformed_count(&self) -> u64 {
        self.state.malformed.load(Ordering::SeqCst)
    }

    /// Connect now and keep reconnecting until `stop`. No-op while running.
    pub fn start(&self) {
        if self.state.should_run.swap(true, Ordering::SeqCst) {
            debug!(url = %self.state.url, "Stream client already running");
            return;
        }
        let generation = self.state.generation.load(Ordering::SeqCst);
        self.state.timer.disarm();

        let state = Arc::clone(&self.state);
        let handle = tokio::spawn(async move { state.drive(generation).await });
        let mut task = self.state.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = task.replace(handle) {
            old.abort();
        }
        info!(url = %self.state.url, "Stream client started");
    }

    /// Stop reconnecting and close the open connection. Safe to repeat.
    pub fn stop(&self) {
        if !self.state.should_run.swap(false, Ordering::SeqCst) {
            return;
        }
        let changed = {
            let mut current = self.state.state.lock().unwrap_or_else(|e| e.into_inner());
            let generation = self.state.generation.fetch_add(1, Ordering::SeqCst) + 1;
            self.state.shutdown.send_replace(generation);
            let changed = *current != StreamConnectionState::Disconnected;
            *current = StreamConnectionState::Disconnected;
            changed
        };
        self.state.timer.cancel();
        if changed {
            self.state
                .state_events
                .publish(&StreamConnectionState::Disconnected);
        }
        info!(url = %self.state.url, "Stream client stopped");
    }

    pub fn on_state_change<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&StreamConnectionState) -> Result<(), String> + Send + Sync + 'static,
    {
        self.state.state_events.subscribe(subscriber)
    }

    pub fn on_payload<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.state.payloads.subscribe(subscriber)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.state.payloads.unsubscribe(id) || self.state.state_events.unsubscribe(id)
    }
}

impl ClientState {
    fn is_current(&self, generation: u64) -> bool {
        self.should_run.load(Ordering::SeqCst)
            && self.generation.load(Ordering::SeqCst) == generation
    }

    async fn drive(&self, generation: u64) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if !self.is_current(generation) {
                break;
            }
            if let Some(connection) = self.open(generation, &mut shutdown).await {
                self.pump(generation, connection, &mut shutdown).await;
            }
            if !self.is_current(generation) {
                break;
            }
            debug!(
                url = %self.url,
                delay_secs = self.reconnect_interval.as_secs(),
                "Scheduling reconnect"
            );
            self.timer.arm(self.reconnect_interval);
            if !self.timer.wait().await {
                break;
            }
        }
        debug!(url = %self.url, "Stream driver exited");
    }

    /// Move to `next` unless this driver has been superseded. Returns false
    /// when the transition was refused.
    fn transition(&self, generation: u64, next: StreamConnectionState) -> bool {
        let changed = {
            let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if self.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            if next == StreamConnectionState::Connecting && *current != StreamConnectionState::Disconnected {
                debug!(url = %self.url, state = %*current, "Connection attempt skipped");
                return false;
            }
            let changed = *current != next;
            *current = next;
            changed
        };
        if changed {
            self.state_events.publish(&next);
        }
        true
    }

    async fn open(
        &self,
        generation: u64,
        shutdown: &mut watch::Receiver<u64>,
    ) -> Option<Box<dyn StreamConnection>> {
        if !self.transition(generation, StreamConnectionState::Connecting) {
            return None;
        }
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let result = tokio::select! {
            result = self.transport.connect(&self.url) => result,
            _ = shutdown.changed() => return None,
        };
        match result {
            Ok(mut connection) => {
                if !self.transition(generation, StreamConnectionState::Connected) {
                    connection.close().await;
                    return None;
                }
                self.timer.disarm();
                info!(url = %self.url, "Stream connected");
                Some(connection)
            }
            Err(e) => {
                warn!(url = %self.url, error = %e, "Stream connection failed");
                self.transition(generation, StreamConnectionState::Disconnected);
                None
            }
        }
    }

    async fn pump(
        &self,
        generation: u64,
        mut connection: Box<dyn StreamConnection>,
        shutdown: &mut watch::Receiver<u64>,
    ) {
        let mut dropped = 0;
        loop {
            let next = tokio::select! {
                next = connection.next_message() => next,
                _ = shutdown.changed() => {
                    connection.close().await;
                    return;
                }
            };
            let total = connection.dropped_frames();
            if total > dropped {
                self.malformed.fetch_add(total - dropped, Ordering::SeqCst);
                debug!(url = %self.url, count = total - dropped, "Dropping oversized frame");
                dropped = total;
            }
            match next {
                Ok(Some(line)) => self.handle_line(&line),
                Ok(None) => {
                    info!(url = %self.url, "{}", StreamError::Closed);
                    break;
                }
                Err(e) => {
                    warn!(url = %self.url, error = %e, "Stream dropped");
                    break;
                }
            }
        }
        connection.close().await;
        self.transition(generation, StreamConnectionState::Disconnected);
    }

    fn handle_line(&self, line: &str) {
        match FeedFrame::parse_line(line) {
            FeedFrame::Payload(payload) => {
                self.received.fetch_add(1, Ordering::SeqCst);
                self.payloads.publish(&payload);
            }
            FeedFrame::KeepAlive => {}
            FeedFrame::Malformed(text) => {
                self.malformed.fetch_add(1, Ordering::SeqCst);
                debug!(url = %self.url, frame = %text, "Dropping malformed frame");
            }
        }
    }
}
