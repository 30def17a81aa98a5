//! Persistent server session
//!
//! One task owns connecting and sending: while disconnected it makes one
//! connection attempt at a time, and while connected it drains the outbound
//! queue. A second task receives and dispatches inbound messages; a third
//! enqueues keep-alive pings. A failure on either side drops the connection
//! and the send task reconnects.

use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use super::{
    Connector, DrainOutcome, Envelope, Handshake, LinkSink, LinkStream, MessageRouter,
    OutboundQueue,
};

/// Connection state of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No link; reconnecting
    Disconnected,
    /// Connection attempt in progress
    Connecting,
    /// Link up; the queue is drained
    Connected,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
        }
    }
}

/// Session timing and handshake settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Wait after a failed connection attempt
    pub reconnect_delay: Duration,
    /// Wait before reconnecting after a receive failure
    pub receive_backoff: Duration,
    /// Pause between queue drains while connected
    pub send_interval: Duration,
    /// Interval between keep-alive pings
    pub keep_alive_interval: Duration,
    /// Messages sent first on every connection
    pub handshake: Handshake,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(10),
            receive_backoff: Duration::from_secs(10),
            send_interval: Duration::from_millis(100),
            keep_alive_interval: Duration::from_secs(45),
            handshake: Handshake::default(),
        }
    }
}

/// Active connection: generation id and outbound half
type ActiveSink = Option<(u64, LinkSink)>;

/// Reconnecting message session with the server
pub struct TransportSession {
    connector: Arc<dyn Connector>,
    queue: Arc<OutboundQueue>,
    router: Arc<MessageRouter>,
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    generation: AtomicU64,
    sink: tokio::sync::Mutex<ActiveSink>,
    resume_at: Mutex<Option<Instant>>,
}

impl TransportSession {
    /// Session over links made by `connector`
    pub fn new(
        connector: Arc<dyn Connector>,
        queue: Arc<OutboundQueue>,
        router: Arc<MessageRouter>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Arc::new(Self {
            connector,
            queue,
            router,
            config,
            state,
            generation: AtomicU64::new(0),
            sink: tokio::sync::Mutex::new(None),
            resume_at: Mutex::new(None),
        })
    }

    /// Current connection state
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// True while a link is up
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Subscribe to state changes
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Wait until the session is connected
    pub async fn wait_connected(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == SessionState::Connected).await;
    }

    /// Start the send, receive and keep-alive tasks; they stop when `cancel` fires
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let (streams_tx, streams_rx) = mpsc::channel(1);
        vec![
            tokio::spawn(self.clone().send_loop(streams_tx, cancel.clone())),
            tokio::spawn(self.clone().receive_loop(streams_rx, cancel.clone())),
            tokio::spawn(self.clone().keep_alive_loop(cancel)),
        ]
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    async fn send_loop(
        self: Arc<Self>,
        streams: mpsc::Sender<(u64, LinkStream)>,
        cancel: CancellationToken,
    ) {
        while !cancel.is_cancelled() {
            let pause = match self.state() {
                SessionState::Connected => {
                    self.drain().await;
                    self.config.send_interval
                }
                _ => {
                    if let Some(wait) = self.take_backoff() {
                        tracing::debug!("waiting {:?} before reconnecting", wait);
                        if !pause_or_cancel(wait, &cancel).await {
                            break;
                        }
                    }
                    if self.connect(&streams).await {
                        self.config.send_interval
                    } else {
                        self.config.reconnect_delay
                    }
                }
            };
            if !pause_or_cancel(pause, &cancel).await {
                break;
            }
        }
        self.close().await;
    }

    /// One connection attempt; returns true once connected
    async fn connect(&self, streams: &mpsc::Sender<(u64, LinkStream)>) -> bool {
        self.set_state(SessionState::Connecting);
        tracing::debug!("connecting to {}", self.connector.describe());
        match self.connector.connect().await {
            Ok(link) => {
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                *self.sink.lock().await = Some((generation, link.sink));
                if self.connector.uses_message_handshake() {
                    for message in self.config.handshake.messages().into_iter().rev() {
                        self.queue.push_front(message);
                    }
                }
                if streams.send((generation, link.stream)).await.is_err() {
                    self.set_state(SessionState::Disconnected);
                    return false;
                }
                self.set_state(SessionState::Connected);
                tracing::info!("controller connected/re-connected");
                true
            }
            Err(e) => {
                tracing::warn!("unable to connect to {}: {}", self.connector.describe(), e);
                self.set_state(SessionState::Disconnected);
                false
            }
        }
    }

    /// Send everything queued; drop the connection on a send failure
    async fn drain(&self) {
        let mut active = self.sink.lock().await;
        let failed = match active.as_mut() {
            Some((generation, sink)) => loop {
                match self.queue.drain_one(sink, Utc::now()).await {
                    Ok(DrainOutcome::Empty) => break None,
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::debug!("send failed: {}", e);
                        break Some(*generation);
                    }
                }
            },
            None => None,
        };
        drop(active);

        if let Some(generation) = failed {
            tracing::warn!("disconnected (on send); reconnecting...");
            self.disconnect(generation, None).await;
        }
    }

    async fn receive_loop(
        self: Arc<Self>,
        mut streams: mpsc::Receiver<(u64, LinkStream)>,
        cancel: CancellationToken,
    ) {
        let mut current: Option<(u64, LinkStream)> = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = streams.recv() => match next {
                    Some(link) => current = Some(link),
                    None => break,
                },
                (generation, item) = next_message(&mut current) => match item {
                    Some(Ok(text)) if !text.trim().is_empty() => {
                        self.router.dispatch_text(&text);
                    }
                    other => {
                        if let Some(Err(e)) = other {
                            tracing::debug!("receive failed: {}", e);
                        }
                        tracing::warn!("disconnected (on receive); reconnecting...");
                        current = None;
                        self.disconnect(generation, Some(self.config.receive_backoff)).await;
                    }
                },
            }
        }
    }

    async fn keep_alive_loop(self: Arc<Self>, cancel: CancellationToken) {
        while pause_or_cancel(self.config.keep_alive_interval, &cancel).await {
            if self.is_connected() && self.connector.uses_message_handshake() {
                self.queue.push(Envelope::new("ping", json!({})));
            }
        }
    }

    /// Drop connection `generation` if it is still the active one
    async fn disconnect(&self, generation: u64, backoff: Option<Duration>) {
        let mut active = self.sink.lock().await;
        if matches!(active.as_ref(), Some((g, _)) if *g == generation) {
            *active = None;
            if let Some(backoff) = backoff {
                *self.resume_at.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(Instant::now() + backoff);
            }
            self.set_state(SessionState::Disconnected);
        }
    }

    fn take_backoff(&self) -> Option<Duration> {
        let resume_at = self.resume_at.lock().unwrap_or_else(|e| e.into_inner()).take()?;
        let now = Instant::now();
        (resume_at > now).then(|| resume_at - now)
    }

    async fn close(&self) {
        if let Some((_, mut sink)) = self.sink.lock().await.take() {
            let _ = futures::SinkExt::close(&mut sink).await;
        }
        self.set_state(SessionState::Disconnected);
    }
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession")
            .field("target", &self.connector.describe())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Next item of the current stream; pending forever when there is none
async fn next_message(
    current: &mut Option<(u64, LinkStream)>,
) -> (u64, Option<Result<String, super::TransportError>>) {
    match current {
        Some((generation, stream)) => (*generation, stream.next().await),
        None => futures::future::pending().await,
    }
}

/// Sleep unless cancelled first; returns false on cancellation
async fn pause_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = sleep(duration) => true,
    }
}
