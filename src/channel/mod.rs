//! One WebSocket connection per topic with an explicit lifecycle.
//!
//! `open` never fails synchronously: connection problems surface through the
//! state callback. Frames are decoded by the topic's [`Frame`] type and handed
//! to the consumer in arrival order; undecodable frames are logged and dropped
//! without touching the connection.

pub mod frame;
pub mod retry;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::TransportError;
use crate::lock;
use crate::logging::{log, log_channel_transition, log_frame_dropped, obj, v_str, Domain, Level};
use frame::{classify, Frame, Inbound};
use retry::{NeverReconnect, ReconnectPolicy};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Disconnected => "disconnected",
            ChannelState::Connecting => "connecting",
            ChannelState::Connected => "connected",
        }
    }

    pub fn can_transition_to(self, next: ChannelState) -> bool {
        use ChannelState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Connected, Connecting)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStatus {
    pub topic: String,
    pub endpoint: Url,
    pub state: ChannelState,
    pub last_error: Option<String>,
    /// Set once `close` ran; no further transitions happen.
    pub closed: bool,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
}

impl ChannelStatus {
    fn new(topic: &str, endpoint: Url) -> Self {
        Self {
            topic: topic.to_string(),
            endpoint,
            state: ChannelState::Disconnected,
            last_error: None,
            closed: false,
            frames_delivered: 0,
            frames_dropped: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub topic: String,
    pub from: ChannelState,
    pub to: ChannelState,
    pub error: Option<String>,
}

/// Read-only view of a channel owned by the manager.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    status: Arc<Mutex<ChannelStatus>>,
}

impl ChannelHandle {
    pub fn status(&self) -> ChannelStatus {
        lock(&self.status).clone()
    }

    pub fn state(&self) -> ChannelState {
        lock(&self.status).state
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.status).last_error.clone()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.status).closed
    }
}

struct ChannelSlot {
    status: Arc<Mutex<ChannelStatus>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ChannelSlot {
    fn signal(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            // The task may already have exited on its own.
            let _ = tx.send(());
        }
    }
}

pub struct ChannelManager {
    policy: Arc<dyn ReconnectPolicy>,
    channels: HashMap<String, ChannelSlot>,
}

impl Default for ChannelManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelManager {
    /// Manager that never reconnects on its own.
    pub fn new() -> Self {
        Self::with_policy(Arc::new(NeverReconnect))
    }

    pub fn with_policy(policy: Arc<dyn ReconnectPolicy>) -> Self {
        Self {
            policy,
            channels: HashMap::new(),
        }
    }

    /// Start a connection for `topic`. Must be called inside a tokio runtime.
    ///
    /// An already-open topic is replaced: its connection is told to stop and
    /// reports its own final transition to its old callback.
    pub fn open<F, M, S>(&mut self, topic: &str, endpoint: Url, on_message: M, on_state: S) -> ChannelHandle
    where
        F: Frame,
        M: FnMut(F) + Send + 'static,
        S: FnMut(StateChange) + Send + 'static,
    {
        if let Some(mut previous) = self.channels.remove(topic) {
            log(
                Level::Info,
                Domain::Channel,
                "replaced",
                obj(&[("topic", v_str(topic))]),
            );
            previous.signal();
        }

        let status = Arc::new(Mutex::new(ChannelStatus::new(topic, endpoint.clone())));
        let (tx, rx) = oneshot::channel();
        let link = Link {
            topic: topic.to_string(),
            status: status.clone(),
            on_state,
        };
        let task = tokio::spawn(run_channel::<F, M, S>(
            endpoint,
            self.policy.clone(),
            on_message,
            link,
            rx,
        ));
        self.channels.insert(
            topic.to_string(),
            ChannelSlot {
                status: status.clone(),
                shutdown: Some(tx),
                task,
            },
        );
        ChannelHandle { status }
    }

    /// Release the connection for `topic` and wait for its task to finish.
    /// Returns `false` (and does nothing) if the topic is not open.
    pub async fn close(&mut self, topic: &str) -> bool {
        let Some(mut slot) = self.channels.remove(topic) else {
            return false;
        };
        slot.signal();
        if let Err(err) = (&mut slot.task).await {
            log(
                Level::Error,
                Domain::Channel,
                "task_failed",
                obj(&[("topic", v_str(topic)), ("msg", v_str(&err.to_string()))]),
            );
        }
        lock(&slot.status).closed = true;
        true
    }

    pub async fn close_all(&mut self) {
        let topics: Vec<String> = self.channels.keys().cloned().collect();
        for topic in topics {
            self.close(&topic).await;
        }
    }

    pub fn status(&self, topic: &str) -> Option<ChannelStatus> {
        self.channels.get(topic).map(|slot| lock(&slot.status).clone())
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.channels.keys().cloned().collect();
        topics.sort();
        topics
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        for slot in self.channels.values_mut() {
            slot.signal();
        }
    }
}

// =============================================================================
// Connection task
// =============================================================================

struct Link<S> {
    topic: String,
    status: Arc<Mutex<ChannelStatus>>,
    on_state: S,
}

impl<S: FnMut(StateChange)> Link<S> {
    fn transition(&mut self, to: ChannelState, error: Option<String>) {
        let from = {
            let mut status = lock(&self.status);
            let from = status.state;
            if from == to {
                return;
            }
            status.state = to;
            match (&error, to) {
                (Some(e), _) => status.last_error = Some(e.clone()),
                (None, ChannelState::Connected) => status.last_error = None,
                _ => {}
            }
            from
        };
        if !from.can_transition_to(to) {
            log(
                Level::Warn,
                Domain::Channel,
                "unexpected_transition",
                obj(&[
                    ("topic", v_str(&self.topic)),
                    ("from", v_str(from.as_str())),
                    ("to", v_str(to.as_str())),
                ]),
            );
        }
        log_channel_transition(&self.topic, from.as_str(), to.as_str(), error.as_deref());
        (self.on_state)(StateChange {
            topic: self.topic.clone(),
            from,
            to,
            error,
        });
    }

    fn mark_closed(&self) {
        lock(&self.status).closed = true;
    }

    fn record_delivered(&self) {
        lock(&self.status).frames_delivered += 1;
    }

    fn record_dropped(&self) {
        lock(&self.status).frames_dropped += 1;
    }
}

enum PumpExit {
    Shutdown,
    Lost(TransportError),
}

async fn run_channel<F, M, S>(
    endpoint: Url,
    policy: Arc<dyn ReconnectPolicy>,
    mut on_message: M,
    mut link: Link<S>,
    mut shutdown: oneshot::Receiver<()>,
) where
    F: Frame,
    M: FnMut(F) + Send + 'static,
    S: FnMut(StateChange) + Send + 'static,
{
    let mut attempt: u32 = 0;
    loop {
        link.transition(ChannelState::Connecting, None);
        let connected = tokio::select! {
            _ = &mut shutdown => {
                link.transition(ChannelState::Disconnected, None);
                link.mark_closed();
                return;
            }
            res = tokio_tungstenite::connect_async(endpoint.as_str()) => res,
        };

        let failure = match connected {
            Ok((stream, _response)) => {
                attempt = 0;
                link.transition(ChannelState::Connected, None);
                match pump::<F, M, S>(stream, &mut on_message, &mut link, &mut shutdown).await {
                    PumpExit::Shutdown => {
                        link.transition(ChannelState::Disconnected, None);
                        link.mark_closed();
                        return;
                    }
                    PumpExit::Lost(err) => err,
                }
            }
            Err(err) => TransportError::Connect(err),
        };
        link.transition(ChannelState::Disconnected, Some(failure.to_string()));

        let Some(delay) = policy.next_delay(attempt) else {
            return;
        };
        attempt = attempt.saturating_add(1);
        log(
            Level::Info,
            Domain::Channel,
            "reconnect_scheduled",
            obj(&[
                ("topic", v_str(&link.topic)),
                ("attempt", json!(attempt)),
                ("delay_ms", json!(delay.as_millis() as u64)),
            ]),
        );
        tokio::select! {
            _ = &mut shutdown => {
                link.mark_closed();
                return;
            }
            _ = sleep(delay) => {}
        }
    }
}

async fn pump<F, M, S>(
    stream: WsStream,
    on_message: &mut M,
    link: &mut Link<S>,
    shutdown: &mut oneshot::Receiver<()>,
) -> PumpExit
where
    F: Frame,
    M: FnMut(F),
    S: FnMut(StateChange),
{
    let (mut write, mut read) = stream.split();
    loop {
        tokio::select! {
            _ = &mut *shutdown => {
                let _ = write.send(Message::Close(None)).await;
                return PumpExit::Shutdown;
            }
            next = read.next() => match next {
                Some(Ok(msg)) => match classify::<F>(msg, Utc::now()) {
                    Inbound::Frame(frame) => {
                        link.record_delivered();
                        on_message(frame);
                    }
                    Inbound::Invalid { error, preview } => {
                        link.record_dropped();
                        log_frame_dropped(&link.topic, &error.to_string(), &preview);
                    }
                    Inbound::Closed => return PumpExit::Lost(TransportError::RemoteClosed),
                    Inbound::Control => {}
                },
                Some(Err(err)) => return PumpExit::Lost(TransportError::Dropped(err)),
                None => return PumpExit::Lost(TransportError::StreamEnded),
            }
        }
    }
}
