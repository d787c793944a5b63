use std::{collections::HashMap, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::{ActorIdentity, ConversationId},
    protocol::NotificationFrame,
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    Connecting,
    Open,
    Closed,
}

/// Inputs driving the channel state machine. The socket driver feeds these
/// from a live connection; tests feed them directly.
#[derive(Debug)]
pub enum ChannelInput {
    Opened,
    Frame(String),
    Closed,
}

#[derive(Debug, Clone)]
pub enum NotificationEvent {
    ChannelReady,
    UnseenCountChanged {
        conversation_id: ConversationId,
        count: u64,
    },
    ChannelClosed,
}

struct ChannelInner {
    phase: ChannelPhase,
    unseen_counts: HashMap<ConversationId, u64>,
}

/// One notification channel per connected actor. Owns the per-conversation
/// unseen-count view; the map is only ever mutated by inbound frames and is
/// emptied when the channel closes.
pub struct NotificationChannel {
    identity: ActorIdentity,
    inner: Mutex<ChannelInner>,
    events: broadcast::Sender<NotificationEvent>,
}

impl NotificationChannel {
    pub fn new(identity: ActorIdentity, events: broadcast::Sender<NotificationEvent>) -> Arc<Self> {
        Arc::new(Self {
            identity,
            inner: Mutex::new(ChannelInner {
                phase: ChannelPhase::Connecting,
                unseen_counts: HashMap::new(),
            }),
            events,
        })
    }

    pub fn identity(&self) -> &ActorIdentity {
        &self.identity
    }

    /// Plaintext identity announcement sent as the first frame after the
    /// socket opens, e.g. `seller_s42`.
    pub fn identity_frame(&self) -> String {
        format!("{}_{}", self.identity.role, self.identity.actor_id)
    }

    pub async fn phase(&self) -> ChannelPhase {
        self.inner.lock().await.phase
    }

    pub async fn is_ready(&self) -> bool {
        self.inner.lock().await.phase == ChannelPhase::Open
    }

    /// Snapshot of the unseen-count map, or `None` until the identity
    /// handshake has completed. Consumers treat `None` as "not yet
    /// available"; a closed channel and a connecting one look the same.
    pub async fn unseen_counts(&self) -> Option<HashMap<ConversationId, u64>> {
        let inner = self.inner.lock().await;
        match inner.phase {
            ChannelPhase::Open => Some(inner.unseen_counts.clone()),
            _ => None,
        }
    }

    /// Count for one conversation; missing keys read as zero on a ready
    /// channel, `None` on a channel that is not ready.
    pub async fn count_for(&self, conversation_id: &ConversationId) -> Option<u64> {
        let inner = self.inner.lock().await;
        match inner.phase {
            ChannelPhase::Open => Some(inner.unseen_counts.get(conversation_id).copied().unwrap_or(0)),
            _ => None,
        }
    }

    /// Applies one input as a single run-to-completion transition.
    pub async fn apply(&self, input: ChannelInput) {
        let mut inner = self.inner.lock().await;
        match input {
            ChannelInput::Opened => {
                if inner.phase != ChannelPhase::Connecting {
                    warn!(
                        actor = %self.identity.actor_id,
                        "ignoring open on a channel that is not connecting"
                    );
                    return;
                }
                inner.phase = ChannelPhase::Open;
                info!(actor = %self.identity.actor_id, role = %self.identity.role, "notification channel ready");
                let _ = self.events.send(NotificationEvent::ChannelReady);
            }
            ChannelInput::Frame(text) => {
                if inner.phase != ChannelPhase::Open {
                    debug!("dropping frame received outside the open phase");
                    return;
                }
                match NotificationFrame::parse(&text) {
                    Ok(NotificationFrame::UnseenCountUpdate(update)) => {
                        // Replacement, not increment: the backend owns the tally
                        // and the last received value per conversation wins.
                        inner
                            .unseen_counts
                            .insert(update.conversation_id.clone(), update.count);
                        let _ = self.events.send(NotificationEvent::UnseenCountChanged {
                            conversation_id: update.conversation_id,
                            count: update.count,
                        });
                    }
                    Ok(NotificationFrame::Unknown { tag }) => {
                        debug!(tag, "ignoring unrecognized notification frame");
                    }
                    Err(err) => {
                        debug!("ignoring malformed notification frame: {err}");
                    }
                }
            }
            ChannelInput::Closed => {
                if inner.phase == ChannelPhase::Closed {
                    return;
                }
                inner.phase = ChannelPhase::Closed;
                inner.unseen_counts.clear();
                info!(actor = %self.identity.actor_id, "notification channel closed");
                let _ = self.events.send(NotificationEvent::ChannelClosed);
            }
        }
    }
}

/// Handle on an open connection's reader task. Aborting detaches future
/// frame delivery; it does not interrupt a transition already running.
pub struct ChannelConnection {
    reader_task: JoinHandle<()>,
}

impl ChannelConnection {
    pub fn new(reader_task: JoinHandle<()>) -> Self {
        Self { reader_task }
    }

    pub fn abort(&self) {
        self.reader_task.abort();
    }
}

/// Seam between the lifecycle manager and the transport, so lifecycle
/// behavior is testable without a real socket.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    /// Dial, announce the channel's identity, and start delivering inbound
    /// frames to it. The channel must be ready by the time this returns Ok.
    async fn open(&self, channel: Arc<NotificationChannel>) -> Result<ChannelConnection>;
}

pub struct WebSocketConnector {
    socket_url: Url,
}

impl WebSocketConnector {
    pub fn new(socket_url: Url) -> Self {
        Self { socket_url }
    }
}

#[async_trait]
impl ChannelConnector for WebSocketConnector {
    async fn open(&self, channel: Arc<NotificationChannel>) -> Result<ChannelConnection> {
        let (mut socket, _) = connect_async(self.socket_url.as_str())
            .await
            .with_context(|| format!("failed to connect notification socket: {}", self.socket_url))?;

        socket
            .send(Message::Text(channel.identity_frame()))
            .await
            .context("failed to announce identity on notification socket")?;
        channel.apply(ChannelInput::Opened).await;

        let reader = Arc::clone(&channel);
        let reader_task = tokio::spawn(async move {
            while let Some(message) = socket.next().await {
                match message {
                    Ok(Message::Text(text)) => reader.apply(ChannelInput::Frame(text)).await,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("notification socket receive failed: {err}");
                        break;
                    }
                }
            }
            reader.apply(ChannelInput::Closed).await;
        });

        Ok(ChannelConnection::new(reader_task))
    }
}

#[cfg(test)]
#[path = "tests/notifications_tests.rs"]
mod tests;
