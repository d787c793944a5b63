use std::{collections::HashMap, sync::Arc};

use shared::domain::{ActorIdentity, ConversationId};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tracing::warn;

use crate::notifications::{
    ChannelConnection, ChannelConnector, ChannelInput, NotificationChannel, NotificationEvent,
};

struct ActiveChannel {
    channel: Arc<NotificationChannel>,
    connection: ChannelConnection,
}

/// Drives channel lifetime from actor identity transitions: opens a channel
/// when an actor appears, tears it down when the actor clears or changes,
/// and never lets two connections coexist. Reconnecting after a transport
/// failure is not its job; only identity transitions open sockets.
pub struct ChannelLifecycleManager {
    connector: Arc<dyn ChannelConnector>,
    actor_rx: watch::Receiver<Option<ActorIdentity>>,
    events: broadcast::Sender<NotificationEvent>,
    active: Mutex<Option<ActiveChannel>>,
}

impl ChannelLifecycleManager {
    pub fn new(
        connector: Arc<dyn ChannelConnector>,
        actor_rx: watch::Receiver<Option<ActorIdentity>>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            connector,
            actor_rx,
            events,
            active: Mutex::new(None),
        })
    }

    /// Events from whichever channel is currently live. The sender is shared
    /// across reconnects, so one subscription survives actor changes.
    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.events.subscribe()
    }

    pub async fn active_channel(&self) -> Option<Arc<NotificationChannel>> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| Arc::clone(&active.channel))
    }

    /// Unseen counts of the live channel, `None` while no channel is ready.
    pub async fn unseen_counts(&self) -> Option<HashMap<ConversationId, u64>> {
        match self.active_channel().await {
            Some(channel) => channel.unseen_counts().await,
            None => None,
        }
    }

    /// Follows the actor watch until its sender drops, then closes whatever
    /// is still open.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut actor_rx = manager.actor_rx.clone();
            loop {
                let desired = actor_rx.borrow_and_update().clone();
                manager.reconcile(desired).await;
                if actor_rx.changed().await.is_err() {
                    break;
                }
            }
            manager.reconcile(None).await;
        })
    }

    /// Aligns the active connection with the desired actor. The previous
    /// actor's connection is fully torn down before a new one is dialed, so
    /// no frame addressed to the old identity can land on the new channel.
    pub async fn reconcile(&self, desired: Option<ActorIdentity>) {
        let mut active = self.active.lock().await;

        match (active.as_ref(), desired.as_ref()) {
            (Some(current), Some(target)) if current.channel.identity() == target => return,
            (None, None) => return,
            _ => {}
        }

        if let Some(previous) = active.take() {
            previous.connection.abort();
            previous.channel.apply(ChannelInput::Closed).await;
        }

        let Some(identity) = desired else {
            return;
        };

        let channel = NotificationChannel::new(identity.clone(), self.events.clone());
        match self.connector.open(Arc::clone(&channel)).await {
            Ok(connection) => {
                *active = Some(ActiveChannel {
                    channel,
                    connection,
                });
            }
            Err(err) => {
                warn!(actor = %identity.actor_id, "failed to open notification channel: {err:#}");
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/lifecycle_tests.rs"]
mod tests;
