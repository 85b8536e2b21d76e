use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use shared::{
    domain::LobbyId,
    protocol::{LobbyEventKind, ServerEvent},
};
use tokio::sync::broadcast;
use tracing::debug;

/// Told about every committed lobby mutation, after it is durable.
///
/// `notify` is fire-and-forget: it must return promptly and never fails the
/// mutation that triggered it.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, lobby_id: &LobbyId);
}

/// Discards every notification.
pub struct NoopSink;

impl NotificationSink for NoopSink {
    fn notify(&self, _lobby_id: &LobbyId) {}
}

/// A viewer's handle on one lobby's event stream. Hand it back to
/// [`LobbyBroadcaster::unregister`] when the viewer goes away.
pub struct Subscription {
    lobby_id: LobbyId,
    receiver: broadcast::Receiver<ServerEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Result<ServerEvent, broadcast::error::RecvError> {
        self.receiver.recv().await
    }
}

/// Registry of live viewers, one broadcast channel per lobby.
///
/// Channels are created on first registration and dropped with their last
/// subscriber. A slow viewer lags and loses events instead of holding up publishers.
#[derive(Clone)]
pub struct LobbyBroadcaster {
    channels: Arc<Mutex<HashMap<LobbyId, broadcast::Sender<ServerEvent>>>>,
    capacity: usize,
}

impl LobbyBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn register(&self, lobby_id: &LobbyId) -> Subscription {
        let mut channels = self.channels();
        let sender = channels
            .entry(lobby_id.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Subscription {
            lobby_id: lobby_id.clone(),
            receiver: sender.subscribe(),
        }
    }

    pub fn unregister(&self, subscription: Subscription) {
        let lobby_id = subscription.lobby_id.clone();
        drop(subscription);

        let mut channels = self.channels();
        if channels
            .get(&lobby_id)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            channels.remove(&lobby_id);
        }
    }

    /// Sends `kind` to every current subscriber of the lobby and returns how many
    /// received it.
    pub fn publish(&self, lobby_id: &LobbyId, kind: LobbyEventKind) -> usize {
        let mut channels = self.channels();
        let Some(sender) = channels.get(lobby_id) else {
            return 0;
        };
        match sender.send(ServerEvent::of_kind(kind, lobby_id)) {
            Ok(reached) => reached,
            Err(_) => {
                // Every receiver was dropped without unregistering.
                channels.remove(lobby_id);
                0
            }
        }
    }

    pub fn subscriber_count(&self, lobby_id: &LobbyId) -> usize {
        self.channels()
            .get(lobby_id)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<LobbyId, broadcast::Sender<ServerEvent>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for LobbyBroadcaster {
    fn default() -> Self {
        Self::new(64)
    }
}

impl NotificationSink for LobbyBroadcaster {
    fn notify(&self, lobby_id: &LobbyId) {
        let reached = self.publish(lobby_id, LobbyEventKind::LobbyUpdated);
        debug!(%lobby_id, reached, "lobby update published");
    }
}
