use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast, mpsc};
use uuid::Uuid;

use rally_types::events::GatewayEvent;

/// Manages all connected clients and fans out events.
///
/// Delivery is at-least-once over a lossy channel: a lagged broadcast
/// receiver drops events, and clients are expected to poll presence, unread
/// counts and typing state as the correctness backstop.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Broadcast channel for gateway events. Every connection receives every
    /// event and filters conversation-scoped ones by its own subscriptions.
    broadcast_tx: broadcast::Sender<GatewayEvent>,

    /// Per-user targeted send channels: user_id -> (conn_id, sender).
    /// A reconnect replaces the entry; the conn_id guard keeps the old
    /// connection's teardown from tearing down the new one.
    user_channels: RwLock<HashMap<Uuid, (Uuid, mpsc::UnboundedSender<GatewayEvent>)>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                user_channels: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to gateway events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Broadcast an event to all connected clients.
    pub fn broadcast(&self, event: GatewayEvent) {
        let _ = self.inner.broadcast_tx.send(event);
    }

    /// Register a per-user targeted channel. Returns (conn_id, receiver).
    pub async fn register_user_channel(
        &self,
        user_id: Uuid,
    ) -> (Uuid, mpsc::UnboundedReceiver<GatewayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .user_channels
            .write()
            .await
            .insert(user_id, (conn_id, tx));
        (conn_id, rx)
    }

    /// Unregister a per-user targeted channel, but only if conn_id matches.
    pub async fn unregister_user_channel(&self, user_id: Uuid, conn_id: Uuid) {
        let mut channels = self.inner.user_channels.write().await;
        if let Some((stored_conn_id, _)) = channels.get(&user_id) {
            if *stored_conn_id == conn_id {
                channels.remove(&user_id);
            }
        }
    }

    /// Send a targeted event to a specific user's open session, if any.
    pub async fn send_to_user(&self, user_id: Uuid, event: GatewayEvent) {
        let channels = self.inner.user_channels.read().await;
        if let Some((_, tx)) = channels.get(&user_id) {
            let _ = tx.send(event);
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rally_types::models::PresenceStatus;

    fn presence_event(user_id: Uuid) -> GatewayEvent {
        GatewayEvent::PresenceUpdate {
            user_id,
            status: PresenceStatus::Online,
            last_seen: None,
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_all_subscribers() {
        let dispatcher = Dispatcher::new();
        let mut rx_a = dispatcher.subscribe();
        let mut rx_b = dispatcher.subscribe();

        let uid = Uuid::new_v4();
        dispatcher.broadcast(presence_event(uid));

        for rx in [&mut rx_a, &mut rx_b] {
            match rx.recv().await.unwrap() {
                GatewayEvent::PresenceUpdate { user_id, .. } => assert_eq!(user_id, uid),
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn targeted_send_reaches_only_the_target() {
        let dispatcher = Dispatcher::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let (_, mut alice_rx) = dispatcher.register_user_channel(alice).await;
        let (_, mut bob_rx) = dispatcher.register_user_channel(bob).await;

        dispatcher.send_to_user(alice, presence_event(alice)).await;

        assert!(alice_rx.try_recv().is_ok());
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_conn_id_cannot_unregister_a_newer_connection() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();

        let (old_conn, _old_rx) = dispatcher.register_user_channel(user).await;
        let (_new_conn, mut new_rx) = dispatcher.register_user_channel(user).await;

        // The old connection's teardown must not remove the new channel
        dispatcher.unregister_user_channel(user, old_conn).await;
        dispatcher.send_to_user(user, presence_event(user)).await;
        assert!(new_rx.try_recv().is_ok());
    }
}
