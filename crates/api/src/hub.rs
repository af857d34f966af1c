//! In-process fan-out of published notifications to WebSocket connections.
//!
//! One Redis `PSUBSCRIBE notifications:user:*` per API process feeds a
//! broadcast channel per connected user. Channels are created on first
//! subscription and dropped when their last receiver goes away.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

use planner_engine::notifications::{CHANNEL_PATTERN, user_from_channel};

/// Messages buffered per user before slow sockets start lagging.
const CHANNEL_CAPACITY: usize = 64;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Default)]
pub struct NotificationHub {
    channels: RwLock<HashMap<Uuid, broadcast::Sender<String>>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the user's group.
    pub async fn subscribe(&self, user_id: Uuid) -> broadcast::Receiver<String> {
        let mut channels = self.channels.write().await;
        channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Forward a payload to the user's live connections. Returns how many received it.
    pub async fn dispatch(&self, user_id: Uuid, payload: String) -> usize {
        let channels = self.channels.read().await;
        match channels.get(&user_id) {
            Some(sender) => sender.send(payload).unwrap_or(0),
            None => 0,
        }
    }

    /// Forget the user's channel once nobody listens to it.
    pub async fn release(&self, user_id: Uuid) {
        let mut channels = self.channels.write().await;
        if channels
            .get(&user_id)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            channels.remove(&user_id);
        }
    }

    pub async fn connected_users(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Relay Redis pub/sub messages into the hub until the task is aborted.
    /// Lost connections are re-established after a short delay.
    pub async fn run(self: Arc<Self>, client: redis::Client) {
        loop {
            if let Err(e) = self.relay(&client).await {
                tracing::warn!(error = %e, "Notification subscription lost, reconnecting");
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn relay(&self, client: &redis::Client) -> Result<(), redis::RedisError> {
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.psubscribe(CHANNEL_PATTERN).await?;
        tracing::info!(pattern = CHANNEL_PATTERN, "Subscribed to notification channels");

        let mut messages = pubsub.on_message();
        while let Some(msg) = messages.next().await {
            let Some(user_id) = user_from_channel(msg.get_channel_name()) else {
                continue;
            };
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping undecodable notification payload");
                    continue;
                }
            };
            let delivered = self.dispatch(user_id, payload).await;
            tracing::trace!(user_id = %user_id, delivered, "Notification relayed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dispatch_reaches_subscribers() {
        let hub = NotificationHub::new();
        let user = Uuid::new_v4();
        let mut rx = hub.subscribe(user).await;

        assert_eq!(hub.dispatch(user, "hello".into()).await, 1);
        assert_eq!(rx.recv().await.unwrap(), "hello");
        assert_eq!(hub.dispatch(Uuid::new_v4(), "nobody".into()).await, 0);
    }

    #[tokio::test]
    async fn test_release_drops_idle_channels() {
        let hub = NotificationHub::new();
        let user = Uuid::new_v4();
        let rx = hub.subscribe(user).await;

        hub.release(user).await;
        assert_eq!(hub.connected_users().await, 1);

        drop(rx);
        hub.release(user).await;
        assert_eq!(hub.connected_users().await, 0);
    }
}
