//! Cross-replica event bus.
//!
//! When the server runs more than one replica, a publish handled by one
//! replica must still reach agents connected to the others. Notifications
//! are therefore mirrored onto a pub/sub topic; every replica subscribes
//! and forwards inbound messages to its local push connections.
//!
//! Delivery is best-effort with no ordering guarantee; agents reconverge
//! through their periodic check. A disabled bus is a no-op.

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::Result;
use crate::notify::NotifyMessage;

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Fire-and-forget publish of a notification.
    async fn publish(&self, msg: &NotifyMessage) -> Result<()>;

    /// Subscribe to the topic. Messages arrive already decoded; undecodable
    /// payloads are dropped with a log line.
    async fn subscribe(&self) -> Result<mpsc::Receiver<NotifyMessage>>;
}

/// Bus used when the config disables cross-replica fan-out.
pub struct NoopBus;

#[async_trait]
impl EventBus for NoopBus {
    async fn publish(&self, _msg: &NotifyMessage) -> Result<()> {
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<NotifyMessage>> {
        // a channel nobody writes to: subscribers just never wake
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }
}

/// Redis pub/sub implementation.
pub struct RedisBus {
    client: redis::Client,
    manager: ConnectionManager,
    topic: String,
}

impl RedisBus {
    pub async fn connect(url: &str, topic: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        info!(topic = %topic, "event bus connected");
        Ok(Self {
            client,
            manager,
            topic: topic.to_string(),
        })
    }
}

#[async_trait]
impl EventBus for RedisBus {
    async fn publish(&self, msg: &NotifyMessage) -> Result<()> {
        let payload = serde_json::to_string(msg)?;
        let mut conn = self.manager.clone();
        let _: () = redis::AsyncCommands::publish(&mut conn, &self.topic, payload).await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<NotifyMessage>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.topic).await?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        error!(error = %e, "bus payload read failed");
                        continue;
                    }
                };
                match serde_json::from_str::<NotifyMessage>(&payload) {
                    Ok(notify) => {
                        if tx.send(notify).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => error!(error = %e, "bus message decode failed"),
                }
            }
            info!("bus subscription closed");
        });

        Ok(rx)
    }
}
