//! Push hub: long-lived bidirectional connections to fleet agents.
//!
//! The pool maps `app_id -> connections`. One physical socket may appear
//! under several app ids, one per distinct app it has reported status for,
//! because a single agent can service multiple apps. Writes to a connection
//! serialize on that connection's mutex; a failed write only logs — removal
//! happens on the read path when the read loop observes an error or EOF.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::SinkExt;
use futures_util::StreamExt;
use futures_util::stream::SplitSink;
use tokio::sync::Mutex;
use tracing::{debug, error};

use dandelion_core::model::instance::{InstanceStatus, InstanceStatusBmc};
use dandelion_core::notify::{NotifyMessage, WsMessage, parse_ws_message};

use crate::AppState;

const PONG_DEADLINE: Duration = Duration::from_secs(5);

type WsSender = SplitSink<WebSocket, Message>;

/// Server-side view of one push connection.
pub struct PushConn {
    id: u64,
    /// Absent in tests, where no socket backs the connection.
    sender: Option<Mutex<WsSender>>,
    /// Last status seen per app over this socket.
    last_status: Mutex<HashMap<String, InstanceStatus>>,
}

impl PushConn {
    fn new(id: u64, sender: WsSender) -> Self {
        Self {
            id,
            sender: Some(Mutex::new(sender)),
            last_status: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn dangling(id: u64) -> Self {
        Self {
            id,
            sender: None,
            last_status: Mutex::new(HashMap::new()),
        }
    }

    async fn write(&self, text: String) -> anyhow::Result<()> {
        if let Some(sender) = &self.sender {
            let mut sender = sender.lock().await;
            sender.send(Message::Text(text.into())).await?;
        }
        Ok(())
    }

    async fn pong(&self) -> anyhow::Result<()> {
        if let Some(sender) = &self.sender {
            let mut sender = sender.lock().await;
            tokio::time::timeout(PONG_DEADLINE, sender.send(Message::Pong(Vec::new().into())))
                .await??;
        }
        Ok(())
    }
}

/// Connection pool keyed by app id.
pub struct PushHub {
    pool: Mutex<HashMap<String, Vec<Arc<PushConn>>>>,
    next_id: AtomicU64,
}

impl PushHub {
    pub fn new() -> Self {
        Self {
            pool: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `conn` under the app id of `status` and remember the status
    /// as the connection's last-seen record for that app.
    async fn update_pool_info(&self, conn: &Arc<PushConn>, status: &InstanceStatus) {
        {
            let mut pool = self.pool.lock().await;
            let conns = pool.entry(status.app_id.clone()).or_default();
            if !conns.iter().any(|c| c.id == conn.id) {
                conns.push(Arc::clone(conn));
            }
        }
        conn.last_status
            .lock()
            .await
            .insert(status.app_id.clone(), status.clone());
    }

    /// Drop `conn` from every app entry; entries left empty disappear.
    async fn remove_pool_info(&self, conn: &Arc<PushConn>) {
        let mut pool = self.pool.lock().await;
        pool.retain(|_, conns| {
            conns.retain(|c| c.id != conn.id);
            !conns.is_empty()
        });
    }

    /// Write the notification to every connection registered under its app
    /// id. Failed writes log and move on.
    pub async fn broadcast(&self, msg: &NotifyMessage) {
        let conns: Vec<Arc<PushConn>> = {
            let pool = self.pool.lock().await;
            match pool.get(&msg.app_id) {
                Some(conns) => conns.clone(),
                None => return,
            }
        };

        let text = match serde_json::to_string(msg) {
            Ok(t) => t,
            Err(e) => {
                error!(error = %e, "encode notification failed");
                return;
            }
        };

        for conn in conns {
            if let Err(e) = conn.write(text.clone()).await {
                error!(conn = conn.id, error = %e, "push write failed");
            }
        }
    }

    /// Number of app entries currently in the pool.
    pub async fn app_count(&self) -> usize {
        self.pool.lock().await.len()
    }
}

impl Default for PushHub {
    fn default() -> Self {
        Self::new()
    }
}

/// `GET /connect/push` upgrade endpoint.
pub async fn ws_push_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_push_socket(state, socket))
}

async fn handle_push_socket(state: AppState, socket: WebSocket) {
    let (sender, mut receiver) = socket.split();
    let id = state.hub.next_id.fetch_add(1, Ordering::Relaxed);
    let conn = Arc::new(PushConn::new(id, sender));
    metrics::gauge!("dandelion_push_connections").increment(1);
    debug!(conn = id, "push connection opened");

    while let Some(frame) = receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Binary(data)) => String::from_utf8_lossy(&data).into_owned(),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) | Err(_) => break,
        };
        debug!(conn = id, message = %text, "push message received");
        if let Err(e) = handle_push_message(&state, &conn, &text).await {
            error!(conn = id, error = %e, "push message handling failed");
        }
    }

    state.hub.remove_pool_info(&conn).await;
    metrics::gauge!("dandelion_push_connections").decrement(1);
    debug!(conn = id, "push connection closed");
}

async fn handle_push_message(
    state: &AppState,
    conn: &Arc<PushConn>,
    raw: &str,
) -> anyhow::Result<()> {
    match parse_ws_message(raw)? {
        WsMessage::Status(status) => {
            state.hub.update_pool_info(conn, &status).await;
            InstanceStatusBmc::upsert_status(&state.mm, &status).await?;
        }
        WsMessage::Ping(statuses) => {
            if let Some(statuses) = statuses {
                InstanceStatusBmc::refresh_ping(&state.mm, &statuses).await?;
            }
            conn.pong().await?;
        }
    }
    Ok(())
}
