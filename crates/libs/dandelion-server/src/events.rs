//! Deployment event stream.
//!
//! Every mutating kube action spawns a watcher that polls the deployment
//! until the rollout completes or stalls. Distinct observations fan out to
//! the per-deployment subscriber set and mirror to the configured webhook;
//! duplicates are suppressed. The timeout deadline is rolling: any state
//! change resets it, so a slow but progressing rollout never times out.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures_util::SinkExt;
use futures_util::stream::SplitSink;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error};

/// Poll cadence for deployment watchers.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Rolling deadline: a watcher gives up after this long with no change.
pub const WATCH_TIMEOUT: Duration = Duration::from_secs(120);

/// Replica counters of a deployment, as the UI renders them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeploymentStatusView {
    pub replicas: i32,
    pub updated_replicas: i32,
    pub available_replicas: i32,
    pub observed_generation: i64,
    pub generation: i64,
}

impl DeploymentStatusView {
    /// A rollout is complete once every replica is updated and available
    /// and the controller has observed the current generation.
    pub fn is_complete(&self) -> bool {
        self.updated_replicas == self.replicas
            && self.available_replicas == self.replicas
            && self.observed_generation >= self.generation
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentEvent {
    pub name: String,
    pub action: String,
    pub event: String,
    pub status: DeploymentStatusView,
}

impl DeploymentEvent {
    /// Two events are equal iff name, action, event and the stringified
    /// status all match.
    pub fn equals(&self, other: &DeploymentEvent) -> bool {
        self.name == other.name
            && self.action == other.action
            && self.event == other.event
            && serde_json::to_string(&self.status).ok()
                == serde_json::to_string(&other.status).ok()
    }
}

/// Deduplicating state machine for one deployment watch.
pub struct Watcher {
    name: String,
    action: String,
    timeout: Duration,
    deadline: Instant,
    last: Option<DeploymentEvent>,
}

impl Watcher {
    pub fn new(name: &str, action: &str, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            action: action.to_string(),
            timeout,
            deadline: Instant::now() + timeout,
            last: Some(DeploymentEvent {
                name: name.to_string(),
                action: action.to_string(),
                event: String::new(),
                status: DeploymentStatusView::default(),
            }),
        }
    }

    /// Feed one observed status. Returns the event to emit (if any) and
    /// whether the watch is finished.
    pub fn observe(
        &mut self,
        status: DeploymentStatusView,
        now: Instant,
    ) -> (Option<DeploymentEvent>, bool) {
        let complete = status.is_complete();
        let candidate = DeploymentEvent {
            name: self.name.clone(),
            action: self.action.clone(),
            event: if complete { "complete" } else { "processing" }.to_string(),
            status,
        };

        let changed = match &self.last {
            Some(last) => !last.equals(&candidate),
            None => true,
        };

        if changed {
            self.deadline = now + self.timeout;
            self.last = Some(candidate.clone());
            return (Some(candidate), complete);
        }

        if now > self.deadline {
            let timeout_event = DeploymentEvent {
                event: "timeout".to_string(),
                ..candidate
            };
            return (Some(timeout_event), true);
        }

        (None, false)
    }
}

type WsSender = SplitSink<WebSocket, Message>;

struct EventConn {
    id: u64,
    sender: Mutex<WsSender>,
}

/// Subscribers per deployment name.
pub struct EventHub {
    conns: Mutex<HashMap<String, Vec<Arc<EventConn>>>>,
    next_id: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            conns: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Drive one subscriber socket until it drops.
    pub async fn serve(&self, deployment: String, socket: WebSocket) {
        use futures_util::StreamExt;

        let (sender, mut receiver) = socket.split();
        let conn = Arc::new(EventConn {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            sender: Mutex::new(sender),
        });
        {
            let mut conns = self.conns.lock().await;
            conns.entry(deployment.clone()).or_default().push(Arc::clone(&conn));
        }
        debug!(conn = conn.id, deployment = %deployment, "event subscriber connected");

        // inbound frames are opaque heartbeats; any read error unsubscribes
        while let Some(frame) = receiver.next().await {
            match frame {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }

        let mut conns = self.conns.lock().await;
        if let Some(list) = conns.get_mut(&deployment) {
            list.retain(|c| c.id != conn.id);
            if list.is_empty() {
                conns.remove(&deployment);
            }
        }
        debug!(conn = conn.id, deployment = %deployment, "event subscriber disconnected");
    }

    pub async fn broadcast(&self, event: &DeploymentEvent) {
        let conns: Vec<Arc<EventConn>> = {
            let map = self.conns.lock().await;
            match map.get(&event.name) {
                Some(list) => list.clone(),
                None => return,
            }
        };
        let text = match serde_json::to_string(event) {
            Ok(t) => t,
            Err(e) => {
                error!(error = %e, "encode deployment event failed");
                return;
            }
        };
        for conn in conns {
            let mut sender = conn.sender.lock().await;
            if let Err(e) = sender.send(Message::Text(text.clone().into())).await {
                error!(conn = conn.id, error = %e, "event write failed");
            }
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
