//! Push channel client.
//!
//! Dials the server's `/connect/push` endpoint and keeps the connection
//! alive: status reports flow out as the reconciler produces them, release
//! notifications flow in and trigger reconciles, and a heartbeat carrying
//! the last-known statuses goes out every two minutes. Any read or write
//! error tears the connection down and redials; the status channel is
//! recreated on every reconnect.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use dandelion_core::notify::{NotifyMessage, ping_frame, status_frame};

use crate::reconcile::Agent;

const PING_INTERVAL: Duration = Duration::from_secs(120);
const REDIAL_DELAY: Duration = Duration::from_secs(5);

pub async fn run_push_loop(agent: Arc<Agent>, mut shutdown: watch::Receiver<bool>) {
    let url = agent.client.push_url();

    loop {
        if *shutdown.borrow() {
            return;
        }

        let ws = match connect_async(url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                error!(url = %url, error = %e, "push channel dial failed");
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep(REDIAL_DELAY) => continue,
                }
            }
        };
        info!(url = %url, "push channel connected");

        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::channel(16);
        agent.set_status_channel(Some(tx)).await;
        let mut ping = tokio::time::interval(PING_INTERVAL);

        'conn: loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = sink.close().await;
                    agent.set_status_channel(None).await;
                    return;
                }
                status = rx.recv() => {
                    let Some(status) = status else { continue };
                    match status_frame(&status) {
                        Ok(frame) => {
                            if sink.send(Message::Text(frame.into())).await.is_err() {
                                break 'conn;
                            }
                        }
                        Err(e) => warn!(error = %e, "encode status failed"),
                    }
                }
                _ = ping.tick() => {
                    let statuses = agent.last_statuses().await;
                    match ping_frame(&statuses) {
                        Ok(frame) => {
                            if sink.send(Message::Text(frame.into())).await.is_err() {
                                break 'conn;
                            }
                        }
                        Err(e) => warn!(error = %e, "encode ping failed"),
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<NotifyMessage>(text.as_str()) {
                            Ok(msg) => {
                                let agent = Arc::clone(&agent);
                                tokio::spawn(async move {
                                    agent.handle_notify(&msg).await;
                                });
                            }
                            Err(e) => warn!(error = %e, "undecodable push message"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break 'conn,
                    Some(Ok(_)) => {}
                }
            }
        }

        agent.set_status_channel(None).await;
        warn!("push channel disconnected, redialing");
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(REDIAL_DELAY) => {}
        }
    }
}
