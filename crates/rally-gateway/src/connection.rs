use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

use rally_db::Database;
use rally_types::api::Claims;
use rally_types::events::{GatewayCommand, GatewayEvent};

use crate::dispatcher::Dispatcher;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle a single WebSocket connection: Identify handshake, then the event
/// loop relaying broadcasts and targeted events to the client.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    jwt_secret: String,
) {
    let (mut sender, mut receiver) = socket.split();

    // Step 1: Wait for Identify command with JWT
    let user_id = match wait_for_identify(&mut receiver, &jwt_secret).await {
        Some(id) => id,
        None => {
            warn!("WebSocket client failed to identify, closing");
            return;
        }
    };

    info!("{} connected to gateway", user_id);

    // Step 2: Send Ready event
    let ready = GatewayEvent::Ready { user_id };
    if sender
        .send(Message::Text(serde_json::to_string(&ready).unwrap().into()))
        .await
        .is_err()
    {
        return;
    }

    // Register per-user channel for targeted events
    let (conn_id, mut user_rx) = dispatcher.register_user_channel(user_id).await;

    // Subscribe to broadcasts and relay to this client
    let mut broadcast_rx = dispatcher.subscribe();

    // Per-connection conversation subscriptions (shared between send and
    // recv tasks). Conversation-scoped events are only forwarded for
    // subscribed conversations.
    let subscriptions: Arc<std::sync::RwLock<HashSet<Uuid>>> =
        Arc::new(std::sync::RwLock::new(HashSet::new()));
    let send_subscriptions = subscriptions.clone();

    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Spawn task to forward broadcasts + targeted events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Broadcast receiver lagged by {} events", n);
                            continue;
                        }
                        Err(_) => break,
                    };

                    if let Some(conversation_id) = event.conversation_id() {
                        let subs = send_subscriptions.read()
                            .expect("subscription lock poisoned");
                        if !subs.contains(&conversation_id) {
                            continue;
                        }
                    }

                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                result = user_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };

                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let recv_subscriptions = subscriptions.clone();
    let recv_db = db.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    match serde_json::from_str::<GatewayCommand>(&text) {
                        Ok(cmd) => {
                            handle_command(&recv_db, user_id, cmd, &recv_subscriptions).await;
                        }
                        Err(e) => {
                            warn!(
                                "{} bad command: {} -- raw: {}",
                                user_id,
                                e,
                                &text[..text.len().min(200)]
                            );
                        }
                    }
                }
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    dispatcher.unregister_user_channel(user_id, conn_id).await;
    info!("{} disconnected from gateway", user_id);
}

async fn wait_for_identify(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<Uuid> {
    use jsonwebtoken::{DecodingKey, Validation, decode};

    // Only the first text frame is considered; anything else fails the handshake
    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Ping(_) | Message::Pong(_) => continue,
            _ => return None,
        };

        return match serde_json::from_str::<GatewayCommand>(&text) {
            Ok(GatewayCommand::Identify { token }) => decode::<Claims>(
                &token,
                &DecodingKey::from_secret(jwt_secret.as_bytes()),
                &Validation::default(),
            )
            .ok()
            .map(|data| data.claims.sub),
            _ => None,
        };
    }

    None
}

async fn handle_command(
    db: &Arc<Database>,
    user_id: Uuid,
    cmd: GatewayCommand,
    subscriptions: &Arc<std::sync::RwLock<HashSet<Uuid>>>,
) {
    match cmd {
        GatewayCommand::Identify { .. } => {
            // Already identified; ignore
        }
        GatewayCommand::Subscribe { conversation_ids } => {
            // Only participants may subscribe: a non-participant must not
            // receive another pair's events, same rule as the REST surface.
            let db = db.clone();
            let allowed = tokio::task::spawn_blocking(move || {
                conversation_ids
                    .into_iter()
                    .filter(|cid| {
                        db.is_participant(&cid.to_string(), &user_id.to_string())
                            .unwrap_or(false)
                    })
                    .collect::<Vec<_>>()
            })
            .await
            .unwrap_or_default();

            let mut subs = subscriptions.write().expect("subscription lock poisoned");
            subs.extend(allowed);
        }
        GatewayCommand::Unsubscribe { conversation_ids } => {
            let mut subs = subscriptions.write().expect("subscription lock poisoned");
            for cid in conversation_ids {
                subs.remove(&cid);
            }
        }
    }
}
