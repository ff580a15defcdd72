use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use rally_types::api::Claims;
use rally_types::events::GatewayEvent;
use rally_types::models::{Presence, PresenceStatus};

use crate::AppState;

/// Refresh the caller's presence. Presence is best-effort: a storage
/// failure is logged and swallowed rather than surfaced, and the client
/// simply re-attempts on its 30s schedule.
pub async fn heartbeat(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> StatusCode {
    let now = Utc::now();
    let db = state.db.clone();
    let uid = claims.sub.to_string();

    let transitioned = tokio::task::spawn_blocking(move || db.heartbeat(&uid, now)).await;

    match transitioned {
        Ok(Ok(true)) => {
            state.dispatcher.broadcast(GatewayEvent::PresenceUpdate {
                user_id: claims.sub,
                status: PresenceStatus::Online,
                last_seen: Some(now),
            });
        }
        Ok(Ok(false)) => {}
        Ok(Err(e)) => warn!("heartbeat for {} failed: {:#}", claims.sub, e),
        Err(e) => warn!("spawn_blocking join error: {}", e),
    }

    StatusCode::OK
}

/// Explicit offline on client teardown (page unload), best-effort.
pub async fn offline(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> StatusCode {
    let now = Utc::now();
    let db = state.db.clone();
    let uid = claims.sub.to_string();

    let result = tokio::task::spawn_blocking(move || db.mark_offline(&uid, now)).await;

    match result {
        Ok(Ok(())) => {
            state.dispatcher.broadcast(GatewayEvent::PresenceUpdate {
                user_id: claims.sub,
                status: PresenceStatus::Offline,
                last_seen: Some(now),
            });
        }
        Ok(Err(e)) => warn!("mark_offline for {} failed: {:#}", claims.sub, e),
        Err(e) => warn!("spawn_blocking join error: {}", e),
    }

    StatusCode::OK
}

/// Presence for any user, staleness already applied: a missed heartbeat
/// window reads as offline, an unknown user as offline with no last_seen.
pub async fn get_presence(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Extension(_claims): Extension<Claims>,
) -> Json<Presence> {
    let now = Utc::now();
    let db = state.db.clone();
    let uid = user_id.to_string();

    let presence = tokio::task::spawn_blocking(move || db.get_presence(&uid, now))
        .await
        .unwrap_or_else(|e| {
            warn!("spawn_blocking join error: {}", e);
            Ok(Presence {
                status: PresenceStatus::Offline,
                last_seen: None,
            })
        })
        .unwrap_or_else(|e| {
            // Presence reads are not a correctness path; degrade to offline
            warn!("presence fetch for {} failed: {:#}", user_id, e);
            Presence {
                status: PresenceStatus::Offline,
                last_seen: None,
            }
        });

    Json(presence)
}
