use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use tracing::error;
use uuid::Uuid;

use rally_types::api::{Claims, TypingRequest, TypingResponse};
use rally_types::events::GatewayEvent;

use crate::error::ApiError;
use crate::{AppState, parse_uuid_or_warn};

/// Upsert or clear the caller's typing flag. Start refreshes the row's
/// updated_at, so a client that keeps typing keeps the flag alive; readers
/// apply the TTL, covering clients that vanish without a stop signal.
pub async fn set_typing(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<TypingRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let uid = claims.sub.to_string();
    let is_typing = req.is_typing;

    let allowed = tokio::task::spawn_blocking(move || -> anyhow::Result<bool> {
        if !db.is_participant(&cid, &uid)? {
            return Ok(false);
        }
        if is_typing {
            db.set_typing(&cid, &uid, &rally_db::now_ts())?;
        } else {
            db.clear_typing(&cid, &uid)?;
        }
        Ok(true)
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        ApiError::Internal(anyhow::anyhow!("join error"))
    })??;

    if !allowed {
        return Err(ApiError::Forbidden);
    }

    state.dispatcher.broadcast(GatewayEvent::TypingUpdate {
        conversation_id,
        user_id: claims.sub,
        is_typing: req.is_typing,
    });

    Ok(StatusCode::OK)
}

/// Polling backstop for dropped TypingUpdate pushes: who is typing right
/// now, stale rows excluded.
pub async fn get_typing(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let uid = claims.sub.to_string();

    let user_ids = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        if !db.is_participant(&cid, &uid)? {
            return Ok(None);
        }
        Ok(Some(db.typing_users(&cid, &uid, Utc::now())?))
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        ApiError::Internal(anyhow::anyhow!("join error"))
    })??
    .ok_or(ApiError::Forbidden)?;

    Ok(Json(TypingResponse {
        user_ids: user_ids
            .iter()
            .map(|id| parse_uuid_or_warn(id, "user_id"))
            .collect(),
    }))
}
