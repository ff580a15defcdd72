use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::error;
use uuid::Uuid;

use rally_types::api::{
    Claims, MarkDeliveredResponse, MarkReadResponse, MessageResponse, SendMessageRequest,
    UnreadCountResponse,
};
use rally_types::events::GatewayEvent;
use rally_types::models::UserProfile;

use crate::error::ApiError;
use crate::{AppState, parse_ts_or_warn, parse_uuid_or_warn};

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    /// Page bound; absent means the whole thread.
    pub limit: Option<u32>,
    /// Cursor-based pagination — pass the `created_at` timestamp of the
    /// oldest message from the previous page to fetch older messages.
    pub before: Option<String>,
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let content = req.content.trim().to_string();
    if content.is_empty() {
        return Err(ApiError::validation("message content must not be empty"));
    }

    let message_id = Uuid::new_v4();
    let now = rally_db::now_ts();

    // Run blocking DB work off the async runtime
    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let sid = claims.sub.to_string();
    let body = content.clone();
    let now_db = now.clone();
    let sender = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        if !db.is_participant(&cid, &sid)? {
            return Ok(None);
        }
        let sender = db
            .get_user_by_id(&sid)?
            .ok_or_else(|| anyhow::anyhow!("sender profile missing for participant {}", sid))?;
        db.insert_message(&message_id.to_string(), &cid, &sid, &body, &now_db)?;
        Ok(Some(sender))
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        ApiError::Internal(anyhow::anyhow!("join error"))
    })??
    .ok_or(ApiError::Forbidden)?;

    let created_at = parse_ts_or_warn(&now, "created_at");

    state.dispatcher.broadcast(GatewayEvent::MessageCreate {
        id: message_id,
        conversation_id,
        sender_id: claims.sub,
        sender_name: sender.display_name.clone(),
        content: content.clone(),
        created_at,
    });

    Ok((
        StatusCode::CREATED,
        Json(MessageResponse {
            id: message_id,
            conversation_id,
            sender: UserProfile {
                id: claims.sub,
                display_name: sender.display_name,
                avatar_url: sender.avatar_url,
            },
            content,
            created_at,
            delivered_at: None,
            read_at: None,
        }),
    ))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let uid = claims.sub.to_string();
    let limit = query.limit.map(|l| l.min(200));
    let before = query.before;

    let rows = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        if !db.is_participant(&cid, &uid)? {
            return Ok(None);
        }
        Ok(Some(db.list_messages(&cid, limit, before.as_deref())?))
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        ApiError::Internal(anyhow::anyhow!("join error"))
    })??
    .ok_or(ApiError::Forbidden)?;

    let messages: Vec<MessageResponse> = rows
        .into_iter()
        .map(|row| MessageResponse {
            id: parse_uuid_or_warn(&row.id, "message_id"),
            conversation_id: parse_uuid_or_warn(&row.conversation_id, "conversation_id"),
            sender: UserProfile {
                id: parse_uuid_or_warn(&row.sender_id, "sender_id"),
                display_name: row.sender_display_name,
                avatar_url: row.sender_avatar_url,
            },
            content: row.content,
            created_at: parse_ts_or_warn(&row.created_at, "created_at"),
            delivered_at: row.delivered_at.as_deref().and_then(rally_db::parse_ts),
            read_at: row.read_at.as_deref().and_then(rally_db::parse_ts),
        })
        .collect();

    Ok(Json(messages))
}

enum DeliveredOutcome {
    NotFound,
    Forbidden,
    Done {
        delivered: bool,
        conversation_id: String,
    },
}

/// Set-if-null delivery marking: the first call performs the transition, any
/// repeat is a no-op with the same 200 response shape.
pub async fn mark_delivered(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let now = rally_db::now_ts();
    let db = state.db.clone();
    let mid = message_id.to_string();
    let uid = claims.sub.to_string();
    let now_db = now.clone();

    let outcome = tokio::task::spawn_blocking(move || -> anyhow::Result<DeliveredOutcome> {
        let meta = match db.message_meta(&mid)? {
            Some(meta) => meta,
            None => return Ok(DeliveredOutcome::NotFound),
        };
        if !db.is_participant(&meta.conversation_id, &uid)? {
            return Ok(DeliveredOutcome::Forbidden);
        }
        let delivered = db.mark_delivered(&mid, &now_db)?;
        Ok(DeliveredOutcome::Done {
            delivered,
            conversation_id: meta.conversation_id,
        })
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        ApiError::Internal(anyhow::anyhow!("join error"))
    })??;

    match outcome {
        DeliveredOutcome::NotFound => Err(ApiError::NotFound("message")),
        DeliveredOutcome::Forbidden => Err(ApiError::Forbidden),
        DeliveredOutcome::Done {
            delivered,
            conversation_id,
        } => {
            if delivered {
                state.dispatcher.broadcast(GatewayEvent::MessageDelivered {
                    message_id,
                    conversation_id: parse_uuid_or_warn(&conversation_id, "conversation_id"),
                    delivered_at: parse_ts_or_warn(&now, "delivered_at"),
                });
            }
            Ok(Json(MarkDeliveredResponse { delivered }))
        }
    }
}

/// Mark every unread partner message in the conversation as read and advance
/// the caller's watermark. Idempotent: a second call observes nothing unread
/// and returns 0.
pub async fn mark_read(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let now = rally_db::now_ts();
    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let uid = claims.sub.to_string();
    let now_db = now.clone();

    let marked = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        if !db.is_participant(&cid, &uid)? {
            return Ok(None);
        }
        Ok(Some(db.mark_read(&cid, &uid, &now_db)?))
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        ApiError::Internal(anyhow::anyhow!("join error"))
    })??
    .ok_or(ApiError::Forbidden)?;

    if marked > 0 {
        state.dispatcher.broadcast(GatewayEvent::ReadReceipt {
            conversation_id,
            reader_id: claims.sub,
            read_at: parse_ts_or_warn(&now, "read_at"),
            marked_count: marked,
        });
    }

    Ok(Json(MarkReadResponse {
        marked_count: marked,
    }))
}

/// Aggregate unread count across all of the caller's conversations, for the
/// badge the client polls every 30s as its push-loss backstop.
pub async fn unread_count(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let uid = claims.sub.to_string();
    let count = tokio::task::spawn_blocking(move || db.unread_count(&uid))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            ApiError::Internal(anyhow::anyhow!("join error"))
        })??;

    Ok(Json(UnreadCountResponse {
        unread_count: count,
    }))
}
