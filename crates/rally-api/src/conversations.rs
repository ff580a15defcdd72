use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use tracing::error;
use uuid::Uuid;

use rally_types::api::{
    Claims, ConversationSummary, MessagePreview, StartConversationRequest,
    StartConversationResponse,
};
use rally_types::events::GatewayEvent;
use rally_types::models::UserProfile;

use crate::error::ApiError;
use crate::{AppState, parse_ts_or_warn, parse_uuid_or_warn};

/// Find-or-create the 1:1 conversation between the caller and the target.
/// Discovery is idempotent in either direction: repeated calls from both
/// sides resolve to the same conversation id.
pub async fn start_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<StartConversationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.target_id == claims.sub {
        return Err(ApiError::validation(
            "cannot start a conversation with yourself",
        ));
    }

    // Resolve both ends in the profile mirror. The target must be a known
    // user; the caller must have synced a profile before starting threads.
    let db = state.db.clone();
    let requester = claims.sub.to_string();
    let target = req.target_id.to_string();
    let (requester_known, target_known) = tokio::task::spawn_blocking({
        let (requester, target) = (requester.clone(), target.clone());
        move || -> anyhow::Result<(bool, bool)> {
            Ok((
                db.get_user_by_id(&requester)?.is_some(),
                db.get_user_by_id(&target)?.is_some(),
            ))
        }
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        ApiError::Internal(anyhow::anyhow!("join error"))
    })??;

    if !target_known {
        return Err(ApiError::NotFound("user"));
    }
    if !requester_known {
        return Err(ApiError::validation("caller profile not synced"));
    }

    let new_id = Uuid::new_v4();
    let db = state.db.clone();
    let (conversation_id, existing) = tokio::task::spawn_blocking(move || {
        db.start_conversation(&new_id.to_string(), &requester, &target, &rally_db::now_ts())
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        ApiError::Internal(anyhow::anyhow!("join error"))
    })??;

    let conversation_id = parse_uuid_or_warn(&conversation_id, "conversation_id");

    if !existing {
        // Targeted, not broadcast: only the other participant's open session
        // cares that a new thread appeared.
        state
            .dispatcher
            .send_to_user(
                req.target_id,
                GatewayEvent::ConversationCreated {
                    conversation_id,
                    created_by: claims.sub,
                    participant_ids: [claims.sub, req.target_id],
                },
            )
            .await;
    }

    let status = if existing {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };

    Ok((
        status,
        Json(StartConversationResponse {
            conversation_id,
            existing,
        }),
    ))
}

/// The caller's inbox: conversations ordered by latest activity, with the
/// partner's profile, a preview of the newest message, and unread counts.
pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let user_id = claims.sub.to_string();
    let rows = tokio::task::spawn_blocking(move || db.list_conversations(&user_id))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            ApiError::Internal(anyhow::anyhow!("join error"))
        })??;

    let summaries: Vec<ConversationSummary> = rows
        .into_iter()
        .map(|row| {
            let last_message = match (row.last_sender_id, row.last_content, row.last_created_at) {
                (Some(sender_id), Some(content), Some(created_at)) => Some(MessagePreview {
                    sender_id: parse_uuid_or_warn(&sender_id, "sender_id"),
                    content,
                    created_at: parse_ts_or_warn(&created_at, "created_at"),
                }),
                _ => None,
            };

            ConversationSummary {
                id: parse_uuid_or_warn(&row.id, "conversation_id"),
                partner: UserProfile {
                    id: parse_uuid_or_warn(&row.partner_id, "partner_id"),
                    display_name: row.partner_display_name,
                    avatar_url: row.partner_avatar_url,
                },
                last_message,
                unread_count: row.unread_count.max(0) as u64,
                updated_at: parse_ts_or_warn(&row.updated_at, "updated_at"),
            }
        })
        .collect();

    Ok(Json(summaries))
}
