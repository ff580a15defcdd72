use axum::{Extension, Json, extract::State, response::IntoResponse};
use tracing::error;

use rally_types::api::{Claims, SyncProfileRequest};
use rally_types::models::UserProfile;

use crate::AppState;
use crate::error::ApiError;

/// Upsert the caller's row in the profile mirror. The identity provider owns
/// profile data; clients push a copy here at login so conversation partners
/// can be resolved to a display name and avatar.
pub async fn sync_profile(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SyncProfileRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let display_name = req.display_name.trim().to_string();
    if display_name.is_empty() {
        return Err(ApiError::validation("display_name must not be empty"));
    }

    let db = state.db.clone();
    let id = claims.sub.to_string();
    let name = display_name.clone();
    let avatar = req.avatar_url.clone();
    tokio::task::spawn_blocking(move || {
        db.upsert_user(&id, &name, avatar.as_deref(), &rally_db::now_ts())
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        ApiError::Internal(anyhow::anyhow!("join error"))
    })??;

    Ok(Json(UserProfile {
        id: claims.sub,
        display_name,
        avatar_url: req.avatar_url,
    }))
}
