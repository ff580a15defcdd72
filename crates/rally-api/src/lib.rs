pub mod conversations;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod presence;
pub mod profiles;
pub mod typing;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use rally_db::Database;
use rally_gateway::dispatcher::Dispatcher;

use crate::middleware::require_auth;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub dispatcher: Dispatcher,
    pub jwt_secret: String,
}

/// The full REST surface. Every route sits behind the auth middleware.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/profiles/sync", post(profiles::sync_profile))
        .route(
            "/conversations",
            post(conversations::start_conversation).get(conversations::list_conversations),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route(
            "/conversations/{conversation_id}/mark-read",
            post(messages::mark_read),
        )
        .route(
            "/conversations/{conversation_id}/typing",
            post(typing::set_typing).get(typing::get_typing),
        )
        .route(
            "/messages/{message_id}/mark-delivered",
            post(messages::mark_delivered),
        )
        .route("/messages/unread-count", get(messages::unread_count))
        .route("/presence/heartbeat", post(presence::heartbeat))
        .route("/presence/offline", post(presence::offline))
        .route("/users/{user_id}/presence", get(presence::get_presence))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_auth,
        ))
        .with_state(state)
}

/// SQLite hands back TEXT ids and timestamps; corrupt values are logged and
/// defaulted rather than failing the whole response, as elsewhere in the
/// read paths.
pub(crate) fn parse_uuid_or_warn(raw: &str, field: &'static str) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} '{}': {}", field, raw, e);
        Uuid::default()
    })
}

pub(crate) fn parse_ts_or_warn(raw: &str, field: &'static str) -> DateTime<Utc> {
    rally_db::parse_ts(raw).unwrap_or_else(|| {
        warn!("Corrupt {} '{}'", field, raw);
        DateTime::default()
    })
}
