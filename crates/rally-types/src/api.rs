use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::UserProfile;

// -- JWT Claims --

/// JWT claims shared across rally-api (REST middleware) and rally-gateway
/// (WebSocket Identify). Canonical definition lives here in rally-types to
/// eliminate duplication. Tokens are issued by the external identity
/// provider; this service only validates them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub name: String,
    pub exp: usize,
}

// -- Profiles --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncProfileRequest {
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

// -- Conversations --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartConversationRequest {
    pub target_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartConversationResponse {
    pub conversation_id: Uuid,
    /// true when an existing conversation with this pair was found,
    /// false when a new one was created.
    pub existing: bool,
}

/// One row of the caller's inbox, ordered by `updated_at` descending.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: Uuid,
    pub partner: UserProfile,
    pub last_message: Option<MessagePreview>,
    pub unread_count: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessagePreview {
    pub sender_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender: UserProfile,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MarkDeliveredResponse {
    /// true when this call performed the transition, false when the message
    /// was already delivered (the call is an idempotent no-op).
    pub delivered: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MarkReadResponse {
    pub marked_count: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnreadCountResponse {
    pub unread_count: u64,
}

// -- Typing --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TypingRequest {
    pub is_typing: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TypingResponse {
    /// Users currently typing in the conversation, the caller excluded.
    pub user_ids: Vec<Uuid>,
}

