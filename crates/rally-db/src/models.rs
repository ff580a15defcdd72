/// Database row types — these map directly to SQLite rows.
/// Distinct from rally-types API models to keep the DB layer independent.
/// Timestamps stay as the stored TEXT form; the API layer parses them.

pub struct UserRow {
    pub id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_display_name: String,
    pub sender_avatar_url: Option<String>,
    pub content: String,
    pub seq: i64,
    pub created_at: String,
    pub delivered_at: Option<String>,
    pub read_at: Option<String>,
}

/// One inbox entry: the conversation, the other participant, a preview of
/// the newest message, and the caller's unread count.
pub struct ConversationSummaryRow {
    pub id: String,
    pub updated_at: String,
    pub partner_id: String,
    pub partner_display_name: String,
    pub partner_avatar_url: Option<String>,
    pub last_sender_id: Option<String>,
    pub last_content: Option<String>,
    pub last_created_at: Option<String>,
    pub unread_count: i64,
}

pub struct PresenceRow {
    pub user_id: String,
    pub status: String,
    pub last_seen: String,
}

/// Conversation id plus sender, as needed by mark-delivered to authorize the
/// caller and scope the fan-out event.
pub struct MessageMeta {
    pub conversation_id: String,
    pub sender_id: String,
    pub delivered_at: Option<String>,
}
