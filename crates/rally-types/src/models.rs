use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Profile data mirrored from the external identity/profile service.
/// This service never authors profiles; it only holds a read-through copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// A stored presence record after staleness derivation. A record whose last
/// heartbeat is older than the staleness window reads as offline regardless
/// of the stored status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Presence {
    pub status: PresenceStatus,
    pub last_seen: Option<DateTime<Utc>>,
}
