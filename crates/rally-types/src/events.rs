use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::PresenceStatus;

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid },

    /// A new conversation was created; sent targeted to the other
    /// participant so their inbox updates without a poll.
    ConversationCreated {
        conversation_id: Uuid,
        created_by: Uuid,
        participant_ids: [Uuid; 2],
    },

    /// A new message was posted
    MessageCreate {
        id: Uuid,
        conversation_id: Uuid,
        sender_id: Uuid,
        sender_name: String,
        content: String,
        created_at: DateTime<Utc>,
    },

    /// A message transitioned to delivered
    MessageDelivered {
        message_id: Uuid,
        conversation_id: Uuid,
        delivered_at: DateTime<Utc>,
    },

    /// A participant marked the conversation read
    ReadReceipt {
        conversation_id: Uuid,
        reader_id: Uuid,
        read_at: DateTime<Utc>,
        marked_count: u64,
    },

    /// A user started or stopped typing
    TypingUpdate {
        conversation_id: Uuid,
        user_id: Uuid,
        is_typing: bool,
    },

    /// A user's presence changed
    PresenceUpdate {
        user_id: Uuid,
        status: PresenceStatus,
        last_seen: Option<DateTime<Utc>>,
    },
}

impl GatewayEvent {
    /// Returns the conversation_id if this event is scoped to a specific
    /// conversation. Events that return `None` are global and delivered to
    /// all connected clients.
    pub fn conversation_id(&self) -> Option<Uuid> {
        match self {
            Self::MessageCreate { conversation_id, .. } => Some(*conversation_id),
            Self::MessageDelivered { conversation_id, .. } => Some(*conversation_id),
            Self::ReadReceipt { conversation_id, .. } => Some(*conversation_id),
            Self::TypingUpdate { conversation_id, .. } => Some(*conversation_id),
            // Ready, ConversationCreated, PresenceUpdate are unscoped
            _ => None,
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// Subscribe to events for specific conversations. The server only
    /// forwards conversation-scoped events for subscribed conversations.
    Subscribe { conversation_ids: Vec<Uuid> },

    /// Drop subscriptions, e.g. when the client navigates away.
    Unsubscribe { conversation_ids: Vec<Uuid> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_events_carry_their_conversation() {
        let cid = Uuid::new_v4();
        let event = GatewayEvent::TypingUpdate {
            conversation_id: cid,
            user_id: Uuid::new_v4(),
            is_typing: true,
        };
        assert_eq!(event.conversation_id(), Some(cid));

        let global = GatewayEvent::PresenceUpdate {
            user_id: Uuid::new_v4(),
            status: PresenceStatus::Online,
            last_seen: None,
        };
        assert_eq!(global.conversation_id(), None);
    }

    #[test]
    fn commands_use_tagged_encoding() {
        let cmd: GatewayCommand =
            serde_json::from_str(r#"{"type":"Identify","data":{"token":"abc"}}"#).unwrap();
        match cmd {
            GatewayCommand::Identify { token } => assert_eq!(token, "abc"),
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
