//! Domain records exchanged with the chat service.
//!
//! Field names follow the service's camelCase JSON so the same structs decode
//! REST bodies and push frames.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ConversationId, MessageId, UserId};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single chat message. Immutable once created, apart from `read_by`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Server-assigned unique identifier.
    pub id: MessageId,
    /// The conversation this message belongs to.
    #[serde(rename = "chatId")]
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    /// Authoritative ordering key.
    pub sent_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    /// Users who have read this message (set semantics).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub read_by: Vec<UserId>,
}

impl Message {
    /// Total order used by every message view: `(sent_at, id)` ascending.
    pub fn order_cmp(&self, other: &Message) -> Ordering {
        self.sent_at
            .cmp(&other.sent_at)
            .then_with(|| self.id.cmp(&other.id))
    }

    /// Whether `self` sorts strictly after `other`.
    pub fn is_newer_than(&self, other: &Message) -> bool {
        self.order_cmp(other) == Ordering::Greater
    }

    /// Record that `user` has read this message. Returns `false` if already recorded.
    pub fn mark_read_by(&mut self, user: &UserId) -> bool {
        if self.read_by.contains(user) {
            return false;
        }
        self.read_by.push(user.clone());
        true
    }
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// Conversation type as the service names it. Kinds this client does not
/// know keep their wire name so they survive a round trip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "String", into = "String")]
pub enum ConversationKind {
    Direct,
    Group,
    Other(String),
}

impl ConversationKind {
    pub fn as_str(&self) -> &str {
        match self {
            ConversationKind::Direct => "direct",
            ConversationKind::Group => "group",
            ConversationKind::Other(kind) => kind,
        }
    }

    /// Kind the service expects for a new conversation with these members.
    pub fn for_members(member_count: usize) -> Self {
        if member_count > 1 {
            ConversationKind::Group
        } else {
            ConversationKind::Direct
        }
    }
}

impl From<String> for ConversationKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "direct" => ConversationKind::Direct,
            "group" => ConversationKind::Group,
            _ => ConversationKind::Other(kind),
        }
    }
}

impl From<ConversationKind> for String {
    fn from(kind: ConversationKind) -> Self {
        match kind {
            ConversationKind::Other(kind) => kind,
            known => known.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub user_id: UserId,
    pub role: String,
    pub joined_at: DateTime<Utc>,
}

/// A chat thread with a fixed member set.
///
/// `last_message` and `unread_count` are derived by the directory and never
/// authored independently by the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
    #[serde(default)]
    pub unread_count: u32,
}

impl Conversation {
    /// Timestamp of the latest activity, for "most recent first" listings.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_message
            .as_ref()
            .map(|m| m.sent_at)
            .unwrap_or(self.created_at)
    }

    pub fn has_member(&self, user: &UserId) -> bool {
        self.members.iter().any(|m| &m.user_id == user)
    }
}
