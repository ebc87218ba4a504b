//! Request/response contract of the chat service.
//!
//! The sync engine only depends on [`ChatApi`]; [`crate::rest::RestClient`]
//! is the HTTP implementation. Every call takes the session explicitly so a
//! result can always be attributed to the credential that produced it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chatsync_shared::{
    ChatResult, Conversation, ConversationId, ConversationKind, Message, MessageId, Session,
    UserId,
};

/// Paging window for a history fetch.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct HistoryQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
    /// Only messages sent strictly before this instant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<DateTime<Utc>>,
    /// Only messages sent strictly after this instant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<DateTime<Utc>>,
}

impl HistoryQuery {
    pub fn latest(limit: u32) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn before(limit: u32, before: DateTime<Utc>) -> Self {
        Self {
            limit: Some(limit),
            before: Some(before),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    pub member_ids: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl CreateConversationRequest {
    /// Build a request whose kind is derived from the member count.
    pub fn new(name: impl Into<String>, member_ids: Vec<UserId>) -> Self {
        Self {
            name: name.into(),
            kind: ConversationKind::for_members(member_ids.len()),
            member_ids,
            avatar_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SearchQuery {
    #[serde(rename = "chat_id")]
    pub conversation_id: ConversationId,
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MarkAsReadRequest {
    pub message_ids: Vec<MessageId>,
}

#[async_trait]
pub trait ChatApi: Send + Sync + 'static {
    /// List every conversation the session's user belongs to.
    async fn fetch_conversations(&self, session: &Session) -> ChatResult<Vec<Conversation>>;

    async fn fetch_conversation(
        &self,
        session: &Session,
        id: &ConversationId,
    ) -> ChatResult<Conversation>;

    /// Fetch a page of history. The result is not guaranteed to be sorted.
    async fn fetch_history(
        &self,
        session: &Session,
        id: &ConversationId,
        query: &HistoryQuery,
    ) -> ChatResult<Vec<Message>>;

    /// Submit a message. The returned record is only an acknowledgment; the
    /// canonical copy arrives through the push channel.
    async fn send_message(
        &self,
        session: &Session,
        id: &ConversationId,
        request: &SendMessageRequest,
    ) -> ChatResult<Message>;

    async fn create_conversation(
        &self,
        session: &Session,
        request: &CreateConversationRequest,
    ) -> ChatResult<Conversation>;

    async fn search_messages(
        &self,
        session: &Session,
        query: &SearchQuery,
    ) -> ChatResult<Vec<Message>>;

    async fn mark_as_read(&self, session: &Session, message_ids: &[MessageId]) -> ChatResult<()>;
}
