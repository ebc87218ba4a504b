use serde::Serialize;
use tokio::sync::broadcast;

use chatsync_shared::{ChannelStatus, ChatError, Conversation, ConversationId, Message, UserId};

use crate::coordinator::{AttachPhase, SyncCoordinator};

pub const EVENT_STATUS_CHANGED: &str = "status-changed";
pub const EVENT_SESSION_STARTED: &str = "session-started";
pub const EVENT_SESSION_ENDED: &str = "session-ended";
pub const EVENT_DIRECTORY_LOADED: &str = "directory-loaded";
pub const EVENT_CONVERSATION_OPENED: &str = "conversation-opened";
pub const EVENT_OPEN_FAILED: &str = "open-failed";
pub const EVENT_MESSAGE_RECEIVED: &str = "message-received";

/// Notifications broadcast by the sync engine, in the order it handled them.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StatusChanged(ChannelStatus),
    SessionStarted {
        user_id: UserId,
    },
    /// `reason` is set when a collaborator rejected the credential.
    SessionEnded {
        reason: Option<ChatError>,
    },
    DirectoryLoaded {
        conversations: usize,
    },
    ConversationOpened {
        conversation_id: ConversationId,
        messages: usize,
    },
    OpenFailed {
        conversation_id: ConversationId,
        error: ChatError,
    },
    MessageReceived(Message),
}

impl SyncEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::StatusChanged(_) => EVENT_STATUS_CHANGED,
            SyncEvent::SessionStarted { .. } => EVENT_SESSION_STARTED,
            SyncEvent::SessionEnded { .. } => EVENT_SESSION_ENDED,
            SyncEvent::DirectoryLoaded { .. } => EVENT_DIRECTORY_LOADED,
            SyncEvent::ConversationOpened { .. } => EVENT_CONVERSATION_OPENED,
            SyncEvent::OpenFailed { .. } => EVENT_OPEN_FAILED,
            SyncEvent::MessageReceived(_) => EVENT_MESSAGE_RECEIVED,
        }
    }
}

/// Observer projection of the conversation directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectorySnapshot {
    pub conversations: Vec<Conversation>,
    pub active: Option<ConversationId>,
    pub total_unread: u32,
}

/// Observer projection of the open conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogSnapshot {
    pub conversation_id: ConversationId,
    pub phase: AttachPhase,
    /// Empty while attaching.
    pub messages: Vec<Message>,
}

impl DirectorySnapshot {
    pub fn of(coordinator: &SyncCoordinator) -> Self {
        let directory = coordinator.directory();
        Self {
            conversations: directory.snapshot(),
            active: directory.active().cloned(),
            total_unread: directory.total_unread(),
        }
    }
}

impl LogSnapshot {
    pub fn of(coordinator: &SyncCoordinator) -> Option<Self> {
        let conversation_id = coordinator.active_conversation()?.clone();
        let messages = coordinator
            .log()
            .map(|log| log.to_sequence().to_vec())
            .unwrap_or_default();
        Some(Self {
            conversation_id,
            phase: coordinator.phase(),
            messages,
        })
    }
}

pub fn emit_event(events: &broadcast::Sender<SyncEvent>, event: SyncEvent) {
    let name = event.name();
    if events.send(event).is_err() {
        tracing::trace!(event = name, "No event subscribers");
    }
}
