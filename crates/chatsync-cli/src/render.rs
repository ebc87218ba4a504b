//! Plain-text rendering of engine state for the terminal.

use chatsync_client::{DirectorySnapshot, SyncEvent};
use chatsync_shared::{Conversation, Message};

pub fn message_line(message: &Message) -> String {
    format!(
        "[{}] {}: {}",
        message.sent_at.format("%H:%M:%S"),
        message.sender_id,
        message.content
    )
}

pub fn conversation_line(conversation: &Conversation, active: bool) -> String {
    let marker = if active { '*' } else { ' ' };
    let mut line = format!("{marker} {:<12} {}", conversation.id.as_str(), conversation.name);
    if conversation.unread_count > 0 {
        line.push_str(&format!(" ({} unread)", conversation.unread_count));
    }
    if let Some(last) = &conversation.last_message {
        line.push_str(&format!(" | {}: {}", last.sender_id, preview(&last.content)));
    }
    line
}

pub fn directory_lines(snapshot: &DirectorySnapshot) -> Vec<String> {
    if snapshot.conversations.is_empty() {
        return vec!["(no conversations)".to_string()];
    }
    let mut conversations: Vec<&Conversation> = snapshot.conversations.iter().collect();
    conversations.sort_by_key(|c| std::cmp::Reverse(c.last_activity()));
    conversations
        .into_iter()
        .map(|c| conversation_line(c, snapshot.active.as_ref() == Some(&c.id)))
        .collect()
}

/// One line for events worth showing; `None` for the rest.
pub fn event_line(event: &SyncEvent) -> Option<String> {
    match event {
        SyncEvent::StatusChanged(status) => Some(format!("-- push channel {status}")),
        SyncEvent::SessionStarted { user_id } => Some(format!("-- signed in as {user_id}")),
        SyncEvent::SessionEnded { reason: Some(reason) } => {
            Some(format!("-- signed out: {reason}"))
        }
        SyncEvent::SessionEnded { reason: None } => Some("-- signed out".to_string()),
        SyncEvent::DirectoryLoaded { conversations } => {
            Some(format!("-- {conversations} conversations"))
        }
        SyncEvent::ConversationOpened { .. } => None,
        SyncEvent::OpenFailed {
            conversation_id,
            error,
        } => Some(format!("-- could not open {conversation_id}: {error}")),
        SyncEvent::MessageReceived(message) => Some(format!(
            "<{}> {}",
            message.conversation_id,
            message_line(message)
        )),
    }
}

fn preview(content: &str) -> String {
    const MAX: usize = 40;
    if content.chars().count() <= MAX {
        return content.to_string();
    }
    let cut: String = content.chars().take(MAX).collect();
    format!("{cut}...")
}
