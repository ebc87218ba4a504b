//! Summary of every conversation the session's user belongs to.
//!
//! `last_message` and `unread_count` on each entry are derived here from
//! listing loads and push events; nothing else writes them.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use chatsync_shared::{Conversation, ConversationId, Message, MessageId};

#[derive(Debug, Clone, Default)]
pub struct ConversationDirectory {
    conversations: Vec<Conversation>,
    active: Option<ConversationId>,
    /// Message ids already applied per conversation since the last listing.
    /// A re-delivered id never counts toward unread a second time.
    seen: HashMap<ConversationId, HashSet<MessageId>>,
}

impl ConversationDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole directory with a fresh listing. The active marker
    /// survives, and the active conversation stays read.
    pub fn load(&mut self, conversations: impl IntoIterator<Item = Conversation>) {
        let mut loaded: Vec<Conversation> = Vec::new();
        for conv in conversations {
            if loaded.iter().any(|c| c.id == conv.id) {
                debug!(conversation = %conv.id, "Duplicate conversation in listing");
                continue;
            }
            loaded.push(conv);
        }
        self.conversations = loaded;

        // The listing's counters are authoritative; only its previews are
        // already accounted for.
        self.seen.clear();
        for conv in &self.conversations {
            if let Some(last) = &conv.last_message {
                self.seen
                    .entry(conv.id.clone())
                    .or_default()
                    .insert(last.id.clone());
            }
        }

        if let Some(active) = self.active.clone() {
            if let Some(conv) = self.get_mut(&active) {
                conv.unread_count = 0;
            }
        }
    }

    /// Apply a pushed message to its conversation's summary.
    ///
    /// The preview only moves forward in `(sent_at, id)` order, and the
    /// unread counter grows by one for each distinct message id delivered
    /// while the conversation is not active. Messages for unknown
    /// conversations are dropped. Returns whether anything changed.
    pub fn apply_incoming_message(&mut self, message: &Message) -> bool {
        let is_active = self.is_active(&message.conversation_id);
        let Some(index) = self.position(&message.conversation_id) else {
            debug!(
                conversation = %message.conversation_id,
                message = %message.id,
                "Dropping push for unknown conversation"
            );
            return false;
        };

        let first_delivery = self
            .seen
            .entry(message.conversation_id.clone())
            .or_default()
            .insert(message.id.clone());

        let conv = &mut self.conversations[index];
        let mut changed = advance_preview(conv, message);
        if first_delivery && !is_active {
            conv.unread_count = conv.unread_count.saturating_add(1);
            changed = true;
        }
        if !first_delivery {
            debug!(
                conversation = %message.conversation_id,
                message = %message.id,
                "Re-delivered message not counted"
            );
        }
        changed
    }

    /// Advance a preview from fetched history; never touches unread counts.
    pub fn note_history(&mut self, message: &Message) -> bool {
        let Some(conv) = self.get_mut(&message.conversation_id) else {
            return false;
        };
        let advanced = advance_preview(conv, message);
        self.seen
            .entry(message.conversation_id.clone())
            .or_default()
            .insert(message.id.clone());
        advanced
    }

    /// Mark `id` as the conversation being read and zero its unread counter.
    pub fn mark_active(&mut self, id: &ConversationId) {
        self.active = Some(id.clone());
        if let Some(conv) = self.get_mut(id) {
            conv.unread_count = 0;
        }
    }

    pub fn clear_active(&mut self) {
        self.active = None;
    }

    /// Add a conversation the local user just created. Returns `false` if a
    /// listing refresh or an earlier call already added it.
    pub fn upsert_created(&mut self, conversation: Conversation) -> bool {
        if self.get(&conversation.id).is_some() {
            debug!(conversation = %conversation.id, "Created conversation already listed");
            return false;
        }
        let mut conversation = conversation;
        if self.is_active(&conversation.id) {
            conversation.unread_count = 0;
        }
        if let Some(last) = &conversation.last_message {
            self.seen
                .entry(conversation.id.clone())
                .or_default()
                .insert(last.id.clone());
        }
        self.conversations.push(conversation);
        true
    }

    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| &c.id == id)
    }

    fn get_mut(&mut self, id: &ConversationId) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| &c.id == id)
    }

    fn position(&self, id: &ConversationId) -> Option<usize> {
        self.conversations.iter().position(|c| &c.id == id)
    }

    pub fn active(&self) -> Option<&ConversationId> {
        self.active.as_ref()
    }

    pub fn is_active(&self, id: &ConversationId) -> bool {
        self.active.as_ref() == Some(id)
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    /// Owned copy for observers.
    pub fn snapshot(&self) -> Vec<Conversation> {
        self.conversations.clone()
    }

    pub fn total_unread(&self) -> u32 {
        self.conversations
            .iter()
            .fold(0u32, |acc, c| acc.saturating_add(c.unread_count))
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }
}

fn advance_preview(conv: &mut Conversation, message: &Message) -> bool {
    let newer = conv
        .last_message
        .as_ref()
        .map_or(true, |last| message.is_newer_than(last));
    if newer {
        conv.last_message = Some(message.clone());
    }
    newer
}
