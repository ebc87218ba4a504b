//! Ordered, deduplicated message view for one conversation.
//!
//! Entries are kept sorted by `(sent_at, id)` ascending and no two entries
//! share an id, whatever order `replace`/`append`/`merge` are called in.

use std::collections::HashSet;

use tracing::debug;

use chatsync_shared::{ConversationId, Message, MessageId, UserId};

#[derive(Debug, Clone)]
pub struct MessageLog {
    conversation_id: ConversationId,
    entries: Vec<Message>,
    ids: HashSet<MessageId>,
}

impl MessageLog {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            entries: Vec::new(),
            ids: HashSet::new(),
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Reset the log to exactly `history`, sorted. When the input repeats an
    /// id, the earliest-sorting copy wins.
    pub fn replace(&mut self, history: impl IntoIterator<Item = Message>) {
        let mut entries: Vec<Message> = history
            .into_iter()
            .filter(|m| self.belongs(m))
            .collect();
        entries.sort_by(|a, b| a.order_cmp(b));

        self.ids.clear();
        let ids = &mut self.ids;
        entries.retain(|m| ids.insert(m.id.clone()));
        self.entries = entries;
    }

    /// Insert `message` at its sort position. Returns `false` (and changes
    /// nothing) if a message with the same id is already present.
    pub fn append(&mut self, message: Message) -> bool {
        if !self.belongs(&message) || self.ids.contains(&message.id) {
            return false;
        }
        let pos = self
            .entries
            .partition_point(|m| m.order_cmp(&message).is_lt());
        self.ids.insert(message.id.clone());
        self.entries.insert(pos, message);
        true
    }

    /// Append every message of `batch`; used for older history pages.
    /// Returns how many were new.
    pub fn merge(&mut self, batch: impl IntoIterator<Item = Message>) -> usize {
        batch
            .into_iter()
            .map(|m| self.append(m))
            .filter(|added| *added)
            .count()
    }

    /// Record `reader` on every listed message present in the log. Returns
    /// how many gained the reader.
    pub fn mark_read_by(&mut self, message_ids: &[MessageId], reader: &UserId) -> usize {
        let wanted: HashSet<&MessageId> = message_ids.iter().collect();
        self.entries
            .iter_mut()
            .filter(|m| wanted.contains(&m.id))
            .map(|m| m.mark_read_by(reader))
            .filter(|added| *added)
            .count()
    }

    /// The current ordered view.
    pub fn to_sequence(&self) -> &[Message] {
        &self.entries
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn oldest(&self) -> Option<&Message> {
        self.entries.first()
    }

    pub fn newest(&self) -> Option<&Message> {
        self.entries.last()
    }

    fn belongs(&self, message: &Message) -> bool {
        if message.conversation_id == self.conversation_id {
            return true;
        }
        debug!(
            message = %message.id,
            conversation = %message.conversation_id,
            log = %self.conversation_id,
            "Ignoring message for another conversation"
        );
        false
    }
}
