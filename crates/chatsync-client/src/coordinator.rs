//! Attach/detach state machine for the open conversation.
//!
//! This is the synchronous heart of the engine: it owns the directory and
//! the active [`MessageLog`], routes push messages to both, and resolves the
//! race between a history fetch and pushes that arrive while it is in flight.
//!
//! Every open request gets a monotonically increasing sequence number. While
//! a request is `Attaching`, pushes for its conversation are queued; when its
//! history arrives the log is rebuilt from the history and the queue is
//! flushed through `append`. A history result whose ticket is not the current
//! one is stale and is dropped. Tickets also carry the session identity, so
//! nothing fetched under an old session is ever applied.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use chatsync_shared::{
    ChatError, ChatResult, Conversation, ConversationId, Message, MessageId, UserId,
};

use crate::directory::ConversationDirectory;
use crate::message_log::MessageLog;

/// Identifies one `open_conversation` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenTicket {
    pub seq: u64,
    pub conversation_id: ConversationId,
    pub session_id: Uuid,
}

/// Identifies one older-history page request against an attached log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OlderTicket {
    pub seq: u64,
    pub conversation_id: ConversationId,
    pub session_id: Uuid,
    /// Fetch messages sent before this instant; `None` when the log is empty.
    pub before: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachPhase {
    Idle,
    Attaching,
    Attached,
}

#[derive(Debug)]
enum Attachment {
    Idle,
    Attaching {
        seq: u64,
        conversation_id: ConversationId,
        queued: Vec<Message>,
    },
    Attached {
        seq: u64,
        log: MessageLog,
    },
}

/// What a push message did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushOutcome {
    pub directory_changed: bool,
    pub queued: bool,
    pub appended: bool,
}

#[derive(Debug)]
pub struct SyncCoordinator {
    session_id: Option<Uuid>,
    directory: ConversationDirectory,
    attachment: Attachment,
    open_seq: u64,
}

impl Default for SyncCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncCoordinator {
    pub fn new() -> Self {
        Self {
            session_id: None,
            directory: ConversationDirectory::new(),
            attachment: Attachment::Idle,
            open_seq: 0,
        }
    }

    // ------------------------------------------------------------------
    // Session
    // ------------------------------------------------------------------

    /// Start from scratch for a new session.
    pub fn begin_session(&mut self, session_id: Uuid) {
        self.end_session();
        self.session_id = Some(session_id);
    }

    /// Drop everything derived from the current session. The sequence
    /// counter is kept so tickets from before can never match again.
    pub fn end_session(&mut self) {
        self.detach();
        self.directory = ConversationDirectory::new();
        self.session_id = None;
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    fn check_session(&self, session_id: Uuid) -> ChatResult<()> {
        match self.session_id {
            Some(current) if current == session_id => Ok(()),
            _ => Err(ChatError::StaleResult),
        }
    }

    fn require_session(&self) -> ChatResult<Uuid> {
        self.session_id.ok_or(ChatError::NoSession)
    }

    // ------------------------------------------------------------------
    // Open / attach / detach
    // ------------------------------------------------------------------

    /// `idle → attaching`. Any current attachment is detached first and any
    /// earlier in-flight request becomes stale.
    pub fn begin_open(&mut self, conversation_id: ConversationId) -> ChatResult<OpenTicket> {
        let session_id = self.require_session()?;
        self.detach();

        self.open_seq += 1;
        let seq = self.open_seq;
        self.directory.mark_active(&conversation_id);
        self.attachment = Attachment::Attaching {
            seq,
            conversation_id: conversation_id.clone(),
            queued: Vec::new(),
        };

        debug!(conversation = %conversation_id, seq, "Attaching conversation");
        Ok(OpenTicket {
            seq,
            conversation_id,
            session_id,
        })
    }

    /// `attaching → attached`: rebuild the log from `history`, then flush the
    /// pushes that arrived meanwhile in arrival order. Returns the log size.
    pub fn complete_open(
        &mut self,
        ticket: &OpenTicket,
        history: Vec<Message>,
    ) -> ChatResult<usize> {
        self.check_session(ticket.session_id)?;
        let queued = match &mut self.attachment {
            Attachment::Attaching { seq, queued, .. } if *seq == ticket.seq => {
                std::mem::take(queued)
            }
            _ => {
                debug!(seq = ticket.seq, "Discarding superseded history");
                return Err(ChatError::StaleResult);
            }
        };

        let mut log = MessageLog::new(ticket.conversation_id.clone());
        log.replace(history);
        let flushed = queued.len();
        for message in queued {
            log.append(message);
        }
        if let Some(newest) = log.newest() {
            self.directory.note_history(newest);
        }

        let size = log.len();
        info!(
            conversation = %ticket.conversation_id,
            messages = size,
            flushed,
            "Conversation attached"
        );
        self.attachment = Attachment::Attached {
            seq: ticket.seq,
            log,
        };
        Ok(size)
    }

    /// The history fetch for `ticket` failed. Returns `true` if that request
    /// was still current (and has now been abandoned).
    pub fn fail_open(&mut self, ticket: &OpenTicket) -> bool {
        if self.check_session(ticket.session_id).is_err() {
            return false;
        }
        match &self.attachment {
            Attachment::Attaching { seq, .. } if *seq == ticket.seq => {
                self.attachment = Attachment::Idle;
                self.directory.clear_active();
                true
            }
            _ => false,
        }
    }

    /// `attached → idle` (or abandon an attach in progress). Returns whether
    /// anything was attached.
    pub fn detach(&mut self) -> bool {
        let was = !matches!(self.attachment, Attachment::Idle);
        if was {
            self.attachment = Attachment::Idle;
            self.directory.clear_active();
        }
        was
    }

    pub fn phase(&self) -> AttachPhase {
        match self.attachment {
            Attachment::Idle => AttachPhase::Idle,
            Attachment::Attaching { .. } => AttachPhase::Attaching,
            Attachment::Attached { .. } => AttachPhase::Attached,
        }
    }

    /// Target of the current open request, attaching or attached.
    pub fn active_conversation(&self) -> Option<&ConversationId> {
        match &self.attachment {
            Attachment::Idle => None,
            Attachment::Attaching {
                conversation_id, ..
            } => Some(conversation_id),
            Attachment::Attached { log, .. } => Some(log.conversation_id()),
        }
    }

    pub fn log(&self) -> Option<&MessageLog> {
        match &self.attachment {
            Attachment::Attached { log, .. } => Some(log),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Older history
    // ------------------------------------------------------------------

    pub fn begin_older(&self) -> ChatResult<OlderTicket> {
        let session_id = self.require_session()?;
        match &self.attachment {
            Attachment::Attached { seq, log } => Ok(OlderTicket {
                seq: *seq,
                conversation_id: log.conversation_id().clone(),
                session_id,
                before: log.oldest().map(|m| m.sent_at),
            }),
            _ => Err(ChatError::NoActiveConversation),
        }
    }

    /// Merge an older page if its log is still the attached one. Returns how
    /// many messages were new.
    pub fn complete_older(&mut self, ticket: &OlderTicket, page: Vec<Message>) -> ChatResult<usize> {
        self.check_session(ticket.session_id)?;
        match &mut self.attachment {
            Attachment::Attached { seq, log } if *seq == ticket.seq => Ok(log.merge(page)),
            _ => Err(ChatError::StaleResult),
        }
    }

    // ------------------------------------------------------------------
    // Push events
    // ------------------------------------------------------------------

    /// Route a pushed message: always to the directory, and to the active
    /// conversation's log or attach queue when it matches.
    pub fn apply_push(&mut self, message: Message) -> PushOutcome {
        let mut outcome = PushOutcome {
            directory_changed: self.directory.apply_incoming_message(&message),
            ..PushOutcome::default()
        };

        match &mut self.attachment {
            Attachment::Attaching {
                conversation_id,
                queued,
                ..
            } if *conversation_id == message.conversation_id => {
                queued.push(message);
                outcome.queued = true;
            }
            Attachment::Attached { log, .. } if *log.conversation_id() == message.conversation_id => {
                outcome.appended = log.append(message);
            }
            _ => {}
        }
        outcome
    }

    // ------------------------------------------------------------------
    // Directory
    // ------------------------------------------------------------------

    pub fn directory(&self) -> &ConversationDirectory {
        &self.directory
    }

    /// Apply a listing fetched under `session_id`.
    pub fn load_conversations(
        &mut self,
        session_id: Uuid,
        conversations: Vec<Conversation>,
    ) -> ChatResult<usize> {
        self.check_session(session_id)?;
        self.directory.load(conversations);
        if let Some(newest) = self.log().and_then(|log| log.newest()).cloned() {
            self.directory.note_history(&newest);
        }
        Ok(self.directory.len())
    }

    /// Add a conversation created (or fetched on open) under `session_id`.
    /// When it is the attached one, its preview catches up with the log.
    pub fn upsert_created(&mut self, session_id: Uuid, conversation: Conversation) -> ChatResult<bool> {
        self.check_session(session_id)?;
        let id = conversation.id.clone();
        if !self.directory.upsert_created(conversation) {
            return Ok(false);
        }
        let newest = self
            .log()
            .filter(|log| *log.conversation_id() == id)
            .and_then(|log| log.newest())
            .cloned();
        if let Some(newest) = newest {
            self.directory.note_history(&newest);
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Read receipts
    // ------------------------------------------------------------------

    /// Record `reader` on messages the server accepted as read, if the log
    /// they were loaded into is still attached under `session_id`.
    pub fn mark_read_by(
        &mut self,
        session_id: Uuid,
        message_ids: &[MessageId],
        reader: &UserId,
    ) -> usize {
        if self.check_session(session_id).is_err() {
            return 0;
        }
        match &mut self.attachment {
            Attachment::Attached { log, .. } => log.mark_read_by(message_ids, reader),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use chatsync_shared::ConversationKind;

    use super::*;

    fn conv(id: &str) -> Conversation {
        Conversation {
            id: ConversationId::new(id),
            name: id.to_uppercase(),
            kind: ConversationKind::Group,
            avatar_url: None,
            created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            members: Vec::new(),
            last_message: None,
            unread_count: 0,
        }
    }

    fn msg(id: &str, conversation: &str, secs: i64) -> Message {
        Message {
            id: MessageId::new(id),
            conversation_id: ConversationId::new(conversation),
            sender_id: UserId::new("u2"),
            content: id.to_string(),
            sent_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            attachments: Vec::new(),
            read_by: Vec::new(),
        }
    }

    fn log_ids(coordinator: &SyncCoordinator) -> Vec<String> {
        coordinator
            .log()
            .map(|log| log.to_sequence().iter().map(|m| m.id.to_string()).collect())
            .unwrap_or_default()
    }

    fn ready() -> (SyncCoordinator, Uuid) {
        let mut c = SyncCoordinator::new();
        let session = Uuid::new_v4();
        c.begin_session(session);
        c.load_conversations(session, vec![conv("a"), conv("b")]).unwrap();
        (c, session)
    }

    #[test]
    fn test_open_requires_session() {
        let mut c = SyncCoordinator::new();
        assert_eq!(
            c.begin_open(ConversationId::new("a")),
            Err(ChatError::NoSession)
        );
    }

    #[test]
    fn test_open_then_attach() {
        let (mut c, _) = ready();
        let ticket = c.begin_open(ConversationId::new("a")).unwrap();
        assert_eq!(c.phase(), AttachPhase::Attaching);
        assert!(c.log().is_none());

        let size = c
            .complete_open(&ticket, vec![msg("m2", "a", 20), msg("m1", "a", 10)])
            .unwrap();
        assert_eq!(size, 2);
        assert_eq!(c.phase(), AttachPhase::Attached);
        assert_eq!(log_ids(&c), vec!["m1", "m2"]);
        let preview = c.directory().get(&ConversationId::new("a")).unwrap();
        assert_eq!(preview.last_message.as_ref().unwrap().id.as_str(), "m2");
    }

    #[test]
    fn test_push_during_attach_is_flushed_once() {
        let (mut c, _) = ready();
        let ticket = c.begin_open(ConversationId::new("a")).unwrap();

        let pushed = msg("p", "a", 15);
        let outcome = c.apply_push(pushed.clone());
        assert!(outcome.queued);
        assert!(outcome.directory_changed);

        c.complete_open(&ticket, vec![msg("m1", "a", 10), msg("m2", "a", 20)])
            .unwrap();
        assert_eq!(log_ids(&c), vec!["m1", "p", "m2"]);

        // The same message racing in again through the channel is a no-op.
        assert!(!c.apply_push(pushed).appended);
        assert_eq!(log_ids(&c), vec!["m1", "p", "m2"]);
    }

    #[test]
    fn test_push_also_in_history_appears_once() {
        let (mut c, _) = ready();
        let ticket = c.begin_open(ConversationId::new("a")).unwrap();
        c.apply_push(msg("m2", "a", 20));
        c.complete_open(&ticket, vec![msg("m1", "a", 10), msg("m2", "a", 20)])
            .unwrap();
        assert_eq!(log_ids(&c), vec!["m1", "m2"]);
    }

    #[test]
    fn test_superseded_history_is_dropped() {
        let (mut c, _) = ready();
        let first = c.begin_open(ConversationId::new("a")).unwrap();
        let second = c.begin_open(ConversationId::new("b")).unwrap();
        assert!(second.seq > first.seq);

        c.complete_open(&second, vec![msg("b1", "b", 10)]).unwrap();
        assert_eq!(
            c.complete_open(&first, vec![msg("a1", "a", 10)]),
            Err(ChatError::StaleResult)
        );
        assert_eq!(log_ids(&c), vec!["b1"]);
        assert_eq!(c.active_conversation(), Some(&ConversationId::new("b")));
        assert!(!c.fail_open(&first));
    }

    #[test]
    fn test_reopening_same_conversation_supersedes() {
        let (mut c, _) = ready();
        let first = c.begin_open(ConversationId::new("a")).unwrap();
        let second = c.begin_open(ConversationId::new("a")).unwrap();
        assert_eq!(
            c.complete_open(&first, vec![msg("old", "a", 10)]),
            Err(ChatError::StaleResult)
        );
        c.complete_open(&second, vec![msg("new", "a", 10)]).unwrap();
        assert_eq!(log_ids(&c), vec!["new"]);
    }

    #[test]
    fn test_result_from_previous_session_is_dropped() {
        let (mut c, _) = ready();
        let ticket = c.begin_open(ConversationId::new("a")).unwrap();
        let next_session = Uuid::new_v4();
        c.begin_session(next_session);
        assert_eq!(
            c.complete_open(&ticket, vec![msg("a1", "a", 10)]),
            Err(ChatError::StaleResult)
        );
        assert_eq!(c.phase(), AttachPhase::Idle);
        assert!(c.directory().is_empty());
        assert_eq!(
            c.load_conversations(Uuid::new_v4(), vec![conv("a")]),
            Err(ChatError::StaleResult)
        );
    }

    #[test]
    fn test_active_conversation_unread_suppressed() {
        let (mut c, _) = ready();
        let ticket = c.begin_open(ConversationId::new("a")).unwrap();
        c.complete_open(&ticket, Vec::new()).unwrap();

        c.apply_push(msg("m1", "a", 10));
        c.apply_push(msg("m2", "b", 10));
        let dir = c.directory();
        assert_eq!(dir.get(&ConversationId::new("a")).unwrap().unread_count, 0);
        assert_eq!(dir.get(&ConversationId::new("b")).unwrap().unread_count, 1);
    }

    #[test]
    fn test_detach_clears_active() {
        let (mut c, _) = ready();
        let ticket = c.begin_open(ConversationId::new("a")).unwrap();
        c.complete_open(&ticket, Vec::new()).unwrap();
        assert!(c.detach());
        assert_eq!(c.phase(), AttachPhase::Idle);
        assert!(c.directory().active().is_none());

        c.apply_push(msg("m1", "a", 10));
        assert_eq!(
            c.directory().get(&ConversationId::new("a")).unwrap().unread_count,
            1
        );
    }

    #[test]
    fn test_failed_open_returns_to_idle() {
        let (mut c, _) = ready();
        let ticket = c.begin_open(ConversationId::new("a")).unwrap();
        assert!(c.fail_open(&ticket));
        assert_eq!(c.phase(), AttachPhase::Idle);
        assert!(c.directory().active().is_none());
    }

    #[test]
    fn test_older_page_merges_into_attached_log() {
        let (mut c, _) = ready();
        let ticket = c.begin_open(ConversationId::new("a")).unwrap();
        c.complete_open(&ticket, vec![msg("m3", "a", 30), msg("m4", "a", 40)])
            .unwrap();

        let older = c.begin_older().unwrap();
        assert_eq!(older.before, Some(Utc.timestamp_opt(1_700_000_030, 0).unwrap()));
        let added = c
            .complete_older(&older, vec![msg("m1", "a", 10), msg("m2", "a", 20)])
            .unwrap();
        assert_eq!(added, 2);
        assert_eq!(log_ids(&c), vec!["m1", "m2", "m3", "m4"]);
    }

    #[test]
    fn test_older_page_after_switch_is_stale() {
        let (mut c, _) = ready();
        let ticket = c.begin_open(ConversationId::new("a")).unwrap();
        c.complete_open(&ticket, vec![msg("m3", "a", 30)]).unwrap();
        let older = c.begin_older().unwrap();

        let next = c.begin_open(ConversationId::new("b")).unwrap();
        c.complete_open(&next, Vec::new()).unwrap();
        assert_eq!(
            c.complete_older(&older, vec![msg("m1", "a", 10)]),
            Err(ChatError::StaleResult)
        );
        assert!(log_ids(&c).is_empty());
    }

    #[test]
    fn test_older_requires_attached_log() {
        let (mut c, _) = ready();
        assert_eq!(c.begin_older(), Err(ChatError::NoActiveConversation));
        c.begin_open(ConversationId::new("a")).unwrap();
        assert_eq!(c.begin_older(), Err(ChatError::NoActiveConversation));
    }

    #[test]
    fn test_unknown_conversation_push_changes_nothing() {
        let (mut c, _) = ready();
        let before = c.directory().snapshot();
        let outcome = c.apply_push(msg("m1", "ghost", 10));
        assert_eq!(outcome, PushOutcome::default());
        assert_eq!(c.directory().snapshot(), before);
    }

    #[test]
    fn test_created_conversation_upsert() {
        let (mut c, session) = ready();
        assert_eq!(c.upsert_created(session, conv("new")), Ok(true));
        assert_eq!(c.upsert_created(session, conv("new")), Ok(false));
        assert_eq!(c.directory().len(), 3);
    }

    #[test]
    fn test_fetched_conversation_takes_attached_preview() {
        let (mut c, session) = ready();
        let ticket = c.begin_open(ConversationId::new("late")).unwrap();
        c.complete_open(&ticket, vec![msg("m1", "late", 10), msg("m2", "late", 20)])
            .unwrap();

        assert_eq!(c.upsert_created(session, conv("late")), Ok(true));
        let entry = c.directory().get(&ConversationId::new("late")).unwrap();
        assert_eq!(entry.last_message.as_ref().unwrap().id.as_str(), "m2");
        assert_eq!(entry.unread_count, 0);
    }

    #[test]
    fn test_mark_read_by_needs_attached_log_of_session() {
        let (mut c, session) = ready();
        let me = UserId::new("me");
        let ids = vec![MessageId::new("m1")];
        assert_eq!(c.mark_read_by(session, &ids, &me), 0);

        let ticket = c.begin_open(ConversationId::new("a")).unwrap();
        c.complete_open(&ticket, vec![msg("m1", "a", 10)]).unwrap();
        assert_eq!(c.mark_read_by(Uuid::new_v4(), &ids, &me), 0);
        assert_eq!(c.mark_read_by(session, &ids, &me), 1);
        assert_eq!(c.log().unwrap().to_sequence()[0].read_by, vec![me]);
    }
}
