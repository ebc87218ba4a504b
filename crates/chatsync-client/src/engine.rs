//! The sync engine task.
//!
//! One tokio task owns the [`SyncCoordinator`] and the push [`Channel`] and
//! is the only writer of either. Everything else reaches it through a
//! [`SyncHandle`]: commands go in over an mpsc queue, state comes back out
//! through watch projections and a broadcast of [`SyncEvent`]s.
//!
//! REST calls never run on the engine task. They are spawned, and whatever
//! has to touch state comes back as a completion tagged with the session
//! (and, for history, the open sequence number) it was started under.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use chatsync_net::{
    Channel, ChannelEvent, ChatApi, CreateConversationRequest, HistoryQuery, PushConnector,
    SearchQuery, SendMessageRequest,
};
use chatsync_shared::{
    ChannelStatus, ChatError, ChatResult, Conversation, ConversationId, Message, MessageId,
    Session, UserId,
};

use crate::config::{ClientConfig, RetryPolicy};
use crate::coordinator::{OlderTicket, OpenTicket, SyncCoordinator};
use crate::events::{emit_event, DirectorySnapshot, LogSnapshot, SyncEvent};
use crate::session::SessionContext;

type Reply<T> = oneshot::Sender<ChatResult<T>>;

enum Command {
    OpenConversation {
        id: ConversationId,
        reply: Reply<usize>,
    },
    CloseConversation {
        reply: Reply<()>,
    },
    SendMessage {
        request: SendMessageRequest,
        reply: Reply<Message>,
    },
    CreateConversation {
        request: CreateConversationRequest,
        reply: Reply<Conversation>,
    },
    RefreshConversations {
        reply: Reply<usize>,
    },
    LoadOlder {
        reply: Reply<usize>,
    },
    SearchMessages {
        query: SearchQuery,
        reply: Reply<Vec<Message>>,
    },
    MarkRead {
        message_ids: Vec<MessageId>,
        reply: Reply<()>,
    },
    Reconnect {
        reply: Reply<()>,
    },
    Shutdown,
}

/// Results of spawned work, applied on the engine task.
enum Completion {
    Listing {
        session_id: Uuid,
        result: ChatResult<Vec<Conversation>>,
        reply: Option<Reply<usize>>,
    },
    History {
        ticket: OpenTicket,
        result: ChatResult<Vec<Message>>,
    },
    Older {
        ticket: OlderTicket,
        result: ChatResult<Vec<Message>>,
        reply: Reply<usize>,
    },
    Created {
        session_id: Uuid,
        result: ChatResult<Conversation>,
        reply: Reply<Conversation>,
    },
    /// Summary of a conversation opened before the listing knew about it.
    Fetched {
        session_id: Uuid,
        user_id: UserId,
        result: ChatResult<Conversation>,
    },
    MarkedRead {
        session_id: Uuid,
        user_id: UserId,
        message_ids: Vec<MessageId>,
        result: ChatResult<()>,
        reply: Reply<()>,
    },
    /// A pass-through call was refused with a session-ending error.
    Rejected { session_id: Uuid, error: ChatError },
    RetryDue { session_id: Uuid },
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable front door to a running engine.
#[derive(Clone)]
pub struct SyncHandle {
    cmd_tx: mpsc::Sender<Command>,
    status: watch::Receiver<ChannelStatus>,
    directory: watch::Receiver<DirectorySnapshot>,
    active_log: watch::Receiver<Option<LogSnapshot>>,
    events: broadcast::Sender<SyncEvent>,
    session: SessionContext,
}

impl SyncHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> ChatResult<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| ChatError::EngineStopped)?;
        rx.await.map_err(|_| ChatError::EngineStopped)?
    }

    /// Make `id` the active conversation. Resolves once its history is
    /// attached, with the number of messages in the log. A request that is
    /// overtaken by a newer open resolves with `StaleResult`.
    pub async fn open_conversation(&self, id: ConversationId) -> ChatResult<usize> {
        self.request(|reply| Command::OpenConversation { id, reply })
            .await
    }

    /// Detach the active conversation, if any. An open still waiting for its
    /// history resolves with `StaleResult`.
    pub async fn close_conversation(&self) -> ChatResult<()> {
        self.request(|reply| Command::CloseConversation { reply })
            .await
    }

    /// Submit a message to the active conversation. The returned record is
    /// the server's acknowledgment; the log only changes when the pushed copy
    /// arrives.
    pub async fn send_message(&self, content: impl Into<String>) -> ChatResult<Message> {
        let request = SendMessageRequest {
            content: content.into(),
            attachments: Vec::new(),
        };
        self.request(|reply| Command::SendMessage { request, reply })
            .await
    }

    pub async fn create_conversation(
        &self,
        name: impl Into<String>,
        member_ids: Vec<UserId>,
    ) -> ChatResult<Conversation> {
        let request = CreateConversationRequest::new(name, member_ids);
        self.request(|reply| Command::CreateConversation { request, reply })
            .await
    }

    /// Reload the directory listing. Resolves with the number of conversations.
    pub async fn refresh_conversations(&self) -> ChatResult<usize> {
        self.request(|reply| Command::RefreshConversations { reply })
            .await
    }

    /// Fetch the page before the oldest loaded message. Resolves with how
    /// many messages were new to the log.
    pub async fn load_older(&self) -> ChatResult<usize> {
        self.request(|reply| Command::LoadOlder { reply }).await
    }

    pub async fn search_messages(
        &self,
        conversation_id: ConversationId,
        query: impl Into<String>,
    ) -> ChatResult<Vec<Message>> {
        let query = SearchQuery {
            conversation_id,
            query: query.into(),
            limit: None,
            offset: None,
        };
        self.request(|reply| Command::SearchMessages { query, reply })
            .await
    }

    /// Report `message_ids` as read. Once the server accepts, the local user
    /// is recorded as a reader on any of them in the open conversation's log.
    pub async fn mark_read(&self, message_ids: Vec<MessageId>) -> ChatResult<()> {
        self.request(|reply| Command::MarkRead { message_ids, reply })
            .await
    }

    /// Drop the push connection and open a fresh one.
    pub async fn reconnect(&self) -> ChatResult<()> {
        self.request(|reply| Command::Reconnect { reply }).await
    }

    /// Stop the engine and wait for it to exit.
    pub async fn shutdown(&self) {
        if self.cmd_tx.send(Command::Shutdown).await.is_ok() {
            self.cmd_tx.closed().await;
        }
    }

    pub fn status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    pub fn directory(&self) -> watch::Receiver<DirectorySnapshot> {
        self.directory.clone()
    }

    pub fn active_log(&self) -> watch::Receiver<Option<LogSnapshot>> {
        self.active_log.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct SyncEngine {
    config: ClientConfig,
    api: Arc<dyn ChatApi>,
    channel: Channel,
    session: SessionContext,
    session_rx: watch::Receiver<Option<Session>>,
    current: Option<Session>,
    coordinator: SyncCoordinator,
    pending_open: Option<(u64, Reply<usize>)>,
    last_status: ChannelStatus,
    retry_attempts: u32,
    cmd_rx: mpsc::Receiver<Command>,
    done_tx: mpsc::Sender<Completion>,
    done_rx: mpsc::Receiver<Completion>,
    directory_tx: watch::Sender<DirectorySnapshot>,
    log_tx: watch::Sender<Option<LogSnapshot>>,
    events: broadcast::Sender<SyncEvent>,
}

/// Start the engine on the current tokio runtime.
///
/// The engine follows `session`: it starts syncing whenever a session is
/// present and tears everything down whenever it changes or is cleared.
pub fn spawn_engine(
    config: ClientConfig,
    api: Arc<dyn ChatApi>,
    connector: Arc<dyn PushConnector>,
    session: SessionContext,
) -> SyncHandle {
    let buffer = config.event_buffer.max(1);
    let (cmd_tx, cmd_rx) = mpsc::channel(buffer);
    let (done_tx, done_rx) = mpsc::channel(buffer);
    let (directory_tx, directory_rx) = watch::channel(DirectorySnapshot::default());
    let (log_tx, log_rx) = watch::channel(None);
    let (events, _) = broadcast::channel(buffer);

    let channel = Channel::new(connector, buffer);
    let status = channel.status();

    let engine = SyncEngine {
        config,
        api,
        channel,
        session_rx: session.subscribe(),
        session: session.clone(),
        current: None,
        coordinator: SyncCoordinator::new(),
        pending_open: None,
        last_status: ChannelStatus::Disconnected,
        retry_attempts: 0,
        cmd_rx,
        done_tx,
        done_rx,
        directory_tx,
        log_tx,
        events: events.clone(),
    };
    tokio::spawn(engine.run());

    SyncHandle {
        cmd_tx,
        status,
        directory: directory_rx,
        active_log: log_rx,
        events,
        session,
    }
}

impl SyncEngine {
    async fn run(mut self) {
        info!("Sync engine started");
        self.apply_session();
        self.publish();

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if !self.handle_command(cmd) {
                                break;
                            }
                        }
                        None => {
                            debug!("All sync handles dropped");
                            break;
                        }
                    }
                }

                Some(done) = self.done_rx.recv() => {
                    self.handle_completion(done);
                }

                Some(event) = self.channel.next_event() => {
                    self.handle_channel_event(event);
                }

                changed = self.session_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.apply_session();
                }
            }
            self.publish();
        }

        self.end_session(None);
        self.publish();
        info!("Sync engine stopped");
    }

    // -- Session lifecycle --

    fn apply_session(&mut self) {
        let next = self.session_rx.borrow_and_update().clone();
        let unchanged = match (&self.current, &next) {
            (Some(current), Some(next)) => current.id == next.id,
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return;
        }

        self.end_session(None);
        if let Some(session) = next {
            self.start_session(session);
        }
    }

    fn start_session(&mut self, session: Session) {
        info!(session = %session.id, user = %session.user_id, "Starting sync for session");
        self.coordinator.begin_session(session.id);
        self.retry_attempts = 0;
        self.channel.open(&session);
        emit_event(
            &self.events,
            SyncEvent::SessionStarted {
                user_id: session.user_id.clone(),
            },
        );
        self.spawn_listing(&session, None);
        self.current = Some(session);
    }

    fn end_session(&mut self, reason: Option<ChatError>) {
        let Some(session) = self.current.take() else {
            return;
        };
        info!(session = %session.id, "Tearing down session");
        self.close_channel();
        self.coordinator.end_session();
        if let Some((_, reply)) = self.pending_open.take() {
            let _ = reply.send(Err(ChatError::NoSession));
        }
        emit_event(&self.events, SyncEvent::SessionEnded { reason });
    }

    /// End the session if `error` rejects the credential it was made with.
    fn check_rejected(&mut self, session_id: Uuid, error: &ChatError) {
        if !error.ends_session() {
            return;
        }
        if self.current.as_ref().map(|s| s.id) != Some(session_id) {
            return;
        }
        warn!(session = %session_id, error = %error, "Credential rejected, ending session");
        self.end_session(Some(error.clone()));
        if self
            .session
            .current()
            .is_some_and(|s| s.id == session_id)
        {
            self.session.clear();
        }
    }

    // -- Channel --

    fn close_channel(&mut self) {
        self.channel.close();
        self.note_status(ChannelStatus::Disconnected);
    }

    /// Record a status transition. Returns whether it was new.
    fn note_status(&mut self, status: ChannelStatus) -> bool {
        if status == self.last_status {
            return false;
        }
        self.last_status = status;
        info!(status = %status, "Push channel status changed");
        emit_event(&self.events, SyncEvent::StatusChanged(status));
        true
    }

    fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Status(status) => {
                if !self.note_status(status) {
                    return;
                }
                match status {
                    ChannelStatus::Connected => self.retry_attempts = 0,
                    ChannelStatus::Disconnected => self.schedule_retry(),
                    _ => {}
                }
            }
            ChannelEvent::Message(message) => {
                let outcome = self.coordinator.apply_push(message.clone());
                debug!(
                    message = %message.id,
                    conversation = %message.conversation_id,
                    directory = outcome.directory_changed,
                    queued = outcome.queued,
                    appended = outcome.appended,
                    "Applied push message"
                );
                if outcome.directory_changed || outcome.queued || outcome.appended {
                    emit_event(&self.events, SyncEvent::MessageReceived(message));
                }
            }
        }
    }

    fn schedule_retry(&mut self) {
        let Some(session) = &self.current else {
            return;
        };
        let Some(delay) = self.config.retry.delay_for(self.retry_attempts) else {
            if self.config.retry != RetryPolicy::Never {
                warn!(attempts = self.retry_attempts, "Giving up on push reconnect");
            }
            return;
        };
        self.retry_attempts += 1;
        info!(
            attempt = self.retry_attempts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling push reconnect"
        );

        let session_id = session.id;
        self.spawn_completion(async move {
            tokio::time::sleep(delay).await;
            Completion::RetryDue { session_id }
        });
    }

    // -- Commands --

    /// Returns `false` when the engine should stop.
    fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::OpenConversation { id, reply } => self.open_conversation(id, reply),
            Command::CloseConversation { reply } => {
                if self.coordinator.detach() {
                    info!("Conversation closed");
                }
                if let Some((seq, abandoned)) = self.pending_open.take() {
                    debug!(seq, "Open request abandoned by close");
                    let _ = abandoned.send(Err(ChatError::StaleResult));
                }
                let _ = reply.send(Ok(()));
            }
            Command::SendMessage { request, reply } => self.send_message(request, reply),
            Command::CreateConversation { request, reply } => {
                let Some(session) = self.current.clone() else {
                    let _ = reply.send(Err(ChatError::NoSession));
                    return true;
                };
                let api = self.api.clone();
                self.spawn_completion(async move {
                    let result = api.create_conversation(&session, &request).await;
                    Completion::Created {
                        session_id: session.id,
                        result,
                        reply,
                    }
                });
            }
            Command::RefreshConversations { reply } => match self.current.clone() {
                Some(session) => self.spawn_listing(&session, Some(reply)),
                None => {
                    let _ = reply.send(Err(ChatError::NoSession));
                }
            },
            Command::LoadOlder { reply } => self.load_older(reply),
            Command::SearchMessages { query, reply } => {
                let Some(session) = self.current.clone() else {
                    let _ = reply.send(Err(ChatError::NoSession));
                    return true;
                };
                let api = self.api.clone();
                self.spawn_call(session.id, reply, async move {
                    api.search_messages(&session, &query).await
                });
            }
            Command::MarkRead { message_ids, reply } => {
                let Some(session) = self.current.clone() else {
                    let _ = reply.send(Err(ChatError::NoSession));
                    return true;
                };
                let api = self.api.clone();
                self.spawn_completion(async move {
                    let result = api.mark_as_read(&session, &message_ids).await;
                    Completion::MarkedRead {
                        session_id: session.id,
                        user_id: session.user_id.clone(),
                        message_ids,
                        result,
                        reply,
                    }
                });
            }
            Command::Reconnect { reply } => {
                let Some(session) = self.current.clone() else {
                    let _ = reply.send(Err(ChatError::NoSession));
                    return true;
                };
                info!(session = %session.id, "Reconnecting push channel");
                self.close_channel();
                self.retry_attempts = 0;
                self.channel.open(&session);
                let _ = reply.send(Ok(()));
            }
            Command::Shutdown => return false,
        }
        true
    }

    fn open_conversation(&mut self, id: ConversationId, reply: Reply<usize>) {
        let Some(session) = self.current.clone() else {
            let _ = reply.send(Err(ChatError::NoSession));
            return;
        };
        let ticket = match self.coordinator.begin_open(id) {
            Ok(ticket) => ticket,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        if let Some((seq, superseded)) = self.pending_open.replace((ticket.seq, reply)) {
            debug!(seq, "Open request superseded");
            let _ = superseded.send(Err(ChatError::StaleResult));
        }
        info!(conversation = %ticket.conversation_id, seq = ticket.seq, "Opening conversation");

        if self.coordinator.directory().get(&ticket.conversation_id).is_none() {
            self.spawn_fetch(&session, ticket.conversation_id.clone());
        }

        let api = self.api.clone();
        let query = HistoryQuery::latest(self.config.history_page_size);
        self.spawn_completion(async move {
            let result = api
                .fetch_history(&session, &ticket.conversation_id, &query)
                .await;
            Completion::History { ticket, result }
        });
    }

    fn send_message(&mut self, request: SendMessageRequest, reply: Reply<Message>) {
        let Some(session) = self.current.clone() else {
            let _ = reply.send(Err(ChatError::NoSession));
            return;
        };
        let Some(conversation_id) = self.coordinator.active_conversation().cloned() else {
            let _ = reply.send(Err(ChatError::NoActiveConversation));
            return;
        };

        debug!(conversation = %conversation_id, "Sending message");
        let api = self.api.clone();
        self.spawn_call(session.id, reply, async move {
            api.send_message(&session, &conversation_id, &request).await
        });
    }

    fn load_older(&mut self, reply: Reply<usize>) {
        let Some(session) = self.current.clone() else {
            let _ = reply.send(Err(ChatError::NoSession));
            return;
        };
        let ticket = match self.coordinator.begin_older() {
            Ok(ticket) => ticket,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let page = self.config.history_page_size;
        let query = match ticket.before {
            Some(before) => HistoryQuery::before(page, before),
            None => HistoryQuery::latest(page),
        };
        debug!(conversation = %ticket.conversation_id, before = ?ticket.before, "Loading older history");

        let api = self.api.clone();
        self.spawn_completion(async move {
            let result = api
                .fetch_history(&session, &ticket.conversation_id, &query)
                .await;
            Completion::Older {
                ticket,
                result,
                reply,
            }
        });
    }

    // -- Completions --

    fn handle_completion(&mut self, done: Completion) {
        match done {
            Completion::Listing {
                session_id,
                result,
                reply,
            } => {
                let outcome = match result {
                    Ok(list) => self.coordinator.load_conversations(session_id, list),
                    Err(e) => {
                        warn!(error = %e, "Failed to load conversations");
                        self.check_rejected(session_id, &e);
                        Err(e)
                    }
                };
                match &outcome {
                    Ok(count) => {
                        info!(conversations = count, "Conversation directory loaded");
                        emit_event(
                            &self.events,
                            SyncEvent::DirectoryLoaded {
                                conversations: *count,
                            },
                        );
                    }
                    Err(ChatError::StaleResult) => debug!("Dropping stale conversation listing"),
                    Err(_) => {}
                }
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }

            Completion::History { ticket, result } => match result {
                Ok(history) => match self.coordinator.complete_open(&ticket, history) {
                    Ok(messages) => {
                        self.reply_open(ticket.seq, Ok(messages));
                        emit_event(
                            &self.events,
                            SyncEvent::ConversationOpened {
                                conversation_id: ticket.conversation_id,
                                messages,
                            },
                        );
                    }
                    Err(_) => debug!(
                        conversation = %ticket.conversation_id,
                        seq = ticket.seq,
                        "Dropping stale history"
                    ),
                },
                Err(error) => {
                    if self.coordinator.fail_open(&ticket) {
                        warn!(
                            conversation = %ticket.conversation_id,
                            error = %error,
                            "Failed to open conversation"
                        );
                        self.reply_open(ticket.seq, Err(error.clone()));
                        emit_event(
                            &self.events,
                            SyncEvent::OpenFailed {
                                conversation_id: ticket.conversation_id.clone(),
                                error: error.clone(),
                            },
                        );
                    }
                    self.check_rejected(ticket.session_id, &error);
                }
            },

            Completion::Older {
                ticket,
                result,
                reply,
            } => {
                let outcome = match result {
                    Ok(page) => self.coordinator.complete_older(&ticket, page),
                    Err(e) => {
                        warn!(conversation = %ticket.conversation_id, error = %e, "Failed to load older history");
                        self.check_rejected(ticket.session_id, &e);
                        Err(e)
                    }
                };
                let _ = reply.send(outcome);
            }

            Completion::Created {
                session_id,
                result,
                reply,
            } => {
                match &result {
                    Ok(conversation) => {
                        match self
                            .coordinator
                            .upsert_created(session_id, conversation.clone())
                        {
                            Ok(true) => {
                                info!(conversation = %conversation.id, "Conversation created")
                            }
                            Ok(false) => {}
                            Err(_) => debug!("Dropping conversation created under old session"),
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to create conversation");
                        self.check_rejected(session_id, e);
                    }
                }
                let _ = reply.send(result);
            }

            Completion::Fetched {
                session_id,
                user_id,
                result,
            } => match result {
                Ok(conversation) if conversation.has_member(&user_id) => {
                    if let Ok(true) = self.coordinator.upsert_created(session_id, conversation) {
                        debug!("Added opened conversation to directory");
                    }
                }
                Ok(conversation) => {
                    warn!(
                        conversation = %conversation.id,
                        user = %user_id,
                        "Not a member of opened conversation"
                    );
                }
                Err(e) => {
                    debug!(error = %e, "Failed to fetch opened conversation");
                    self.check_rejected(session_id, &e);
                }
            },

            Completion::MarkedRead {
                session_id,
                user_id,
                message_ids,
                result,
                reply,
            } => {
                match &result {
                    Ok(()) => {
                        let marked = self
                            .coordinator
                            .mark_read_by(session_id, &message_ids, &user_id);
                        debug!(requested = message_ids.len(), marked, "Messages marked as read");
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to mark messages as read");
                        self.check_rejected(session_id, e);
                    }
                }
                let _ = reply.send(result);
            }

            Completion::Rejected { session_id, error } => {
                self.check_rejected(session_id, &error);
            }

            Completion::RetryDue { session_id } => {
                let Some(session) = self.current.clone() else {
                    return;
                };
                if session.id == session_id && !self.channel.is_open_for(&session) {
                    info!(session = %session.id, "Retrying push connection");
                    self.channel.open(&session);
                }
            }
        }
    }

    fn reply_open(&mut self, seq: u64, result: ChatResult<usize>) {
        if self
            .pending_open
            .as_ref()
            .is_some_and(|(pending, _)| *pending == seq)
        {
            if let Some((_, reply)) = self.pending_open.take() {
                let _ = reply.send(result);
            }
        }
    }

    // -- Spawned work --

    fn spawn_listing(&self, session: &Session, reply: Option<Reply<usize>>) {
        let api = self.api.clone();
        let session = session.clone();
        self.spawn_completion(async move {
            let result = api.fetch_conversations(&session).await;
            Completion::Listing {
                session_id: session.id,
                result,
                reply,
            }
        });
    }

    fn spawn_fetch(&self, session: &Session, conversation_id: ConversationId) {
        let api = self.api.clone();
        let session = session.clone();
        self.spawn_completion(async move {
            let result = api.fetch_conversation(&session, &conversation_id).await;
            Completion::Fetched {
                session_id: session.id,
                user_id: session.user_id.clone(),
                result,
            }
        });
    }

    fn spawn_completion<F>(&self, task: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let done = self.done_tx.clone();
        tokio::spawn(async move {
            let completion = task.await;
            let _ = done.send(completion).await;
        });
    }

    /// Run a call whose result goes straight back to the caller. Only a
    /// rejected credential is reported to the engine.
    fn spawn_call<T, F>(&self, session_id: Uuid, reply: Reply<T>, call: F)
    where
        T: Send + 'static,
        F: Future<Output = ChatResult<T>> + Send + 'static,
    {
        let done = self.done_tx.clone();
        tokio::spawn(async move {
            let result = call.await;
            if let Err(error) = &result {
                if error.ends_session() {
                    let _ = done
                        .send(Completion::Rejected {
                            session_id,
                            error: error.clone(),
                        })
                        .await;
                }
            }
            let _ = reply.send(result);
        });
    }

    // -- Observers --

    fn publish(&self) {
        let directory = DirectorySnapshot::of(&self.coordinator);
        self.directory_tx.send_if_modified(|current| {
            if *current == directory {
                false
            } else {
                *current = directory;
                true
            }
        });

        let log = LogSnapshot::of(&self.coordinator);
        self.log_tx.send_if_modified(|current| {
            if *current == log {
                false
            } else {
                *current = log;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use futures::StreamExt;

    use chatsync_net::{FrameStream, NetError, NetResult};
    use chatsync_shared::{ConversationKind, Member, PushEvent};

    use super::*;
    use crate::coordinator::AttachPhase;

    const WAIT: Duration = Duration::from_secs(2);

    struct HistoryCall {
        conversation_id: ConversationId,
        query: HistoryQuery,
        respond: oneshot::Sender<ChatResult<Vec<Message>>>,
    }

    /// Chat service double. History calls are handed to the test, which
    /// answers them whenever it likes.
    struct FakeApi {
        conversations: Mutex<ChatResult<Vec<Conversation>>>,
        history_tx: mpsc::UnboundedSender<HistoryCall>,
        sent: Mutex<Vec<(ConversationId, String)>>,
        read: Mutex<Vec<MessageId>>,
    }

    #[async_trait]
    impl ChatApi for FakeApi {
        async fn fetch_conversations(&self, _session: &Session) -> ChatResult<Vec<Conversation>> {
            self.conversations.lock().unwrap().clone()
        }

        async fn fetch_conversation(
            &self,
            session: &Session,
            id: &ConversationId,
        ) -> ChatResult<Conversation> {
            let mut found = conv(id.as_str());
            if id.as_str() != "foreign" {
                found.members.push(Member {
                    user_id: session.user_id.clone(),
                    role: "member".into(),
                    joined_at: found.created_at,
                });
            }
            Ok(found)
        }

        async fn fetch_history(
            &self,
            _session: &Session,
            id: &ConversationId,
            query: &HistoryQuery,
        ) -> ChatResult<Vec<Message>> {
            let (respond, rx) = oneshot::channel();
            let _ = self.history_tx.send(HistoryCall {
                conversation_id: id.clone(),
                query: query.clone(),
                respond,
            });
            rx.await
                .unwrap_or_else(|_| Err(ChatError::Transport("dropped".into())))
        }

        async fn send_message(
            &self,
            _session: &Session,
            id: &ConversationId,
            request: &SendMessageRequest,
        ) -> ChatResult<Message> {
            self.sent
                .lock()
                .unwrap()
                .push((id.clone(), request.content.clone()));
            let mut ack = msg("ack", id.as_str(), 99);
            ack.content = request.content.clone();
            Ok(ack)
        }

        async fn create_conversation(
            &self,
            _session: &Session,
            request: &CreateConversationRequest,
        ) -> ChatResult<Conversation> {
            Ok(conv(&format!("new-{}", request.name)))
        }

        async fn search_messages(
            &self,
            _session: &Session,
            query: &SearchQuery,
        ) -> ChatResult<Vec<Message>> {
            if query.query == "forbidden" {
                return Err(ChatError::NotAuthorized);
            }
            let mut hit = msg("hit", query.conversation_id.as_str(), 1);
            hit.content = query.query.clone();
            Ok(vec![hit])
        }

        async fn mark_as_read(&self, _session: &Session, message_ids: &[MessageId]) -> ChatResult<()> {
            self.read.lock().unwrap().extend_from_slice(message_ids);
            Ok(())
        }
    }

    type FrameTx = mpsc::UnboundedSender<NetResult<String>>;

    struct FakeConnector {
        scripts: Mutex<VecDeque<mpsc::UnboundedReceiver<NetResult<String>>>>,
        connects: AtomicUsize,
    }

    impl FakeConnector {
        fn accept(&self) -> FrameTx {
            let (tx, rx) = mpsc::unbounded_channel();
            self.scripts.lock().unwrap().push_back(rx);
            tx
        }
    }

    #[async_trait]
    impl PushConnector for FakeConnector {
        async fn connect(&self, _session: &Session) -> NetResult<FrameStream> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let script = self.scripts.lock().unwrap().pop_front();
            match script {
                Some(rx) => Ok(futures::stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|frame| (frame, rx))
                })
                .boxed()),
                None => Err(NetError::InvalidUrl("connection refused".into())),
            }
        }
    }

    struct Harness {
        handle: SyncHandle,
        api: Arc<FakeApi>,
        connector: Arc<FakeConnector>,
        history: mpsc::UnboundedReceiver<HistoryCall>,
        push: FrameTx,
        session: SessionContext,
    }

    impl Harness {
        async fn start(conversations: Vec<Conversation>) -> Self {
            Self::start_with(ClientConfig::default(), conversations).await
        }

        async fn start_with(config: ClientConfig, conversations: Vec<Conversation>) -> Self {
            let (history_tx, history) = mpsc::unbounded_channel();
            let expected = conversations.len();
            let api = Arc::new(FakeApi {
                conversations: Mutex::new(Ok(conversations)),
                history_tx,
                sent: Mutex::new(Vec::new()),
                read: Mutex::new(Vec::new()),
            });
            let connector = Arc::new(FakeConnector {
                scripts: Mutex::new(VecDeque::new()),
                connects: AtomicUsize::new(0),
            });
            let push = connector.accept();

            let session = SessionContext::default();
            session.begin("token", UserId::new("me"));
            let handle = spawn_engine(config, api.clone(), connector.clone(), session.clone());

            wait(handle.status(), |s| *s == ChannelStatus::Connected).await;
            wait(handle.directory(), |d| d.conversations.len() == expected).await;

            Self {
                handle,
                api,
                connector,
                history,
                push,
                session,
            }
        }

        async fn next_history(&mut self) -> HistoryCall {
            tokio::time::timeout(WAIT, self.history.recv())
                .await
                .expect("history request expected")
                .expect("api alive")
        }

        fn push(&self, message: &Message) {
            let frame = PushEvent::Message {
                message: message.clone(),
            }
            .to_json()
            .unwrap();
            self.push.send(Ok(frame)).unwrap();
        }

        /// Open `id` and answer its history fetch with `history`.
        async fn open(&mut self, id: &str, history: Vec<Message>) -> usize {
            let handle = self.handle.clone();
            let id = ConversationId::new(id);
            let opening = tokio::spawn(async move { handle.open_conversation(id).await });
            let call = self.next_history().await;
            call.respond.send(Ok(history)).unwrap();
            opening.await.unwrap().unwrap()
        }

        fn log_ids(&self) -> Vec<String> {
            self.handle
                .active_log()
                .borrow()
                .as_ref()
                .map(|log| log.messages.iter().map(|m| m.id.to_string()).collect())
                .unwrap_or_default()
        }

        fn unread(&self, id: &str) -> u32 {
            self.handle
                .directory()
                .borrow()
                .conversations
                .iter()
                .find(|c| c.id.as_str() == id)
                .map(|c| c.unread_count)
                .unwrap_or_default()
        }
    }

    async fn wait<T>(mut rx: watch::Receiver<T>, cond: impl FnMut(&T) -> bool) {
        tokio::time::timeout(WAIT, rx.wait_for(cond))
            .await
            .expect("condition not reached in time")
            .map(|_| ())
            .expect("engine stopped");
    }

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

    fn preview(snapshot: &DirectorySnapshot, id: &str) -> Option<String> {
        snapshot
            .conversations
            .iter()
            .find(|c| c.id.as_str() == id)
            .and_then(|c| c.last_message.as_ref())
            .map(|m| m.id.to_string())
    }

    #[tokio::test]
    async fn test_startup_loads_directory_and_connects() {
        let h = Harness::start(vec![conv("a"), conv("b")]).await;
        assert_eq!(h.handle.directory().borrow().conversations.len(), 2);
        assert!(h.handle.active_log().borrow().is_none());
        assert_eq!(h.connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_push_during_attach_lands_in_log() {
        let mut h = Harness::start(vec![conv("a")]).await;

        let handle = h.handle.clone();
        let opening =
            tokio::spawn(async move { handle.open_conversation(ConversationId::new("a")).await });
        let call = h.next_history().await;
        assert_eq!(call.conversation_id.as_str(), "a");
        assert_eq!(call.query.limit, Some(50));

        h.push(&msg("p", "a", 15));
        wait(h.handle.directory(), |d| preview(d, "a").as_deref() == Some("p")).await;
        assert_eq!(
            h.handle.active_log().borrow().as_ref().map(|l| l.phase),
            Some(AttachPhase::Attaching)
        );

        call.respond
            .send(Ok(vec![msg("m2", "a", 20), msg("m1", "a", 10)]))
            .unwrap();
        assert_eq!(opening.await.unwrap(), Ok(3));
        assert_eq!(h.log_ids(), vec!["m1", "p", "m2"]);
        assert_eq!(h.unread("a"), 0);
    }

    #[tokio::test]
    async fn test_newer_open_supersedes_older() {
        let mut h = Harness::start(vec![conv("a"), conv("b")]).await;

        let handle = h.handle.clone();
        let first =
            tokio::spawn(async move { handle.open_conversation(ConversationId::new("a")).await });
        let call_a = h.next_history().await;

        let handle = h.handle.clone();
        let second =
            tokio::spawn(async move { handle.open_conversation(ConversationId::new("b")).await });
        let call_b = h.next_history().await;

        assert_eq!(first.await.unwrap(), Err(ChatError::StaleResult));
        call_b.respond.send(Ok(vec![msg("b1", "b", 10)])).unwrap();
        assert_eq!(second.await.unwrap(), Ok(1));

        call_a.respond.send(Ok(vec![msg("a1", "a", 10)])).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.log_ids(), vec!["b1"]);
        assert_eq!(
            h.handle.directory().borrow().active,
            Some(ConversationId::new("b"))
        );
    }

    #[tokio::test]
    async fn test_unread_only_for_inactive_conversations() {
        let mut h = Harness::start(vec![conv("a"), conv("b")]).await;
        h.open("a", Vec::new()).await;

        h.push(&msg("m1", "a", 10));
        h.push(&msg("m2", "b", 10));
        wait(h.handle.directory(), |d| preview(d, "b").is_some()).await;

        assert_eq!(h.unread("a"), 0);
        assert_eq!(h.unread("b"), 1);
        assert_eq!(h.log_ids(), vec!["m1"]);
    }

    #[tokio::test]
    async fn test_unknown_conversation_push_is_dropped() {
        let h = Harness::start(vec![conv("a")]).await;
        let before = h.handle.directory().borrow().clone();

        h.push(&msg("x", "ghost", 10));
        h.push(&msg("m1", "a", 20));
        wait(h.handle.directory(), |d| preview(d, "a").is_some()).await;

        let after = h.handle.directory().borrow().clone();
        assert_eq!(after.conversations.len(), before.conversations.len());
        assert!(after.conversations.iter().all(|c| c.id.as_str() != "ghost"));
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        let mut h = Harness::start(vec![conv("a")]).await;
        h.open("a", Vec::new()).await;

        h.push.send(Ok("not json".into())).unwrap();
        h.push(&msg("m1", "a", 10));
        wait(h.handle.active_log(), |l| {
            l.as_ref().is_some_and(|l| l.messages.len() == 1)
        })
        .await;
        assert_eq!(*h.handle.status().borrow(), ChannelStatus::Connected);
    }

    #[tokio::test]
    async fn test_send_waits_for_pushed_copy() {
        let mut h = Harness::start(vec![conv("a")]).await;
        h.open("a", vec![msg("m1", "a", 10)]).await;

        let ack = h.handle.send_message("hello").await.unwrap();
        assert_eq!(ack.content, "hello");
        assert_eq!(
            h.api.sent.lock().unwrap().clone(),
            vec![(ConversationId::new("a"), "hello".to_string())]
        );
        assert_eq!(h.log_ids(), vec!["m1"]);

        h.push(&ack);
        wait(h.handle.active_log(), |l| {
            l.as_ref().is_some_and(|l| l.messages.len() == 2)
        })
        .await;
        assert_eq!(h.log_ids(), vec!["m1", "ack"]);
    }

    #[tokio::test]
    async fn test_send_without_open_conversation() {
        let h = Harness::start(vec![conv("a")]).await;
        assert_eq!(
            h.handle.send_message("hello").await,
            Err(ChatError::NoActiveConversation)
        );
    }

    #[tokio::test]
    async fn test_not_authorized_ends_session() {
        let mut h = Harness::start(vec![conv("a")]).await;
        let mut events = h.handle.subscribe();

        let handle = h.handle.clone();
        let opening =
            tokio::spawn(async move { handle.open_conversation(ConversationId::new("a")).await });
        let call = h.next_history().await;
        call.respond.send(Err(ChatError::NotAuthorized)).unwrap();

        assert_eq!(opening.await.unwrap(), Err(ChatError::NotAuthorized));
        wait(h.handle.status(), |s| *s == ChannelStatus::Disconnected).await;
        wait(h.handle.directory(), |d| d.conversations.is_empty()).await;
        assert!(h.session.current().is_none());

        let mut ended = false;
        while let Ok(event) = events.try_recv() {
            if event
                == (SyncEvent::SessionEnded {
                    reason: Some(ChatError::NotAuthorized),
                })
            {
                ended = true;
            }
        }
        assert!(ended);
        assert_eq!(
            h.handle.refresh_conversations().await,
            Err(ChatError::NoSession)
        );
    }

    #[tokio::test]
    async fn test_rejected_pass_through_call_ends_session() {
        let h = Harness::start(vec![conv("a")]).await;
        assert_eq!(
            h.handle
                .search_messages(ConversationId::new("a"), "forbidden")
                .await,
            Err(ChatError::NotAuthorized)
        );
        wait(h.handle.directory(), |d| d.conversations.is_empty()).await;
        assert!(h.session.current().is_none());
    }

    #[tokio::test]
    async fn test_logout_tears_down_and_new_login_restarts() {
        let mut h = Harness::start(vec![conv("a")]).await;
        h.open("a", vec![msg("m1", "a", 10)]).await;

        h.session.clear();
        wait(h.handle.active_log(), |l| l.is_none()).await;
        wait(h.handle.directory(), |d| d.conversations.is_empty()).await;
        assert_eq!(*h.handle.status().borrow(), ChannelStatus::Disconnected);

        let _frames = h.connector.accept();
        h.session.begin("token-2", UserId::new("me"));
        wait(h.handle.status(), |s| *s == ChannelStatus::Connected).await;
        wait(h.handle.directory(), |d| d.conversations.len() == 1).await;
        assert_eq!(h.connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_history_from_old_session_is_discarded() {
        let mut h = Harness::start(vec![conv("a")]).await;

        let handle = h.handle.clone();
        let opening =
            tokio::spawn(async move { handle.open_conversation(ConversationId::new("a")).await });
        let call = h.next_history().await;

        let _frames = h.connector.accept();
        h.session.begin("token-2", UserId::new("me"));
        assert_eq!(opening.await.unwrap(), Err(ChatError::NoSession));

        call.respond.send(Ok(vec![msg("m1", "a", 10)])).unwrap();
        wait(h.handle.directory(), |d| d.conversations.len() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.handle.active_log().borrow().is_none());
    }

    #[tokio::test]
    async fn test_load_older_merges_page() {
        let mut h = Harness::start(vec![conv("a")]).await;
        h.open("a", vec![msg("m3", "a", 30), msg("m4", "a", 40)]).await;

        let handle = h.handle.clone();
        let loading = tokio::spawn(async move { handle.load_older().await });
        let call = h.next_history().await;
        assert_eq!(
            call.query.before,
            Some(Utc.timestamp_opt(1_700_000_030, 0).unwrap())
        );
        call.respond
            .send(Ok(vec![msg("m1", "a", 10), msg("m2", "a", 20)]))
            .unwrap();

        assert_eq!(loading.await.unwrap(), Ok(2));
        assert_eq!(h.log_ids(), vec!["m1", "m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn test_create_conversation_added_to_directory() {
        let h = Harness::start(vec![conv("a")]).await;
        let created = h
            .handle
            .create_conversation("team", vec![UserId::new("u2"), UserId::new("u3")])
            .await
            .unwrap();
        assert_eq!(created.id.as_str(), "new-team");
        wait(h.handle.directory(), |d| d.conversations.len() == 2).await;
    }

    #[tokio::test]
    async fn test_mark_read_is_explicit() {
        let mut h = Harness::start(vec![conv("a")]).await;
        h.open("a", vec![msg("m1", "a", 10)]).await;
        assert!(h.api.read.lock().unwrap().is_empty());

        h.handle
            .mark_read(vec![MessageId::new("m1")])
            .await
            .unwrap();
        assert_eq!(h.api.read.lock().unwrap().clone(), vec![MessageId::new("m1")]);

        wait(h.handle.active_log(), |log| {
            log.as_ref()
                .is_some_and(|log| log.messages[0].read_by == vec![UserId::new("me")])
        })
        .await;
    }

    #[tokio::test]
    async fn test_close_while_attaching_resolves_open_as_stale() {
        let mut h = Harness::start(vec![conv("a")]).await;

        let handle = h.handle.clone();
        let opening =
            tokio::spawn(async move { handle.open_conversation(ConversationId::new("a")).await });
        let call = h.next_history().await;

        h.handle.close_conversation().await.unwrap();
        assert_eq!(opening.await.unwrap(), Err(ChatError::StaleResult));

        call.respond.send(Ok(vec![msg("a1", "a", 10)])).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.handle.active_log().borrow().is_none());
        assert_eq!(h.handle.directory().borrow().active, None);
    }

    #[tokio::test]
    async fn test_duplicate_push_counts_unread_once() {
        let h = Harness::start(vec![conv("a")]).await;

        h.push(&msg("m1", "a", 10));
        h.push(&msg("m2", "a", 20));
        h.push(&msg("m1", "a", 10));
        h.push(&msg("m3", "a", 30));
        wait(h.handle.directory(), |d| preview(d, "a").as_deref() == Some("m3")).await;

        assert_eq!(h.unread("a"), 3);
    }

    #[tokio::test]
    async fn test_opening_unlisted_conversation_adds_it() {
        let mut h = Harness::start(vec![conv("a")]).await;
        h.open("late", vec![msg("l1", "late", 10)]).await;

        wait(h.handle.directory(), |d| preview(d, "late").is_some()).await;
        let snapshot = h.handle.directory().borrow().clone();
        assert_eq!(snapshot.conversations.len(), 2);
        assert_eq!(preview(&snapshot, "late").as_deref(), Some("l1"));
        assert_eq!(h.unread("late"), 0);

        // A conversation that does not list the local user stays out.
        h.open("foreign", Vec::new()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.handle.directory().borrow().conversations.len(), 2);
    }

    #[tokio::test]
    async fn test_no_automatic_reconnect_by_default() {
        let h = Harness::start(vec![conv("a")]).await;
        drop(h.push);
        wait(h.handle.status(), |s| *s == ChannelStatus::Disconnected).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.connector.connects.load(Ordering::SeqCst), 1);

        let _frames = h.connector.accept();
        h.handle.reconnect().await.unwrap();
        wait(h.handle.status(), |s| *s == ChannelStatus::Connected).await;
        assert_eq!(h.connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_backoff_policy_reconnects() {
        let config = ClientConfig {
            retry: RetryPolicy::Backoff {
                base: Duration::from_millis(10),
                max: Duration::from_millis(50),
                max_attempts: 3,
            },
            ..ClientConfig::default()
        };
        let h = Harness::start_with(config, vec![conv("a")]).await;
        let _next = h.connector.accept();
        let mut events = h.handle.subscribe();

        drop(h.push);
        let mut seen = Vec::new();
        while seen.last() != Some(&ChannelStatus::Connected) {
            let event = tokio::time::timeout(WAIT, events.recv())
                .await
                .expect("status event expected")
                .unwrap();
            if let SyncEvent::StatusChanged(status) = event {
                seen.push(status);
            }
        }
        assert_eq!(
            seen,
            vec![
                ChannelStatus::Disconnected,
                ChannelStatus::Connecting,
                ChannelStatus::Connected
            ]
        );
        assert_eq!(h.connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_engine() {
        let h = Harness::start(vec![conv("a")]).await;
        h.handle.shutdown().await;
        assert_eq!(
            h.handle.refresh_conversations().await,
            Err(ChatError::EngineStopped)
        );
    }
}
