//! The push channel: one authenticated connection scoped to a session.
//!
//! The connection runs in a dedicated tokio task and reports back through a
//! typed event queue, the same command/notification split the rest of the
//! client uses. The owner polls [`Channel::next_event`] from its own loop;
//! nothing here knows about conversations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use chatsync_shared::{ChannelStatus, Message, PushEvent, Session};

use crate::connector::PushConnector;
use crate::error::NetError;

/// Everything the channel reports, in delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Status(ChannelStatus),
    Message(Message),
}

struct Connection {
    session_id: Uuid,
    task: JoinHandle<()>,
}

pub struct Channel {
    connector: Arc<dyn PushConnector>,
    buffer: usize,
    events_tx: mpsc::Sender<ChannelEvent>,
    events_rx: mpsc::Receiver<ChannelEvent>,
    status_tx: watch::Sender<ChannelStatus>,
    current: Option<Connection>,
    malformed: Arc<AtomicU64>,
}

impl Channel {
    pub fn new(connector: Arc<dyn PushConnector>, buffer: usize) -> Self {
        let buffer = buffer.max(1);
        let (events_tx, events_rx) = mpsc::channel(buffer);
        let (status_tx, _) = watch::channel(ChannelStatus::Disconnected);
        Self {
            connector,
            buffer,
            events_tx,
            events_rx,
            status_tx,
            current: None,
            malformed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Observable status. Updated as events are consumed, so it never runs
    /// ahead of what the owner has processed.
    pub fn status(&self) -> watch::Receiver<ChannelStatus> {
        self.status_tx.subscribe()
    }

    pub fn current_status(&self) -> ChannelStatus {
        *self.status_tx.borrow()
    }

    /// Whether a live connection task exists for this session.
    pub fn is_open_for(&self, session: &Session) -> bool {
        self.current
            .as_ref()
            .is_some_and(|c| c.session_id == session.id && !c.task.is_finished())
    }

    /// Number of inbound payloads dropped because they could not be decoded.
    pub fn malformed_events(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Open a connection for `session`.
    ///
    /// A no-op if a live connection already exists for the same session; a
    /// connection for any other session is closed first. Transport failures
    /// surface as `Errored` then `Disconnected`, never as an error here.
    pub fn open(&mut self, session: &Session) {
        if self.is_open_for(session) {
            debug!(session = %session.id, "Push channel already open for session");
            return;
        }
        if self.current.is_some() {
            self.close();
        }

        let task = tokio::spawn(run_connection(
            self.connector.clone(),
            session.clone(),
            self.events_tx.clone(),
            self.malformed.clone(),
        ));

        self.current = Some(Connection {
            session_id: session.id,
            task,
        });
    }

    /// Release the connection. Safe to call at any time.
    ///
    /// Events the old connection already queued are discarded: once this
    /// returns, [`Channel::next_event`] only yields events of a later `open`.
    /// Returns `true` if the status changed.
    pub fn close(&mut self) -> bool {
        if let Some(conn) = self.current.take() {
            conn.task.abort();
            info!(session = %conn.session_id, "Push channel closed");
        }

        let (events_tx, events_rx) = mpsc::channel(self.buffer);
        self.events_tx = events_tx;
        self.events_rx = events_rx;

        self.status_tx.send_if_modified(|status| {
            if *status == ChannelStatus::Disconnected {
                false
            } else {
                *status = ChannelStatus::Disconnected;
                true
            }
        })
    }

    /// Next event, with repeated statuses collapsed so every yielded
    /// `Status` is a real transition. Cancel-safe.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        loop {
            let event = self.events_rx.recv().await?;
            match event {
                ChannelEvent::Status(next) => {
                    let changed = self.status_tx.send_if_modified(|status| {
                        if *status == next {
                            false
                        } else {
                            *status = next;
                            true
                        }
                    });
                    if changed {
                        return Some(ChannelEvent::Status(next));
                    }
                }
                message => return Some(message),
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(conn) = self.current.take() {
            conn.task.abort();
        }
    }
}

async fn run_connection(
    connector: Arc<dyn PushConnector>,
    session: Session,
    tx: mpsc::Sender<ChannelEvent>,
    malformed: Arc<AtomicU64>,
) {
    if tx
        .send(ChannelEvent::Status(ChannelStatus::Connecting))
        .await
        .is_err()
    {
        return;
    }

    let mut frames = match connector.connect(&session).await {
        Ok(frames) => frames,
        Err(e) => {
            warn!(session = %session.id, error = %e, "Push connection failed");
            let _ = tx.send(ChannelEvent::Status(ChannelStatus::Errored)).await;
            let _ = tx
                .send(ChannelEvent::Status(ChannelStatus::Disconnected))
                .await;
            return;
        }
    };

    info!(session = %session.id, "Push channel connected");
    if tx
        .send(ChannelEvent::Status(ChannelStatus::Connected))
        .await
        .is_err()
    {
        return;
    }

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(text) => match PushEvent::from_json(&text) {
                Ok(PushEvent::Message { message }) => {
                    debug!(
                        message = %message.id,
                        conversation = %message.conversation_id,
                        "Push message received"
                    );
                    if tx.send(ChannelEvent::Message(message)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let dropped = malformed.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(error = %e, dropped, "Dropping malformed push event");
                }
            },
            Err(NetError::MalformedFrame(reason)) => {
                let dropped = malformed.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(reason = %reason, dropped, "Dropping undecodable push frame");
            }
            Err(e) => {
                warn!(session = %session.id, error = %e, "Push channel transport error");
                let _ = tx.send(ChannelEvent::Status(ChannelStatus::Errored)).await;
                break;
            }
        }
    }

    info!(session = %session.id, "Push channel ended");
    let _ = tx
        .send(ChannelEvent::Status(ChannelStatus::Disconnected))
        .await;
}
