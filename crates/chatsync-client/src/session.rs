//! The single source of truth for "who is logged in".
//!
//! A [`SessionContext`] is cheap to clone; every clone shares one watch
//! slot. The sync engine subscribes to it and tears everything down when
//! the identity in the slot changes.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use chatsync_shared::{Session, UserId};

#[derive(Clone)]
pub struct SessionContext {
    tx: Arc<watch::Sender<Option<Session>>>,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new(None)
    }
}

impl SessionContext {
    pub fn new(initial: Option<Session>) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Start a new session for `user_id`, replacing any current one.
    pub fn begin(&self, token: impl Into<String>, user_id: UserId) -> Session {
        let session = Session::new(token, user_id);
        info!(session = %session.id, user = %session.user_id, "Session started");
        self.tx.send_replace(Some(session.clone()));
        session
    }

    /// End the current session (logout). Returns what was cleared.
    pub fn clear(&self) -> Option<Session> {
        let previous = self.tx.send_replace(None);
        if let Some(session) = &previous {
            info!(session = %session.id, "Session ended");
        }
        previous
    }

    pub fn current(&self) -> Option<Session> {
        self.tx.borrow().clone()
    }

    pub fn is_active(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.tx.subscribe()
    }
}
