//! Realtime sync for a chat client.
//!
//! [`spawn_engine`] starts a task that keeps a [`ConversationDirectory`] and
//! the open conversation's [`MessageLog`] in step with the server: history
//! over REST, live messages over the push channel, everything scoped to the
//! current [`SessionContext`].

pub mod config;
pub mod coordinator;
pub mod directory;
pub mod engine;
pub mod events;
pub mod message_log;
pub mod session;

pub use config::{ClientConfig, RetryPolicy};
pub use coordinator::{AttachPhase, OlderTicket, OpenTicket, PushOutcome, SyncCoordinator};
pub use directory::ConversationDirectory;
pub use engine::{spawn_engine, SyncHandle};
pub use events::{DirectorySnapshot, LogSnapshot, SyncEvent};
pub use message_log::MessageLog;
pub use session::SessionContext;
