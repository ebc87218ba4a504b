use thiserror::Error;

/// Failure taxonomy of the sync engine and its collaborators.
///
/// Only `NotAuthorized` ends a session. Everything else is recoverable: the
/// worst outcome is a view that stops updating until the channel reconnects.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Not authorized")]
    NotAuthorized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Result superseded by a newer request")]
    StaleResult,

    #[error("No active session")]
    NoSession,

    #[error("No conversation is open")]
    NoActiveConversation,

    #[error("Sync engine stopped")]
    EngineStopped,
}

impl ChatError {
    /// Whether this error must tear down the current session.
    pub fn ends_session(&self) -> bool {
        matches!(self, ChatError::NotAuthorized)
    }
}

pub type ChatResult<T> = std::result::Result<T, ChatError>;
