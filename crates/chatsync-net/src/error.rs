use thiserror::Error;

use chatsync_shared::ChatError;

/// Transport-level failures of the REST client and the push connector.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Server responded {status}: {body}")]
    Status { status: u16, body: String },

    /// One inbound frame could not be decoded; the connection is still usable.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
}

pub type NetResult<T> = std::result::Result<T, NetError>;

impl From<NetError> for ChatError {
    fn from(err: NetError) -> Self {
        match err {
            NetError::Status { status: 401 | 403, .. } => ChatError::NotAuthorized,
            NetError::Status { status: 404, body } => ChatError::NotFound(body),
            NetError::Http(e) if e.status().map(|s| s.as_u16()) == Some(401) => {
                ChatError::NotAuthorized
            }
            NetError::MalformedFrame(reason) => ChatError::MalformedEvent(reason),
            other => ChatError::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(status: u16) -> NetError {
        NetError::Status {
            status,
            body: "chat c1".into(),
        }
    }

    #[test]
    fn test_auth_statuses_map_to_not_authorized() {
        assert_eq!(ChatError::from(status(401)), ChatError::NotAuthorized);
        assert_eq!(ChatError::from(status(403)), ChatError::NotAuthorized);
    }

    #[test]
    fn test_not_found_keeps_body() {
        assert_eq!(
            ChatError::from(status(404)),
            ChatError::NotFound("chat c1".into())
        );
    }

    #[test]
    fn test_everything_else_is_transport() {
        assert!(matches!(ChatError::from(status(502)), ChatError::Transport(_)));
        assert!(matches!(
            ChatError::from(NetError::InvalidUrl("ftp://x".into())),
            ChatError::Transport(_)
        ));
    }

    #[test]
    fn test_malformed_frame_maps_to_malformed_event() {
        assert_eq!(
            ChatError::from(NetError::MalformedFrame("binary frame".into())),
            ChatError::MalformedEvent("binary frame".into())
        );
    }
}
