use serde::{Deserialize, Serialize};

use crate::error::ChatError;
use crate::models::Message;

/// Payloads delivered by the push channel.
///
/// Frames are JSON objects tagged by `type`. A frame whose tag is unknown or
/// whose body does not match is a malformed event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    /// A message was posted to one of the user's conversations.
    Message { message: Message },
}

impl PushEvent {
    /// Decode a text frame.
    pub fn from_json(text: &str) -> Result<Self, ChatError> {
        serde_json::from_str(text).map_err(|e| ChatError::MalformedEvent(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
