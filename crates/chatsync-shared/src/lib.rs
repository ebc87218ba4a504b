// Domain types, push wire protocol and error taxonomy shared by every chatsync crate.

pub mod constants;
pub mod error;
pub mod models;
pub mod protocol;
pub mod types;

pub use error::{ChatError, ChatResult};
pub use models::{Conversation, ConversationKind, Member, Message};
pub use protocol::PushEvent;
pub use types::{ChannelStatus, ConversationId, MessageId, Session, UserId};
