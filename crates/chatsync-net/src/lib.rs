// Transports for the chat service: REST request/response and the push channel.

pub mod api;
pub mod channel;
pub mod connector;
pub mod error;
pub mod rest;

pub use api::{
    ChatApi, CreateConversationRequest, HistoryQuery, MarkAsReadRequest, SearchQuery,
    SendMessageRequest,
};
pub use channel::{Channel, ChannelEvent};
pub use connector::{FrameStream, PushConnector, WsConnector};
pub use error::{NetError, NetResult};
pub use rest::RestClient;
