//! Push transport: turns a session into a stream of text frames.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tracing::{debug, info};

use chatsync_shared::constants::{PUSH_PATH, PUSH_TOKEN_PARAM};
use chatsync_shared::Session;

use crate::error::{NetError, NetResult};

/// Inbound text frames of one push connection. The stream ends when the
/// server closes the connection. An `Err(NetError::MalformedFrame)` item is a
/// single undecodable frame; any other `Err` means the transport failed.
pub type FrameStream = BoxStream<'static, NetResult<String>>;

#[async_trait]
pub trait PushConnector: Send + Sync + 'static {
    async fn connect(&self, session: &Session) -> NetResult<FrameStream>;
}

/// WebSocket connector: `<base>/ws/?token=<bearer>`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    base_url: String,
}

impl WsConnector {
    pub fn new(base_url: &str) -> NetResult<Self> {
        let parsed = reqwest::Url::parse(base_url)
            .map_err(|e| NetError::InvalidUrl(format!("{base_url}: {e}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(NetError::InvalidUrl(format!("{base_url}: expected ws or wss")));
        }
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Full push endpoint for a bearer token.
    pub fn endpoint(&self, token: &str) -> NetResult<reqwest::Url> {
        let raw = format!("{}{}", self.base_url, PUSH_PATH);
        let mut url =
            reqwest::Url::parse(&raw).map_err(|e| NetError::InvalidUrl(format!("{raw}: {e}")))?;
        url.query_pairs_mut().append_pair(PUSH_TOKEN_PARAM, token);
        Ok(url)
    }
}

#[async_trait]
impl PushConnector for WsConnector {
    async fn connect(&self, session: &Session) -> NetResult<FrameStream> {
        let url = self.endpoint(&session.token)?;

        // The URL carries the token, so only the base is logged.
        info!(base = %self.base_url, user = %session.user_id, "Opening push connection");
        let (ws, _response) = connect_async(url.as_str()).await?;

        let frames = ws
            .filter_map(|item| futures::future::ready(decode_frame(item)))
            .boxed();

        Ok(frames)
    }
}

/// Map one WebSocket item to a frame; `None` for control frames.
fn decode_frame(item: Result<WsMessage, WsError>) -> Option<NetResult<String>> {
    match item {
        Ok(WsMessage::Text(text)) => Some(Ok(text.as_str().to_owned())),
        Ok(WsMessage::Binary(bytes)) => Some(
            String::from_utf8(bytes.to_vec())
                .map_err(|e| NetError::MalformedFrame(format!("binary frame: {e}"))),
        ),
        Ok(WsMessage::Close(frame)) => {
            debug!(frame = ?frame, "Push connection closed by server");
            None
        }
        // Ping/pong are answered by tungstenite itself.
        Ok(_) => None,
        Err(e) => Some(Err(NetError::from(e))),
    }
}
