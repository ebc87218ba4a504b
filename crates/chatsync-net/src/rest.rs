//! HTTP implementation of [`ChatApi`] on top of `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use chatsync_shared::constants::APP_NAME;
use chatsync_shared::{ChatResult, Conversation, ConversationId, Message, MessageId, Session};

use crate::api::{
    ChatApi, CreateConversationRequest, HistoryQuery, MarkAsReadRequest, SearchQuery,
    SendMessageRequest,
};
use crate::error::{NetError, NetResult};

fn user_agent() -> String {
    format!("{}/{}", APP_NAME, env!("CARGO_PKG_VERSION"))
}

#[derive(Deserialize)]
struct ConversationsEnvelope {
    chats: Option<Vec<Conversation>>,
}

#[derive(Deserialize)]
struct MessagesEnvelope {
    messages: Option<Vec<Message>>,
}

/// REST client for the chat service. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
}

impl RestClient {
    /// Build a client for `base_url` (`http` or `https`). Requests time out
    /// after `timeout`; the engine itself has no timers.
    pub fn new(base_url: &str, timeout: Duration) -> NetResult<Self> {
        let parsed = reqwest::Url::parse(base_url)
            .map_err(|e| NetError::InvalidUrl(format!("{base_url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(NetError::InvalidUrl(format!(
                "{base_url}: expected http or https"
            )));
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent())
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: Method, session: &Session, path: &str) -> RequestBuilder {
        debug!(%method, path, "REST request");
        self.http
            .request(method, self.url(path))
            .bearer_auth(&session.token)
    }

    async fn execute<T: DeserializeOwned>(builder: RequestBuilder) -> NetResult<T> {
        let response = check_status(builder.send().await?).await?;
        Ok(response.json::<T>().await?)
    }

    async fn execute_empty(builder: RequestBuilder) -> NetResult<()> {
        check_status(builder.send().await?).await?;
        Ok(())
    }
}

async fn check_status(response: Response) -> NetResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(NetError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl ChatApi for RestClient {
    async fn fetch_conversations(&self, session: &Session) -> ChatResult<Vec<Conversation>> {
        let envelope: ConversationsEnvelope =
            Self::execute(self.request(Method::GET, session, "/chats/")).await?;
        Ok(envelope.chats.unwrap_or_default())
    }

    async fn fetch_conversation(
        &self,
        session: &Session,
        id: &ConversationId,
    ) -> ChatResult<Conversation> {
        let path = format!("/chats/{id}");
        Ok(Self::execute(self.request(Method::GET, session, &path)).await?)
    }

    async fn fetch_history(
        &self,
        session: &Session,
        id: &ConversationId,
        query: &HistoryQuery,
    ) -> ChatResult<Vec<Message>> {
        let path = format!("/chats/{id}/messages");
        let envelope: MessagesEnvelope =
            Self::execute(self.request(Method::GET, session, &path).query(query)).await?;
        Ok(envelope.messages.unwrap_or_default())
    }

    async fn send_message(
        &self,
        session: &Session,
        id: &ConversationId,
        request: &SendMessageRequest,
    ) -> ChatResult<Message> {
        let path = format!("/chats/{id}/messages");
        Ok(Self::execute(self.request(Method::POST, session, &path).json(request)).await?)
    }

    async fn create_conversation(
        &self,
        session: &Session,
        request: &CreateConversationRequest,
    ) -> ChatResult<Conversation> {
        Ok(Self::execute(self.request(Method::POST, session, "/chats/").json(request)).await?)
    }

    async fn search_messages(
        &self,
        session: &Session,
        query: &SearchQuery,
    ) -> ChatResult<Vec<Message>> {
        let builder = self
            .request(Method::GET, session, "/chats/messages/search")
            .query(query);
        let envelope: MessagesEnvelope = Self::execute(builder).await?;
        Ok(envelope.messages.unwrap_or_default())
    }

    async fn mark_as_read(&self, session: &Session, message_ids: &[MessageId]) -> ChatResult<()> {
        let body = MarkAsReadRequest {
            message_ids: message_ids.to_vec(),
        };
        let builder = self
            .request(Method::POST, session, "/chats/messages/read")
            .json(&body);
        Ok(Self::execute_empty(builder).await?)
    }
}
