use anyhow::{anyhow, Result};
use async_trait::async_trait;
use outbox::RemoteService;
use reqwest::{Client, Response};
use shared::{
    domain::{ChannelId, MessageId},
    error::{ApiError, ApiException},
    protocol::{MessagePage, MessageQuery, RemoteMessage, SendMessageRequest, UpdateMessageRequest},
};

/// JSON-over-HTTP message backend.
#[derive(Clone)]
pub struct HttpRemoteService {
    http: Client,
    server_url: String,
}

impl HttpRemoteService {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), server_url)
    }

    pub fn with_client(http: Client, server_url: impl Into<String>) -> Self {
        let server_url = server_url.into().trim_end_matches('/').to_string();
        Self { http, server_url }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    fn messages_url(&self, channel_id: &ChannelId) -> String {
        format!("{}/channels/{}/messages", self.server_url, channel_id)
    }

    fn message_url(&self, channel_id: &ChannelId, message_id: &MessageId) -> String {
        format!("{}/{}", self.messages_url(channel_id), message_id)
    }
}

#[async_trait]
impl RemoteService for HttpRemoteService {
    async fn send_message(
        &self,
        channel_id: &ChannelId,
        request: &SendMessageRequest,
    ) -> Result<RemoteMessage> {
        let response = self
            .http
            .post(self.messages_url(channel_id))
            .json(request)
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn update_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        request: &UpdateMessageRequest,
    ) -> Result<()> {
        let response = self
            .http
            .patch(self.message_url(channel_id, message_id))
            .json(request)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn delete_message(&self, channel_id: &ChannelId, message_id: &MessageId) -> Result<()> {
        let response = self
            .http
            .delete(self.message_url(channel_id, message_id))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn query_messages(
        &self,
        channel_id: &ChannelId,
        query: &MessageQuery,
    ) -> Result<MessagePage> {
        let response = self
            .http
            .get(self.messages_url(channel_id))
            .query(query)
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }
}

/// Non-2xx responses become [`ApiException`] when the body carries an
/// [`ApiError`], otherwise a plain error with the status and body.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(error) => Err(ApiException::new(status.as_u16(), error).into()),
        Err(_) => Err(anyhow!("request failed with {status}: {body}")),
    }
}

#[cfg(test)]
#[path = "tests/http_remote_tests.rs"]
mod tests;
