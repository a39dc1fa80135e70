//! Backend seams: the REST snapshot API and the push event channel.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{ConversationId, MessageId, UserId},
    error::ApiError,
    protocol::{
        ClientRequest, ConversationPayload, MessagePayload, SendMessageRequest, ServerEvent,
        StartConversationRequest, UserSummary,
    },
};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
};
use tracing::{debug, warn};
use url::Url;

use crate::{config::SyncSettings, error::SyncError};

#[async_trait]
pub trait SnapshotApi: Send + Sync {
    async fn fetch_current_user(&self) -> Result<UserSummary, SyncError>;
    async fn fetch_users(&self) -> Result<Vec<UserSummary>, SyncError>;
    async fn fetch_conversations(&self) -> Result<Vec<ConversationPayload>, SyncError>;
    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        text: &str,
    ) -> Result<MessagePayload, SyncError>;
    async fn start_conversation(
        &self,
        user_id: &UserId,
        text: &str,
    ) -> Result<ConversationPayload, SyncError>;
    async fn report_seen(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<(), SyncError>;
    async fn mark_all_read(&self) -> Result<(), SyncError>;
}

/// REST client for the chat backend. Paths are relative to `server_url`.
#[derive(Debug, Clone)]
pub struct HttpSnapshotApi {
    http: Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl HttpSnapshotApi {
    pub fn new(base_url: impl Into<String>, bearer_token: Option<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            bearer_token,
        }
    }

    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self::new(settings.server_url.clone(), settings.bearer_token.clone())
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, format!("{}{path}", self.base_url));
        match &self.bearer_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

async fn check_status(response: Response) -> Result<Response, SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.bytes().await.unwrap_or_default();
    let api_error = serde_json::from_slice::<ApiError>(&body)
        .unwrap_or_else(|_| ApiError::from_status(status.as_u16()));
    Err(SyncError::Api {
        status: status.as_u16(),
        code: api_error.code,
        message: api_error.message,
    })
}

async fn decode_json<T: DeserializeOwned>(response: Response) -> Result<T, SyncError> {
    let body = check_status(response).await?.bytes().await?;
    Ok(serde_json::from_slice(&body)?)
}

#[async_trait]
impl SnapshotApi for HttpSnapshotApi {
    async fn fetch_current_user(&self) -> Result<UserSummary, SyncError> {
        let response = self.request(Method::GET, "/users/me").send().await?;
        decode_json(response).await
    }

    async fn fetch_users(&self) -> Result<Vec<UserSummary>, SyncError> {
        let response = self.request(Method::GET, "/users").send().await?;
        decode_json(response).await
    }

    async fn fetch_conversations(&self) -> Result<Vec<ConversationPayload>, SyncError> {
        let response = self.request(Method::GET, "/conversations").send().await?;
        decode_json(response).await
    }

    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        text: &str,
    ) -> Result<MessagePayload, SyncError> {
        let response = self
            .request(
                Method::POST,
                &format!("/conversations/{conversation_id}/messages"),
            )
            .json(&SendMessageRequest {
                text: text.to_string(),
            })
            .send()
            .await?;
        decode_json(response).await
    }

    async fn start_conversation(
        &self,
        user_id: &UserId,
        text: &str,
    ) -> Result<ConversationPayload, SyncError> {
        let response = self
            .request(Method::POST, "/conversations")
            .json(&StartConversationRequest {
                user_id: user_id.clone(),
                text: text.to_string(),
            })
            .send()
            .await?;
        decode_json(response).await
    }

    async fn report_seen(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<(), SyncError> {
        let response = self
            .request(
                Method::POST,
                &format!("/conversations/{conversation_id}/messages/{message_id}/seen"),
            )
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn mark_all_read(&self) -> Result<(), SyncError> {
        let response = self
            .request(Method::POST, "/conversations/mark-all-read")
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

/// One open channel. Dropping `outbound` closes the connection; `inbound`
/// yields `None` once the backend side is gone.
#[derive(Debug)]
pub struct ChannelSession {
    pub inbound: mpsc::Receiver<ServerEvent>,
    pub outbound: mpsc::Sender<ClientRequest>,
}

#[async_trait]
pub trait EventChannel: Send + Sync {
    async fn connect(&self) -> Result<ChannelSession, SyncError>;
}

#[derive(Debug, Clone)]
pub struct WebSocketChannel {
    url: Url,
    bearer_token: Option<String>,
    buffer: usize,
}

impl WebSocketChannel {
    pub fn new(
        server_url: &str,
        ws_path: &str,
        bearer_token: Option<String>,
        buffer: usize,
    ) -> Result<Self, SyncError> {
        Ok(Self {
            url: websocket_url(server_url, ws_path)?,
            bearer_token,
            buffer: buffer.max(1),
        })
    }

    pub fn from_settings(settings: &SyncSettings) -> Result<Self, SyncError> {
        Self::new(
            &settings.server_url,
            &settings.ws_path,
            settings.bearer_token.clone(),
            settings.channel_buffer,
        )
    }
}

/// Maps the REST base url onto the websocket endpoint of the same host.
pub fn websocket_url(server_url: &str, ws_path: &str) -> Result<Url, SyncError> {
    let mut url = Url::parse(server_url)?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(SyncError::Config(format!(
                "server_url scheme '{other}' is not http or https"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| SyncError::Config(format!("cannot derive websocket url from {server_url}")))?;
    url.set_path(ws_path);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

#[async_trait]
impl EventChannel for WebSocketChannel {
    async fn connect(&self) -> Result<ChannelSession, SyncError> {
        let mut request = self.url.as_str().into_client_request()?;
        if let Some(token) = &self.bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|err| SyncError::Config(format!("invalid bearer token: {err}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, _) = connect_async(request).await?;
        let (mut writer, mut reader) = stream.split();
        let (inbound_tx, inbound_rx) = mpsc::channel(self.buffer);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientRequest>(self.buffer);

        tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            if inbound_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!(error = %err, "sync: dropping invalid server event"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "sync: websocket receive failed");
                        break;
                    }
                }
            }
            debug!("sync: websocket reader finished");
        });

        tokio::spawn(async move {
            while let Some(request) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&request) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "sync: failed to encode client request");
                        continue;
                    }
                };
                if let Err(err) = writer.send(Message::Text(text)).await {
                    warn!(error = %err, "sync: websocket send failed");
                    break;
                }
            }
            let _ = writer.close().await;
        });

        Ok(ChannelSession {
            inbound: inbound_rx,
            outbound: outbound_tx,
        })
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
