/// Persistence API client
///
/// Endpoints (relative to the configured base URL):
///   POST /auth/login                      body: {"email","password"}
///   POST /auth/register                   body: {"username","email","password"}
///   POST /auth/logout
///   GET  /auth/me
///   GET  /auth/users
///   POST /messages                        body: {"recipient","content","messageType"}
///   GET  /messages/conversation/:userId   ?page=N&limit=N
///   GET  /messages/conversations
///   PUT  /messages/read/:userId
use crate::config::ClientConfig;
use crate::error::{ChatError, Result};
use crate::messenger_types::{
    Ack, AuthResponse, Conversation, HistoryPage, LoginRequest, Message, NewMessage,
    RegisterRequest, User,
};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Request/response side of the chat backend
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn login(&self, req: &LoginRequest) -> Result<AuthResponse>;
    async fn register(&self, req: &RegisterRequest) -> Result<AuthResponse>;
    async fn logout(&self) -> Result<Ack>;
    async fn current_user(&self) -> Result<User>;
    async fn users(&self) -> Result<Vec<User>>;
    async fn send_message(&self, msg: &NewMessage) -> Result<Message>;
    async fn conversation(&self, peer_id: &str, page: u32, limit: u32) -> Result<HistoryPage>;
    async fn conversations(&self) -> Result<Vec<Conversation>>;
    async fn mark_read(&self, peer_id: &str) -> Result<Ack>;
}

/// `ChatApi` over HTTP with a bearer token
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl HttpApi {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            token: RwLock::new(None),
        })
    }

    pub async fn set_token(&self, token: Option<String>) {
        *self.token.write().await = token;
    }

    pub async fn token(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T> {
        let mut builder = self.client.request(method.clone(), self.url(path));
        if let Some(token) = self.token().await {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        debug!("{} {}", method, path);
        let response = builder.send().await?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            warn!("{} {} rejected with 401, dropping session token", method, path);
            self.set_token(None).await;
            return Err(ChatError::Session);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ChatError::Request {
                status: status.as_u16(),
                message: error_message(&text, status),
            });
        }

        Ok(response.json::<T>().await?)
    }

    async fn authenticate(&self, path: &str, body: Value) -> Result<AuthResponse> {
        let auth: AuthResponse = self
            .request(Method::POST, path, Some(body))
            .await
            .map_err(|e| match e {
                // Bad credentials, not an expired session
                ChatError::Session => ChatError::Request {
                    status: StatusCode::UNAUTHORIZED.as_u16(),
                    message: "invalid credentials".to_string(),
                },
                other => other,
            })?;
        self.set_token(Some(auth.token.clone())).await;
        Ok(auth)
    }
}

/// Pull `{"message": ...}` out of an error body, falling back to the status text
fn error_message(body: &str, status: StatusCode) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(String::from))
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        })
}

#[async_trait]
impl ChatApi for HttpApi {
    async fn login(&self, req: &LoginRequest) -> Result<AuthResponse> {
        self.authenticate("/auth/login", serde_json::to_value(req)?)
            .await
    }

    async fn register(&self, req: &RegisterRequest) -> Result<AuthResponse> {
        self.authenticate("/auth/register", serde_json::to_value(req)?)
            .await
    }

    async fn logout(&self) -> Result<Ack> {
        let ack = self.request(Method::POST, "/auth/logout", None).await;
        self.set_token(None).await;
        ack
    }

    async fn current_user(&self) -> Result<User> {
        self.request(Method::GET, "/auth/me", None).await
    }

    async fn users(&self) -> Result<Vec<User>> {
        self.request(Method::GET, "/auth/users", None).await
    }

    async fn send_message(&self, msg: &NewMessage) -> Result<Message> {
        self.request(Method::POST, "/messages", Some(serde_json::to_value(msg)?))
            .await
    }

    async fn conversation(&self, peer_id: &str, page: u32, limit: u32) -> Result<HistoryPage> {
        let path = format!(
            "/messages/conversation/{}?page={}&limit={}",
            urlencoding::encode(peer_id),
            page,
            limit
        );
        self.request(Method::GET, &path, None).await
    }

    async fn conversations(&self) -> Result<Vec<Conversation>> {
        self.request(Method::GET, "/messages/conversations", None)
            .await
    }

    async fn mark_read(&self, peer_id: &str) -> Result<Ack> {
        let path = format!("/messages/read/{}", urlencoding::encode(peer_id));
        self.request(Method::PUT, &path, None).await
    }
}
