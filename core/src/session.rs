/// Authenticated session: owns the push channel and the sync loop
use crate::api::{ChatApi, HttpApi};
use crate::config::ClientConfig;
use crate::error::Result;
use crate::messenger_types::{LoginRequest, RegisterRequest, User};
use crate::sync::{SyncEngine, SyncHandle};
use crate::transport::{InboundEvent, Transport, INBOUND_EVENTS};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct Session {
    user: User,
    api: Arc<dyn ChatApi>,
    transport: Transport,
    sync: SyncHandle,
    task: Option<JoinHandle<()>>,
}

impl Session {
    /// `POST /auth/login`, then start syncing
    pub async fn login(config: &ClientConfig, email: &str, password: &str) -> Result<Self> {
        let api = Arc::new(HttpApi::new(config)?);
        let auth = api
            .login(&LoginRequest {
                email: email.to_string(),
                password: password.to_string(),
            })
            .await?;
        info!("Logged in as {} ({})", auth.user.username, auth.user.id);
        Self::start(config, api, auth.user).await
    }

    /// `POST /auth/register`, then start syncing
    pub async fn register(
        config: &ClientConfig,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<Self> {
        let api = Arc::new(HttpApi::new(config)?);
        let auth = api
            .register(&RegisterRequest {
                username: username.to_string(),
                email: email.to_string(),
                password: password.to_string(),
            })
            .await?;
        info!("Registered {} ({})", auth.user.username, auth.user.id);
        Self::start(config, api, auth.user).await
    }

    /// Reuse a stored token: `GET /auth/me`, then start syncing
    pub async fn resume(config: &ClientConfig, token: &str) -> Result<Self> {
        let api = Arc::new(HttpApi::new(config)?);
        api.set_token(Some(token.to_string())).await;
        let user = api.current_user().await?;
        info!("Resumed session for {} ({})", user.username, user.id);
        Self::start(config, api, user).await
    }

    /// Wire transport and sync loop for an authenticated user.
    ///
    /// A push channel that cannot connect is logged and tolerated; the
    /// session still works over request/response only.
    pub async fn start(config: &ClientConfig, api: Arc<dyn ChatApi>, user: User) -> Result<Self> {
        let transport = Transport::new(config.socket_url(), config.connect_timeout);
        let (engine, rx) =
            SyncEngine::new(user.clone(), api.clone(), Arc::new(transport.clone()), config);
        let (sync, task) = engine.spawn(rx);

        for name in INBOUND_EVENTS {
            let sync = sync.clone();
            transport.subscribe(name, move |data| match InboundEvent::parse(name, data) {
                Ok(Some(event)) => {
                    let _ = sync.push(event);
                }
                Ok(None) => {}
                Err(e) => warn!("Malformed {} payload: {}", name, e),
            });
        }

        if let Err(e) = transport.connect(&user.id).await {
            warn!("Continuing without live updates: {}", e);
        }
        sync.refresh_conversations()?;

        Ok(Self {
            user,
            api,
            transport,
            sync,
            task: Some(task),
        })
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn sync(&self) -> &SyncHandle {
        &self.sync
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// `GET /auth/users`
    pub async fn users(&self) -> Result<Vec<User>> {
        self.api.users().await
    }

    /// Best-effort `POST /auth/logout`, then local teardown
    pub async fn logout(mut self) -> Result<()> {
        if let Err(e) = self.api.logout().await {
            warn!("Server logout failed, tearing down locally: {}", e);
        }
        self.teardown().await;
        info!("Logged out {}", self.user.id);
        Ok(())
    }

    /// Resolves once the sync loop has stopped (logout or expired token)
    pub async fn closed(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.release_transport();
    }

    async fn teardown(&mut self) {
        let _ = self.sync.shutdown();
        self.closed().await;
    }

    fn release_transport(&self) {
        self.transport.unsubscribe_all();
        self.transport.disconnect();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.sync.shutdown();
            self.release_transport();
        }
    }
}
