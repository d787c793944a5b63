use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use reqwest::{Client, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use shared::{
    domain::{ActorIdentity, ConversationId, Role},
    error::ApiError,
    protocol::{ActorProfile, ConversationSummary},
};
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{info, warn};

pub mod config;
pub mod lifecycle;
pub mod notifications;
pub mod refresh;

pub use lifecycle::ChannelLifecycleManager;
pub use notifications::{
    ChannelConnector, ChannelInput, ChannelPhase, NotificationChannel, NotificationEvent,
    WebSocketConnector,
};
pub use refresh::RefreshCoordinator;

use refresh::Admission;

/// Failures surfaced by the authenticated transport. Cloneable so a single
/// refresh failure can fan out to every caller it stranded.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("transport failure: {0}")]
    Transport(Arc<reqwest::Error>),
    #[error("credential refresh failed: {0}")]
    RefreshFailed(String),
    #[error("unauthorized after credential refresh")]
    Unauthorized,
    #[error("unauthorized response for a request whose body cannot be replayed")]
    NotReplayable,
    #[error("api error (status {status}): {message}")]
    Api { status: u16, message: String },
}

fn transport(err: reqwest::Error) -> ClientError {
    ClientError::Transport(Arc::new(err))
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    SessionEstablished(ActorIdentity),
    SessionTerminated,
}

#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub actor: Option<ActorIdentity>,
    pub is_authenticated: bool,
}

/// Exchanges an expired credential for a renewed one. Abstracted so tests
/// can fail or stall the refresh without a backend.
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh(&self) -> anyhow::Result<()>;
}

/// Default refresher: one POST to the refresh endpoint, no request body.
/// Renewed credentials arrive through the shared cookie store.
pub struct HttpCredentialRefresher {
    http: Client,
    refresh_url: String,
}

#[async_trait]
impl CredentialRefresher for HttpCredentialRefresher {
    async fn refresh(&self) -> anyhow::Result<()> {
        let response = self
            .http
            .post(&self.refresh_url)
            .send()
            .await
            .context("refresh request failed")?;
        if !response.status().is_success() {
            return Err(anyhow!("refresh endpoint returned {}", response.status()));
        }
        Ok(())
    }
}

/// The single egress point for backend calls. Attaches the cookie credential
/// context to every request and recovers transparently from expired
/// credentials: the first 401 triggers one refresh, concurrent 401s queue
/// behind it, and queued requests replay FIFO once the refresh lands.
pub struct ApiClient {
    http: Client,
    api_url: String,
    refresh: RefreshCoordinator,
    refresher: Arc<dyn CredentialRefresher>,
    session: Mutex<SessionState>,
    actor_tx: watch::Sender<Option<ActorIdentity>>,
    events: broadcast::Sender<ClientEvent>,
}

impl ApiClient {
    pub fn new(api_url: impl Into<String>) -> anyhow::Result<Arc<Self>> {
        let api_url = api_url.into();
        let http = Client::builder()
            .cookie_store(true)
            .build()
            .context("failed to build http client")?;
        let refresher = Arc::new(HttpCredentialRefresher {
            http: http.clone(),
            refresh_url: format!("{}/auth/refresh", api_url.trim_end_matches('/')),
        });
        Ok(Self::new_with_refresher(api_url, http, refresher))
    }

    pub fn new_with_refresher(
        api_url: impl Into<String>,
        http: Client,
        refresher: Arc<dyn CredentialRefresher>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let (actor_tx, _) = watch::channel(None);
        Arc::new(Self {
            http,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            refresh: RefreshCoordinator::new(),
            refresher,
            session: Mutex::new(SessionState::default()),
            actor_tx,
            events,
        })
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.api_url)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Current actor identity feed; the lifecycle manager follows this to
    /// open and close notification channels.
    pub fn actor_updates(&self) -> watch::Receiver<Option<ActorIdentity>> {
        self.actor_tx.subscribe()
    }

    pub async fn session_state(&self) -> SessionState {
        self.session.lock().await.clone()
    }

    /// Executes one request with authentication recovery. Responses other
    /// than 401 pass through unchanged, other 4xx/5xx included.
    pub async fn execute(&self, request: Request) -> Result<Response, ClientError> {
        let retry = request.try_clone();
        let response = self.http.execute(request).await.map_err(transport)?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(retry) = retry else {
            warn!("unauthorized response for a request with a non-replayable body");
            return Err(ClientError::NotReplayable);
        };

        match self.refresh.admit(retry).await {
            Admission::Queued { outcome } => match outcome.await {
                Ok(result) => result,
                // Leader vanished without settling; fail rather than hang.
                Err(_) => Err(ClientError::RefreshFailed("refresh abandoned".into())),
            },
            Admission::Leader { request } => self.drive_refresh(request).await,
        }
    }

    /// Runs the refresh as the coordinator's leader, then settles: queued
    /// requests replay in arrival order before the request that triggered
    /// the refresh, or every one of them rejects with the same failure.
    async fn drive_refresh(&self, original: Request) -> Result<Response, ClientError> {
        info!("session credentials expired, refreshing");
        match self.refresher.refresh().await {
            Ok(()) => {
                let queued = self.refresh.settle().await;
                let replayed = queued.len();
                for pending in queued {
                    let result = self.replay(pending.request).await;
                    let _ = pending.responder.send(result);
                }
                info!(replayed, "credential refresh succeeded");
                self.replay(original).await
            }
            Err(err) => {
                let failure = ClientError::RefreshFailed(err.to_string());
                let queued = self.refresh.settle().await;
                warn!(rejected = queued.len(), "credential refresh failed: {err:#}");
                for pending in queued {
                    let _ = pending.responder.send(Err(failure.clone()));
                }
                self.terminate_session().await;
                Err(failure)
            }
        }
    }

    /// Re-executes a request that already rode one refresh. A second 401 is
    /// terminal here, which is what caps every request at a single retry.
    async fn replay(&self, request: Request) -> Result<Response, ClientError> {
        let response = self.http.execute(request).await.map_err(transport)?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ClientError::Unauthorized);
        }
        Ok(response)
    }

    async fn terminate_session(&self) {
        {
            let mut session = self.session.lock().await;
            session.actor = None;
            session.is_authenticated = false;
        }
        let _ = self.actor_tx.send(None);
        let _ = self.events.send(ClientEvent::SessionTerminated);
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let request = self
            .http
            .get(self.endpoint(path))
            .build()
            .map_err(transport)?;
        let response = self.execute(request).await?;
        decode_json(response).await
    }

    /// Fetches the profile for the given role and establishes the session.
    /// An expired credential on this path is recovered like any other call;
    /// a terminal failure leaves the session unauthenticated.
    pub async fn resolve_identity(&self, role: Role) -> Result<ActorProfile, ClientError> {
        match self.get_json::<ActorProfile>(identity_path(role)).await {
            Ok(profile) => {
                let identity = ActorIdentity {
                    actor_id: profile.id.clone(),
                    role: profile.role,
                };
                {
                    let mut session = self.session.lock().await;
                    session.actor = Some(identity.clone());
                    session.is_authenticated = true;
                }
                info!(actor = %identity.actor_id, role = %identity.role, "session established");
                let _ = self.actor_tx.send(Some(identity.clone()));
                let _ = self.events.send(ClientEvent::SessionEstablished(identity));
                Ok(profile)
            }
            Err(err) => {
                self.session.lock().await.is_authenticated = false;
                Err(err)
            }
        }
    }

    pub async fn logout(&self) -> Result<(), ClientError> {
        let request = self
            .http
            .post(self.endpoint("/auth/logout"))
            .build()
            .map_err(transport)?;
        let response = self.execute(request).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(decode_failure(status, response).await);
        }
        self.terminate_session().await;
        Ok(())
    }

    pub async fn fetch_conversations(&self) -> Result<Vec<ConversationSummary>, ClientError> {
        self.get_json("/conversations").await
    }

    /// Tells the backend the actor has read a conversation. The local unseen
    /// map is not touched here; the backend pushes the new tally as a frame.
    pub async fn mark_conversation_seen(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<(), ClientError> {
        let request = self
            .http
            .put(self.endpoint(&format!("/conversations/{conversation_id}/seen")))
            .build()
            .map_err(transport)?;
        let response = self.execute(request).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(decode_failure(status, response).await);
        }
        Ok(())
    }
}

fn identity_path(role: Role) -> &'static str {
    match role {
        Role::Buyer => "/users/me",
        Role::Seller => "/sellers/me",
        Role::Admin => "/admins/me",
    }
}

async fn decode_json<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let status = response.status();
    if !status.is_success() {
        return Err(decode_failure(status, response).await);
    }
    response.json().await.map_err(transport)
}

async fn decode_failure(status: StatusCode, response: Response) -> ClientError {
    let message = match response.json::<ApiError>().await {
        Ok(payload) => payload.message,
        Err(_) => status.to_string(),
    };
    ClientError::Api {
        status: status.as_u16(),
        message,
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
