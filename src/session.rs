use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::lastfm::{ScrobbleError, ScrobbleService};
use crate::secrets::{SecretStore, SecretStoreError};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Secret store error: {0}")]
    SecretStore(#[from] SecretStoreError),
    #[error("Authentication failed: {0}")]
    Authentication(#[from] ScrobbleError),
}

/// Where the account session currently stands. `Connected` holds the
/// canonical username echoed by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScrobbleAuthState {
    Disconnected,
    Authenticating,
    Connected { username: String },
    Error { message: String },
}

impl ScrobbleAuthState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ScrobbleAuthState::Connected { .. })
    }
}

/// Tracks the session lifecycle and keeps the secret store in step with it.
///
/// Credentials are written only after the service has accepted them and are
/// removed as a pair, so the store never holds a half-session across
/// restarts.
pub struct SessionManager {
    secrets: Arc<dyn SecretStore>,
    state: RwLock<ScrobbleAuthState>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager").finish_non_exhaustive()
    }
}

impl SessionManager {
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        SessionManager {
            secrets,
            state: RwLock::new(ScrobbleAuthState::Disconnected),
        }
    }

    /// Rebuild the auth state from stored credentials, typically at startup.
    /// Anything short of a complete session reads as disconnected.
    pub async fn restore_session(&self) -> Result<ScrobbleAuthState, SessionError> {
        let next = match self.secrets.load_session()? {
            Some(session) => {
                info!("Restored scrobble session for {}", session.username);
                ScrobbleAuthState::Connected {
                    username: session.username,
                }
            }
            None => ScrobbleAuthState::Disconnected,
        };
        Ok(self.set_state(next).await)
    }

    /// Exchange credentials for a session and persist it on success.
    ///
    /// A rejected sign-in is a normal outcome and lands in the returned
    /// state as `Error`; only secret store failures surface as `Err`.
    pub async fn sign_in(
        &self,
        service: &dyn ScrobbleService,
        username: &str,
        password: &str,
    ) -> Result<ScrobbleAuthState, SessionError> {
        self.set_state(ScrobbleAuthState::Authenticating).await;

        let session = match service.authenticate(username, password).await {
            Ok(session) => session,
            Err(e) => {
                warn!("Sign-in failed for {}: {}", username, e);
                return Ok(self
                    .set_state(ScrobbleAuthState::Error {
                        message: e.to_string(),
                    })
                    .await);
            }
        };

        if let Err(e) = self.secrets.store_session(&session) {
            self.set_state(ScrobbleAuthState::Error {
                message: e.to_string(),
            })
            .await;
            return Err(e.into());
        }

        info!("Signed in to scrobble service as {}", session.username);
        Ok(self
            .set_state(ScrobbleAuthState::Connected {
                username: session.username,
            })
            .await)
    }

    /// Ask the service whether the current session is still honored,
    /// demoting the state when it is not.
    ///
    /// Transport failures propagate without touching the state: an offline
    /// start must not read as signed out.
    pub async fn validate(&self, service: &dyn ScrobbleService) -> Result<bool, SessionError> {
        if !self.is_connected().await {
            return Ok(false);
        }
        let valid = service.validate_session().await?;
        if !valid {
            self.session_expired().await;
        }
        Ok(valid)
    }

    /// Drop the stored session and return to `Disconnected`.
    pub async fn disconnect(&self) -> Result<ScrobbleAuthState, SessionError> {
        self.secrets.remove_credentials()?;
        info!("Disconnected from scrobble service");
        Ok(self.set_state(ScrobbleAuthState::Disconnected).await)
    }

    /// Mark the stored session as no longer honored by the service. The
    /// credentials stay in the store; a fresh sign-in overwrites them.
    pub async fn session_expired(&self) {
        warn!("Scrobble session is no longer valid");
        self.set_state(ScrobbleAuthState::Error {
            message: "Session expired, sign in again".to_string(),
        })
        .await;
    }

    pub async fn state(&self) -> ScrobbleAuthState {
        self.state.read().await.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.state.read().await.is_connected()
    }

    pub async fn connected_username(&self) -> Option<String> {
        match &*self.state.read().await {
            ScrobbleAuthState::Connected { username } => Some(username.clone()),
            _ => None,
        }
    }

    async fn set_state(&self, next: ScrobbleAuthState) -> ScrobbleAuthState {
        *self.state.write().await = next.clone();
        next
    }
}
