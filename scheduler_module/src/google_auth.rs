//! Gmail OAuth access tokens for workspace mailboxes.
//!
//! Tokens live in the outreach store. A token close to expiry is refreshed
//! against the Google token endpoint with a short exponential backoff; a
//! refresh token the provider reports as revoked is deleted so the workspace
//! shows as disconnected until the user signs in again.

use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::store::OutreachStore;
use crate::types::SchedulerError;

pub const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Tokens expiring within this margin are refreshed before use.
const EXPIRY_BUFFER_MINUTES: i64 = 5;
const MAX_REFRESH_ATTEMPTS: u32 = 3;
const INITIAL_REFRESH_BACKOFF: Duration = Duration::from_millis(100);

/// OAuth client used to refresh mailbox tokens.
#[derive(Debug, Clone, Default)]
pub struct GoogleAuthConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Token endpoint; [`DEFAULT_TOKEN_URL`] when unset.
    pub token_url: Option<String>,
}

impl GoogleAuthConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            client_id: std::env::var("GOOGLE_CLIENT_ID").ok(),
            client_secret: std::env::var("GOOGLE_CLIENT_SECRET").ok(),
            token_url: std::env::var("GOOGLE_OAUTH_TOKEN_URL")
                .ok()
                .filter(|value| !value.trim().is_empty()),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.client_id.is_some() && self.client_secret.is_some()
    }

    pub fn token_url(&self) -> &str {
        self.token_url.as_deref().unwrap_or(DEFAULT_TOKEN_URL)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("no Gmail token for workspace {0}")]
    NoToken(String),
    #[error("Gmail access was revoked for workspace {0}; the user must sign in again")]
    ReLoginRequired(String),
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
    #[error(transparent)]
    Store(#[from] SchedulerError),
}

/// Access token ready to use, and the mailbox it sends from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidToken {
    pub access_token: String,
    pub email: String,
}

/// Source of sendable tokens for the sender worker.
pub trait TokenProvider: Send + Sync {
    fn valid_token(&self, workspace_id: &str) -> Result<ValidToken, TokenError>;
}

#[derive(Debug, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    expires_in: i64,
}

enum RefreshFailure {
    Revoked,
    Other(String),
}

/// Store-backed token provider that refreshes through Google OAuth.
#[derive(Debug, Clone)]
pub struct GmailTokenService {
    store: OutreachStore,
    config: GoogleAuthConfig,
    http: reqwest::blocking::Client,
    initial_backoff: Duration,
}

impl GmailTokenService {
    pub fn new(store: OutreachStore, config: GoogleAuthConfig) -> Self {
        Self {
            store,
            config,
            http: reqwest::blocking::Client::new(),
            initial_backoff: INITIAL_REFRESH_BACKOFF,
        }
    }

    /// Overrides the first refresh backoff; later attempts double it.
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Mailbox connected to the workspace, if any.
    pub fn connected_mailbox(&self, workspace_id: &str) -> Result<Option<String>, TokenError> {
        Ok(self
            .store
            .load_gmail_token(workspace_id)?
            .map(|token| token.email))
    }

    fn refresh(&self, refresh_token: &str) -> Result<OAuthTokenResponse, RefreshFailure> {
        let client_id = self.config.client_id.as_deref().unwrap_or_default();
        let client_secret = self.config.client_secret.as_deref().unwrap_or_default();
        let response = self
            .http
            .post(self.config.token_url())
            .form(&[
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .map_err(|err| RefreshFailure::Other(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            if body.contains("invalid_grant") {
                return Err(RefreshFailure::Revoked);
            }
            return Err(RefreshFailure::Other(format!("HTTP {}: {}", status, body)));
        }
        response
            .json::<OAuthTokenResponse>()
            .map_err(|err| RefreshFailure::Other(err.to_string()))
    }
}

impl TokenProvider for GmailTokenService {
    fn valid_token(&self, workspace_id: &str) -> Result<ValidToken, TokenError> {
        let token = self
            .store
            .load_gmail_token(workspace_id)?
            .ok_or_else(|| TokenError::NoToken(workspace_id.to_string()))?;

        let now = Utc::now();
        if token.expires_at - now > ChronoDuration::minutes(EXPIRY_BUFFER_MINUTES) {
            return Ok(ValidToken {
                access_token: token.access_token,
                email: token.email,
            });
        }

        debug!("refreshing Gmail token for workspace {}", workspace_id);
        let mut delay = self.initial_backoff;
        let mut last_error = String::new();
        for attempt in 1..=MAX_REFRESH_ATTEMPTS {
            match self.refresh(&token.refresh_token) {
                Ok(refreshed) => {
                    let expires_at = Utc::now() + ChronoDuration::seconds(refreshed.expires_in);
                    self.store.update_gmail_access_token(
                        workspace_id,
                        &refreshed.access_token,
                        expires_at,
                    )?;
                    return Ok(ValidToken {
                        access_token: refreshed.access_token,
                        email: token.email,
                    });
                }
                Err(RefreshFailure::Revoked) => {
                    error!(
                        "Gmail token revoked for workspace {}; removing it",
                        workspace_id
                    );
                    if let Err(err) = self.store.delete_gmail_token(workspace_id) {
                        warn!("failed to delete revoked token for {}: {}", workspace_id, err);
                    }
                    return Err(TokenError::ReLoginRequired(workspace_id.to_string()));
                }
                Err(RefreshFailure::Other(message)) => {
                    warn!(
                        "token refresh attempt {}/{} for workspace {} failed: {}",
                        attempt, MAX_REFRESH_ATTEMPTS, workspace_id, message
                    );
                    last_error = message;
                    if attempt < MAX_REFRESH_ATTEMPTS {
                        thread::sleep(delay);
                        delay *= 2;
                    }
                }
            }
        }
        Err(TokenError::RefreshFailed(last_error))
    }
}
