use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

pub const DEFAULT_GMAIL_API_BASE_URL: &str = "https://gmail.googleapis.com";
pub const NETWORK_ERROR_CODE: &str = "NETWORK_ERROR";

const SEND_PATH: &str = "/gmail/v1/users/me/messages/send";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Body of a `users.messages.send` call.
#[derive(Debug, Clone, Serialize)]
pub struct SendEmailParams {
    /// Full RFC 2822 message, base64url encoded without padding.
    pub raw: String,
    #[serde(rename = "threadId", skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendEmailResult {
    pub message_id: String,
    pub thread_id: String,
    pub label_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GmailSendResponse {
    id: String,
    #[serde(rename = "threadId")]
    thread_id: String,
    #[serde(rename = "labelIds", default)]
    label_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GmailErrorEnvelope {
    error: Option<GmailErrorBody>,
}

#[derive(Debug, Deserialize)]
struct GmailErrorBody {
    message: Option<String>,
    status: Option<String>,
    #[serde(default)]
    errors: Vec<GmailErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct GmailErrorDetail {
    reason: Option<String>,
}

/// A failed send, classified at the transport boundary.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct GmailSendError {
    pub message: String,
    /// Provider reason (`rateLimitExceeded`, `invalidArgument`, ...), `HTTP_<status>`
    /// when the body carries none, or [`NETWORK_ERROR_CODE`].
    pub code: String,
    pub status_code: Option<u16>,
    pub is_retryable: bool,
}

impl GmailSendError {
    pub fn from_response(status: u16, body: &str) -> Self {
        let parsed = serde_json::from_str::<GmailErrorEnvelope>(body)
            .ok()
            .and_then(|envelope| envelope.error);
        let (message, code) = match parsed {
            Some(error) => {
                let code = error
                    .errors
                    .iter()
                    .find_map(|detail| detail.reason.clone())
                    .or(error.status)
                    .unwrap_or_else(|| format!("HTTP_{}", status));
                let message = error
                    .message
                    .unwrap_or_else(|| format!("Gmail API returned HTTP {}", status));
                (message, code)
            }
            None => (
                format!("Gmail API returned HTTP {}", status),
                format!("HTTP_{}", status),
            ),
        };
        Self {
            message,
            code,
            status_code: Some(status),
            is_retryable: is_retryable_status(status),
        }
    }

    pub fn network(err: impl std::fmt::Display) -> Self {
        Self {
            message: format!("network error: {}", err),
            code: NETWORK_ERROR_CODE.to_string(),
            status_code: None,
            is_retryable: true,
        }
    }
}

/// 429 and 5xx are transient; every other 4xx is final.
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

#[derive(Debug, Clone)]
pub struct GmailClient {
    api_base: String,
    http: reqwest::blocking::Client,
}

impl GmailClient {
    pub fn new(api_base: impl Into<String>) -> Result<Self, GmailSendError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(GmailSendError::network)?;
        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn from_env() -> Result<Self, GmailSendError> {
        dotenvy::dotenv().ok();
        let api_base = env::var("GMAIL_API_BASE_URL")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_GMAIL_API_BASE_URL.to_string());
        Self::new(api_base)
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// Sends one message. The call is made exactly once; retrying is the
    /// caller's decision, driven by [`GmailSendError::is_retryable`].
    pub fn send_email(
        &self,
        access_token: &str,
        params: &SendEmailParams,
    ) -> Result<SendEmailResult, GmailSendError> {
        let url = format!("{}{}", self.api_base, SEND_PATH);
        let response = self
            .http
            .post(url)
            .bearer_auth(access_token)
            .json(params)
            .send()
            .map_err(GmailSendError::network)?;

        let status = response.status();
        let body = response.text().map_err(GmailSendError::network)?;
        if !status.is_success() {
            return Err(GmailSendError::from_response(status.as_u16(), &body));
        }

        let parsed: GmailSendResponse = serde_json::from_str(&body).map_err(|err| GmailSendError {
            message: format!("unexpected Gmail send response: {}", err),
            code: "INVALID_RESPONSE".to_string(),
            status_code: Some(status.as_u16()),
            is_retryable: false,
        })?;
        Ok(SendEmailResult {
            message_id: parsed.id,
            thread_id: parsed.thread_id,
            label_ids: parsed.label_ids,
        })
    }
}
