//! Gmail transport for outbound prospecting emails.
//!
//! `gmail` wraps the `users.messages.send` endpoint and turns provider failures
//! into a typed [`GmailSendError`]; `compose` builds the base64url RFC 2822
//! payload that endpoint expects.

pub mod compose;
pub mod gmail;

pub use compose::{
    compose_email, encode_rfc2047, render_template, text_to_html, threaded_subject,
    unsubscribe_link, ComposeEmailParams, RenderedTemplate, TemplateVariables,
};
pub use gmail::{
    is_retryable_status, GmailClient, GmailSendError, SendEmailParams, SendEmailResult,
    DEFAULT_GMAIL_API_BASE_URL, NETWORK_ERROR_CODE,
};
