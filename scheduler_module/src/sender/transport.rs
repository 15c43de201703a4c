use send_emails_module::{GmailClient, GmailSendError, SendEmailParams, SendEmailResult};

/// Outbound mail delivery. One call per attempt; retries are decided by the
/// worker.
pub trait MailTransport: Send + Sync {
    fn send(
        &self,
        access_token: &str,
        params: &SendEmailParams,
    ) -> Result<SendEmailResult, GmailSendError>;
}

impl MailTransport for GmailClient {
    fn send(
        &self,
        access_token: &str,
        params: &SendEmailParams,
    ) -> Result<SendEmailResult, GmailSendError> {
        self.send_email(access_token, params)
    }
}
