//! Sends due emails through the mail transport.
//!
//! Each row passes the guardrail chain, is claimed (SCHEDULED or
//! RETRY_SCHEDULED -> SENDING), sent once, and then recorded as SENT or
//! handed to the retry policy.

mod guardrails;
mod threading;
mod transport;
mod worker;

pub use guardrails::{GuardrailCode, GuardrailDisposition};
pub use threading::{are_previous_steps_sent, format_message_id_header, thread_context, ThreadContext};
pub use transport::MailTransport;
pub use worker::{
    EmailSenderWorker, ProcessingStats, SendOutcome, WorkerOptions, DEFAULT_BATCH_LIMIT,
    DEFAULT_INTER_EMAIL_DELAY,
};

#[cfg(test)]
mod tests;
