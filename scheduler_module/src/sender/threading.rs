use crate::store::OutreachStore;
use crate::types::SchedulerError;

const GMAIL_MESSAGE_ID_DOMAIN: &str = "mail.gmail.com";

/// Where a follow-up step attaches in the prospect's existing thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadContext {
    pub thread_id: String,
    pub in_reply_to: String,
    pub references: String,
    /// Subject of the step-1 message that opened the thread.
    pub original_subject: String,
}

/// Gmail returns bare ids; headers need `<id@mail.gmail.com>`.
pub fn format_message_id_header(message_id: &str) -> String {
    if message_id.starts_with('<') && message_id.ends_with('>') {
        return message_id.to_string();
    }
    format!("<{}@{}>", message_id, GMAIL_MESSAGE_ID_DOMAIN)
}

/// `None` for step 1, which opens a new thread. Later steps reply to the
/// step-1 message and fail when it was never sent.
pub fn thread_context(
    store: &OutreachStore,
    campaign_id: &str,
    prospect_id: &str,
    step_number: u32,
) -> Result<Option<ThreadContext>, SchedulerError> {
    if step_number <= 1 {
        return Ok(None);
    }
    let first = store
        .sent_email_for_step(campaign_id, prospect_id, 1)?
        .ok_or_else(|| SchedulerError::ThreadContextMissing {
            prospect_id: prospect_id.to_string(),
            step_number,
        })?;
    let header = format_message_id_header(&first.message_id);
    Ok(Some(ThreadContext {
        thread_id: first.thread_id,
        in_reply_to: header.clone(),
        references: header,
        original_subject: first.subject,
    }))
}

/// Whether every step before `step_number` has gone out to the prospect.
pub fn are_previous_steps_sent(
    store: &OutreachStore,
    campaign_id: &str,
    prospect_id: &str,
    step_number: u32,
) -> Result<bool, SchedulerError> {
    if step_number <= 1 {
        return Ok(true);
    }
    Ok(store.count_sent_steps(campaign_id, prospect_id)? >= step_number - 1)
}
