use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use send_emails_module::{
    compose_email, render_template, text_to_html, threaded_subject, unsubscribe_link,
    ComposeEmailParams, SendEmailParams, TemplateVariables,
};

use crate::anomaly::{AnomalyAction, AutoPauseService};
use crate::control::{enrollment_transition, EnrollmentAction};
use crate::google_auth::TokenProvider;
use crate::quota::QuotaService;
use crate::retry::{decide_failure, is_bounce_error, FailureDecision, FailureSignal};
use crate::sending_window::local_day_bounds;
use crate::store::{ClaimOutcome, OutreachStore, SendRecord};
use crate::types::{CampaignProspect, ScheduledEmail, SchedulerError, SequenceStep};

use super::guardrails::{
    check_guardrails, GuardrailCode, GuardrailDisposition, GuardrailOutcome, SendContext,
};
use super::threading::thread_context;
use super::transport::MailTransport;

pub const DEFAULT_BATCH_LIMIT: usize = 50;
pub const DEFAULT_INTER_EMAIL_DELAY: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub batch_limit: usize,
    /// Pause between two transport calls.
    pub inter_email_delay: Duration,
    /// Base URL for unsubscribe links; no footer when unset.
    pub app_base_url: Option<String>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            batch_limit: DEFAULT_BATCH_LIMIT,
            inter_email_delay: DEFAULT_INTER_EMAIL_DELAY,
            app_base_url: None,
        }
    }
}

/// Counters for one sender pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessingStats {
    pub processed: usize,
    pub sent: usize,
    pub skipped_quota: usize,
    pub deferred: usize,
    pub cancelled: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

/// What happened to one due row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent {
        message_id: String,
        thread_id: String,
    },
    Deferred(GuardrailCode),
    Cancelled(GuardrailCode),
    RetryScheduled {
        attempt_count: u32,
        next_retry_at: DateTime<Utc>,
    },
    Failed {
        last_error: String,
    },
    /// Another worker claimed the row first.
    AlreadyClaimed,
}

/// The parts of a composed message that are sent and then recorded.
struct OutgoingMessage {
    params: SendEmailParams,
    subject: String,
    body: String,
    headers: BTreeMap<String, String>,
    next_enrollment: CampaignProspect,
}

pub struct EmailSenderWorker<T: MailTransport, P: TokenProvider> {
    store: OutreachStore,
    transport: T,
    tokens: P,
    quota: QuotaService,
    anomaly: AutoPauseService,
    options: WorkerOptions,
}

impl<T: MailTransport, P: TokenProvider> EmailSenderWorker<T, P> {
    pub fn new(store: OutreachStore, transport: T, tokens: P, options: WorkerOptions) -> Self {
        Self {
            quota: QuotaService::new(store.clone()),
            anomaly: AutoPauseService::new(store.clone()),
            store,
            transport,
            tokens,
            options,
        }
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// One pass over due rows, up to the batch limit. Per-row errors are
    /// logged and counted; they never abort the pass.
    pub fn process_pending_emails(&self) -> Result<ProcessingStats, SchedulerError> {
        let started = Instant::now();
        let due = self
            .store
            .due_scheduled_emails(Utc::now(), self.options.batch_limit)?;
        let mut stats = ProcessingStats::default();
        if due.is_empty() {
            debug!("no pending emails");
            return Ok(stats);
        }
        info!("processing {} pending email(s)", due.len());

        let mut quota_blocked: HashSet<String> = HashSet::new();
        let mut touched_workspaces: BTreeSet<String> = BTreeSet::new();
        let mut evaluated_campaigns: HashSet<String> = HashSet::new();

        for (index, email) in due.iter().enumerate() {
            if quota_blocked.contains(&email.workspace_id) {
                continue;
            }
            touched_workspaces.insert(email.workspace_id.clone());
            let outcome = match self.process_email(email, &mut evaluated_campaigns) {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!("failed to process scheduled email {}: {}", email.id, err);
                    stats.processed += 1;
                    stats.failed += 1;
                    continue;
                }
            };

            match outcome {
                SendOutcome::AlreadyClaimed => continue,
                SendOutcome::Sent { .. } => stats.sent += 1,
                SendOutcome::Deferred(GuardrailCode::QuotaExceeded) => {
                    stats.skipped_quota += 1;
                    quota_blocked.insert(email.workspace_id.clone());
                    info!(
                        "daily quota reached for workspace {}; skipping its remaining emails",
                        email.workspace_id
                    );
                }
                SendOutcome::Deferred(_) => stats.deferred += 1,
                SendOutcome::Cancelled(_) => stats.cancelled += 1,
                SendOutcome::RetryScheduled { .. } | SendOutcome::Failed { .. } => {
                    stats.failed += 1
                }
            }
            stats.processed += 1;

            let called_transport = matches!(
                outcome,
                SendOutcome::Sent { .. }
                    | SendOutcome::RetryScheduled { .. }
                    | SendOutcome::Failed { .. }
            );
            if called_transport
                && index + 1 < due.len()
                && !self.options.inter_email_delay.is_zero()
            {
                thread::sleep(self.options.inter_email_delay);
            }
        }

        for workspace_id in &touched_workspaces {
            if let Err(err) = self.anomaly.sweep_workspace(workspace_id, &evaluated_campaigns) {
                warn!("anomaly sweep failed for workspace {}: {}", workspace_id, err);
            }
        }

        stats.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            "sender pass done: {} processed, {} sent, {} quota-skipped, {} deferred, {} cancelled, {} failed in {}ms",
            stats.processed,
            stats.sent,
            stats.skipped_quota,
            stats.deferred,
            stats.cancelled,
            stats.failed,
            stats.duration_ms
        );
        Ok(stats)
    }

    /// Guardrails, claim, send and bookkeeping for a single row.
    pub fn process_email(
        &self,
        email: &ScheduledEmail,
        evaluated_campaigns: &mut HashSet<String>,
    ) -> Result<SendOutcome, SchedulerError> {
        let now = Utc::now();
        let context = match check_guardrails(&self.store, &self.quota, &self.tokens, email, now)? {
            GuardrailOutcome::Pass(context) => context,
            GuardrailOutcome::Blocked(code) => return self.block(email, code, now),
        };

        let (day_start, day_end) = local_day_bounds(context.settings.timezone, now)?;
        match self
            .store
            .claim_within_quota(email, day_start, day_end, context.daily_cap, now)?
        {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::AlreadyClaimed => {
                debug!("scheduled email {} already claimed", email.id);
                return Ok(SendOutcome::AlreadyClaimed);
            }
            ClaimOutcome::QuotaExceeded => {
                return self.block(email, GuardrailCode::QuotaExceeded, now)
            }
        }

        let message = match self.compose(email, &context, now) {
            Ok(message) => message,
            Err(err) if is_store_failure(&err) => {
                // Nothing was sent; give the row back for a later pass.
                if let Err(release_err) = self.store.release_claim(&email.id, email.status, now) {
                    error!(
                        "failed to release scheduled email {}: {}",
                        email.id, release_err
                    );
                }
                return Err(err);
            }
            Err(err) => {
                return self.handle_failure(email, err.to_string().as_str(), evaluated_campaigns)
            }
        };

        match self.transport.send(&context.token.access_token, &message.params) {
            Ok(result) => {
                let record = SendRecord {
                    email,
                    message_id: &result.message_id,
                    thread_id: &result.thread_id,
                    subject: &message.subject,
                    body: &message.body,
                    from_email: &context.token.email,
                    to_email: &context.prospect.email,
                    headers: &message.headers,
                    sent_at: Utc::now(),
                    next_enrollment: Some(&message.next_enrollment),
                };
                if let Err(err) = self.store.record_successful_send(&record) {
                    error!(
                        "email {} was sent (message {}) but recording it failed: {}",
                        email.id, result.message_id, err
                    );
                } else {
                    info!(
                        "sent email {} step {} to {} (message {})",
                        email.id, email.step_number, context.prospect.email, result.message_id
                    );
                }
                Ok(SendOutcome::Sent {
                    message_id: result.message_id,
                    thread_id: result.thread_id,
                })
            }
            Err(err) => self.handle_failure(email, &err, evaluated_campaigns),
        }
    }

    fn block(
        &self,
        email: &ScheduledEmail,
        code: GuardrailCode,
        now: DateTime<Utc>,
    ) -> Result<SendOutcome, SchedulerError> {
        match code.disposition() {
            GuardrailDisposition::Cancel => {
                self.store
                    .cancel_scheduled_email(&email.id, code.description(), now)?;
                info!("cancelled scheduled email {}: {}", email.id, code);
                Ok(SendOutcome::Cancelled(code))
            }
            GuardrailDisposition::Defer => {
                debug!("deferred scheduled email {}: {}", email.id, code);
                Ok(SendOutcome::Deferred(code))
            }
        }
    }

    fn compose(
        &self,
        email: &ScheduledEmail,
        context: &SendContext,
        now: DateTime<Utc>,
    ) -> Result<OutgoingMessage, SchedulerError> {
        let steps = self.store.load_sequence_steps(&email.sequence_id)?;
        let step = find_step(&steps, email)?;
        let last_step = steps.iter().map(|step| step.step_number).max().unwrap_or(0);
        let thread = thread_context(
            &self.store,
            &email.campaign_id,
            &email.prospect_id,
            email.step_number,
        )?;

        let prospect = &context.prospect;
        let variables = TemplateVariables {
            first_name: prospect.first_name.as_deref(),
            last_name: prospect.last_name.as_deref(),
            company: prospect.company.as_deref(),
            title: prospect.title.as_deref(),
            email: Some(prospect.email.as_str()),
        };
        let rendered_subject = render_template(&step.subject, &variables).text;
        let body = text_to_html(&render_template(&step.body, &variables).text);
        let subject = match &thread {
            Some(thread) => threaded_subject(&thread.original_subject),
            None => rendered_subject,
        };
        let unsubscribe = self
            .options
            .app_base_url
            .as_deref()
            .map(|base| unsubscribe_link(base, &prospect.id, &email.workspace_id));
        let date = now.to_rfc2822();

        let raw = compose_email(&ComposeEmailParams {
            from: &context.token.email,
            from_name: context.settings.from_name.as_deref(),
            to: &prospect.email,
            subject: &subject,
            body: &body,
            date: &date,
            in_reply_to: thread.as_ref().map(|thread| thread.in_reply_to.as_str()),
            references: thread.as_ref().map(|thread| thread.references.as_str()),
            signature: context.settings.signature.as_deref(),
            unsubscribe_link: unsubscribe.as_deref(),
        });

        let mut headers = BTreeMap::new();
        headers.insert("from".to_string(), context.token.email.clone());
        headers.insert("to".to_string(), prospect.email.clone());
        headers.insert("subject".to_string(), subject.clone());
        if let Some(thread) = &thread {
            headers.insert("inReplyTo".to_string(), thread.in_reply_to.clone());
            headers.insert("references".to_string(), thread.references.clone());
        }

        let mut next_enrollment = context.enrollment.clone();
        next_enrollment.current_step = email.step_number + 1;
        if email.step_number >= last_step {
            next_enrollment.enrollment_status = enrollment_transition(
                next_enrollment.enrollment_status,
                EnrollmentAction::Complete,
            )
            .map_err(|err| SchedulerError::Storage(err.to_string()))?;
            next_enrollment.completed_at = Some(now);
        }

        Ok(OutgoingMessage {
            params: SendEmailParams {
                raw,
                thread_id: thread.map(|thread| thread.thread_id),
            },
            subject,
            body,
            headers,
            next_enrollment,
        })
    }

    /// Retry or give up on a claimed row, then re-check the campaign when the
    /// failure looks like a bounce.
    fn handle_failure<E: FailureSignal + ?Sized>(
        &self,
        email: &ScheduledEmail,
        error: &E,
        evaluated_campaigns: &mut HashSet<String>,
    ) -> Result<SendOutcome, SchedulerError> {
        let now = Utc::now();
        match decide_failure(error, email.attempt_count, now) {
            FailureDecision::Retry {
                attempt_count,
                next_retry_at,
                last_error,
            } => {
                self.store.mark_retry_scheduled(
                    &email.id,
                    attempt_count,
                    next_retry_at,
                    &last_error,
                    now,
                )?;
                warn!(
                    "send of email {} failed (attempt {}), retrying at {}: {}",
                    email.id, attempt_count, next_retry_at, last_error
                );
                Ok(SendOutcome::RetryScheduled {
                    attempt_count,
                    next_retry_at,
                })
            }
            FailureDecision::GiveUp {
                attempt_count,
                last_error,
            } => {
                self.store
                    .mark_permanently_failed(&email.id, attempt_count, &last_error, now)?;
                error!("email {} permanently failed: {}", email.id, last_error);
                if is_bounce_error(&last_error) {
                    evaluated_campaigns.insert(email.campaign_id.clone());
                    match self.anomaly.check_campaign(&email.campaign_id) {
                        Ok(AnomalyAction::Paused(_)) => warn!(
                            "campaign {} paused after bounce on email {}",
                            email.campaign_id, email.id
                        ),
                        Ok(_) => {}
                        Err(err) => warn!(
                            "anomaly check failed for campaign {}: {}",
                            email.campaign_id, err
                        ),
                    }
                }
                Ok(SendOutcome::Failed { last_error })
            }
        }
    }
}

/// Store-level errors while composing leave the row retryable; anything else
/// is a defect in the sequence or thread data.
fn is_store_failure(err: &SchedulerError) -> bool {
    matches!(
        err,
        SchedulerError::Io(_)
            | SchedulerError::Sqlite(_)
            | SchedulerError::DateTimeParse(_)
            | SchedulerError::Json(_)
    )
}

fn find_step<'a>(
    steps: &'a [SequenceStep],
    email: &ScheduledEmail,
) -> Result<&'a SequenceStep, SchedulerError> {
    steps
        .iter()
        .find(|step| step.step_number == email.step_number)
        .ok_or_else(|| {
            SchedulerError::Storage(format!(
                "sequence {} has no step {}",
                email.sequence_id, email.step_number
            ))
        })
}
