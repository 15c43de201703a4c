use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use send_emails_module::{GmailSendError, SendEmailParams, SendEmailResult};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use super::guardrails::{check_guardrails, GuardrailOutcome};
use super::*;
use crate::control::CampaignControl;
use crate::google_auth::{TokenError, TokenProvider, ValidToken};
use crate::quota::QuotaService;
use crate::sending_window::{local_day_bounds, SendingSettings};
use crate::store::ClaimOutcome;
use crate::test_fixtures::{all_day_settings, Fixture};
use crate::types::{
    CampaignStatus, EnrollmentStatus, MessageDirection, ProspectStatus, ScheduledEmailStatus,
    SchedulerError,
};

#[derive(Clone, Default)]
struct FakeTransport {
    responses: Arc<Mutex<VecDeque<Result<SendEmailResult, GmailSendError>>>>,
    calls: Arc<Mutex<Vec<(String, SendEmailParams)>>>,
}

impl FakeTransport {
    fn respond(&self, response: Result<SendEmailResult, GmailSendError>) {
        self.responses.lock().expect("responses").push_back(response);
    }

    fn accept(&self, message_id: &str, thread_id: &str) {
        self.respond(Ok(SendEmailResult {
            message_id: message_id.to_string(),
            thread_id: thread_id.to_string(),
            label_ids: vec!["SENT".to_string()],
        }));
    }

    fn calls(&self) -> Vec<(String, SendEmailParams)> {
        self.calls.lock().expect("calls").clone()
    }
}

impl MailTransport for FakeTransport {
    fn send(
        &self,
        access_token: &str,
        params: &SendEmailParams,
    ) -> Result<SendEmailResult, GmailSendError> {
        self.calls
            .lock()
            .expect("calls")
            .push((access_token.to_string(), params.clone()));
        self.responses
            .lock()
            .expect("responses")
            .pop_front()
            .unwrap_or_else(|| Err(GmailSendError::network("no scripted response")))
    }
}

#[derive(Clone, Copy)]
enum FakeTokens {
    Valid,
    Revoked,
    RefreshFails,
}

impl TokenProvider for FakeTokens {
    fn valid_token(&self, workspace_id: &str) -> Result<ValidToken, TokenError> {
        match self {
            FakeTokens::Valid => Ok(ValidToken {
                access_token: "access-token".to_string(),
                email: "founder@acme.test".to_string(),
            }),
            FakeTokens::Revoked => Err(TokenError::ReLoginRequired(workspace_id.to_string())),
            FakeTokens::RefreshFails => Err(TokenError::RefreshFailed("HTTP 500".to_string())),
        }
    }
}

fn worker(fixture: &Fixture, tokens: FakeTokens) -> (EmailSenderWorker<FakeTransport, FakeTokens>, FakeTransport) {
    let transport = FakeTransport::default();
    let worker = EmailSenderWorker::new(
        fixture.store.clone(),
        transport.clone(),
        tokens,
        WorkerOptions {
            batch_limit: 10,
            inter_email_delay: std::time::Duration::ZERO,
            app_base_url: Some("https://app.example.test".to_string()),
        },
    );
    (worker, transport)
}

fn decode(raw: &str) -> String {
    String::from_utf8(URL_SAFE_NO_PAD.decode(raw).expect("base64url")).expect("utf8")
}

fn gmail_error(status: u16, code: &str, message: &str) -> GmailSendError {
    GmailSendError {
        message: message.to_string(),
        code: code.to_string(),
        status_code: Some(status),
        is_retryable: status == 429 || status >= 500,
    }
}

fn due_now() -> chrono::DateTime<Utc> {
    Utc::now() - Duration::seconds(1)
}

#[test]
fn sends_first_step_and_records_bookkeeping() {
    let fixture = Fixture::new(2);
    let email = fixture.insert_email(1, due_now(), ScheduledEmailStatus::Scheduled);
    let (worker, transport) = worker(&fixture, FakeTokens::Valid);
    transport.accept("msg-1", "thread-abc");

    let stats = worker.process_pending_emails().expect("pass");
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.sent, 1);
    assert_eq!(stats.failed, 0);

    let calls = transport.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "access-token");
    assert_eq!(calls[0].1.thread_id, None);
    let raw = decode(&calls[0].1.raw);
    assert!(raw.contains("To: ada@example.com"));
    assert!(raw.contains("Subject: Step 1 for Initech"));
    assert!(raw.contains("Hi Ada,<br>Quick question."));
    assert!(raw.contains("https://app.example.test/api/unsubscribe?p="));
    assert!(!raw.contains("In-Reply-To"));

    let stored = fixture.reload_email(&email.id);
    assert_eq!(stored.status, ScheduledEmailStatus::Sent);
    assert_eq!(stored.message_id.as_deref(), Some("msg-1"));
    assert_eq!(stored.thread_id.as_deref(), Some("thread-abc"));
    assert!(stored.sent_at.is_some());
    assert_eq!(stored.attempt_count, 0);

    let enrollment = fixture
        .store
        .load_enrollment(&fixture.campaign.id, &fixture.prospect.id)
        .expect("load")
        .expect("enrollment");
    assert_eq!(enrollment.current_step, 2);
    assert_eq!(enrollment.enrollment_status, EnrollmentStatus::Enrolled);

    let conversation = fixture
        .store
        .load_conversation(&fixture.workspace.id, "thread-abc")
        .expect("load")
        .expect("conversation");
    assert_eq!(conversation.status, "OPEN");
    let messages = fixture
        .store
        .inbox_messages(&conversation.id)
        .expect("messages");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].direction, MessageDirection::Outbound);
    assert!(messages[0].is_read);
    assert_eq!(messages[0].gmail_message_id, "msg-1");
}

#[test]
fn follow_up_replies_in_first_thread_and_completes_enrollment() {
    let fixture = Fixture::new(2);
    fixture.insert_email(1, due_now(), ScheduledEmailStatus::Scheduled);
    let (worker, transport) = worker(&fixture, FakeTokens::Valid);
    transport.accept("msg-1", "thread-abc");
    worker.process_pending_emails().expect("first pass");

    let follow_up = fixture.insert_email(2, due_now(), ScheduledEmailStatus::Scheduled);
    transport.accept("msg-2", "thread-abc");
    let stats = worker.process_pending_emails().expect("second pass");
    assert_eq!(stats.sent, 1);

    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].1.thread_id.as_deref(), Some("thread-abc"));
    let raw = decode(&calls[1].1.raw);
    assert!(raw.contains("Subject: Re: Step 1 for Initech"));
    assert!(raw.contains("In-Reply-To: <msg-1@mail.gmail.com>"));
    assert!(raw.contains("References: <msg-1@mail.gmail.com>"));

    assert_eq!(
        fixture.reload_email(&follow_up.id).status,
        ScheduledEmailStatus::Sent
    );
    let enrollment = fixture
        .store
        .load_enrollment(&fixture.campaign.id, &fixture.prospect.id)
        .expect("load")
        .expect("enrollment");
    assert_eq!(enrollment.enrollment_status, EnrollmentStatus::Completed);
    assert!(enrollment.completed_at.is_some());

    let conversation = fixture
        .store
        .load_conversation(&fixture.workspace.id, "thread-abc")
        .expect("load")
        .expect("conversation");
    assert_eq!(
        fixture
            .store
            .inbox_messages(&conversation.id)
            .expect("messages")
            .len(),
        2
    );
}

#[test]
fn follow_up_waits_for_previous_step() {
    let fixture = Fixture::new(2);
    let email = fixture.insert_email(2, due_now(), ScheduledEmailStatus::Scheduled);
    let (worker, transport) = worker(&fixture, FakeTokens::Valid);

    let outcome = worker
        .process_email(&email, &mut HashSet::new())
        .expect("process");
    assert_eq!(outcome, SendOutcome::Deferred(GuardrailCode::PreviousStepPending));
    assert!(transport.calls().is_empty());
    assert_eq!(
        fixture.reload_email(&email.id).status,
        ScheduledEmailStatus::Scheduled
    );
}

#[test]
fn paused_campaign_defers_and_finished_campaign_cancels() {
    let fixture = Fixture::new(1);
    let email = fixture.insert_email(1, due_now(), ScheduledEmailStatus::Scheduled);
    let (worker, transport) = worker(&fixture, FakeTokens::Valid);
    let control = CampaignControl::new(fixture.store.clone());

    control
        .pause(&fixture.campaign.id, &fixture.workspace.id)
        .expect("pause");
    let stats = worker.process_pending_emails().expect("pass");
    assert_eq!(stats.deferred, 1);
    assert_eq!(
        fixture.reload_email(&email.id).status,
        ScheduledEmailStatus::Scheduled
    );

    control
        .resume(&fixture.campaign.id, &fixture.workspace.id)
        .expect("resume");
    control
        .complete(&fixture.campaign.id, &fixture.workspace.id)
        .expect("complete");
    let shifted = fixture.reload_email(&email.id);
    let outcome = worker
        .process_email(&shifted, &mut HashSet::new())
        .expect("process");
    assert_eq!(outcome, SendOutcome::Cancelled(GuardrailCode::CampaignNotRunning));

    let stored = fixture.reload_email(&email.id);
    assert_eq!(stored.status, ScheduledEmailStatus::Cancelled);
    assert_eq!(stored.last_error.as_deref(), Some("Campaign not running"));
    assert!(transport.calls().is_empty());
}

#[test]
fn ineligible_prospect_is_cancelled() {
    let fixture = Fixture::new(1);
    let email = fixture.insert_email(1, due_now(), ScheduledEmailStatus::Scheduled);
    fixture
        .store
        .update_prospect_status(&fixture.prospect.id, ProspectStatus::Suppressed)
        .expect("suppress");
    let (worker, _) = worker(&fixture, FakeTokens::Valid);

    let stats = worker.process_pending_emails().expect("pass");
    assert_eq!(stats.cancelled, 1);
    let stored = fixture.reload_email(&email.id);
    assert_eq!(stored.status, ScheduledEmailStatus::Cancelled);
    assert_eq!(
        stored.last_error.as_deref(),
        Some("Prospect not eligible for sending")
    );
}

#[test]
fn token_problems_defer_without_sending() {
    let fixture = Fixture::new(1);
    let email = fixture.insert_email(1, due_now(), ScheduledEmailStatus::Scheduled);

    let (revoked, transport) = worker(&fixture, FakeTokens::Revoked);
    assert_eq!(
        revoked
            .process_email(&email, &mut HashSet::new())
            .expect("process"),
        SendOutcome::Deferred(GuardrailCode::GmailReloginRequired)
    );

    let (failing, _) = worker(&fixture, FakeTokens::RefreshFails);
    assert_eq!(
        failing
            .process_email(&email, &mut HashSet::new())
            .expect("process"),
        SendOutcome::Deferred(GuardrailCode::GmailTokenInvalid)
    );

    fixture
        .store
        .delete_gmail_token(&fixture.workspace.id)
        .expect("delete");
    let (disconnected, _) = worker(&fixture, FakeTokens::Valid);
    assert_eq!(
        disconnected
            .process_email(&email, &mut HashSet::new())
            .expect("process"),
        SendOutcome::Deferred(GuardrailCode::GmailNotConnected)
    );

    assert!(transport.calls().is_empty());
    assert_eq!(
        fixture.reload_email(&email.id).status,
        ScheduledEmailStatus::Scheduled
    );
}

#[test]
fn transient_failure_schedules_retry() {
    let fixture = Fixture::new(1);
    let email = fixture.insert_email(1, due_now(), ScheduledEmailStatus::Scheduled);
    let (worker, transport) = worker(&fixture, FakeTokens::Valid);
    transport.respond(Err(gmail_error(503, "backendError", "Backend Error")));

    let before = Utc::now();
    let stats = worker.process_pending_emails().expect("pass");
    assert_eq!(stats.failed, 1);

    let stored = fixture.reload_email(&email.id);
    assert_eq!(stored.status, ScheduledEmailStatus::RetryScheduled);
    assert_eq!(stored.attempt_count, 1);
    assert_eq!(stored.last_error.as_deref(), Some("Backend Error"));
    let next_retry_at = stored.next_retry_at.expect("next retry");
    assert!(next_retry_at >= before + Duration::minutes(1));
    assert!(next_retry_at <= Utc::now() + Duration::minutes(1));
}

#[test]
fn retry_exhaustion_fails_permanently() {
    let fixture = Fixture::new(1);
    let mut email = fixture.insert_email(1, due_now(), ScheduledEmailStatus::Scheduled);
    let (worker, transport) = worker(&fixture, FakeTokens::Valid);
    email.attempt_count = 2;
    transport.respond(Err(gmail_error(429, "rateLimitExceeded", "Rate Limit Exceeded")));

    let outcome = worker
        .process_email(&email, &mut HashSet::new())
        .expect("process");
    assert_eq!(
        outcome,
        SendOutcome::Failed {
            last_error: "Max retries exceeded (3/3): Rate Limit Exceeded".to_string()
        }
    );
    let stored = fixture.reload_email(&email.id);
    assert_eq!(stored.status, ScheduledEmailStatus::PermanentlyFailed);
    assert_eq!(stored.attempt_count, 3);
}

#[test]
fn hard_bounce_fails_and_triggers_anomaly_check() {
    let fixture = Fixture::new(1);
    let email = fixture.insert_email(1, due_now(), ScheduledEmailStatus::Scheduled);
    let (worker, transport) = worker(&fixture, FakeTokens::Valid);
    transport.respond(Err(gmail_error(
        400,
        "invalidArgument",
        "Recipient address rejected",
    )));

    let mut evaluated = HashSet::new();
    let outcome = worker.process_email(&email, &mut evaluated).expect("process");
    assert_eq!(
        outcome,
        SendOutcome::Failed {
            last_error: "Non-retryable error: Recipient address rejected".to_string()
        }
    );
    assert!(evaluated.contains(&fixture.campaign.id));
    // One failure is below every volume tier, so the campaign keeps running.
    assert_eq!(fixture.reload_campaign().status, CampaignStatus::Running);
}

#[test]
fn quota_exhaustion_skips_rest_of_workspace() {
    let settings = SendingSettings {
        daily_quota: 1,
        ..all_day_settings()
    };
    let fixture = Fixture::with_settings(1, settings);
    let earlier = fixture.add_prospect("earlier@example.com");
    fixture.insert_email_for(&earlier, 1, Utc::now(), ScheduledEmailStatus::Sent);
    let first = fixture.insert_email(1, due_now(), ScheduledEmailStatus::Scheduled);
    let other = fixture.add_prospect("grace@example.com");
    let second = fixture.insert_email_for(&other, 1, due_now(), ScheduledEmailStatus::Scheduled);
    let (worker, transport) = worker(&fixture, FakeTokens::Valid);

    let stats = worker.process_pending_emails().expect("pass");
    assert_eq!(stats.skipped_quota, 1);
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.sent, 0);
    assert!(transport.calls().is_empty());
    for id in [&first.id, &second.id] {
        assert_eq!(
            fixture.reload_email(id).status,
            ScheduledEmailStatus::Scheduled
        );
    }
}

#[test]
fn row_claimed_elsewhere_is_left_alone() {
    let fixture = Fixture::new(1);
    let email = fixture.insert_email(1, due_now(), ScheduledEmailStatus::Scheduled);
    assert!(fixture
        .store
        .claim_for_sending(&email.id, Utc::now())
        .expect("claim"));
    let (worker, transport) = worker(&fixture, FakeTokens::Valid);

    let outcome = worker
        .process_email(&email, &mut HashSet::new())
        .expect("process");
    assert_eq!(outcome, SendOutcome::AlreadyClaimed);
    assert!(transport.calls().is_empty());
}

#[test]
fn message_id_header_formatting() {
    assert_eq!(
        format_message_id_header("18e1234567890abc"),
        "<18e1234567890abc@mail.gmail.com>"
    );
    assert_eq!(
        format_message_id_header("<already@mail.gmail.com>"),
        "<already@mail.gmail.com>"
    );
}

#[test]
fn guardrail_dispositions() {
    assert_eq!(
        GuardrailCode::CampaignPaused.disposition(),
        GuardrailDisposition::Defer
    );
    assert_eq!(
        GuardrailCode::CampaignNotRunning.disposition(),
        GuardrailDisposition::Cancel
    );
    assert_eq!(
        GuardrailCode::GmailReloginRequired.disposition(),
        GuardrailDisposition::Defer
    );
    assert_eq!(GuardrailCode::QuotaExceeded.as_str(), "QUOTA_EXCEEDED");
}

#[test]
fn quota_holds_when_two_passes_overlap() {
    let settings = SendingSettings {
        daily_quota: 1,
        ..all_day_settings()
    };
    let fixture = Fixture::with_settings(1, settings);
    let first = fixture.insert_email(1, due_now(), ScheduledEmailStatus::Scheduled);
    let other = fixture.add_prospect("grace@example.com");
    let second = fixture.insert_email_for(&other, 1, due_now(), ScheduledEmailStatus::Scheduled);
    let quota = QuotaService::new(fixture.store.clone());
    let now = Utc::now();

    // Both passes check before either claims.
    let mut caps = Vec::new();
    for email in [&first, &second] {
        match check_guardrails(&fixture.store, &quota, &FakeTokens::Valid, email, now)
            .expect("guardrails")
        {
            GuardrailOutcome::Pass(context) => caps.push(context.daily_cap),
            GuardrailOutcome::Blocked(code) => panic!("unexpected block: {code}"),
        }
    }
    assert_eq!(caps, vec![1, 1]);

    let (day_start, day_end) = local_day_bounds(chrono_tz::UTC, now).expect("day");
    let claims: Vec<ClaimOutcome> = [&first, &second]
        .into_iter()
        .map(|email| {
            fixture
                .store
                .claim_within_quota(email, day_start, day_end, 1, now)
                .expect("claim")
        })
        .collect();
    assert_eq!(claims, vec![ClaimOutcome::Claimed, ClaimOutcome::QuotaExceeded]);
    assert_eq!(
        fixture
            .store
            .count_sent_or_sending(&fixture.workspace.id, day_start, day_end)
            .expect("count"),
        1
    );
    assert_eq!(
        fixture.reload_email(&second.id).status,
        ScheduledEmailStatus::Scheduled
    );

    // The worker turns a lost claim race into a quota deferral.
    let (worker, transport) = worker(&fixture, FakeTokens::Valid);
    let outcome = worker
        .process_email(&second, &mut HashSet::new())
        .expect("process");
    assert_eq!(outcome, SendOutcome::Deferred(GuardrailCode::QuotaExceeded));
    assert!(transport.calls().is_empty());
}

#[test]
fn store_error_while_composing_releases_the_claim() {
    let fixture = Fixture::new(1);
    let email = fixture.insert_email(1, due_now(), ScheduledEmailStatus::Scheduled);
    // An unreadable step row makes loading the sequence fail with a sqlite error.
    fixture
        .store
        .open()
        .expect("open")
        .execute("UPDATE sequence_steps SET subject = X'FF00'", [])
        .expect("corrupt step");
    let (worker, transport) = worker(&fixture, FakeTokens::Valid);

    let err = worker
        .process_email(&email, &mut HashSet::new())
        .expect_err("store failure");
    assert!(matches!(err, SchedulerError::Sqlite(_)));
    assert!(transport.calls().is_empty());
    let stored = fixture.reload_email(&email.id);
    assert_eq!(stored.status, ScheduledEmailStatus::Scheduled);
    assert_eq!(stored.attempt_count, 0);
    assert_eq!(stored.last_error, None);

    let stats = worker.process_pending_emails().expect("pass");
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.sent, 0);
    assert_eq!(
        fixture.reload_email(&email.id).status,
        ScheduledEmailStatus::Scheduled
    );
}

#[test]
fn missing_step_still_fails_permanently() {
    let fixture = Fixture::new(1);
    let email = fixture.insert_email(1, due_now(), ScheduledEmailStatus::Scheduled);
    fixture
        .store
        .open()
        .expect("open")
        .execute("DELETE FROM sequence_steps", [])
        .expect("delete steps");
    let (worker, transport) = worker(&fixture, FakeTokens::Valid);

    let outcome = worker
        .process_email(&email, &mut HashSet::new())
        .expect("process");
    assert!(matches!(outcome, SendOutcome::Failed { .. }));
    assert!(transport.calls().is_empty());
    let stored = fixture.reload_email(&email.id);
    assert_eq!(stored.status, ScheduledEmailStatus::PermanentlyFailed);
    assert!(stored
        .last_error
        .as_deref()
        .is_some_and(|error| error.contains("has no step 1")));
}

#[test]
fn unrecorded_send_stays_sending_until_the_watchdog_fails_it() {
    let fixture = Fixture::new(1);
    let email = fixture.insert_email(1, due_now(), ScheduledEmailStatus::Scheduled);
    let conn = fixture.store.open().expect("open");
    conn.execute_batch(
        "CREATE TRIGGER reject_sent_emails BEFORE INSERT ON sent_emails
         BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
    )
    .expect("trigger");
    let (worker, transport) = worker(&fixture, FakeTokens::Valid);
    transport.accept("msg-1", "thread-abc");

    let stats = worker.process_pending_emails().expect("pass");
    assert_eq!(stats.sent, 1);
    assert_eq!(transport.calls().len(), 1);

    let stored = fixture.reload_email(&email.id);
    assert_eq!(stored.status, ScheduledEmailStatus::Sending);
    assert!(fixture
        .store
        .sent_emails_for_campaign(&fixture.campaign.id)
        .expect("sent")
        .is_empty());
    let now = Utc::now();
    let (day_start, day_end) = local_day_bounds(chrono_tz::UTC, now).expect("day");
    assert_eq!(
        fixture
            .store
            .count_sent_or_sending(&fixture.workspace.id, day_start, day_end)
            .expect("count"),
        1
    );

    // A SENDING row is never due again.
    worker.process_pending_emails().expect("second pass");
    assert_eq!(transport.calls().len(), 1);

    conn.execute_batch("DROP TRIGGER reject_sent_emails")
        .expect("drop trigger");
    let failed = fixture
        .store
        .fail_stale_sending(
            now + Duration::minutes(1),
            crate::service::STALE_SENDING_REASON,
            now,
        )
        .expect("watchdog");
    assert_eq!(failed, 1);
    let stored = fixture.reload_email(&email.id);
    assert_eq!(stored.status, ScheduledEmailStatus::PermanentlyFailed);
    assert_eq!(
        stored.last_error.as_deref(),
        Some("Send outcome unknown: worker stopped while sending")
    );
    worker.process_pending_emails().expect("third pass");
    assert_eq!(transport.calls().len(), 1);
}
