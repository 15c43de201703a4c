mod test_support;

use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use mockito::Matcher;
use scheduler_module::service::{run_once, ServiceConfig};
use scheduler_module::{
    CampaignProspect, GoogleAuthConfig, Prospect, ProspectStatus, ScheduledEmailStatus,
};
use test_support::{start_mockito_server, SeededStore};

fn service_config(seeded: &SeededStore, gmail_url: &str) -> ServiceConfig {
    ServiceConfig {
        db_path: seeded.store.path().to_path_buf(),
        sender_poll_interval: StdDuration::from_secs(60),
        scheduler_poll_interval: StdDuration::from_secs(300),
        send_batch_limit: 10,
        inter_email_delay: StdDuration::ZERO,
        watchdog_interval: StdDuration::from_secs(300),
        sending_stale_after: StdDuration::from_secs(600),
        gmail_api_base_url: gmail_url.to_string(),
        app_base_url: Some("https://app.example.test".to_string()),
        google: GoogleAuthConfig {
            client_id: Some("client-id".to_string()),
            client_secret: Some("client-secret".to_string()),
            token_url: Some(format!("{}/token", gmail_url)),
        },
    }
}

#[test]
fn due_email_is_sent_through_gmail() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let Some(mut server) = start_mockito_server("due_email_is_sent_through_gmail") else {
        return Ok(());
    };
    let seeded = SeededStore::new(Utc::now() + Duration::hours(1)).map_err(|err| err.to_string())?;
    let email = seeded.insert_due_email().map_err(|err| err.to_string())?;

    let mock = server
        .mock("POST", "/gmail/v1/users/me/messages/send")
        .match_header("authorization", "Bearer stored-access")
        .match_body(Matcher::Regex(r#""raw"\s*:\s*""#.to_string()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"id":"gmail-msg-1","threadId":"gmail-thread-1","labelIds":["SENT"]}"#)
        .expect(1)
        .create();

    let report = run_once(&service_config(&seeded, &server.url()))?;
    mock.assert();
    assert_eq!(report.stale_failed, 0);
    // The row already existed, so the scheduler pass leaves the enrollment alone.
    assert_eq!(report.schedule.scheduled, 0);
    assert_eq!(report.schedule.skipped, 1);
    assert_eq!(report.send.processed, 1);
    assert_eq!(report.send.sent, 1);

    let stored = seeded
        .store
        .load_scheduled_email(&email.id)?
        .expect("row kept");
    assert_eq!(stored.status, ScheduledEmailStatus::Sent);
    assert!(stored.sent_at.is_some());

    let sent = seeded.store.sent_emails_for_campaign(&seeded.campaign.id)?;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message_id, "gmail-msg-1");
    assert_eq!(sent[0].thread_id, "gmail-thread-1");
    assert_eq!(sent[0].subject, "Quick question for Initech");
    Ok(())
}

#[test]
fn rejected_recipient_fails_permanently() -> Result<(), Box<dyn std::error::Error + Send + Sync>>
{
    let Some(mut server) = start_mockito_server("rejected_recipient_fails_permanently") else {
        return Ok(());
    };
    let seeded = SeededStore::new(Utc::now() + Duration::hours(1)).map_err(|err| err.to_string())?;
    let email = seeded.insert_due_email().map_err(|err| err.to_string())?;

    let mock = server
        .mock("POST", "/gmail/v1/users/me/messages/send")
        .with_status(400)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"error":{"code":400,"message":"Invalid To header","status":"INVALID_ARGUMENT","errors":[{"reason":"invalidArgument"}]}}"#,
        )
        .expect(1)
        .create();

    let report = run_once(&service_config(&seeded, &server.url()))?;
    mock.assert();
    assert_eq!(report.send.sent, 0);
    assert_eq!(report.send.failed, 1);

    let stored = seeded
        .store
        .load_scheduled_email(&email.id)?
        .expect("row kept");
    assert_eq!(stored.status, ScheduledEmailStatus::PermanentlyFailed);
    assert_eq!(stored.attempt_count, 1);
    assert_eq!(
        stored.last_error.as_deref(),
        Some("Non-retryable error: Invalid To header")
    );
    assert!(seeded
        .store
        .sent_emails_for_campaign(&seeded.campaign.id)?
        .is_empty());
    Ok(())
}

#[test]
fn new_enrollment_is_scheduled_by_a_single_pass(
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let Some(server) = start_mockito_server("new_enrollment_is_scheduled_by_a_single_pass") else {
        return Ok(());
    };
    let seeded = SeededStore::new(Utc::now() + Duration::hours(1)).map_err(|err| err.to_string())?;

    let mut prospect = Prospect::new(&seeded.workspace.id, "grace@example.com");
    prospect.first_name = Some("Grace".to_string());
    prospect.status = ProspectStatus::Verified;
    seeded.store.insert_prospect(&prospect)?;
    seeded.store.enroll_prospect(&CampaignProspect::new(
        &seeded.campaign.id,
        &prospect.id,
        Utc::now() - Duration::minutes(10),
    ))?;

    let report = run_once(&service_config(&seeded, &server.url()))?;
    // Ada and Grace both get a first step; jitter keeps them out of this pass's sends.
    assert_eq!(report.schedule.scheduled, 2);
    assert!(report.schedule.errors.is_empty());

    let rows = seeded
        .store
        .scheduled_emails_for_campaign(&seeded.campaign.id)?;
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| row.step_number == 1));
    assert!(rows
        .iter()
        .any(|row| row.prospect_id == prospect.id));
    Ok(())
}
