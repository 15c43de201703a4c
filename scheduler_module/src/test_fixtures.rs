//! Seeded stores shared by the unit tests.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use tempfile::TempDir;

use crate::idempotency;
use crate::sending_window::SendingSettings;
use crate::store::{OutreachStore, SendRecord};
use crate::types::{
    Campaign, CampaignProspect, CampaignStatus, GmailToken, Prospect, ProspectStatus,
    ScheduledEmail, ScheduledEmailStatus, Sequence, SequenceStep, Workspace,
};

pub(crate) fn utc(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("rfc3339")
        .with_timezone(&Utc)
}

/// Every day, 0h-23h UTC, 50 a day, no ramp-up.
pub(crate) fn all_day_settings() -> SendingSettings {
    SendingSettings::new(0..=6, 0, 23, "UTC", 50, false).expect("valid settings")
}

fn enroll_verified_prospect(
    store: &OutreachStore,
    campaign: &Campaign,
    email: &str,
) -> (Prospect, CampaignProspect) {
    let mut prospect = Prospect::new(&campaign.workspace_id, email);
    prospect.first_name = Some("Ada".to_string());
    prospect.company = Some("Initech".to_string());
    prospect.status = ProspectStatus::Verified;
    store.insert_prospect(&prospect).expect("prospect");

    let enrollment = CampaignProspect::new(&campaign.id, &prospect.id, utc(CAMPAIGN_START));
    store.enroll_prospect(&enrollment).expect("enroll");
    (prospect, enrollment)
}

pub(crate) const CAMPAIGN_START: &str = "2026-10-19T08:00:00Z";

/// One onboarded workspace with a connected mailbox, a sequence, a RUNNING
/// campaign and one VERIFIED prospect enrolled at campaign start.
pub(crate) struct Fixture {
    _dir: TempDir,
    pub store: OutreachStore,
    pub workspace: Workspace,
    pub sequence: Sequence,
    pub campaign: Campaign,
    pub prospect: Prospect,
    pub enrollment: CampaignProspect,
}

impl Fixture {
    pub fn new(step_count: u32) -> Self {
        Self::with_settings(step_count, all_day_settings())
    }

    pub fn with_settings(step_count: u32, settings: SendingSettings) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let store = OutreachStore::new(dir.path().join("outreach.db")).expect("store");

        let mut workspace = Workspace::new("Acme Outreach");
        workspace.onboarding_complete = true;
        store.insert_workspace(&workspace).expect("insert workspace");
        store
            .upsert_sending_settings(&workspace.id, &settings)
            .expect("settings");
        store
            .upsert_gmail_token(&GmailToken {
                workspace_id: workspace.id.clone(),
                email: "founder@acme.test".to_string(),
                access_token: "access-token".to_string(),
                refresh_token: "refresh-token".to_string(),
                expires_at: Utc::now() + Duration::days(365),
            })
            .expect("token");

        let steps = (1..=step_count)
            .map(|step_number| SequenceStep {
                step_number,
                delay_days: if step_number == 1 { 0 } else { 2 },
                subject: format!("Step {} for {{{{company}}}}", step_number),
                body: "Hi {{first_name}},\nQuick question.".to_string(),
            })
            .collect();
        let sequence = Sequence::new(&workspace.id, "Intro", steps);
        store.insert_sequence(&sequence).expect("sequence");

        let mut campaign = Campaign::new(&workspace.id, &sequence.id, "Q4 outreach");
        campaign.status = CampaignStatus::Running;
        campaign.started_at = Some(utc(CAMPAIGN_START));
        store.insert_campaign(&campaign).expect("campaign");

        let (prospect, enrollment) = enroll_verified_prospect(&store, &campaign, "ada@example.com");
        Self {
            _dir: dir,
            store,
            workspace,
            sequence,
            campaign,
            prospect,
            enrollment,
        }
    }

    /// Inserts another VERIFIED prospect enrolled at campaign start.
    pub fn add_prospect(&self, email: &str) -> CampaignProspect {
        enroll_verified_prospect(&self.store, &self.campaign, email).1
    }

    pub fn insert_email(
        &self,
        step_number: u32,
        scheduled_for: DateTime<Utc>,
        status: ScheduledEmailStatus,
    ) -> ScheduledEmail {
        self.insert_email_for(&self.enrollment, step_number, scheduled_for, status)
    }

    /// Writes a row directly in `status`; SENT rows get `sent_at =
    /// scheduled_for`.
    pub fn insert_email_for(
        &self,
        enrollment: &CampaignProspect,
        step_number: u32,
        scheduled_for: DateTime<Utc>,
        status: ScheduledEmailStatus,
    ) -> ScheduledEmail {
        let key = idempotency::generate(&enrollment.prospect_id, &self.sequence.id, step_number)
            .expect("key");
        let mut email = ScheduledEmail::new(
            &self.campaign,
            enrollment,
            step_number,
            key,
            scheduled_for,
            scheduled_for,
        );
        email.status = status;
        if status == ScheduledEmailStatus::Sent {
            email.sent_at = Some(scheduled_for);
            email.message_id = Some(format!("msg-{}", step_number));
            email.thread_id = Some("thread-1".to_string());
        }
        assert!(self.store.insert_scheduled_email(&email).expect("insert email"));
        email
    }

    /// A PERMANENTLY_FAILED row last touched at `at`.
    pub fn insert_failed_email_for(
        &self,
        enrollment: &CampaignProspect,
        step_number: u32,
        at: DateTime<Utc>,
        last_error: &str,
    ) -> ScheduledEmail {
        let key = idempotency::generate(&enrollment.prospect_id, &self.sequence.id, step_number)
            .expect("key");
        let mut email = ScheduledEmail::new(&self.campaign, enrollment, step_number, key, at, at);
        email.status = ScheduledEmailStatus::PermanentlyFailed;
        email.attempt_count = 1;
        email.last_error = Some(last_error.to_string());
        assert!(self.store.insert_scheduled_email(&email).expect("insert email"));
        email
    }

    /// Claims `email` and records it as delivered at `sent_at`, advancing the
    /// enrollment to the next step.
    pub fn record_sent(&self, email: &ScheduledEmail, sent_at: DateTime<Utc>) {
        assert!(self.store.claim_for_sending(&email.id, sent_at).expect("claim"));
        let mut next = self
            .store
            .load_enrollment(&email.campaign_id, &email.prospect_id)
            .expect("load enrollment")
            .expect("enrollment exists");
        next.current_step = email.step_number + 1;
        let headers = BTreeMap::new();
        let message_id = format!("msg-{}-{}", email.prospect_id, email.step_number);
        self.store
            .record_successful_send(&SendRecord {
                email,
                message_id: &message_id,
                thread_id: "thread-1",
                subject: "Step 1 for Initech",
                body: "Hi Ada",
                from_email: "founder@acme.test",
                to_email: "ada@example.com",
                headers: &headers,
                sent_at,
                next_enrollment: Some(&next),
            })
            .expect("record send");
    }

    pub fn reload_campaign(&self) -> Campaign {
        self.store
            .load_campaign(&self.campaign.id)
            .expect("load campaign")
            .expect("campaign exists")
    }

    pub fn reload_email(&self, id: &str) -> ScheduledEmail {
        self.store
            .load_scheduled_email(id)
            .expect("load email")
            .expect("email exists")
    }
}
