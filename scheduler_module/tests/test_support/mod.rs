#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use scheduler_module::idempotency;
use scheduler_module::types::GmailToken;
use scheduler_module::{
    Campaign, CampaignProspect, CampaignStatus, OutreachStore, Prospect, ProspectStatus,
    ScheduledEmail, SendingSettings, Sequence, SequenceStep, Workspace,
};
use tempfile::TempDir;

pub fn start_mockito_server(test_name: &str) -> Option<mockito::ServerGuard> {
    let server = std::panic::catch_unwind(mockito::Server::new);
    match server {
        Ok(server) => Some(server),
        Err(_) => {
            eprintln!("Skipping {test_name}; unable to start mockito server in this environment.");
            None
        }
    }
}

/// An onboarded workspace with a RUNNING one-step campaign and one VERIFIED
/// prospect enrolled an hour ago. Sends are allowed all day.
pub struct SeededStore {
    pub dir: TempDir,
    pub store: OutreachStore,
    pub workspace: Workspace,
    pub sequence: Sequence,
    pub campaign: Campaign,
    pub prospect: Prospect,
    pub enrollment: CampaignProspect,
}

impl SeededStore {
    pub fn new(token_expires_at: DateTime<Utc>) -> Result<Self, Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let store = OutreachStore::new(dir.path().join("outreach.db"))?;

        let mut workspace = Workspace::new("Acme Outreach");
        workspace.onboarding_complete = true;
        store.insert_workspace(&workspace)?;
        store.upsert_sending_settings(
            &workspace.id,
            &SendingSettings::new(0..=6, 0, 23, "UTC", 50, false)?,
        )?;
        store.upsert_gmail_token(&GmailToken {
            workspace_id: workspace.id.clone(),
            email: "founder@acme.test".to_string(),
            access_token: "stored-access".to_string(),
            refresh_token: "stored-refresh".to_string(),
            expires_at: token_expires_at,
        })?;

        let sequence = Sequence::new(
            &workspace.id,
            "Intro",
            vec![SequenceStep {
                step_number: 1,
                delay_days: 0,
                subject: "Quick question for {{company}}".to_string(),
                body: "Hi {{first_name}},\nAre you the right person?".to_string(),
            }],
        );
        store.insert_sequence(&sequence)?;

        let started_at = Utc::now() - Duration::hours(1);
        let mut campaign = Campaign::new(&workspace.id, &sequence.id, "Launch");
        campaign.status = CampaignStatus::Running;
        campaign.started_at = Some(started_at);
        store.insert_campaign(&campaign)?;

        let mut prospect = Prospect::new(&workspace.id, "ada@example.com");
        prospect.first_name = Some("Ada".to_string());
        prospect.company = Some("Initech".to_string());
        prospect.status = ProspectStatus::Verified;
        store.insert_prospect(&prospect)?;

        let enrollment = CampaignProspect::new(&campaign.id, &prospect.id, started_at);
        store.enroll_prospect(&enrollment)?;

        Ok(Self {
            dir,
            store,
            workspace,
            sequence,
            campaign,
            prospect,
            enrollment,
        })
    }

    /// Inserts the step-1 row, due a minute ago.
    pub fn insert_due_email(&self) -> Result<ScheduledEmail, Box<dyn std::error::Error>> {
        let key = idempotency::generate(&self.prospect.id, &self.sequence.id, 1)?;
        let due = Utc::now() - Duration::minutes(1);
        let email = ScheduledEmail::new(&self.campaign, &self.enrollment, 1, key, due, due);
        self.store.insert_scheduled_email(&email)?;
        Ok(email)
    }
}
