use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use std::ops::RangeInclusive;
use tracing::{debug, error, info, warn};

use crate::control::CampaignControl;
use crate::idempotency;
use crate::quota::QuotaService;
use crate::sending_window::{campaign_day_number, is_within_window, SendingSettings};
use crate::store::OutreachStore;
use crate::types::{
    Campaign, CampaignProspect, CampaignStatus, EnrollmentStatus, ScheduledEmail, SchedulerError,
    SequenceStep,
};

/// Seconds added to a slot so a batch does not fire exactly at window open.
pub const DEFAULT_JITTER_SECONDS: RangeInclusive<i64> = 30..=90;

/// Result of one scheduling run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleSummary {
    pub scheduled: usize,
    pub skipped: usize,
    /// One entry per enrollment (or campaign) that could not be planned.
    pub errors: Vec<String>,
}

impl ScheduleSummary {
    fn merge(&mut self, other: ScheduleSummary) {
        self.scheduled += other.scheduled;
        self.skipped += other.skipped;
        self.errors.extend(other.errors);
    }
}

enum EnrollmentPlan {
    Scheduled(DateTime<Utc>),
    Skipped(&'static str),
}

/// Plans the next step of every active enrollment of RUNNING campaigns.
#[derive(Debug, Clone)]
pub struct EmailScheduler {
    store: OutreachStore,
    quota: QuotaService,
    control: CampaignControl,
    jitter_seconds: RangeInclusive<i64>,
}

impl EmailScheduler {
    pub fn new(store: OutreachStore) -> Self {
        Self {
            quota: QuotaService::new(store.clone()),
            control: CampaignControl::new(store.clone()),
            store,
            jitter_seconds: DEFAULT_JITTER_SECONDS,
        }
    }

    pub fn with_jitter(mut self, jitter_seconds: RangeInclusive<i64>) -> Self {
        self.jitter_seconds = jitter_seconds;
        self
    }

    pub fn schedule_campaign(&self, campaign_id: &str) -> Result<ScheduleSummary, SchedulerError> {
        self.schedule_campaign_at(campaign_id, Utc::now())
    }

    /// Inserts one row per ENROLLED prospect for its current step. Rows that
    /// already exist for the idempotency key are left alone; a failing
    /// enrollment is reported and the run continues.
    pub fn schedule_campaign_at(
        &self,
        campaign_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ScheduleSummary, SchedulerError> {
        let campaign = self
            .store
            .load_campaign(campaign_id)?
            .ok_or_else(|| SchedulerError::NotFound(format!("campaign {}", campaign_id)))?;
        if campaign.status != CampaignStatus::Running {
            return Err(SchedulerError::CampaignNotRunning {
                campaign_id: campaign.id,
                status: campaign.status,
            });
        }

        let steps = self.store.load_sequence_steps(&campaign.sequence_id)?;
        let settings = self.store.load_sending_settings(&campaign.workspace_id)?;
        let enrollments = self
            .store
            .enrollments_with_status(&campaign.id, EnrollmentStatus::Enrolled)?;

        let mut summary = ScheduleSummary::default();
        for enrollment in &enrollments {
            match self.plan_enrollment(&campaign, &steps, &settings, enrollment, now) {
                Ok(EnrollmentPlan::Scheduled(at)) => {
                    debug!(
                        "scheduled step {} for prospect {} at {}",
                        enrollment.current_step, enrollment.prospect_id, at
                    );
                    summary.scheduled += 1;
                }
                Ok(EnrollmentPlan::Skipped(reason)) => {
                    debug!(
                        "skipped prospect {} in campaign {}: {}",
                        enrollment.prospect_id, campaign.id, reason
                    );
                    summary.skipped += 1;
                }
                Err(err) => {
                    warn!(
                        "failed to schedule prospect {} in campaign {}: {}",
                        enrollment.prospect_id, campaign.id, err
                    );
                    summary
                        .errors
                        .push(format!("prospect {}: {}", enrollment.prospect_id, err));
                }
            }
        }

        self.complete_if_finished(&campaign)?;
        info!(
            "scheduled {} email(s) for campaign {} ({} skipped, {} error(s))",
            summary.scheduled,
            campaign.id,
            summary.skipped,
            summary.errors.len()
        );
        Ok(summary)
    }

    /// Runs the scheduler over every RUNNING campaign. One failing campaign
    /// is recorded in `errors` and does not stop the others.
    pub fn schedule_running_campaigns(&self) -> Result<ScheduleSummary, SchedulerError> {
        let now = Utc::now();
        let campaigns = self.store.campaigns_with_status(CampaignStatus::Running, None)?;
        let mut summary = ScheduleSummary::default();
        for campaign in &campaigns {
            match self.schedule_campaign_at(&campaign.id, now) {
                Ok(result) => summary.merge(result),
                Err(err) => {
                    error!("scheduling campaign {} failed: {}", campaign.id, err);
                    summary.errors.push(format!("campaign {}: {}", campaign.id, err));
                }
            }
        }
        Ok(summary)
    }

    fn plan_enrollment(
        &self,
        campaign: &Campaign,
        steps: &[SequenceStep],
        settings: &SendingSettings,
        enrollment: &CampaignProspect,
        now: DateTime<Utc>,
    ) -> Result<EnrollmentPlan, SchedulerError> {
        let step_number = enrollment.current_step;
        let Some(step) = steps.iter().find(|step| step.step_number == step_number) else {
            return Ok(EnrollmentPlan::Skipped("sequence finished"));
        };

        let key = idempotency::generate(&enrollment.prospect_id, &campaign.sequence_id, step_number)?;
        if self.store.scheduled_email_exists(&key)? {
            return Ok(EnrollmentPlan::Skipped("already scheduled"));
        }

        let base = if step_number <= 1 {
            now.max(enrollment.enrolled_at)
        } else {
            let Some(previous) =
                self.store
                    .sent_email_for_step(&campaign.id, &enrollment.prospect_id, step_number - 1)?
            else {
                return Ok(EnrollmentPlan::Skipped("previous step not sent"));
            };
            now.max(previous.sent_at + Duration::days(i64::from(step.delay_days)))
        };

        let day_number = campaign_day_number(
            settings.timezone,
            campaign.started_at.unwrap_or(now),
            base,
        );
        let slot = self
            .quota
            .next_available_slot(&campaign.workspace_id, base, settings, day_number)?;
        let scheduled_for = self.jittered(settings, slot);

        let email = ScheduledEmail::new(campaign, enrollment, step_number, key, scheduled_for, now);
        if self.store.insert_scheduled_email(&email)? {
            Ok(EnrollmentPlan::Scheduled(scheduled_for))
        } else {
            // Lost the insert race to a concurrent run.
            Ok(EnrollmentPlan::Skipped("already scheduled"))
        }
    }

    /// The slot plus jitter, or the bare slot when the jitter would leave the
    /// sending window.
    fn jittered(&self, settings: &SendingSettings, slot: DateTime<Utc>) -> DateTime<Utc> {
        if self.jitter_seconds.is_empty() {
            return slot;
        }
        let seconds = rand::thread_rng().gen_range(self.jitter_seconds.clone());
        let candidate = slot + Duration::seconds(seconds);
        if is_within_window(settings, candidate) {
            candidate
        } else {
            slot
        }
    }

    fn complete_if_finished(&self, campaign: &Campaign) -> Result<(), SchedulerError> {
        let (total, open) = self.store.enrollment_counts(&campaign.id)?;
        if total == 0 || open > 0 {
            return Ok(());
        }
        if let Err(err) = self.control.complete(&campaign.id, &campaign.workspace_id) {
            warn!("could not complete campaign {}: {}", campaign.id, err);
        }
        Ok(())
    }
}
