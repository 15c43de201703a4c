use chrono::{DateTime, Utc};
use rusqlite::Transaction;
use serde_json::json;
use tracing::info;

use crate::store::{
    cancel_pending_emails, insert_audit_log, load_campaign_row, load_enrollment_row,
    update_enrollment_row, CancelScope, OutreachStore,
};
use crate::types::{AuditLogEntry, CampaignProspect};

use super::{enrollment_transition, ControlError, EnrollmentAction};

const STOPPED_BY_USER: &str = "Prospect stopped by user";
const PROSPECT_REPLIED: &str = "Prospect replied";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentChange {
    pub enrollment: CampaignProspect,
    pub emails_cancelled: usize,
}

#[derive(Debug, Clone)]
pub struct ProspectControl {
    store: OutreachStore,
}

impl ProspectControl {
    pub fn new(store: OutreachStore) -> Self {
        Self { store }
    }

    pub fn pause(
        &self,
        campaign_id: &str,
        prospect_id: &str,
        workspace_id: &str,
    ) -> Result<CampaignProspect, ControlError> {
        let change = self.apply(
            campaign_id,
            prospect_id,
            workspace_id,
            EnrollmentAction::Pause,
            "PROSPECT_PAUSED",
            |_, enrollment, now| {
                enrollment.paused_at = Some(now);
                Ok(0)
            },
        )?;
        info!("paused prospect {} in campaign {}", prospect_id, campaign_id);
        Ok(change.enrollment)
    }

    /// Pending sends keep their original dates.
    pub fn resume(
        &self,
        campaign_id: &str,
        prospect_id: &str,
        workspace_id: &str,
    ) -> Result<CampaignProspect, ControlError> {
        let change = self.apply(
            campaign_id,
            prospect_id,
            workspace_id,
            EnrollmentAction::Resume,
            "PROSPECT_RESUMED",
            |_, enrollment, _| {
                enrollment.paused_at = None;
                Ok(0)
            },
        )?;
        info!("resumed prospect {} in campaign {}", prospect_id, campaign_id);
        Ok(change.enrollment)
    }

    pub fn stop(
        &self,
        campaign_id: &str,
        prospect_id: &str,
        workspace_id: &str,
    ) -> Result<EnrollmentChange, ControlError> {
        let change = self.apply(
            campaign_id,
            prospect_id,
            workspace_id,
            EnrollmentAction::Stop,
            "PROSPECT_STOPPED",
            |tx, _, now| {
                Ok(cancel_pending_emails(
                    tx,
                    CancelScope::Enrollment {
                        campaign_id,
                        prospect_id,
                    },
                    STOPPED_BY_USER,
                    Some(prospect_id),
                    now,
                )?)
            },
        )?;
        info!(
            "stopped prospect {} in campaign {} and cancelled {} pending email(s)",
            prospect_id, campaign_id, change.emails_cancelled
        );
        Ok(change)
    }

    /// ENROLLED -> REPLIED. Pending follow-ups are cancelled but keep their
    /// keys, so the step can never be scheduled again for this enrollment.
    pub fn mark_replied(
        &self,
        campaign_id: &str,
        prospect_id: &str,
        workspace_id: &str,
    ) -> Result<EnrollmentChange, ControlError> {
        let change = self.apply(
            campaign_id,
            prospect_id,
            workspace_id,
            EnrollmentAction::MarkReplied,
            "PROSPECT_REPLIED",
            |tx, _, now| {
                Ok(cancel_pending_emails(
                    tx,
                    CancelScope::Enrollment {
                        campaign_id,
                        prospect_id,
                    },
                    PROSPECT_REPLIED,
                    None,
                    now,
                )?)
            },
        )?;
        info!(
            "prospect {} replied in campaign {}; cancelled {} follow-up(s)",
            prospect_id, campaign_id, change.emails_cancelled
        );
        Ok(change)
    }

    fn apply<F>(
        &self,
        campaign_id: &str,
        prospect_id: &str,
        workspace_id: &str,
        action: EnrollmentAction,
        audit_action: &str,
        update: F,
    ) -> Result<EnrollmentChange, ControlError>
    where
        F: FnOnce(&Transaction<'_>, &mut CampaignProspect, DateTime<Utc>) -> Result<usize, ControlError>,
    {
        let now = Utc::now();
        self.store.with_transaction(|tx| {
            load_campaign_row(tx, campaign_id)?
                .filter(|campaign| campaign.workspace_id == workspace_id)
                .ok_or_else(|| ControlError::CampaignNotFound(campaign_id.to_string()))?;
            let mut enrollment = load_enrollment_row(tx, campaign_id, prospect_id)?.ok_or_else(|| {
                ControlError::EnrollmentNotFound {
                    campaign_id: campaign_id.to_string(),
                    prospect_id: prospect_id.to_string(),
                }
            })?;
            let previous = enrollment.enrollment_status;
            let next = enrollment_transition(previous, action)?;
            let emails_cancelled = update(tx, &mut enrollment, now)?;
            enrollment.enrollment_status = next;
            update_enrollment_row(tx, &enrollment)?;
            insert_audit_log(
                tx,
                &AuditLogEntry::new(
                    workspace_id,
                    audit_action,
                    "CAMPAIGN_PROSPECT",
                    &enrollment.id,
                    json!({
                        "campaignId": campaign_id,
                        "prospectId": prospect_id,
                        "from": previous.as_str(),
                        "to": next.as_str(),
                        "emailsCancelled": emails_cancelled,
                    }),
                    now,
                ),
            )?;
            Ok(EnrollmentChange {
                enrollment,
                emails_cancelled,
            })
        })
    }
}
