use chrono::{DateTime, Duration, Utc};
use rusqlite::Transaction;
use serde_json::json;
use tracing::{info, warn};

use crate::store::{
    cancel_pending_emails, insert_audit_log, load_campaign_row, shift_pending_emails,
    update_campaign_row, CancelScope, OutreachStore,
};
use crate::types::{AuditLogEntry, Campaign};

use super::{campaign_transition, CampaignAction, ControlError};

const STOPPED_BY_USER: &str = "Campaign stopped by user";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopCampaignResult {
    pub campaign: Campaign,
    pub emails_cancelled: usize,
}

#[derive(Debug, Clone)]
pub struct CampaignControl {
    store: OutreachStore,
}

struct Applied {
    campaign: Campaign,
    affected: usize,
}

impl CampaignControl {
    pub fn new(store: OutreachStore) -> Self {
        Self { store }
    }

    /// DRAFT -> RUNNING. The first launch stamps `started_at`, which anchors
    /// the ramp-up day count.
    pub fn launch(&self, campaign_id: &str, workspace_id: &str) -> Result<Campaign, ControlError> {
        let applied = self.apply(
            campaign_id,
            workspace_id,
            CampaignAction::Launch,
            "CAMPAIGN_LAUNCHED",
            |_, campaign, now| {
                campaign.started_at.get_or_insert(now);
                Ok((0, json!({})))
            },
        )?;
        info!("launched campaign {}", campaign_id);
        Ok(applied.campaign)
    }

    pub fn pause(&self, campaign_id: &str, workspace_id: &str) -> Result<Campaign, ControlError> {
        let applied = self.apply(
            campaign_id,
            workspace_id,
            CampaignAction::Pause,
            "CAMPAIGN_PAUSED",
            |_, campaign, now| {
                campaign.paused_at = Some(now);
                campaign.auto_paused_reason = None;
                Ok((0, json!({})))
            },
        )?;
        info!("paused campaign {}", campaign_id);
        Ok(applied.campaign)
    }

    /// Manual resume. Refused for an automatic pause until the risk is
    /// acknowledged through [`Self::resume_auto_paused_campaign`].
    pub fn resume(&self, campaign_id: &str, workspace_id: &str) -> Result<Campaign, ControlError> {
        self.resume_auto_paused_campaign(campaign_id, workspace_id, false)
    }

    /// PAUSED -> RUNNING, shifting pending sends later by the time spent
    /// paused and clearing any automatic pause reason.
    pub fn resume_auto_paused_campaign(
        &self,
        campaign_id: &str,
        workspace_id: &str,
        acknowledge_risk: bool,
    ) -> Result<Campaign, ControlError> {
        let mut auto_reason = None;
        let applied = self.apply(
            campaign_id,
            workspace_id,
            CampaignAction::Resume,
            "CAMPAIGN_RESUMED",
            |tx, campaign, now| {
                if let Some(reason) = campaign.auto_paused_reason {
                    if !acknowledge_risk {
                        return Err(ControlError::RiskAcknowledgementRequired {
                            campaign_id: campaign.id.clone(),
                            reason,
                        });
                    }
                }
                let pause_duration = campaign
                    .paused_at
                    .map(|paused_at| now - paused_at)
                    .filter(|duration| *duration > Duration::zero())
                    .unwrap_or_else(Duration::zero);
                let shifted = shift_pending_emails(tx, &campaign.id, pause_duration, now)?;
                auto_reason = campaign.auto_paused_reason.take();
                campaign.paused_at = None;

                if let Some(reason) = auto_reason {
                    insert_audit_log(
                        tx,
                        &AuditLogEntry::new(
                            &campaign.workspace_id,
                            "CAMPAIGN_RESUMED_AFTER_AUTO_PAUSE",
                            "CAMPAIGN",
                            &campaign.id,
                            json!({
                                "previousReason": reason.as_str(),
                                "acknowledgedRisk": acknowledge_risk,
                                "pauseDurationMs": pause_duration.num_milliseconds(),
                            }),
                            now,
                        ),
                    )?;
                }
                Ok((
                    shifted,
                    json!({ "pauseDurationMs": pause_duration.num_milliseconds() }),
                ))
            },
        )?;
        match auto_reason {
            Some(reason) => warn!(
                "campaign {} resumed after automatic pause ({}), risk acknowledged",
                campaign_id, reason
            ),
            None => info!(
                "resumed campaign {} and shifted {} pending email(s)",
                campaign_id, applied.affected
            ),
        }
        Ok(applied.campaign)
    }

    /// RUNNING/PAUSED -> STOPPED. Pending sends are cancelled and their keys
    /// suffixed with the campaign id.
    pub fn stop(
        &self,
        campaign_id: &str,
        workspace_id: &str,
    ) -> Result<StopCampaignResult, ControlError> {
        let applied = self.apply(
            campaign_id,
            workspace_id,
            CampaignAction::Stop,
            "CAMPAIGN_STOPPED",
            |tx, campaign, now| {
                campaign.stopped_at = Some(now);
                campaign.paused_at = None;
                campaign.auto_paused_reason = None;
                let cancelled = cancel_pending_emails(
                    tx,
                    CancelScope::Campaign(&campaign.id),
                    STOPPED_BY_USER,
                    Some(&campaign.id),
                    now,
                )?;
                Ok((cancelled, json!({ "emailsCancelled": cancelled })))
            },
        )?;
        info!(
            "stopped campaign {} and cancelled {} pending email(s)",
            campaign_id, applied.affected
        );
        Ok(StopCampaignResult {
            campaign: applied.campaign,
            emails_cancelled: applied.affected,
        })
    }

    /// RUNNING -> COMPLETED, once no enrollment is left to send to.
    pub fn complete(&self, campaign_id: &str, workspace_id: &str) -> Result<Campaign, ControlError> {
        let applied = self.apply(
            campaign_id,
            workspace_id,
            CampaignAction::Complete,
            "CAMPAIGN_COMPLETED",
            |_, campaign, now| {
                campaign.completed_at = Some(now);
                Ok((0, json!({})))
            },
        )?;
        info!("completed campaign {}", campaign_id);
        Ok(applied.campaign)
    }

    fn apply<F>(
        &self,
        campaign_id: &str,
        workspace_id: &str,
        action: CampaignAction,
        audit_action: &str,
        update: F,
    ) -> Result<Applied, ControlError>
    where
        F: FnOnce(
            &Transaction<'_>,
            &mut Campaign,
            DateTime<Utc>,
        ) -> Result<(usize, serde_json::Value), ControlError>,
    {
        let now = Utc::now();
        self.store.with_transaction(|tx| {
            let mut campaign = load_campaign_row(tx, campaign_id)?
                .filter(|campaign| campaign.workspace_id == workspace_id)
                .ok_or_else(|| ControlError::CampaignNotFound(campaign_id.to_string()))?;
            let previous = campaign.status;
            let next = campaign_transition(previous, action)?;
            let (affected, mut metadata) = update(tx, &mut campaign, now)?;
            campaign.status = next;
            update_campaign_row(tx, &campaign, now)?;

            if let Some(fields) = metadata.as_object_mut() {
                fields.insert("from".to_string(), json!(previous.as_str()));
                fields.insert("to".to_string(), json!(next.as_str()));
            }
            insert_audit_log(
                tx,
                &AuditLogEntry::new(
                    workspace_id,
                    audit_action,
                    "CAMPAIGN",
                    campaign_id,
                    metadata,
                    now,
                ),
            )?;
            Ok(Applied { campaign, affected })
        })
    }
}
