use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::collections::HashSet;
use tracing::{debug, error, info, warn};

use crate::control::{campaign_transition, CampaignAction, ControlError};
use crate::store::{
    insert_audit_log, insert_notification, load_campaign_row, update_campaign_row, OutreachStore,
};
use crate::types::{AuditLogEntry, AutoPauseReason, Campaign, NotificationKind};

use super::detection::{AnomalyDetector, AnomalyResult};
use super::notification::anomaly_notification;
use super::thresholds::ROLLING_WINDOW_HOURS;

/// What applying a detection result did.
#[derive(Debug, Clone, PartialEq)]
pub enum AnomalyAction {
    Paused(Campaign),
    Warned,
    Unchanged,
}

/// Totals for one workspace sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnomalySweep {
    pub campaigns_checked: usize,
    pub paused: Vec<String>,
    pub warned: Vec<String>,
}

/// Applies detector verdicts: pauses, warnings and their notifications.
#[derive(Debug, Clone)]
pub struct AutoPauseService {
    store: OutreachStore,
    detector: AnomalyDetector,
}

impl AutoPauseService {
    pub fn new(store: OutreachStore) -> Self {
        Self {
            detector: AnomalyDetector::new(store.clone()),
            store,
        }
    }

    pub fn detector(&self) -> &AnomalyDetector {
        &self.detector
    }

    /// Detects and applies for one campaign.
    pub fn check_campaign(&self, campaign_id: &str) -> Result<AnomalyAction, ControlError> {
        match self.detector.detect(campaign_id)? {
            Some(result) => self.apply_result(&result),
            None => Ok(AnomalyAction::Unchanged),
        }
    }

    /// Evaluates every RUNNING campaign of the workspace.
    pub fn run_for_workspace(&self, workspace_id: &str) -> Result<AnomalySweep, ControlError> {
        self.sweep_workspace(workspace_id, &HashSet::new())
    }

    /// Like [`Self::run_for_workspace`], skipping campaigns in `skip`. A
    /// failure on one campaign is logged and the sweep continues.
    pub fn sweep_workspace(
        &self,
        workspace_id: &str,
        skip: &HashSet<String>,
    ) -> Result<AnomalySweep, ControlError> {
        let campaigns = self
            .store
            .campaigns_with_status(crate::types::CampaignStatus::Running, Some(workspace_id))?;
        let mut sweep = AnomalySweep::default();
        for campaign in campaigns {
            if skip.contains(&campaign.id) {
                continue;
            }
            sweep.campaigns_checked += 1;
            match self.check_campaign(&campaign.id) {
                Ok(AnomalyAction::Paused(_)) => sweep.paused.push(campaign.id),
                Ok(AnomalyAction::Warned) => sweep.warned.push(campaign.id),
                Ok(AnomalyAction::Unchanged) => {}
                Err(err) => warn!("anomaly check failed for campaign {}: {}", campaign.id, err),
            }
        }
        info!(
            "anomaly sweep for workspace {}: {} checked, {} paused, {} warned",
            workspace_id,
            sweep.campaigns_checked,
            sweep.paused.len(),
            sweep.warned.len()
        );
        Ok(sweep)
    }

    pub fn apply_result(&self, result: &AnomalyResult) -> Result<AnomalyAction, ControlError> {
        let now = Utc::now();
        match (result.should_pause, result.reason) {
            (true, Some(reason)) => self.auto_pause(result, reason, now),
            _ if result.should_warn => self.warn(result, now),
            _ => Ok(AnomalyAction::Unchanged),
        }
    }

    /// RUNNING -> PAUSED with the reason, audit entry and notification
    /// committed together. A campaign no longer RUNNING is left alone.
    fn auto_pause(
        &self,
        result: &AnomalyResult,
        reason: AutoPauseReason,
        now: DateTime<Utc>,
    ) -> Result<AnomalyAction, ControlError> {
        let notification = anomaly_notification(result, now)?;
        let outcome = self.store.with_transaction(|tx| {
            let mut campaign = load_campaign_row(tx, &result.campaign_id)?
                .ok_or_else(|| ControlError::CampaignNotFound(result.campaign_id.clone()))?;
            campaign.status = campaign_transition(campaign.status, CampaignAction::Pause)?;
            campaign.paused_at = Some(now);
            campaign.auto_paused_reason = Some(reason);
            update_campaign_row(tx, &campaign, now)?;
            insert_audit_log(
                tx,
                &AuditLogEntry::new(
                    &campaign.workspace_id,
                    "CAMPAIGN_AUTO_PAUSED",
                    "CAMPAIGN",
                    &campaign.id,
                    json!({ "reason": reason.as_str(), "metrics": result.metrics }),
                    now,
                ),
            )?;
            if let Some(notification) = &notification {
                insert_notification(tx, notification)?;
            }
            Ok(campaign)
        });
        match outcome {
            Ok(campaign) => {
                error!(
                    "auto-paused campaign {} ({}): {}",
                    campaign.id,
                    reason,
                    result.message.as_deref().unwrap_or_default()
                );
                Ok(AnomalyAction::Paused(campaign))
            }
            Err(ControlError::InvalidTransition(err)) => {
                info!("skipping auto-pause of campaign {}: {}", result.campaign_id, err);
                Ok(AnomalyAction::Unchanged)
            }
            Err(err) => Err(err),
        }
    }

    /// One warning notification per campaign per rolling window.
    fn warn(&self, result: &AnomalyResult, now: DateTime<Utc>) -> Result<AnomalyAction, ControlError> {
        let since = now - Duration::hours(ROLLING_WINDOW_HOURS);
        if self.store.has_recent_notification(
            &result.workspace_id,
            NotificationKind::AnomalyWarning,
            &result.campaign_id,
            since,
        )? {
            debug!("warning for campaign {} already raised", result.campaign_id);
            return Ok(AnomalyAction::Unchanged);
        }
        if let Some(notification) = anomaly_notification(result, now)? {
            let conn = self.store.open()?;
            insert_notification(&conn, &notification)?;
        }
        warn!(
            "anomaly warning for campaign {}: {}",
            result.campaign_id,
            result.message.as_deref().unwrap_or_default()
        );
        Ok(AnomalyAction::Warned)
    }
}
