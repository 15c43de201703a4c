use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::debug;

use crate::retry::is_bounce_error;
use crate::store::{DeliveryStats, OutreachStore};
use crate::types::{AutoPauseReason, Campaign, CampaignStatus, SchedulerError, Severity};

use super::thresholds::{
    bounce_thresholds, unsubscribe_thresholds, volume_tier, VolumeTier, ROLLING_WINDOW_HOURS,
};

/// Snapshot attached to notifications and audit entries.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyMetrics {
    pub campaign_id: String,
    pub campaign_name: String,
    pub total_sent: u32,
    pub volume_tier: VolumeTier,
    pub bounce_count: u32,
    pub bounce_rate: f64,
    pub unsubscribe_count: u32,
    pub unsubscribe_rate: f64,
    pub window_hours: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnomalyResult {
    pub campaign_id: String,
    pub workspace_id: String,
    pub campaign_name: String,
    pub metrics: AnomalyMetrics,
    pub should_pause: bool,
    pub should_warn: bool,
    pub reason: Option<AutoPauseReason>,
    pub severity: Option<Severity>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Rate {
    count: u32,
    total: u32,
    percent: f64,
}

impl Rate {
    fn new(count: u32, total: u32) -> Self {
        if total == 0 {
            return Self {
                count: 0,
                total: 0,
                percent: 0.0,
            };
        }
        Self {
            count,
            total,
            percent: f64::from(count) / f64::from(total) * 100.0,
        }
    }
}

fn bounce_rate(stats: &DeliveryStats) -> Rate {
    let failures = u32::try_from(stats.failure_errors.len()).unwrap_or(u32::MAX);
    let bounces = stats
        .failure_errors
        .iter()
        .filter(|error| is_bounce_error(error.as_str()))
        .count();
    Rate::new(
        u32::try_from(bounces).unwrap_or(u32::MAX),
        stats.sent_updated.saturating_add(failures),
    )
}

fn unsubscribe_rate(stats: &DeliveryStats) -> Rate {
    Rate::new(stats.unsubscribed, stats.sent_in_window)
}

/// Rolling-window bounce and unsubscribe evaluation for RUNNING campaigns.
#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    store: OutreachStore,
}

impl AnomalyDetector {
    pub fn new(store: OutreachStore) -> Self {
        Self { store }
    }

    /// `None` when the campaign is missing, not RUNNING, or has too little
    /// traffic in the window to judge.
    pub fn detect(&self, campaign_id: &str) -> Result<Option<AnomalyResult>, SchedulerError> {
        self.detect_at(campaign_id, Utc::now())
    }

    pub fn detect_at(
        &self,
        campaign_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AnomalyResult>, SchedulerError> {
        let Some(campaign) = self.store.load_campaign(campaign_id)? else {
            return Ok(None);
        };
        if campaign.status != CampaignStatus::Running {
            return Ok(None);
        }
        let since = now - Duration::hours(ROLLING_WINDOW_HOURS);
        let stats = self.store.delivery_stats(campaign_id, since)?;
        let result = evaluate(&campaign, &stats);
        if result.is_none() {
            debug!("campaign {} has too little traffic for anomaly detection", campaign_id);
        }
        Ok(result)
    }

    /// Detection over every RUNNING campaign of the workspace, keeping only
    /// results that warn or pause.
    pub fn detect_for_workspace(
        &self,
        workspace_id: &str,
    ) -> Result<Vec<AnomalyResult>, SchedulerError> {
        let campaigns = self
            .store
            .campaigns_with_status(CampaignStatus::Running, Some(workspace_id))?;
        let mut flagged = Vec::new();
        for campaign in campaigns {
            if let Some(result) = self.detect(&campaign.id)? {
                if result.should_pause || result.should_warn {
                    flagged.push(result);
                }
            }
        }
        Ok(flagged)
    }
}

pub(super) fn evaluate(campaign: &Campaign, stats: &DeliveryStats) -> Option<AnomalyResult> {
    let bounce = bounce_rate(stats);
    let unsubscribe = unsubscribe_rate(stats);
    let total_sent = bounce.total.max(unsubscribe.total);
    let tier = volume_tier(total_sent)?;

    let metrics = AnomalyMetrics {
        campaign_id: campaign.id.clone(),
        campaign_name: campaign.name.clone(),
        total_sent,
        volume_tier: tier,
        bounce_count: bounce.count,
        bounce_rate: bounce.percent,
        unsubscribe_count: unsubscribe.count,
        unsubscribe_rate: unsubscribe.percent,
        window_hours: ROLLING_WINDOW_HOURS,
    };
    let bounce_limits = bounce_thresholds(tier);
    let unsubscribe_limits = unsubscribe_thresholds(tier);

    let verdict = if bounce_limits.should_pause(bounce.percent, bounce.count) {
        Some((
            true,
            AutoPauseReason::HighBounceRate,
            format!("High bounce rate: {:.1}%", bounce.percent),
        ))
    } else if unsubscribe_limits.should_pause(unsubscribe.percent, unsubscribe.count) {
        Some((
            true,
            AutoPauseReason::HighUnsubscribeRate,
            format!("High unsubscribe rate: {:.1}%", unsubscribe.percent),
        ))
    } else if bounce_limits.should_warn(bounce.percent, bounce.count) {
        Some((
            false,
            AutoPauseReason::HighBounceRate,
            format!("Bounce rate needs attention ({:.1}%)", bounce.percent),
        ))
    } else if unsubscribe_limits.should_warn(unsubscribe.percent, unsubscribe.count) {
        Some((
            false,
            AutoPauseReason::HighUnsubscribeRate,
            format!("Unsubscribe rate needs attention ({:.1}%)", unsubscribe.percent),
        ))
    } else {
        None
    };

    let mut result = AnomalyResult {
        campaign_id: campaign.id.clone(),
        workspace_id: campaign.workspace_id.clone(),
        campaign_name: campaign.name.clone(),
        metrics,
        should_pause: false,
        should_warn: false,
        reason: None,
        severity: None,
        message: None,
    };
    if let Some((pause, reason, message)) = verdict {
        result.should_pause = pause;
        result.should_warn = !pause;
        result.reason = Some(reason);
        result.severity = Some(if pause { Severity::Error } else { Severity::Warning });
        result.message = Some(message);
    }
    Some(result)
}
