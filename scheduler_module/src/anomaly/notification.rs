use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::types::{AutoPauseReason, Notification, NotificationKind, SchedulerError, Severity};

use super::detection::AnomalyResult;

fn reason_label(reason: AutoPauseReason) -> &'static str {
    match reason {
        AutoPauseReason::HighBounceRate => "high bounce rate",
        AutoPauseReason::HighUnsubscribeRate => "high unsubscribe rate",
        AutoPauseReason::HighComplaintRate => "high complaint rate",
    }
}

fn title(result: &AnomalyResult) -> String {
    match (result.reason, result.should_pause) {
        (Some(reason), true) => format!("Campaign auto-paused: {}", reason_label(reason)),
        (Some(reason), false) => format!("Warning: {}", reason_label(reason)),
        (None, _) => "Deliverability anomaly detected".to_string(),
    }
}

/// Notification for a result that warns or pauses; `None` otherwise.
pub(crate) fn anomaly_notification(
    result: &AnomalyResult,
    now: DateTime<Utc>,
) -> Result<Option<Notification>, SchedulerError> {
    if !result.should_pause && !result.should_warn {
        return Ok(None);
    }
    let (kind, default_severity) = if result.should_pause {
        (NotificationKind::AnomalyPause, Severity::Error)
    } else {
        (NotificationKind::AnomalyWarning, Severity::Warning)
    };
    let message = result.message.clone().unwrap_or_else(|| {
        format!("Anomaly detected on campaign {}", result.campaign_name)
    });
    Ok(Some(Notification {
        id: Uuid::new_v4().to_string(),
        workspace_id: result.workspace_id.clone(),
        kind,
        severity: result.severity.unwrap_or(default_severity),
        title: title(result),
        message,
        metadata: json!({
            "campaignId": result.campaign_id,
            "campaignName": result.campaign_name,
            "reason": result.reason.map(|reason| reason.as_str()),
            "metrics": serde_json::to_value(&result.metrics)?,
        }),
        is_read: false,
        created_at: now,
    }))
}
