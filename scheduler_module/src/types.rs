use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::idempotency::IdempotencyKeyError;
use crate::sending_window::{SendingWindowError, SettingsError};

macro_rules! status_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = SchedulerError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok($name::$variant),)+
                    other => Err(SchedulerError::Storage(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

status_enum!(
    /// Lifecycle of one (prospect, sequence, step) send.
    ScheduledEmailStatus {
        Scheduled => "SCHEDULED",
        Sending => "SENDING",
        Sent => "SENT",
        RetryScheduled => "RETRY_SCHEDULED",
        Cancelled => "CANCELLED",
        PermanentlyFailed => "PERMANENTLY_FAILED",
    }
);

impl ScheduledEmailStatus {
    /// Waiting to be picked up by the sender.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Scheduled | Self::RetryScheduled)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Cancelled | Self::PermanentlyFailed)
    }

    pub fn can_transition_to(&self, next: ScheduledEmailStatus) -> bool {
        use ScheduledEmailStatus::*;
        match (*self, next) {
            (Scheduled | RetryScheduled, Sending | Cancelled) => true,
            (Sending, Sent | RetryScheduled | PermanentlyFailed | Cancelled) => true,
            _ => false,
        }
    }
}

status_enum!(CampaignStatus {
    Draft => "DRAFT",
    Running => "RUNNING",
    Paused => "PAUSED",
    Stopped => "STOPPED",
    Completed => "COMPLETED",
});

status_enum!(EnrollmentStatus {
    Enrolled => "ENROLLED",
    Paused => "PAUSED",
    Completed => "COMPLETED",
    Stopped => "STOPPED",
    Replied => "REPLIED",
});

impl EnrollmentStatus {
    /// Still expected to receive emails at some point.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Enrolled | Self::Paused)
    }
}

status_enum!(ProspectStatus {
    New => "NEW",
    Enriching => "ENRICHING",
    Verified => "VERIFIED",
    NotVerified => "NOT_VERIFIED",
    NeedsReview => "NEEDS_REVIEW",
    Suppressed => "SUPPRESSED",
    Contacted => "CONTACTED",
    Replied => "REPLIED",
    Bounced => "BOUNCED",
    Unsubscribed => "UNSUBSCRIBED",
    Booked => "BOOKED",
});

impl ProspectStatus {
    pub fn is_sendable(&self) -> bool {
        matches!(self, Self::Verified)
    }
}

status_enum!(AutoPauseReason {
    HighBounceRate => "HIGH_BOUNCE_RATE",
    HighUnsubscribeRate => "HIGH_UNSUBSCRIBE_RATE",
    HighComplaintRate => "HIGH_COMPLAINT_RATE",
});

status_enum!(NotificationKind {
    AnomalyPause => "ANOMALY_PAUSE",
    AnomalyWarning => "ANOMALY_WARNING",
});

status_enum!(Severity {
    Info => "INFO",
    Warning => "WARNING",
    Error => "ERROR",
});

status_enum!(MessageDirection {
    Inbound => "INBOUND",
    Outbound => "OUTBOUND",
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub onboarding_complete: bool,
    pub created_at: DateTime<Utc>,
}

impl Workspace {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            onboarding_complete: false,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prospect {
    pub id: String,
    pub workspace_id: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company: Option<String>,
    pub title: Option<String>,
    pub status: ProspectStatus,
    pub created_at: DateTime<Utc>,
}

impl Prospect {
    pub fn new(workspace_id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workspace_id: workspace_id.into(),
            email: email.into(),
            first_name: None,
            last_name: None,
            company: None,
            title: None,
            status: ProspectStatus::New,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceStep {
    pub step_number: u32,
    /// Days to wait after the previous step was sent. Ignored for step 1.
    pub delay_days: u32,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequence {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub steps: Vec<SequenceStep>,
    pub created_at: DateTime<Utc>,
}

impl Sequence {
    pub fn new(
        workspace_id: impl Into<String>,
        name: impl Into<String>,
        steps: Vec<SequenceStep>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workspace_id: workspace_id.into(),
            name: name.into(),
            steps,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Campaign {
    pub id: String,
    pub workspace_id: String,
    pub sequence_id: String,
    pub name: String,
    pub status: CampaignStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set only by the anomaly detector.
    pub auto_paused_reason: Option<AutoPauseReason>,
    pub created_at: DateTime<Utc>,
}

impl Campaign {
    pub fn new(
        workspace_id: impl Into<String>,
        sequence_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workspace_id: workspace_id.into(),
            sequence_id: sequence_id.into(),
            name: name.into(),
            status: CampaignStatus::Draft,
            started_at: None,
            paused_at: None,
            stopped_at: None,
            completed_at: None,
            auto_paused_reason: None,
            created_at: Utc::now(),
        }
    }
}

/// Enrollment of a prospect in a campaign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignProspect {
    pub id: String,
    pub campaign_id: String,
    pub prospect_id: String,
    pub enrollment_status: EnrollmentStatus,
    /// Next step to send, starting at 1.
    pub current_step: u32,
    pub enrolled_at: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl CampaignProspect {
    pub fn new(
        campaign_id: impl Into<String>,
        prospect_id: impl Into<String>,
        enrolled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            campaign_id: campaign_id.into(),
            prospect_id: prospect_id.into(),
            enrollment_status: EnrollmentStatus::Enrolled,
            current_step: 1,
            enrolled_at,
            paused_at: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledEmail {
    pub id: String,
    pub workspace_id: String,
    pub campaign_id: String,
    pub campaign_prospect_id: String,
    pub prospect_id: String,
    pub sequence_id: String,
    pub step_number: u32,
    pub idempotency_key: String,
    pub status: ScheduledEmailStatus,
    pub scheduled_for: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub message_id: Option<String>,
    pub thread_id: Option<String>,
    pub last_error: Option<String>,
    pub attempt_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledEmail {
    /// A fresh SCHEDULED row for one step of an enrollment.
    pub fn new(
        campaign: &Campaign,
        enrollment: &CampaignProspect,
        step_number: u32,
        idempotency_key: impl Into<String>,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workspace_id: campaign.workspace_id.clone(),
            campaign_id: campaign.id.clone(),
            campaign_prospect_id: enrollment.id.clone(),
            prospect_id: enrollment.prospect_id.clone(),
            sequence_id: campaign.sequence_id.clone(),
            step_number,
            idempotency_key: idempotency_key.into(),
            status: ScheduledEmailStatus::Scheduled,
            scheduled_for,
            sent_at: None,
            message_id: None,
            thread_id: None,
            last_error: None,
            attempt_count: 0,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEmail {
    pub id: String,
    pub workspace_id: String,
    pub campaign_id: String,
    pub prospect_id: String,
    pub scheduled_email_id: String,
    pub step_number: u32,
    pub message_id: String,
    pub thread_id: String,
    pub subject: String,
    pub headers: BTreeMap<String, String>,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: String,
    pub workspace_id: String,
    pub prospect_id: String,
    pub campaign_id: Option<String>,
    pub thread_id: String,
    pub subject: String,
    pub status: String,
    pub last_message_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxMessage {
    pub id: String,
    pub conversation_id: String,
    pub gmail_message_id: String,
    pub direction: MessageDirection,
    pub from_email: String,
    pub to_email: String,
    pub subject: String,
    pub body: String,
    pub is_read: bool,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GmailToken {
    pub workspace_id: String,
    /// Mailbox the token sends from.
    pub email: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub id: String,
    pub workspace_id: String,
    pub kind: NotificationKind,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub metadata: serde_json::Value,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditLogEntry {
    pub id: String,
    pub workspace_id: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn new(
        workspace_id: impl Into<String>,
        action: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        metadata: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workspace_id: workspace_id.into(),
            action: action.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            metadata,
            created_at,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("campaign {campaign_id} is not running (status {status})")]
    CampaignNotRunning {
        campaign_id: String,
        status: CampaignStatus,
    },
    #[error("no sent email to thread step {step_number} for prospect {prospect_id}")]
    ThreadContextMissing {
        prospect_id: String,
        step_number: u32,
    },
    #[error(transparent)]
    Idempotency(#[from] IdempotencyKeyError),
    #[error(transparent)]
    Window(#[from] SendingWindowError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
}
