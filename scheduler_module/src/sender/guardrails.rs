use chrono::{DateTime, Utc};

use crate::google_auth::{TokenError, TokenProvider, ValidToken};
use crate::quota::{effective_daily_quota, QuotaService};
use crate::sending_window::{campaign_day_number, SendingSettings};
use crate::store::OutreachStore;
use crate::types::{
    CampaignProspect, CampaignStatus, EnrollmentStatus, Prospect, ScheduledEmail, SchedulerError,
};

use super::threading::are_previous_steps_sent;

/// Why a due email was not sent on this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuardrailCode {
    WorkspaceNotFound,
    OnboardingIncomplete,
    GmailNotConnected,
    GmailTokenInvalid,
    GmailReloginRequired,
    ProspectNotEligible,
    CampaignPaused,
    CampaignNotRunning,
    EnrollmentPaused,
    EnrollmentInactive,
    QuotaExceeded,
    PreviousStepPending,
}

/// What happens to the row when a guardrail blocks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardrailDisposition {
    /// Row is CANCELLED and never retried.
    Cancel,
    /// Row is left pending for a later pass.
    Defer,
}

impl GuardrailCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardrailCode::WorkspaceNotFound => "WORKSPACE_NOT_FOUND",
            GuardrailCode::OnboardingIncomplete => "ONBOARDING_INCOMPLETE",
            GuardrailCode::GmailNotConnected => "GMAIL_NOT_CONNECTED",
            GuardrailCode::GmailTokenInvalid => "GMAIL_TOKEN_INVALID",
            GuardrailCode::GmailReloginRequired => "GMAIL_RELOGIN_REQUIRED",
            GuardrailCode::ProspectNotEligible => "PROSPECT_NOT_ELIGIBLE",
            GuardrailCode::CampaignPaused => "CAMPAIGN_PAUSED",
            GuardrailCode::CampaignNotRunning => "CAMPAIGN_NOT_RUNNING",
            GuardrailCode::EnrollmentPaused => "ENROLLMENT_PAUSED",
            GuardrailCode::EnrollmentInactive => "ENROLLMENT_INACTIVE",
            GuardrailCode::QuotaExceeded => "QUOTA_EXCEEDED",
            GuardrailCode::PreviousStepPending => "PREVIOUS_STEP_PENDING",
        }
    }

    pub fn disposition(&self) -> GuardrailDisposition {
        match self {
            GuardrailCode::WorkspaceNotFound
            | GuardrailCode::ProspectNotEligible
            | GuardrailCode::CampaignNotRunning
            | GuardrailCode::EnrollmentInactive => GuardrailDisposition::Cancel,
            _ => GuardrailDisposition::Defer,
        }
    }

    /// `last_error` text for cancelled rows.
    pub fn description(&self) -> &'static str {
        match self {
            GuardrailCode::WorkspaceNotFound => "Workspace not found",
            GuardrailCode::OnboardingIncomplete => "Workspace onboarding incomplete",
            GuardrailCode::GmailNotConnected => "Gmail not connected",
            GuardrailCode::GmailTokenInvalid => "Gmail token could not be refreshed",
            GuardrailCode::GmailReloginRequired => "Gmail access revoked, sign in again",
            GuardrailCode::ProspectNotEligible => "Prospect not eligible for sending",
            GuardrailCode::CampaignPaused => "Campaign paused",
            GuardrailCode::CampaignNotRunning => "Campaign not running",
            GuardrailCode::EnrollmentPaused => "Prospect paused",
            GuardrailCode::EnrollmentInactive => "Prospect no longer enrolled",
            GuardrailCode::QuotaExceeded => "Daily quota exceeded",
            GuardrailCode::PreviousStepPending => "Previous step not sent yet",
        }
    }
}

impl std::fmt::Display for GuardrailCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a send needs once every guardrail has passed.
#[derive(Debug, Clone)]
pub(super) struct SendContext {
    pub token: ValidToken,
    pub prospect: Prospect,
    pub enrollment: CampaignProspect,
    pub settings: SendingSettings,
    /// Send cap for today's campaign day, enforced again at claim time.
    pub daily_cap: u32,
}

pub(super) enum GuardrailOutcome {
    Pass(Box<SendContext>),
    Blocked(GuardrailCode),
}

/// Runs the pre-send chain in order, stopping at the first failure. Store
/// errors propagate; business conditions come back as a code.
pub(super) fn check_guardrails<P: TokenProvider + ?Sized>(
    store: &OutreachStore,
    quota: &QuotaService,
    tokens: &P,
    email: &ScheduledEmail,
    now: DateTime<Utc>,
) -> Result<GuardrailOutcome, SchedulerError> {
    use GuardrailOutcome::Blocked;

    let Some(workspace) = store.load_workspace(&email.workspace_id)? else {
        return Ok(Blocked(GuardrailCode::WorkspaceNotFound));
    };
    if !workspace.onboarding_complete {
        return Ok(Blocked(GuardrailCode::OnboardingIncomplete));
    }
    if store.load_gmail_token(&workspace.id)?.is_none() {
        return Ok(Blocked(GuardrailCode::GmailNotConnected));
    }
    let token = match tokens.valid_token(&workspace.id) {
        Ok(token) => token,
        Err(TokenError::NoToken(_)) => return Ok(Blocked(GuardrailCode::GmailNotConnected)),
        Err(TokenError::ReLoginRequired(_)) => {
            return Ok(Blocked(GuardrailCode::GmailReloginRequired))
        }
        Err(TokenError::RefreshFailed(_)) => return Ok(Blocked(GuardrailCode::GmailTokenInvalid)),
        Err(TokenError::Store(err)) => return Err(err),
    };

    let prospect = match store.load_prospect(&email.prospect_id)? {
        Some(prospect) if prospect.status.is_sendable() => prospect,
        _ => return Ok(Blocked(GuardrailCode::ProspectNotEligible)),
    };

    let campaign = match store.load_campaign(&email.campaign_id)? {
        Some(campaign) if campaign.status == CampaignStatus::Running => campaign,
        Some(campaign) if campaign.status == CampaignStatus::Paused => {
            return Ok(Blocked(GuardrailCode::CampaignPaused))
        }
        _ => return Ok(Blocked(GuardrailCode::CampaignNotRunning)),
    };

    let enrollment = match store.load_enrollment(&campaign.id, &prospect.id)? {
        Some(enrollment) if enrollment.enrollment_status == EnrollmentStatus::Enrolled => enrollment,
        Some(enrollment) if enrollment.enrollment_status == EnrollmentStatus::Paused => {
            return Ok(Blocked(GuardrailCode::EnrollmentPaused))
        }
        _ => return Ok(Blocked(GuardrailCode::EnrollmentInactive)),
    };

    let settings = store.load_sending_settings(&workspace.id)?;
    let day_number = campaign_day_number(
        settings.timezone,
        campaign.started_at.unwrap_or(now),
        now,
    );
    if quota.remaining_send_quota(&workspace.id, now, &settings, day_number)? == 0 {
        return Ok(Blocked(GuardrailCode::QuotaExceeded));
    }

    if !are_previous_steps_sent(store, &campaign.id, &prospect.id, email.step_number)? {
        return Ok(Blocked(GuardrailCode::PreviousStepPending));
    }

    Ok(GuardrailOutcome::Pass(Box::new(SendContext {
        token,
        prospect,
        enrollment,
        daily_cap: effective_daily_quota(&settings, day_number),
        settings,
    })))
}
