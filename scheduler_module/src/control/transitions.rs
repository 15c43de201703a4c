//! Allowed campaign and enrollment transitions. Every caller goes through
//! these two functions, so the matrices live in one place.

use crate::types::{CampaignStatus, EnrollmentStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignAction {
    Launch,
    Pause,
    Resume,
    Stop,
    Complete,
}

impl CampaignAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignAction::Launch => "launch",
            CampaignAction::Pause => "pause",
            CampaignAction::Resume => "resume",
            CampaignAction::Stop => "stop",
            CampaignAction::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentAction {
    Pause,
    Resume,
    Stop,
    Complete,
    MarkReplied,
}

impl EnrollmentAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentAction::Pause => "pause",
            EnrollmentAction::Resume => "resume",
            EnrollmentAction::Stop => "stop",
            EnrollmentAction::Complete => "complete",
            EnrollmentAction::MarkReplied => "mark as replied",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot {action} a {entity} that is {state}")]
pub struct TransitionError {
    pub entity: &'static str,
    pub action: &'static str,
    pub state: String,
}

pub fn campaign_transition(
    from: CampaignStatus,
    action: CampaignAction,
) -> Result<CampaignStatus, TransitionError> {
    use CampaignAction as A;
    use CampaignStatus as S;
    match (from, action) {
        (S::Draft, A::Launch) => Ok(S::Running),
        (S::Running, A::Pause) => Ok(S::Paused),
        (S::Paused, A::Resume) => Ok(S::Running),
        (S::Running | S::Paused, A::Stop) => Ok(S::Stopped),
        (S::Running, A::Complete) => Ok(S::Completed),
        _ => Err(TransitionError {
            entity: "campaign",
            action: action.as_str(),
            state: from.as_str().to_lowercase(),
        }),
    }
}

pub fn enrollment_transition(
    from: EnrollmentStatus,
    action: EnrollmentAction,
) -> Result<EnrollmentStatus, TransitionError> {
    use EnrollmentAction as A;
    use EnrollmentStatus as S;
    match (from, action) {
        (S::Enrolled, A::Pause) => Ok(S::Paused),
        (S::Paused, A::Resume) => Ok(S::Enrolled),
        (S::Enrolled | S::Paused | S::Replied, A::Stop) => Ok(S::Stopped),
        (S::Enrolled | S::Replied, A::Complete) => Ok(S::Completed),
        (S::Enrolled, A::MarkReplied) => Ok(S::Replied),
        _ => Err(TransitionError {
            entity: "prospect enrollment",
            action: action.as_str(),
            state: from.as_str().to_lowercase(),
        }),
    }
}
