//! User- and system-initiated campaign and enrollment transitions.
//!
//! Each operation loads, validates, writes and audits inside one immediate
//! transaction; a rejected transition leaves the store untouched.

mod campaign;
mod prospect;
mod transitions;

pub use campaign::{CampaignControl, StopCampaignResult};
pub use prospect::{EnrollmentChange, ProspectControl};
pub use transitions::{
    campaign_transition, enrollment_transition, CampaignAction, EnrollmentAction, TransitionError,
};

use crate::types::{AutoPauseReason, SchedulerError};

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
    #[error("campaign {campaign_id} was paused automatically ({reason}); accept the risk to resume it")]
    RiskAcknowledgementRequired {
        campaign_id: String,
        reason: AutoPauseReason,
    },
    #[error("campaign {0} not found")]
    CampaignNotFound(String),
    #[error("prospect {prospect_id} is not enrolled in campaign {campaign_id}")]
    EnrollmentNotFound {
        campaign_id: String,
        prospect_id: String,
    },
    #[error(transparent)]
    Store(#[from] SchedulerError),
}
