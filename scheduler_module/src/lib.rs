pub mod anomaly;
pub mod control;
pub mod google_auth;
pub mod idempotency;
pub mod quota;
pub mod retry;
pub mod scheduler;
pub mod sender;
pub mod sending_window;
pub mod service;
pub mod store;
pub mod types;

mod utils;

#[cfg(test)]
pub(crate) mod test_fixtures;

pub use anomaly::{AnomalyAction, AnomalyDetector, AnomalyResult, AutoPauseService};
pub use control::{CampaignControl, ControlError, ProspectControl, StopCampaignResult};
pub use google_auth::{GmailTokenService, GoogleAuthConfig, TokenError, TokenProvider, ValidToken};
pub use quota::QuotaService;
pub use scheduler::{EmailScheduler, ScheduleSummary};
pub use sender::{
    EmailSenderWorker, GuardrailCode, MailTransport, ProcessingStats, SendOutcome, WorkerOptions,
};
pub use sending_window::SendingSettings;
pub use store::{ClaimOutcome, OutreachStore};
pub use types::{
    Campaign, CampaignProspect, CampaignStatus, EnrollmentStatus, Prospect, ProspectStatus,
    ScheduledEmail, ScheduledEmailStatus, SchedulerError, Sequence, SequenceStep, Workspace,
};
