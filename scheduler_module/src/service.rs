//! Long-running worker process: scheduler, sender and watchdog loops over one
//! outreach store.

mod config;
mod scheduler;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub use config::ServiceConfig;
pub use scheduler::{fail_stale_sending, STALE_SENDING_REASON};

use std::sync::Arc;

use send_emails_module::GmailClient;
use tokio::task;
use tracing::{info, warn};

use crate::google_auth::GmailTokenService;
use crate::scheduler::{EmailScheduler, ScheduleSummary};
use crate::sender::{EmailSenderWorker, ProcessingStats};
use crate::store::OutreachStore;

use scheduler::{start_service_threads, GmailSenderWorker};

/// What a single `--once` invocation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OnceReport {
    pub stale_failed: usize,
    pub schedule: ScheduleSummary,
    pub send: ProcessingStats,
}

fn build_worker(config: &ServiceConfig, store: &OutreachStore) -> Result<GmailSenderWorker, BoxError> {
    if !config.google.is_valid() {
        warn!("GOOGLE_CLIENT_ID/GOOGLE_CLIENT_SECRET not set; expiring tokens cannot be refreshed");
    }
    let transport = GmailClient::new(config.gmail_api_base_url.clone())?;
    let tokens = GmailTokenService::new(store.clone(), config.google.clone());
    Ok(EmailSenderWorker::new(
        store.clone(),
        transport,
        tokens,
        config.worker_options(),
    ))
}

/// One watchdog sweep, one scheduler pass and one sender pass, then return.
pub fn run_once(config: &ServiceConfig) -> Result<OnceReport, BoxError> {
    let store = OutreachStore::new(config.db_path.clone())?;
    let worker = build_worker(config, &store)?;

    let stale_failed = fail_stale_sending(&store, config.sending_stale_after)?;
    let schedule = EmailScheduler::new(store.clone()).schedule_running_campaigns()?;
    let send = worker.process_pending_emails()?;
    info!(
        "single pass done: {} scheduled, {} sent, {} stale failed",
        schedule.scheduled, send.sent, stale_failed
    );
    Ok(OnceReport {
        stale_failed,
        schedule,
        send,
    })
}

/// Runs the background loops until `shutdown` resolves, then waits for them
/// to finish their current pass.
pub async fn run_service(
    config: ServiceConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), BoxError> {
    let config = Arc::new(config);
    // The Gmail and OAuth clients are blocking; build them off the runtime.
    let mut control = task::spawn_blocking(move || -> Result<_, BoxError> {
        let store = OutreachStore::new(config.db_path.clone())?;
        let worker = Arc::new(build_worker(&config, &store)?);
        info!("outreach worker using store {}", store.path().display());
        Ok(start_service_threads(config, store, worker))
    })
    .await
    .map_err(|err| -> BoxError { err.into() })??;
    shutdown.await;
    info!("shutdown requested; waiting for loops to finish");
    task::spawn_blocking(move || control.stop_and_join())
        .await
        .map_err(|err| -> BoxError { err.into() })?;
    info!("outreach worker stopped");
    Ok(())
}
