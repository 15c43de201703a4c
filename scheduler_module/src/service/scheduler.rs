use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use send_emails_module::GmailClient;
use tracing::{error, info, warn};

use crate::google_auth::GmailTokenService;
use crate::scheduler::EmailScheduler;
use crate::sender::EmailSenderWorker;
use crate::store::OutreachStore;
use crate::types::SchedulerError;

use super::config::ServiceConfig;

pub const STALE_SENDING_REASON: &str = "Send outcome unknown: worker stopped while sending";

/// Longest uninterrupted sleep, so a stop request is noticed quickly.
const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(200);

pub(crate) type GmailSenderWorker = EmailSenderWorker<GmailClient, GmailTokenService>;

pub(super) struct ServiceControl {
    stop: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl ServiceControl {
    pub(super) fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub(super) fn stop_and_join(&mut self) {
        self.stop();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Fails SENDING rows untouched for longer than `stale_after`. Whether those
/// messages left is unknown, so they are never sent again.
pub fn fail_stale_sending(
    store: &OutreachStore,
    stale_after: Duration,
) -> Result<usize, SchedulerError> {
    let now = Utc::now();
    let stale_after = chrono::Duration::from_std(stale_after)
        .map_err(|err| SchedulerError::Storage(format!("invalid stale threshold: {}", err)))?;
    let failed = store.fail_stale_sending(now - stale_after, STALE_SENDING_REASON, now)?;
    if failed > 0 {
        warn!("watchdog failed {} email(s) stuck in SENDING", failed);
    }
    Ok(failed)
}

pub(super) fn start_service_threads(
    config: Arc<ServiceConfig>,
    store: OutreachStore,
    worker: Arc<GmailSenderWorker>,
) -> ServiceControl {
    let stop = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::with_capacity(3);

    {
        let stop = stop.clone();
        let scheduler = EmailScheduler::new(store.clone());
        let interval = config.scheduler_poll_interval;
        handles.push(thread::spawn(move || {
            info!("scheduler loop started (interval={}s)", interval.as_secs());
            while !stop.load(Ordering::Relaxed) {
                match scheduler.schedule_running_campaigns() {
                    Ok(summary) if !summary.errors.is_empty() => warn!(
                        "scheduler pass finished with {} error(s): {}",
                        summary.errors.len(),
                        summary.errors.join("; ")
                    ),
                    Ok(_) => {}
                    Err(err) => error!("scheduler pass failed: {}", err),
                }
                sleep_unless_stopped(&stop, interval);
            }
        }));
    }

    {
        let stop = stop.clone();
        let interval = config.sender_poll_interval;
        handles.push(thread::spawn(move || {
            info!("sender loop started (interval={}s)", interval.as_secs());
            while !stop.load(Ordering::Relaxed) {
                if let Err(err) = worker.process_pending_emails() {
                    error!("sender pass failed: {}", err);
                }
                sleep_unless_stopped(&stop, interval);
            }
        }));
    }

    {
        let stop = stop.clone();
        let interval = config.watchdog_interval;
        let stale_after = config.sending_stale_after;
        handles.push(thread::spawn(move || {
            info!(
                "sending watchdog started (stale_after={}s, check_interval={}ms)",
                stale_after.as_secs(),
                interval.as_millis()
            );
            while !stop.load(Ordering::Relaxed) {
                sleep_unless_stopped(&stop, interval);
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(err) = fail_stale_sending(&store, stale_after) {
                    error!("sending watchdog failed: {}", err);
                }
            }
        }));
    }

    ServiceControl { stop, handles }
}

fn sleep_unless_stopped(stop: &AtomicBool, duration: Duration) {
    let deadline = Instant::now() + duration;
    while !stop.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(STOP_CHECK_INTERVAL));
    }
}
