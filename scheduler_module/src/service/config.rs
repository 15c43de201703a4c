use std::env;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use send_emails_module::DEFAULT_GMAIL_API_BASE_URL;

use crate::google_auth::GoogleAuthConfig;
use crate::sender::WorkerOptions;

const DEFAULT_DB_PATH: &str = ".outreach/outreach.db";
const DEFAULT_SENDER_POLL_SECS: u64 = 60;
const DEFAULT_SCHEDULER_POLL_SECS: u64 = 300;
const DEFAULT_SEND_BATCH_LIMIT: usize = 50;
const DEFAULT_INTER_EMAIL_DELAY_MS: u64 = 3000;
const DEFAULT_WATCHDOG_INTERVAL_MS: u64 = 30_000;
const DEFAULT_SENDING_STALE_AFTER_SECS: u64 = 600;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub db_path: PathBuf,
    pub sender_poll_interval: Duration,
    pub scheduler_poll_interval: Duration,
    pub send_batch_limit: usize,
    pub inter_email_delay: Duration,
    pub watchdog_interval: Duration,
    /// SENDING rows older than this are failed by the watchdog.
    pub sending_stale_after: Duration,
    pub gmail_api_base_url: String,
    /// Base for unsubscribe links.
    pub app_base_url: Option<String>,
    pub google: GoogleAuthConfig,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, io::Error> {
        dotenvy::dotenv().ok();

        let db_path = resolve_path(
            env::var("OUTREACH_DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string()),
        )?;
        let gmail_api_base_url = non_empty_var("GMAIL_API_BASE_URL")
            .unwrap_or_else(|| DEFAULT_GMAIL_API_BASE_URL.to_string());

        Ok(Self {
            db_path,
            sender_poll_interval: Duration::from_secs(positive_var(
                "SENDER_POLL_INTERVAL_SECS",
                DEFAULT_SENDER_POLL_SECS,
            )),
            scheduler_poll_interval: Duration::from_secs(positive_var(
                "SCHEDULER_POLL_INTERVAL_SECS",
                DEFAULT_SCHEDULER_POLL_SECS,
            )),
            send_batch_limit: positive_var("SEND_BATCH_LIMIT", DEFAULT_SEND_BATCH_LIMIT),
            // Zero is allowed here: no pause between sends.
            inter_email_delay: Duration::from_millis(
                env::var("INTER_EMAIL_DELAY_MS")
                    .ok()
                    .and_then(|value| value.trim().parse::<u64>().ok())
                    .unwrap_or(DEFAULT_INTER_EMAIL_DELAY_MS),
            ),
            watchdog_interval: Duration::from_millis(positive_var(
                "WATCHDOG_INTERVAL_MS",
                DEFAULT_WATCHDOG_INTERVAL_MS,
            )),
            sending_stale_after: Duration::from_secs(positive_var(
                "SENDING_STALE_AFTER_SECS",
                DEFAULT_SENDING_STALE_AFTER_SECS,
            )),
            gmail_api_base_url,
            app_base_url: non_empty_var("APP_BASE_URL"),
            google: GoogleAuthConfig::from_env(),
        })
    }

    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            batch_limit: self.send_batch_limit,
            inter_email_delay: self.inter_email_delay,
            app_base_url: self.app_base_url.clone(),
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Parsed value of `key`, or `default` when unset, unparsable or zero.
fn positive_var<T>(key: &str, default: T) -> T
where
    T: FromStr + PartialOrd + Default,
{
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .filter(|value| *value > T::default())
        .unwrap_or(default)
}

fn resolve_path(raw: String) -> Result<PathBuf, io::Error> {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        Ok(path)
    } else {
        let cwd = env::current_dir()?;
        Ok(cwd.join(path))
    }
}
