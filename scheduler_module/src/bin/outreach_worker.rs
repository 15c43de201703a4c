use scheduler_module::service::{run_once, run_service, ServiceConfig};
use std::env;
use tracing::info;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt().with_target(false).init();

    let mut once = false;
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--once" => once = true,
            other => {
                return Err(format!(
                    "unknown argument '{}' (usage: outreach-worker [--once])",
                    other
                )
                .into())
            }
        }
    }

    let config = ServiceConfig::from_env()?;
    if once {
        let report = tokio::task::spawn_blocking(move || run_once(&config)).await??;
        info!(
            "scheduled {} ({} skipped, {} error(s)); sent {} of {} processed",
            report.schedule.scheduled,
            report.schedule.skipped,
            report.schedule.errors.len(),
            report.send.sent,
            report.send.processed
        );
        return Ok(());
    }

    run_service(config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}
