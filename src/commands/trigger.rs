// ABOUTME: Trigger command - ask the running scheduler to start a full sync now
// ABOUTME: Fire-and-forget; the outcome shows up later in `status`

use anyhow::{bail, Context, Result};

use crate::config::SyncConfig;
use crate::scheduler::{control, ControlRequest, ControlResponse, TriggerOutcome};

pub async fn trigger_sync(config: &SyncConfig) -> Result<()> {
    let addr = &config.scheduler.control_addr;
    let response = control::send(addr, ControlRequest::TriggerSync)
        .await
        .context("Could not reach the scheduler; is `citizen-sync serve` running?")?;

    match response {
        ControlResponse::Trigger {
            outcome: TriggerOutcome::Started,
        } => println!("Full sync started. Follow progress with `citizen-sync status`."),
        ControlResponse::Trigger {
            outcome: TriggerOutcome::AlreadyRunning,
        } => println!("A sync is already in progress; request ignored."),
        ControlResponse::Trigger {
            outcome: TriggerOutcome::SchedulerStopped,
        } => bail!("The scheduler at {} is shutting down", addr),
        ControlResponse::Error { message } => bail!("Scheduler rejected the request: {}", message),
        ControlResponse::Status(_) => bail!("Scheduler answered with a status instead of a trigger outcome"),
    }
    Ok(())
}
