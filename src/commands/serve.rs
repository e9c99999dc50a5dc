// ABOUTME: Serve command - elect a scheduler leader and run the background scheduler until Ctrl+C
// ABOUTME: The leader also answers status and trigger requests; losing processes stand down

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;

use crate::config::SyncConfig;
use crate::scheduler::{control, elect, ElectionOutcome, Scheduler, TriggerOutcome};
use crate::service::SyncService;

pub async fn serve(config: &SyncConfig, run_now: bool) -> Result<()> {
    let schedule = config.scheduler.weekly_schedule()?;
    let lock_file = &config.scheduler.lock_file;

    let guard = match elect(lock_file).context("Scheduler election failed")? {
        ElectionOutcome::Leader(guard) => guard,
        ElectionOutcome::Follower { leader_pid } => {
            match leader_pid {
                Some(pid) => tracing::info!("Scheduler already running as PID {}; standing down", pid),
                None => tracing::info!("Scheduler lock {:?} is held; standing down", lock_file),
            }
            return Ok(());
        }
    };

    let listener = control::bind(&config.scheduler.control_addr).await?;
    let service = Arc::new(SyncService::connect(config).await?);
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let (handle, task) =
        Scheduler::new(service, schedule, config.scheduler.regeneration_delay()).start(&shutdown_tx);
    tokio::spawn(control::serve_control(
        listener,
        handle.clone(),
        shutdown_tx.subscribe(),
    ));

    println!("========================================");
    println!("citizen-sync scheduler (PID {})", guard.pid());
    println!("========================================");
    println!("  Schedule: {}", schedule);
    println!(
        "  Next run: {}",
        schedule.next_after(Utc::now()).format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("  Control:  {}", config.scheduler.control_addr);
    println!("  Press Ctrl+C to stop");
    println!();

    if run_now {
        match handle.trigger_sync_now() {
            TriggerOutcome::Started => tracing::info!("Initial sync started"),
            other => tracing::warn!("Initial sync not started: {:?}", other),
        }
    }

    let shutdown = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Received shutdown signal");
        let _ = shutdown.send(());
    });

    task.await.context("Scheduler task panicked")?;
    drop(guard);
    Ok(())
}
