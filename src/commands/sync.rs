// ABOUTME: Sync commands - one table or the full ordered catalog, run in the foreground
// ABOUTME: Prints per-table outcomes; optional immediate regeneration after sync-all

use anyhow::{bail, Result};

use crate::config::SyncConfig;
use crate::orchestrator::{SyncRequest, TableSyncOutcome};
use crate::regenerate::TriggerSource;
use crate::scheduler::SchedulerJobs;
use crate::service::SyncService;

pub async fn sync(config: &SyncConfig, request: SyncRequest) -> Result<()> {
    let service = SyncService::connect(config).await?;
    let outcome = service.orchestrator().sync(&request).await?;

    print_outcome(&outcome);
    if !outcome.succeeded() {
        bail!(
            "Sync of {} failed: {}",
            outcome.table,
            outcome.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

pub async fn sync_all(config: &SyncConfig, regenerate: bool) -> Result<()> {
    let service = SyncService::connect(config).await?;
    let report = service.orchestrator().sync_all().await;

    println!("========================================");
    println!("Sync run started {}", report.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("========================================");
    for outcome in &report.outcomes {
        print_outcome(outcome);
    }
    println!();
    println!(
        "{} succeeded, {} failed in {:.1}s",
        report.succeeded(),
        report.failed(),
        report.duration.as_secs_f64()
    );

    if !report.wants_regeneration() {
        bail!("No table synced successfully");
    }
    if regenerate {
        SchedulerJobs::regenerate(&service, TriggerSource::Manual).await?;
        println!("Derived tables regenerated");
    }
    Ok(())
}

fn print_outcome(outcome: &TableSyncOutcome) {
    println!();
    println!("{} ({}, {})", outcome.table, outcome.remote_name, outcome.pattern);
    println!("  Status:     {}", outcome.status);
    if let Some(window) = &outcome.window {
        println!("  Window:     {}", window);
    }
    println!("  Received:   {}", outcome.processed);
    println!(
        "  Inserted:   {}  Updated: {}  Skipped: {}  Failed: {}",
        outcome.merge.inserted, outcome.merge.updated, outcome.merge.skipped, outcome.merge.failed
    );
    if let Some(stop) = &outcome.stop {
        println!("  Stopped:    {}", stop);
    }
    if let Some(error) = &outcome.error {
        println!("  Error:      {}", error);
    }
}
