// ABOUTME: Status command - cursor state per table and the live scheduler's state
// ABOUTME: Read-only; never touches the remote API

use anyhow::{Context, Result};

use crate::catalog::Catalog;
use crate::config::SyncConfig;
use crate::cursor::SyncCursor;
use crate::scheduler::{control, current_leader, ControlRequest, ControlResponse, SchedulerStatus};
use crate::warehouse::{PgWarehouse, Warehouse};

pub async fn status(config: &SyncConfig) -> Result<()> {
    let warehouse = PgWarehouse::connect(config.require_database_url()?, &config.schema)
        .await
        .context("Failed to connect to warehouse")?;
    let cursors = warehouse
        .cursors()
        .await
        .context("Failed to load sync cursors")?;

    println!("========================================");
    println!("Sync Status");
    println!("========================================");
    let catalog = Catalog::standard();
    for target in catalog.targets() {
        let cursor = cursors
            .iter()
            .find(|c| c.table_name == target.table)
            .cloned()
            .unwrap_or_else(|| SyncCursor::new(&target.table));
        print_cursor(&cursor, &target.pattern.to_string());
    }

    // Cursors for tables no longer in the catalog
    for cursor in cursors
        .iter()
        .filter(|c| catalog.resolve(&c.table_name).is_err())
    {
        print_cursor(cursor, "unlisted");
    }

    println!();
    match current_leader(&config.scheduler.lock_file) {
        Some(pid) => println!("Scheduler: leader PID {}", pid),
        None => println!("Scheduler: no leader"),
    }
    match config.scheduler.weekly_schedule() {
        Ok(schedule) => println!("Schedule:  {}", schedule),
        Err(e) => println!("Schedule:  invalid ({})", e),
    }
    match control::send(&config.scheduler.control_addr, ControlRequest::Status).await {
        Ok(ControlResponse::Status(status)) => print_scheduler(&status),
        Ok(other) => println!("Scheduler state: unexpected reply {:?}", other),
        Err(e) => {
            tracing::debug!("Scheduler control endpoint unavailable: {:?}", e);
            println!(
                "Scheduler state: unavailable (nothing answering on {})",
                config.scheduler.control_addr
            );
        }
    }
    Ok(())
}

fn print_scheduler(status: &SchedulerStatus) {
    println!("  Running:           {}", status.running);
    println!("  Sync in progress:  {}", status.sync_in_progress);
    match status.next_sync_at {
        Some(at) => println!("  Next sync:         {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("  Next sync:         -"),
    }
    match status.regeneration_pending_at {
        Some(at) => println!("  Regeneration due:  {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("  Regeneration due:  -"),
    }
}

fn print_cursor(cursor: &SyncCursor, pattern: &str) {
    println!();
    println!("{} ({})", cursor.table_name, pattern);
    println!("  Status:        {}", cursor.status.as_str());
    match (cursor.window_start, cursor.window_end) {
        (Some(start), Some(end)) => println!("  Window:        {} to {}", start, end),
        (None, Some(end)) => println!("  Synced up to:  {}", end),
        _ => println!("  Window:        -"),
    }
    match cursor.last_sync_at {
        Some(at) => println!("  Last sync:     {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("  Last sync:     never"),
    }
    println!("  Records:       {}", cursor.total_records);
    if let Some(error) = &cursor.last_error {
        println!("  Last error:    {}", error);
    }
}
