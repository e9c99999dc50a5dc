// ABOUTME: Regenerate command - rebuild some or all derived tables on demand
// ABOUTME: Table names are validated before any connection is made

use anyhow::{Context, Result};

use crate::config::SyncConfig;
use crate::regenerate::{DerivedTable, TriggerSource};
use crate::service::SyncService;

pub async fn regenerate(
    config: &SyncConfig,
    tables: &[String],
    trigger: TriggerSource,
) -> Result<()> {
    let tables = tables
        .iter()
        .map(|name| name.parse::<DerivedTable>())
        .collect::<Result<Vec<_>, _>>()
        .context("Invalid derived table name")?;

    let service = SyncService::connect(config).await?;
    let report = service.regenerator().regenerate(&tables, trigger).await?;

    println!("========================================");
    println!("Regeneration complete ({})", trigger);
    println!("========================================");
    for entry in &report.entries {
        println!(
            "  {:<26} {:>10} rows  {:>7.2}s",
            entry.table_name, entry.rows_generated, entry.duration_seconds
        );
    }
    println!("  Total: {:.2}s", report.duration_seconds);
    Ok(())
}
