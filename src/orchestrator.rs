// ABOUTME: SyncOrchestrator - runs one table or the whole catalog and records every outcome
// ABOUTME: Window selection, strategy dispatch and unconditional cursor updates

use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::catalog::{Catalog, ReplicationPattern, SyncTarget};
use crate::config::SyncSettings;
use crate::cursor::{parse_date, DateWindow, SyncCursor, SyncStatus};
use crate::error::{Result, SyncError};
use crate::fetch::{BatchSink, PaginatedFetcher, StopReason};
use crate::merge::MergeOutcome;
use crate::remote::{Record, RecordSource};
use crate::warehouse::Warehouse;

/// Parameters for a single-table sync.
#[derive(Debug, Clone, Default)]
pub struct SyncRequest {
    /// Local, remote or `ml_` alias name
    pub table: String,
    /// `YYYY-MM-DD`; defaults to the cursor's window end, then the epoch
    pub start_date: Option<String>,
    /// `YYYY-MM-DD`; defaults to today
    pub end_date: Option<String>,
    /// Ignore the cursor and start from the epoch
    pub force_full: bool,
}

impl SyncRequest {
    pub fn table(name: &str) -> Self {
        Self {
            table: name.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TableSyncOutcome {
    pub table: String,
    pub remote_name: String,
    pub pattern: ReplicationPattern,
    pub window: Option<DateWindow>,
    /// Records received from the remote API
    pub processed: u64,
    pub merge: MergeOutcome,
    pub stop: Option<StopReason>,
    pub status: SyncStatus,
    pub error: Option<String>,
}

impl TableSyncOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == SyncStatus::Success
    }

    fn failed_to_start(target: &SyncTarget, error: &SyncError) -> Self {
        Self {
            table: target.table.clone(),
            remote_name: target.remote_name.clone(),
            pattern: target.pattern,
            window: None,
            processed: 0,
            merge: MergeOutcome::default(),
            stop: None,
            status: SyncStatus::Failed,
            error: Some(error.to_string()),
        }
    }
}

/// Result of a full ordered run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRunReport {
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub outcomes: Vec<TableSyncOutcome>,
}

impl SyncRunReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    /// Derived tables are rebuilt when at least one table synced.
    pub fn wants_regeneration(&self) -> bool {
        self.succeeded() > 0
    }

    pub fn outcome(&self, table: &str) -> Option<&TableSyncOutcome> {
        self.outcomes.iter().find(|o| o.table == table)
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }
}

/// Forwards fetched pages to the warehouse and remembers progress so a
/// failed run still reports what was written.
struct WarehouseSink<'a> {
    warehouse: &'a dyn Warehouse,
    target: &'a SyncTarget,
    received: AtomicU64,
    progress: Mutex<MergeOutcome>,
}

impl<'a> WarehouseSink<'a> {
    fn new(warehouse: &'a dyn Warehouse, target: &'a SyncTarget) -> Self {
        Self {
            warehouse,
            target,
            received: AtomicU64::new(0),
            progress: Mutex::new(MergeOutcome::default()),
        }
    }

    fn progress(&self) -> (u64, MergeOutcome) {
        let merged = self
            .progress
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default();
        (self.received.load(Ordering::SeqCst), merged)
    }
}

#[async_trait]
impl<'a> BatchSink for WarehouseSink<'a> {
    async fn write_batch(&self, page: u32, records: &[Record]) -> Result<MergeOutcome> {
        self.received
            .fetch_add(records.len() as u64, Ordering::SeqCst);
        let outcome = self.warehouse.merge_batch(self.target, records).await?;
        tracing::debug!(
            "{}: page {} merged ({} written, {} failed)",
            self.target.table,
            page,
            outcome.written(),
            outcome.failed
        );
        if let Ok(mut progress) = self.progress.lock() {
            progress.absorb(outcome.clone());
        }
        Ok(outcome)
    }
}

struct RunSummary {
    processed: u64,
    merge: MergeOutcome,
    stop: Option<StopReason>,
}

pub struct SyncOrchestrator {
    source: Arc<dyn RecordSource>,
    warehouse: Arc<dyn Warehouse>,
    catalog: Catalog,
    fetcher: PaginatedFetcher,
    epoch: NaiveDate,
}

impl SyncOrchestrator {
    pub fn new(
        source: Arc<dyn RecordSource>,
        warehouse: Arc<dyn Warehouse>,
        settings: &SyncSettings,
    ) -> Self {
        Self {
            source,
            warehouse,
            catalog: Catalog::standard(),
            fetcher: PaginatedFetcher::new(settings.page_size),
            epoch: settings.epoch_start,
        }
    }

    /// Sync one table and persist its cursor, whatever happens to the run.
    ///
    /// Returns `Err` only when the run could not start: unknown table, bad
    /// dates, or an unreadable cursor. A failed run is `Ok` with a FAILED status.
    pub async fn sync(&self, request: &SyncRequest) -> Result<TableSyncOutcome> {
        let target = self.catalog.resolve(&request.table)?.clone();
        let existing = self.warehouse.load_cursor(&target.table).await?;
        let window = self.resolve_window(request, existing.as_ref())?;

        tracing::info!(
            "Syncing {} (remote {}, {}, {}) for {}",
            target.table,
            target.remote_name,
            target.pattern,
            target.merge,
            window
        );

        let (result, partial) = match target.pattern {
            ReplicationPattern::DumpAll => (self.run_dump(&target).await, None),
            ReplicationPattern::Paginated => {
                let sink = WarehouseSink::new(self.warehouse.as_ref(), &target);
                let result = self
                    .fetcher
                    .run(self.source.as_ref(), &target, &window, &sink)
                    .await
                    .map(|report| RunSummary {
                        processed: report.records_received,
                        merge: report.merge,
                        stop: Some(report.stop),
                    });
                (result, Some(sink.progress()))
            }
        };

        let mut cursor = existing.unwrap_or_else(|| SyncCursor::new(&target.table));
        let now = Utc::now();
        let mut outcome = TableSyncOutcome {
            table: target.table.clone(),
            remote_name: target.remote_name.clone(),
            pattern: target.pattern,
            window: Some(window),
            processed: 0,
            merge: MergeOutcome::default(),
            stop: None,
            status: SyncStatus::Success,
            error: None,
        };

        match result {
            Ok(summary) => {
                cursor.record_success(window, summary.processed, now);
                outcome.processed = summary.processed;
                outcome.merge = summary.merge;
                outcome.stop = summary.stop;
                tracing::info!(
                    "{}: sync succeeded ({} received, {} inserted, {} updated, {} skipped, {} failed)",
                    target.table,
                    outcome.processed,
                    outcome.merge.inserted,
                    outcome.merge.updated,
                    outcome.merge.skipped,
                    outcome.merge.failed
                );
            }
            Err(e) => {
                tracing::error!("{}: sync failed ({}): {:?}", target.table, e.kind(), e);
                let (processed, merged) = partial.unwrap_or_default();
                cursor.record_failure(window, processed, &e.to_string(), now);
                outcome.processed = processed;
                outcome.merge = merged;
                outcome.status = SyncStatus::Failed;
                outcome.error = Some(e.to_string());
            }
        }

        if let Err(e) = self.warehouse.save_cursor(&cursor).await {
            tracing::error!("{}: failed to persist cursor: {:?}", target.table, e);
            outcome.status = SyncStatus::Failed;
            let message = format!("cursor write failed: {}", e);
            outcome.error = Some(match outcome.error.take() {
                Some(previous) => format!("{}; {}", previous, message),
                None => message,
            });
        }

        Ok(outcome)
    }

    /// Sync every catalog table in order. Failures never stop the run.
    pub async fn sync_all(&self) -> SyncRunReport {
        let started_at = Utc::now();
        let started = Instant::now();
        let mut outcomes = Vec::with_capacity(self.catalog.targets().len());

        tracing::info!("Starting full sync of {} tables", self.catalog.targets().len());

        for target in self.catalog.targets() {
            let request = SyncRequest::table(&target.table);
            match self.sync(&request).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    tracing::error!(
                        "{}: sync could not start ({}): {:?}",
                        target.table,
                        e.kind(),
                        e
                    );
                    outcomes.push(TableSyncOutcome::failed_to_start(target, &e));
                }
            }
        }

        let report = SyncRunReport {
            started_at,
            duration: started.elapsed(),
            outcomes,
        };
        tracing::info!(
            "Full sync finished in {:.1}s: {} succeeded, {} failed",
            report.duration.as_secs_f64(),
            report.succeeded(),
            report.failed()
        );
        report
    }

    async fn run_dump(&self, target: &SyncTarget) -> Result<RunSummary> {
        let records = self.source.fetch_dump(&target.remote_name).await?;
        let processed = records.len() as u64;

        if records.is_empty() {
            tracing::warn!(
                "{}: remote returned no records, leaving the table untouched",
                target.table
            );
            return Ok(RunSummary {
                processed: 0,
                merge: MergeOutcome::default(),
                stop: None,
            });
        }

        let merge = self.warehouse.replace_all(target, &records).await?;
        Ok(RunSummary {
            processed,
            merge,
            stop: None,
        })
    }

    /// Explicit start, else the cursor's window end (unless forcing a full
    /// sync), else the epoch. The end defaults to today.
    fn resolve_window(
        &self,
        request: &SyncRequest,
        cursor: Option<&SyncCursor>,
    ) -> Result<DateWindow> {
        let end = match request.end_date.as_deref() {
            Some(value) => parse_date(value)?,
            None => Local::now().date_naive(),
        };

        let start = match request.start_date.as_deref() {
            Some(value) => {
                let start = parse_date(value)?;
                if start > end {
                    return Err(SyncError::Structural(format!(
                        "start date {} is after end date {}",
                        start, end
                    )));
                }
                start
            }
            None => {
                let resumed = if request.force_full {
                    None
                } else {
                    cursor.and_then(|c| c.window_end)
                };
                resumed.unwrap_or(self.epoch).min(end)
            }
        };

        Ok(DateWindow::new(start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoSource;

    #[async_trait]
    impl RecordSource for NoSource {
        async fn fetch_total(&self, _: &str, _: &DateWindow) -> Result<u64> {
            Ok(0)
        }
        async fn fetch_page(&self, _: &str, _: &DateWindow, _: u32, _: u32) -> Result<Vec<Record>> {
            Ok(Vec::new())
        }
        async fn fetch_dump(&self, _: &str) -> Result<Vec<Record>> {
            Ok(Vec::new())
        }
    }

    struct NoWarehouse;

    #[async_trait]
    impl Warehouse for NoWarehouse {
        async fn load_cursor(&self, _: &str) -> Result<Option<SyncCursor>> {
            Ok(None)
        }
        async fn save_cursor(&self, _: &SyncCursor) -> Result<()> {
            Ok(())
        }
        async fn cursors(&self) -> Result<Vec<SyncCursor>> {
            Ok(Vec::new())
        }
        async fn merge_batch(&self, _: &SyncTarget, _: &[Record]) -> Result<MergeOutcome> {
            Ok(MergeOutcome::default())
        }
        async fn replace_all(&self, _: &SyncTarget, _: &[Record]) -> Result<MergeOutcome> {
            Ok(MergeOutcome::default())
        }
    }

    fn orchestrator() -> SyncOrchestrator {
        SyncOrchestrator::new(
            Arc::new(NoSource),
            Arc::new(NoWarehouse),
            &SyncSettings::default(),
        )
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn cursor_ending(end: NaiveDate) -> SyncCursor {
        let mut cursor = SyncCursor::new("ml_citizen_master");
        cursor.window_end = Some(end);
        cursor.status = SyncStatus::Success;
        cursor
    }

    #[test]
    fn test_window_explicit_dates_win() {
        let request = SyncRequest {
            table: "citizen_master".to_string(),
            start_date: Some("2025-03-01".to_string()),
            end_date: Some("2025-03-31".to_string()),
            force_full: false,
        };
        let cursor = cursor_ending(date(2025, 2, 1));
        let window = orchestrator().resolve_window(&request, Some(&cursor)).unwrap();
        assert_eq!(window, DateWindow::new(date(2025, 3, 1), date(2025, 3, 31)));
    }

    #[test]
    fn test_window_resumes_from_cursor_end() {
        let request = SyncRequest {
            end_date: Some("2025-03-31".to_string()),
            ..SyncRequest::table("ml_citizen_master")
        };
        let cursor = cursor_ending(date(2025, 2, 1));
        let window = orchestrator().resolve_window(&request, Some(&cursor)).unwrap();
        assert_eq!(window.start, date(2025, 2, 1));
    }

    #[test]
    fn test_window_defaults_to_epoch_and_today() {
        let window = orchestrator()
            .resolve_window(&SyncRequest::table("provision"), None)
            .unwrap();
        assert_eq!(window.start, date(2024, 1, 1));
        assert_eq!(window.end, Local::now().date_naive());
    }

    #[test]
    fn test_force_full_ignores_cursor() {
        let request = SyncRequest {
            end_date: Some("2025-03-31".to_string()),
            force_full: true,
            ..SyncRequest::table("ml_citizen_master")
        };
        let cursor = cursor_ending(date(2025, 2, 1));
        let window = orchestrator().resolve_window(&request, Some(&cursor)).unwrap();
        assert_eq!(window.start, date(2024, 1, 1));
    }

    #[test]
    fn test_bad_dates_are_structural() {
        let request = SyncRequest {
            start_date: Some("2025-13-01".to_string()),
            ..SyncRequest::table("ml_citizen_master")
        };
        assert!(matches!(
            orchestrator().resolve_window(&request, None),
            Err(SyncError::Structural(_))
        ));

        let request = SyncRequest {
            start_date: Some("2025-04-01".to_string()),
            end_date: Some("2025-03-01".to_string()),
            ..SyncRequest::table("ml_citizen_master")
        };
        assert!(matches!(
            orchestrator().resolve_window(&request, None),
            Err(SyncError::Structural(_))
        ));
    }

    #[test]
    fn test_cursor_beyond_end_clamps_to_end() {
        let request = SyncRequest {
            end_date: Some("2025-03-31".to_string()),
            ..SyncRequest::table("ml_citizen_master")
        };
        let cursor = cursor_ending(date(2025, 6, 1));
        let window = orchestrator().resolve_window(&request, Some(&cursor)).unwrap();
        assert_eq!(window.start, date(2025, 3, 31));
    }

    #[tokio::test]
    async fn test_unknown_table_is_an_error_not_an_outcome() {
        let err = orchestrator()
            .sync(&SyncRequest::table("grouped_df"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Structural(_)));
    }
}
