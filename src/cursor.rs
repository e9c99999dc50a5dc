// ABOUTME: SyncCursor - per-table bookkeeping of the last synced window and outcome
// ABOUTME: Persisted in sync_metadata, one row per table, never deleted

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio_postgres::{GenericClient, Row};

use crate::error::{Result, SyncError};
use crate::utils::{qualified_table, truncate_chars};

pub const CURSOR_TABLE: &str = "sync_metadata";

/// Inclusive date window sent to paginated endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn start_str(&self) -> String {
        self.start.format("%Y-%m-%d").to_string()
    }

    pub fn end_str(&self) -> String {
        self.end.format("%Y-%m-%d").to_string()
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.start_str(), self.end_str())
    }
}

/// Parse a `YYYY-MM-DD` date supplied by an operator.
pub fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| SyncError::Structural(format!("Invalid date '{}', expected YYYY-MM-DD", value)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Success,
    Failed,
    NeverSynced,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "SUCCESS",
            SyncStatus::Failed => "FAILED",
            SyncStatus::NeverSynced => "NEVER_SYNCED",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "SUCCESS" => Ok(SyncStatus::Success),
            "FAILED" => Ok(SyncStatus::Failed),
            "NEVER_SYNCED" | "" => Ok(SyncStatus::NeverSynced),
            other => Err(SyncError::Structural(format!("Unknown sync status '{}'", other))),
        }
    }
}

/// Persisted sync state for one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub table_name: String,
    /// Start of the last attempted window
    pub window_start: Option<NaiveDate>,
    /// End of the last successfully synced window; the next run starts here
    pub window_end: Option<NaiveDate>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub status: SyncStatus,
    pub total_records: i64,
    pub last_error: Option<String>,
}

impl SyncCursor {
    pub fn new(table_name: &str) -> Self {
        Self {
            table_name: table_name.to_string(),
            window_start: None,
            window_end: None,
            last_sync_at: None,
            status: SyncStatus::NeverSynced,
            total_records: 0,
            last_error: None,
        }
    }

    /// Record a successful attempt; the window end advances.
    pub fn record_success(&mut self, window: DateWindow, processed: u64, at: DateTime<Utc>) {
        self.window_start = Some(window.start);
        self.window_end = Some(window.end);
        self.last_sync_at = Some(at);
        self.status = SyncStatus::Success;
        self.total_records = i64::try_from(processed).unwrap_or(i64::MAX);
        self.last_error = None;
    }

    /// Record a failed attempt. The window end stays put so the next run
    /// re-covers the same range.
    pub fn record_failure(
        &mut self,
        window: DateWindow,
        processed: u64,
        error: &str,
        at: DateTime<Utc>,
    ) {
        self.window_start = Some(window.start);
        self.last_sync_at = Some(at);
        self.status = SyncStatus::Failed;
        self.total_records = i64::try_from(processed).unwrap_or(i64::MAX);
        self.last_error = Some(truncate_chars(error, 500));
    }
}

/// Reads and writes cursors in `sync_metadata`.
#[derive(Debug, Clone)]
pub struct CursorRepository {
    schema: String,
}

impl CursorRepository {
    pub fn new(schema: &str) -> Self {
        Self {
            schema: schema.to_string(),
        }
    }

    fn table(&self) -> String {
        qualified_table(&self.schema, CURSOR_TABLE)
    }

    pub async fn ensure_table<C: GenericClient>(&self, client: &C) -> Result<()> {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id SERIAL PRIMARY KEY,
                table_name VARCHAR(100) NOT NULL UNIQUE,
                last_sync_timestamp TIMESTAMPTZ,
                last_window_start DATE,
                last_sync_from_date DATE,
                total_records BIGINT NOT NULL DEFAULT 0,
                last_sync_status VARCHAR(50) NOT NULL DEFAULT 'NEVER_SYNCED',
                last_error VARCHAR(500),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            self.table()
        );
        client
            .batch_execute(&ddl)
            .await
            .map_err(|e| SyncError::storage("create sync_metadata", e))
    }

    pub async fn load<C: GenericClient>(
        &self,
        client: &C,
        table_name: &str,
    ) -> Result<Option<SyncCursor>> {
        let sql = format!(
            "SELECT table_name, last_window_start, last_sync_from_date, last_sync_timestamp, \
                    last_sync_status, total_records, last_error \
             FROM {} WHERE table_name = $1",
            self.table()
        );
        let row = client
            .query_opt(&sql, &[&table_name])
            .await
            .map_err(|e| SyncError::storage(format!("load cursor for {}", table_name), e))?;

        row.map(|row| cursor_from_row(&row)).transpose()
    }

    pub async fn load_all<C: GenericClient>(&self, client: &C) -> Result<Vec<SyncCursor>> {
        let sql = format!(
            "SELECT table_name, last_window_start, last_sync_from_date, last_sync_timestamp, \
                    last_sync_status, total_records, last_error \
             FROM {} ORDER BY table_name",
            self.table()
        );
        let rows = client
            .query(&sql, &[])
            .await
            .map_err(|e| SyncError::storage("load cursors", e))?;
        rows.iter().map(cursor_from_row).collect()
    }

    /// Insert or update the cursor row, relying on the UNIQUE table_name.
    pub async fn save<C: GenericClient>(&self, client: &C, cursor: &SyncCursor) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (table_name, last_window_start, last_sync_from_date, \
                             last_sync_timestamp, last_sync_status, total_records, last_error) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (table_name) DO UPDATE SET \
                last_window_start = EXCLUDED.last_window_start, \
                last_sync_from_date = EXCLUDED.last_sync_from_date, \
                last_sync_timestamp = EXCLUDED.last_sync_timestamp, \
                last_sync_status = EXCLUDED.last_sync_status, \
                total_records = EXCLUDED.total_records, \
                last_error = EXCLUDED.last_error, \
                updated_at = NOW()",
            self.table()
        );
        client
            .execute(
                &sql,
                &[
                    &cursor.table_name,
                    &cursor.window_start,
                    &cursor.window_end,
                    &cursor.last_sync_at,
                    &cursor.status.as_str(),
                    &cursor.total_records,
                    &cursor.last_error,
                ],
            )
            .await
            .map_err(|e| SyncError::storage(format!("save cursor for {}", cursor.table_name), e))?;
        Ok(())
    }
}

fn cursor_from_row(row: &Row) -> Result<SyncCursor> {
    let status: String = row.get(4);
    Ok(SyncCursor {
        table_name: row.get(0),
        window_start: row.get(1),
        window_end: row.get(2),
        last_sync_at: row.get(3),
        status: status.parse()?,
        total_records: row.get(5),
        last_error: row.get(6),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_new_cursor_is_never_synced() {
        let cursor = SyncCursor::new("ml_citizen_master");
        assert_eq!(cursor.status, SyncStatus::NeverSynced);
        assert!(cursor.window_end.is_none());
        assert_eq!(cursor.total_records, 0);
    }

    #[test]
    fn test_success_advances_window_end() {
        let mut cursor = SyncCursor::new("ml_citizen_master");
        let at = Utc.with_ymd_and_hms(2026, 10, 18, 0, 0, 0).unwrap();
        cursor.record_success(DateWindow::new(date(2024, 1, 1), date(2026, 10, 18)), 4200, at);

        assert_eq!(cursor.status, SyncStatus::Success);
        assert_eq!(cursor.window_end, Some(date(2026, 10, 18)));
        assert_eq!(cursor.total_records, 4200);
        assert_eq!(cursor.last_sync_at, Some(at));
    }

    #[test]
    fn test_failure_keeps_previous_window_end() {
        let mut cursor = SyncCursor::new("ml_provision");
        let at = Utc.with_ymd_and_hms(2026, 10, 11, 0, 0, 0).unwrap();
        cursor.record_success(DateWindow::new(date(2024, 1, 1), date(2026, 10, 11)), 10, at);

        let later = Utc.with_ymd_and_hms(2026, 10, 18, 0, 0, 0).unwrap();
        cursor.record_failure(
            DateWindow::new(date(2026, 10, 11), date(2026, 10, 18)),
            3,
            "Authentication failed: 401",
            later,
        );

        assert_eq!(cursor.status, SyncStatus::Failed);
        assert_eq!(cursor.window_end, Some(date(2026, 10, 11)));
        assert_eq!(cursor.window_start, Some(date(2026, 10, 11)));
        assert_eq!(cursor.last_sync_at, Some(later));
        assert_eq!(cursor.last_error.as_deref(), Some("Authentication failed: 401"));
    }

    #[test]
    fn test_failure_error_text_is_truncated() {
        let mut cursor = SyncCursor::new("ml_district");
        let window = DateWindow::new(date(2024, 1, 1), date(2024, 1, 2));
        cursor.record_failure(window, 0, &"x".repeat(2000), Utc::now());
        assert_eq!(cursor.last_error.unwrap().len(), 500);
    }

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [SyncStatus::Success, SyncStatus::Failed, SyncStatus::NeverSynced] {
            assert_eq!(status.as_str().parse::<SyncStatus>().unwrap(), status);
        }
        assert_eq!("success".parse::<SyncStatus>().unwrap(), SyncStatus::Success);
        assert!("RUNNING".parse::<SyncStatus>().is_err());
    }

    #[test]
    fn test_parse_date() {
        assert_eq!(parse_date("2024-01-01").unwrap(), date(2024, 1, 1));
        assert!(matches!(parse_date("01/01/2024"), Err(SyncError::Structural(_))));
    }

    #[test]
    fn test_window_display() {
        let window = DateWindow::new(date(2024, 1, 1), date(2024, 2, 29));
        assert_eq!(window.to_string(), "2024-01-01 to 2024-02-29");
    }
}
