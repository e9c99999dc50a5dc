// ABOUTME: Shared fixtures for integration tests
// ABOUTME: In-memory warehouse and a scripted record source standing in for the remote API

#![allow(dead_code)]

use async_trait::async_trait;
use citizen_sync::catalog::{MergeStrategy, SyncTarget};
use citizen_sync::cursor::{DateWindow, SyncCursor};
use citizen_sync::error::{Result, SyncError};
use citizen_sync::merge::MergeOutcome;
use citizen_sync::remote::{Record, RecordSource};
use citizen_sync::warehouse::Warehouse;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

pub fn record(value: Value) -> Record {
    value.as_object().expect("record fixture must be an object").clone()
}

/// What the fake remote does for one table.
#[derive(Clone)]
pub enum Script {
    Dump(Vec<Record>),
    Paged { total: u64, pages: Vec<Vec<Record>> },
    AuthFailure(String),
}

#[derive(Default)]
pub struct ScriptedSource {
    scripts: HashMap<String, Script>,
    windows: Mutex<Vec<(String, DateWindow)>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, remote_table: &str, script: Script) -> Self {
        self.scripts.insert(remote_table.to_string(), script);
        self
    }

    /// Windows passed to meta calls, in call order.
    pub fn windows(&self) -> Vec<(String, DateWindow)> {
        self.windows.lock().unwrap().clone()
    }

    fn script(&self, table: &str) -> Result<&Script> {
        self.scripts
            .get(table)
            .ok_or_else(|| SyncError::Structural(format!("no script for {}", table)))
    }
}

#[async_trait]
impl RecordSource for ScriptedSource {
    async fn fetch_total(&self, table: &str, window: &DateWindow) -> Result<u64> {
        self.windows
            .lock()
            .unwrap()
            .push((table.to_string(), *window));
        match self.script(table)? {
            Script::Paged { total, .. } => Ok(*total),
            Script::AuthFailure(message) => Err(SyncError::Auth(message.clone())),
            Script::Dump(_) => Err(SyncError::Structural(format!("{} is a dump table", table))),
        }
    }

    async fn fetch_page(
        &self,
        table: &str,
        _window: &DateWindow,
        page: u32,
        _page_size: u32,
    ) -> Result<Vec<Record>> {
        match self.script(table)? {
            Script::Paged { pages, .. } => Ok(pages
                .get(page as usize - 1)
                .cloned()
                .unwrap_or_default()),
            Script::AuthFailure(message) => Err(SyncError::Auth(message.clone())),
            Script::Dump(_) => Err(SyncError::Structural(format!("{} is a dump table", table))),
        }
    }

    async fn fetch_dump(&self, table: &str) -> Result<Vec<Record>> {
        match self.script(table)? {
            Script::Dump(records) => Ok(records.clone()),
            Script::AuthFailure(message) => Err(SyncError::Auth(message.clone())),
            Script::Paged { .. } => Err(SyncError::Structural(format!("{} is paginated", table))),
        }
    }
}

/// Keeps rows per local table and cursors per table name.
#[derive(Default)]
pub struct MemoryWarehouse {
    pub rows: Mutex<HashMap<String, Vec<Record>>>,
    pub cursors: Mutex<HashMap<String, SyncCursor>>,
    pub replace_calls: AtomicUsize,
    pub merge_calls: AtomicUsize,
    /// Merge calls numbered from 1 that fail with a storage-like error
    pub fail_merge_call: Mutex<Option<usize>>,
    pub fail_cursor_writes: AtomicBool,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_rows(&self, table: &str, rows: Vec<Record>) {
        self.rows.lock().unwrap().insert(table.to_string(), rows);
    }

    pub fn seed_cursor(&self, cursor: SyncCursor) {
        self.cursors
            .lock()
            .unwrap()
            .insert(cursor.table_name.clone(), cursor);
    }

    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.rows
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn cursor(&self, table: &str) -> Option<SyncCursor> {
        self.cursors.lock().unwrap().get(table).cloned()
    }

    fn merge_into(target: &SyncTarget, rows: &mut Vec<Record>, records: &[Record]) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        for record in records {
            let key: Option<Vec<Value>> = target
                .primary_key
                .iter()
                .map(|col| record.get(col).filter(|v| !v.is_null()).cloned())
                .collect();
            let Some(key) = key else {
                outcome.skipped += 1;
                continue;
            };

            let existing = rows.iter().position(|row| {
                target
                    .primary_key
                    .iter()
                    .zip(&key)
                    .all(|(col, value)| row.get(col) == Some(value))
            });
            match (target.merge, existing) {
                (MergeStrategy::ManualUpsert, Some(idx)) => {
                    rows[idx] = record.clone();
                    outcome.updated += 1;
                }
                _ => {
                    rows.push(record.clone());
                    outcome.inserted += 1;
                }
            }
        }
        outcome
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn load_cursor(&self, table: &str) -> Result<Option<SyncCursor>> {
        Ok(self.cursor(table))
    }

    async fn save_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        if self.fail_cursor_writes.load(Ordering::SeqCst) {
            return Err(SyncError::Structural("sync_metadata is read-only".to_string()));
        }
        self.seed_cursor(cursor.clone());
        Ok(())
    }

    async fn cursors(&self) -> Result<Vec<SyncCursor>> {
        Ok(self.cursors.lock().unwrap().values().cloned().collect())
    }

    async fn merge_batch(&self, target: &SyncTarget, records: &[Record]) -> Result<MergeOutcome> {
        let call = self.merge_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if *self.fail_merge_call.lock().unwrap() == Some(call) {
            return Err(SyncError::Structural(format!(
                "connection lost during merge into {}",
                target.table
            )));
        }
        let mut rows = self.rows.lock().unwrap();
        let table_rows = rows.entry(target.table.clone()).or_default();
        Ok(Self::merge_into(target, table_rows, records))
    }

    async fn replace_all(&self, target: &SyncTarget, records: &[Record]) -> Result<MergeOutcome> {
        self.replace_calls.fetch_add(1, Ordering::SeqCst);
        let mut fresh = Vec::new();
        let outcome = Self::merge_into(target, &mut fresh, records);
        self.rows.lock().unwrap().insert(target.table.clone(), fresh);
        Ok(outcome)
    }
}
