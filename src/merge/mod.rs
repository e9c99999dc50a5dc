// ABOUTME: MergeEngine - fault-isolated writes of sanitized record batches
// ABOUTME: Insert, manual upsert and truncate-then-insert strategies with per-record savepoints

pub mod sanitize;
pub mod writer;

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio_postgres::{GenericClient, Transaction};

use crate::catalog::{MergeStrategy, SyncTarget};
use crate::error::{Result, SyncError};
use crate::remote::Record;
use sanitize::{to_sql_text, Column, TableSchema};

/// Keys per existence query in the upsert path.
pub const EXISTENCE_CHUNK_SIZE: usize = 500;

/// Failure details kept per outcome; the counts are always complete.
pub const MAX_FAILURE_DETAILS: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordFailure {
    pub key: String,
    pub reason: String,
}

/// Counts for one batch (or the sum of several).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,
    pub failures: Vec<RecordFailure>,
}

impl MergeOutcome {
    /// Records that reached the table.
    pub fn written(&self) -> u64 {
        self.inserted + self.updated
    }

    pub fn absorb(&mut self, other: MergeOutcome) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.failed += other.failed;
        for failure in other.failures {
            if self.failures.len() >= MAX_FAILURE_DETAILS {
                break;
            }
            self.failures.push(failure);
        }
    }

    fn record_failure(&mut self, table: &str, key: &str, reason: String) {
        tracing::warn!("{}: record {} failed: {}", table, key, reason);
        self.failed += 1;
        if self.failures.len() < MAX_FAILURE_DETAILS {
            self.failures.push(RecordFailure {
                key: key.to_string(),
                reason,
            });
        }
    }
}

/// A sanitized record with its key rendered as text.
struct Keyed {
    key: Vec<String>,
    record: Record,
}

impl Keyed {
    fn label(&self, key_columns: &[&Column]) -> String {
        key_columns
            .iter()
            .zip(&self.key)
            .map(|(c, v)| format!("{}={}", c.name, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Writes batches into one schema of the local store.
pub struct MergeEngine {
    schema: String,
    tables: Mutex<HashMap<String, Arc<TableSchema>>>,
}

impl MergeEngine {
    pub fn new(schema: &str) -> Self {
        Self {
            schema: schema.to_string(),
            tables: Mutex::new(HashMap::new()),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Column metadata for `table`, introspected once and cached.
    pub async fn table_schema<C: GenericClient>(
        &self,
        client: &C,
        table: &str,
    ) -> Result<Arc<TableSchema>> {
        if let Some(cached) = self.cached(table) {
            return Ok(cached);
        }

        let rows = client
            .query(
                "SELECT a.attname, format_type(a.atttypid, a.atttypmod)
                 FROM pg_attribute a
                 JOIN pg_class c ON c.oid = a.attrelid
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE n.nspname = $1
                   AND c.relname = $2
                   AND a.attnum > 0
                   AND NOT a.attisdropped
                 ORDER BY a.attnum",
                &[&self.schema, &table],
            )
            .await
            .map_err(|e| SyncError::storage(format!("introspect columns of {}", table), e))?;

        if rows.is_empty() {
            return Err(SyncError::Structural(format!(
                "Unknown table {}.{} (no columns found)",
                self.schema, table
            )));
        }

        let columns = rows
            .iter()
            .map(|row| {
                let name: String = row.get(0);
                let sql_type: String = row.get(1);
                Column::new(&name, &sql_type)
            })
            .collect();

        let schema = Arc::new(TableSchema {
            schema: self.schema.clone(),
            table: table.to_string(),
            columns,
        });

        if let Ok(mut tables) = self.tables.lock() {
            tables.insert(table.to_string(), schema.clone());
        }
        Ok(schema)
    }

    fn cached(&self, table: &str) -> Option<Arc<TableSchema>> {
        self.tables.lock().ok()?.get(table).cloned()
    }

    /// Merge a batch inside `tx` using the target's strategy.
    ///
    /// Per-record failures are counted, never raised. Errors are returned
    /// only for structural problems or a transaction that can no longer be used.
    pub async fn merge(
        &self,
        tx: &mut Transaction<'_>,
        target: &SyncTarget,
        records: &[Record],
    ) -> Result<MergeOutcome> {
        let table = self.table_schema(&*tx, &target.table).await?;
        let key_columns = key_columns(&table, target)?;

        let mut outcome = MergeOutcome::default();
        if records.is_empty() {
            return Ok(outcome);
        }

        let mut keyed = Vec::with_capacity(records.len());
        for (position, raw) in records.iter().enumerate() {
            let record = table.sanitize(raw);
            match key_of(&key_columns, &record) {
                Some(key) => keyed.push(Keyed { key, record }),
                None => {
                    tracing::warn!(
                        "{}: skipping record #{} with a null primary key ({})",
                        target.table,
                        position,
                        target.primary_key.join(", ")
                    );
                    outcome.skipped += 1;
                }
            }
        }

        match target.merge {
            MergeStrategy::PureInsert | MergeStrategy::InsertOnlyAfterTruncate => {
                self.insert_each(tx, &table, &key_columns, &keyed, &mut outcome)
                    .await?;
            }
            MergeStrategy::ManualUpsert => {
                self.upsert(tx, &table, &key_columns, keyed, &mut outcome)
                    .await?;
            }
        }

        tracing::debug!(
            "{}: merged batch of {} (inserted {}, updated {}, skipped {}, failed {})",
            target.table,
            records.len(),
            outcome.inserted,
            outcome.updated,
            outcome.skipped,
            outcome.failed
        );
        Ok(outcome)
    }

    async fn insert_each(
        &self,
        tx: &mut Transaction<'_>,
        table: &TableSchema,
        key_columns: &[&Column],
        records: &[Keyed],
        outcome: &mut MergeOutcome,
    ) -> Result<()> {
        for item in records {
            let statement = writer::insert_statement(table, &item.record);
            match writer::isolated_execute(tx, &statement).await? {
                Ok(_) => outcome.inserted += 1,
                Err(e) => outcome.record_failure(
                    &table.table,
                    &item.label(key_columns),
                    writer::pg_message(&e),
                ),
            }
        }
        Ok(())
    }

    async fn upsert(
        &self,
        tx: &mut Transaction<'_>,
        table: &TableSchema,
        key_columns: &[&Column],
        records: Vec<Keyed>,
        outcome: &mut MergeOutcome,
    ) -> Result<()> {
        let unique = dedupe_last_wins(records, outcome);
        let existing = self
            .existing_positions(tx, table, key_columns, &unique)
            .await?;

        for (position, item) in unique.iter().enumerate() {
            let label = item.label(key_columns);
            match existing.get(&position) {
                None => {}
                Some(Err(reason)) => {
                    outcome.record_failure(&table.table, &label, reason.clone());
                    continue;
                }
                Some(Ok(true)) => {
                    let statement = match writer::update_statement(table, key_columns, &item.record)
                    {
                        Ok(Some(statement)) => statement,
                        Ok(None) => {
                            outcome.updated += 1;
                            continue;
                        }
                        Err(column) => {
                            outcome.record_failure(
                                &table.table,
                                &label,
                                format!("update is missing primary-key column {}", column),
                            );
                            continue;
                        }
                    };
                    match writer::isolated_execute(tx, &statement).await? {
                        Ok(0) => outcome.record_failure(
                            &table.table,
                            &label,
                            "update matched no rows".to_string(),
                        ),
                        Ok(_) => outcome.updated += 1,
                        Err(e) => {
                            outcome.record_failure(&table.table, &label, writer::pg_message(&e))
                        }
                    }
                    continue;
                }
                Some(Ok(false)) => {}
            }

            let statement = writer::insert_statement(table, &item.record);
            match writer::isolated_execute(tx, &statement).await? {
                Ok(_) => outcome.inserted += 1,
                Err(e) => outcome.record_failure(&table.table, &label, writer::pg_message(&e)),
            }
        }
        Ok(())
    }

    /// Classify each position as existing (`Ok(true)`), new (`Ok(false)`)
    /// or unclassifiable (`Err(reason)`).
    async fn existing_positions(
        &self,
        tx: &mut Transaction<'_>,
        table: &TableSchema,
        key_columns: &[&Column],
        records: &[Keyed],
    ) -> Result<HashMap<usize, std::result::Result<bool, String>>> {
        let mut classified = HashMap::with_capacity(records.len());
        let indexed: Vec<(usize, Vec<String>)> = records
            .iter()
            .enumerate()
            .map(|(i, r)| (i, r.key.clone()))
            .collect();

        for chunk in indexed.chunks(EXISTENCE_CHUNK_SIZE) {
            let statement = writer::existing_keys_statement(table, key_columns, chunk);
            match writer::isolated_query_ints(tx, &statement).await? {
                Ok(found) => {
                    let found: HashSet<usize> = found.into_iter().map(|i| i as usize).collect();
                    for (idx, _) in chunk {
                        classified.insert(*idx, Ok(found.contains(idx)));
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "{}: existence check for {} keys failed ({}), checking one by one",
                        table.table,
                        chunk.len(),
                        writer::pg_message(&e)
                    );
                    for (idx, key) in chunk {
                        let statement = writer::key_exists_statement(table, key_columns, key);
                        let verdict = match writer::isolated_query_ints(tx, &statement).await? {
                            Ok(rows) => Ok(!rows.is_empty()),
                            Err(e) => Err(writer::pg_message(&e)),
                        };
                        classified.insert(*idx, verdict);
                    }
                }
            }
        }

        Ok(classified)
    }
}

/// Resolve the target's key columns against the table; missing ones are structural.
fn key_columns<'a>(table: &'a TableSchema, target: &SyncTarget) -> Result<Vec<&'a Column>> {
    if target.primary_key.is_empty() {
        return Err(SyncError::Structural(format!(
            "No primary key defined for {}",
            target.table
        )));
    }
    target
        .primary_key
        .iter()
        .map(|name| {
            table.column(name).ok_or_else(|| {
                SyncError::Structural(format!(
                    "Primary-key column {} does not exist in {}",
                    name, target.table
                ))
            })
        })
        .collect()
}

/// Text key for a sanitized record, or `None` if any key field is null or absent.
fn key_of(key_columns: &[&Column], record: &Record) -> Option<Vec<String>> {
    key_columns
        .iter()
        .map(|c| record.get(&c.name).and_then(to_sql_text))
        .collect()
}

/// Collapse duplicate keys to their last occurrence, counting the rest as skipped.
fn dedupe_last_wins(records: Vec<Keyed>, outcome: &mut MergeOutcome) -> Vec<Keyed> {
    let mut last_index: HashMap<Vec<String>, usize> = HashMap::with_capacity(records.len());
    for (i, item) in records.iter().enumerate() {
        last_index.insert(item.key.clone(), i);
    }

    let total = records.len();
    let unique: Vec<Keyed> = records
        .into_iter()
        .enumerate()
        .filter(|(i, item)| last_index.get(&item.key) == Some(i))
        .map(|(_, item)| item)
        .collect();

    let superseded = (total - unique.len()) as u64;
    if superseded > 0 {
        tracing::debug!("{} duplicate keys in batch superseded by later records", superseded);
        outcome.skipped += superseded;
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, ReplicationPattern};
    use serde_json::json;

    fn citizen_table() -> TableSchema {
        TableSchema {
            schema: "public".to_string(),
            table: "ml_citizen_master".to_string(),
            columns: vec![
                Column::new("citizen_id", "character varying(64)"),
                Column::new("age", "integer"),
            ],
        }
    }

    fn keyed(id: &str, age: i64) -> Keyed {
        Keyed {
            key: vec![id.to_string()],
            record: json!({"citizen_id": id, "age": age}).as_object().unwrap().clone(),
        }
    }

    #[test]
    fn test_outcome_absorb_caps_failure_details() {
        let mut total = MergeOutcome::default();
        for _ in 0..3 {
            let mut batch = MergeOutcome {
                inserted: 2,
                updated: 1,
                ..Default::default()
            };
            for i in 0..30 {
                batch.record_failure("t", &format!("id={}", i), "bad".to_string());
            }
            total.absorb(batch);
        }
        assert_eq!(total.inserted, 6);
        assert_eq!(total.updated, 3);
        assert_eq!(total.failed, 90);
        assert_eq!(total.failures.len(), MAX_FAILURE_DETAILS);
        assert_eq!(total.written(), 9);
    }

    #[test]
    fn test_key_of_rejects_null_and_missing_fields() {
        let table = citizen_table();
        let target = Catalog::standard().resolve("citizen_master").unwrap().clone();
        let keys = key_columns(&table, &target).unwrap();

        let ok = table.sanitize(json!({"citizen_id": "C1"}).as_object().unwrap());
        assert_eq!(key_of(&keys, &ok), Some(vec!["C1".to_string()]));

        let null = table.sanitize(json!({"citizen_id": null, "age": 3}).as_object().unwrap());
        assert_eq!(key_of(&keys, &null), None);

        let missing = table.sanitize(json!({"age": 3}).as_object().unwrap());
        assert_eq!(key_of(&keys, &missing), None);
    }

    #[test]
    fn test_key_columns_missing_from_table_is_structural() {
        let table = citizen_table();
        let target = SyncTarget::new(
            "ml_citizen_master",
            "citizen_master",
            ReplicationPattern::Paginated,
            &["citizen_uuid"],
            MergeStrategy::ManualUpsert,
        );
        assert!(matches!(
            key_columns(&table, &target),
            Err(SyncError::Structural(_))
        ));
    }

    #[test]
    fn test_dedupe_keeps_last_occurrence() {
        let mut outcome = MergeOutcome::default();
        let unique = dedupe_last_wins(
            vec![keyed("C1", 10), keyed("C2", 20), keyed("C1", 11)],
            &mut outcome,
        );
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].record["citizen_id"], json!("C2"));
        assert_eq!(unique[1].record["age"], json!(11));
        assert_eq!(outcome.skipped, 1);
    }
}
