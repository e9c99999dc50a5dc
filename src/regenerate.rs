// ABOUTME: Regenerator - rebuilds derived recommendation tables from the synced tables
// ABOUTME: One transaction for the whole rebuild, one regeneration_log row per table (or one ALL row on failure)

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_postgres::{Client, GenericClient};

use crate::error::{Result, SyncError};
use crate::utils::{qualified_table, quote_ident, truncate_chars};

pub const LOG_TABLE: &str = "regeneration_log";

/// Who asked for a regeneration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TriggerSource {
    Scheduler,
    Manual,
    Admin,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Scheduler => "scheduler",
            TriggerSource::Manual => "manual",
            TriggerSource::Admin => "admin",
        }
    }
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerSource {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "scheduler" => Ok(TriggerSource::Scheduler),
            "manual" => Ok(TriggerSource::Manual),
            "admin" => Ok(TriggerSource::Admin),
            other => Err(SyncError::Structural(format!("Unknown trigger source '{}'", other))),
        }
    }
}

/// Derived tables, in rebuild order. `cluster_service_map` reads `grouped_df`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum DerivedTable {
    GroupedDf,
    DistrictTopServices,
    BlockWiseTopServices,
    ClusterServiceMap,
}

impl DerivedTable {
    pub const ALL: [DerivedTable; 4] = [
        DerivedTable::GroupedDf,
        DerivedTable::DistrictTopServices,
        DerivedTable::BlockWiseTopServices,
        DerivedTable::ClusterServiceMap,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            DerivedTable::GroupedDf => "grouped_df",
            DerivedTable::DistrictTopServices => "district_top_services",
            DerivedTable::BlockWiseTopServices => "block_wise_top_services",
            DerivedTable::ClusterServiceMap => "cluster_service_map",
        }
    }

    fn insert_sql(&self) -> &'static str {
        match self {
            DerivedTable::GroupedDf => GROUPED_DF_SQL,
            DerivedTable::DistrictTopServices => DISTRICT_TOP_SERVICES_SQL,
            DerivedTable::BlockWiseTopServices => BLOCK_WISE_TOP_SERVICES_SQL,
            DerivedTable::ClusterServiceMap => CLUSTER_SERVICE_MAP_SQL,
        }
    }
}

impl FromStr for DerivedTable {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self> {
        let value = value.trim();
        DerivedTable::ALL
            .into_iter()
            .find(|t| t.name() == value)
            .ok_or_else(|| SyncError::Structural(format!("Unknown derived table '{}'", value)))
    }
}

/// Canonical rebuild order for a requested subset; empty means everything.
pub fn rebuild_order(requested: &[DerivedTable]) -> Vec<DerivedTable> {
    if requested.is_empty() {
        return DerivedTable::ALL.to_vec();
    }
    let mut tables = requested.to_vec();
    tables.sort();
    tables.dedup();
    tables
}

/// One row of `regeneration_log`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegenerationLogEntry {
    pub table_name: String,
    pub rows_generated: i64,
    pub duration_seconds: f64,
    pub status: String,
    pub error_message: Option<String>,
    pub triggered_by: TriggerSource,
}

impl RegenerationLogEntry {
    fn success(table: DerivedTable, rows: i64, duration: Duration, trigger: TriggerSource) -> Self {
        Self {
            table_name: table.name().to_string(),
            rows_generated: rows,
            duration_seconds: duration.as_secs_f64(),
            status: "success".to_string(),
            error_message: None,
            triggered_by: trigger,
        }
    }

    pub fn failure(error: &str, duration: Duration, trigger: TriggerSource) -> Self {
        Self {
            table_name: "ALL".to_string(),
            rows_generated: 0,
            duration_seconds: duration.as_secs_f64(),
            status: "failed".to_string(),
            error_message: Some(truncate_chars(error, 500)),
            triggered_by: trigger,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegenerationReport {
    pub entries: Vec<RegenerationLogEntry>,
    pub duration_seconds: f64,
}

pub struct Regenerator {
    client: Arc<Mutex<Client>>,
    schema: String,
}

impl Regenerator {
    pub fn new(client: Arc<Mutex<Client>>, schema: &str) -> Self {
        Self {
            client,
            schema: schema.to_string(),
        }
    }

    pub async fn ensure_log_table(&self) -> Result<()> {
        let client = self.client.lock().await;
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id SERIAL PRIMARY KEY,
                regeneration_timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                table_name VARCHAR(100),
                rows_generated INTEGER,
                duration_seconds DOUBLE PRECISION,
                status VARCHAR(50),
                error_message VARCHAR(500),
                triggered_by VARCHAR(50),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            qualified_table(&self.schema, LOG_TABLE)
        );
        client
            .batch_execute(&ddl)
            .await
            .map_err(|e| SyncError::storage("create regeneration_log", e))
    }

    /// Rebuild `tables` (all when empty) atomically.
    ///
    /// On failure nothing is replaced and a single `ALL` row with status
    /// `failed` is logged before the error is returned.
    pub async fn regenerate(
        &self,
        tables: &[DerivedTable],
        trigger: TriggerSource,
    ) -> Result<RegenerationReport> {
        let order = rebuild_order(tables);
        tracing::info!(
            "Regenerating {} derived tables (triggered by {})",
            order.len(),
            trigger
        );

        let started = Instant::now();
        let mut client = self.client.lock().await;

        match self.rebuild(&mut client, &order, trigger).await {
            Ok(entries) => {
                let duration = started.elapsed().as_secs_f64();
                tracing::info!("Regeneration complete in {:.2}s", duration);
                Ok(RegenerationReport {
                    entries,
                    duration_seconds: duration,
                })
            }
            Err(e) => {
                tracing::error!("Regeneration failed after {:?}: {:?}", started.elapsed(), e);
                let entry =
                    RegenerationLogEntry::failure(&e.to_string(), started.elapsed(), trigger);
                if let Err(log_err) = self.write_log(&*client, &entry).await {
                    tracing::warn!("Could not record failed regeneration: {:?}", log_err);
                }
                Err(e)
            }
        }
    }

    async fn rebuild(
        &self,
        client: &mut Client,
        order: &[DerivedTable],
        trigger: TriggerSource,
    ) -> Result<Vec<RegenerationLogEntry>> {
        let tx = client
            .transaction()
            .await
            .map_err(|e| SyncError::storage("begin regeneration", e))?;

        tx.batch_execute(&format!("SET LOCAL search_path TO {}", quote_ident(&self.schema)))
            .await
            .map_err(|e| SyncError::storage("set search_path", e))?;

        let mut entries = Vec::with_capacity(order.len());
        for table in order {
            let started = Instant::now();
            tracing::info!("Generating {}...", table.name());

            tx.batch_execute(&format!("TRUNCATE TABLE {}", quote_ident(table.name())))
                .await
                .map_err(|e| SyncError::storage(format!("truncate {}", table.name()), e))?;
            tx.execute(table.insert_sql(), &[])
                .await
                .map_err(|e| SyncError::storage(format!("populate {}", table.name()), e))?;

            let row = tx
                .query_one(
                    &format!("SELECT COUNT(*) FROM {}", quote_ident(table.name())),
                    &[],
                )
                .await
                .map_err(|e| SyncError::storage(format!("count {}", table.name()), e))?;
            let rows: i64 = row.get(0);

            let entry = RegenerationLogEntry::success(*table, rows, started.elapsed(), trigger);
            self.write_log(&tx, &entry).await?;
            tracing::info!(
                "{}: {} rows in {:.2}s",
                table.name(),
                rows,
                entry.duration_seconds
            );
            entries.push(entry);
        }

        tx.commit()
            .await
            .map_err(|e| SyncError::storage("commit regeneration", e))?;
        Ok(entries)
    }

    async fn write_log<C: GenericClient>(
        &self,
        client: &C,
        entry: &RegenerationLogEntry,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (table_name, rows_generated, duration_seconds, status, error_message, triggered_by) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            qualified_table(&self.schema, LOG_TABLE)
        );
        let rows = i32::try_from(entry.rows_generated).unwrap_or(i32::MAX);
        client
            .execute(
                &sql,
                &[
                    &entry.table_name,
                    &rows,
                    &entry.duration_seconds,
                    &entry.status,
                    &entry.error_message,
                    &entry.triggered_by.as_str(),
                ],
            )
            .await
            .map_err(|e| SyncError::storage("write regeneration_log", e))?;
        Ok(())
    }
}

const GROUPED_DF_SQL: &str = r#"
INSERT INTO grouped_df (cluster_id, district_id, gender, caste, age_group, religion_group)
SELECT
    ROW_NUMBER() OVER () AS cluster_id,
    district_id,
    gender,
    caste,
    CASE WHEN age < 18 THEN 'child' WHEN age < 60 THEN 'youth' ELSE 'elderly' END AS age_group,
    CASE WHEN religion = 'Hindu' THEN 'Hindu' ELSE 'Minority' END AS religion_group
FROM ml_citizen_master
GROUP BY
    district_id,
    gender,
    caste,
    CASE WHEN age < 18 THEN 'child' WHEN age < 60 THEN 'youth' ELSE 'elderly' END,
    CASE WHEN religion = 'Hindu' THEN 'Hindu' ELSE 'Minority' END
"#;

const DISTRICT_TOP_SERVICES_SQL: &str = r#"
INSERT INTO district_top_services
    (district_id, district_name, service_id, service_name, unique_citizen_count, citizen_percentage, rank_in_district)
WITH district_service_counts AS (
    SELECT
        c.district_id,
        d.district_name,
        p.service_id,
        p.service_name,
        COUNT(DISTINCT p.customer_id) AS unique_citizen_count
    FROM ml_provision p
    JOIN ml_citizen_master c ON p.customer_id = c.citizen_id
    JOIN ml_district d ON c.district_id = d.district_id
    GROUP BY c.district_id, d.district_name, p.service_id, p.service_name
),
district_totals AS (
    SELECT c.district_id, COUNT(DISTINCT p.customer_id) AS total_citizens
    FROM ml_provision p
    JOIN ml_citizen_master c ON p.customer_id = c.citizen_id
    GROUP BY c.district_id
)
SELECT
    dsc.district_id,
    dsc.district_name,
    dsc.service_id,
    dsc.service_name,
    dsc.unique_citizen_count,
    COALESCE(ROUND((dsc.unique_citizen_count::DECIMAL / NULLIF(dt.total_citizens, 0)) * 100, 2), 0),
    RANK() OVER (PARTITION BY dsc.district_id ORDER BY dsc.unique_citizen_count DESC)
FROM district_service_counts dsc
JOIN district_totals dt ON dsc.district_id = dt.district_id
"#;

const BLOCK_WISE_TOP_SERVICES_SQL: &str = r#"
INSERT INTO block_wise_top_services (block_id, service_name, block_name, rank_in_block)
WITH block_service_counts AS (
    SELECT
        b.block_mun_id AS block_id,
        b.block_municipalty_name AS block_name,
        p.service_name,
        COUNT(DISTINCT p.customer_id) AS unique_citizen_count
    FROM ml_provision p
    JOIN ml_bsk_master b ON p.bsk_id = b.bsk_id
    WHERE b.block_mun_id IS NOT NULL
    GROUP BY b.block_mun_id, b.block_municipalty_name, p.service_name
)
SELECT
    bsc.block_id,
    bsc.service_name,
    bsc.block_name,
    RANK() OVER (PARTITION BY bsc.block_id ORDER BY bsc.unique_citizen_count DESC)
FROM block_service_counts bsc
"#;

const CLUSTER_SERVICE_MAP_SQL: &str = r#"
INSERT INTO cluster_service_map (cluster_id, service_id, rank)
WITH cluster_services AS (
    SELECT
        g.cluster_id,
        p.service_id,
        COUNT(*) AS usage_count
    FROM grouped_df g
    JOIN ml_citizen_master c ON
        c.district_id = g.district_id AND
        c.gender = g.gender AND
        c.caste = g.caste AND
        (CASE WHEN c.age < 18 THEN 'child' WHEN c.age < 60 THEN 'youth' ELSE 'elderly' END) = g.age_group AND
        (CASE WHEN c.religion = 'Hindu' THEN 'Hindu' ELSE 'Minority' END) = g.religion_group
    JOIN ml_provision p ON c.citizen_id = p.customer_id
    GROUP BY g.cluster_id, p.service_id
)
SELECT
    cluster_id,
    service_id,
    RANK() OVER (PARTITION BY cluster_id ORDER BY usage_count DESC)
FROM cluster_services
"#;
