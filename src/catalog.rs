// ABOUTME: Sync catalog - the fixed set of replicated tables and how each one is replicated
// ABOUTME: Resolves operator-supplied names to a SyncTarget

use serde::Serialize;
use std::fmt;

use crate::error::{Result, SyncError};

/// How the remote API serves a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReplicationPattern {
    /// Ignores parameters and returns every record in one response
    DumpAll,
    /// Requires a date window, a meta call and numbered page calls
    Paginated,
}

/// How a batch of records is written to the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MergeStrategy {
    PureInsert,
    ManualUpsert,
    InsertOnlyAfterTruncate,
}

impl fmt::Display for ReplicationPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationPattern::DumpAll => f.write_str("dump-all"),
            ReplicationPattern::Paginated => f.write_str("paginated"),
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeStrategy::PureInsert => f.write_str("insert"),
            MergeStrategy::ManualUpsert => f.write_str("upsert"),
            MergeStrategy::InsertOnlyAfterTruncate => f.write_str("truncate+insert"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncTarget {
    /// Local table name
    pub table: String,
    /// Name the remote API addresses the table by
    pub remote_name: String,
    pub pattern: ReplicationPattern,
    pub primary_key: Vec<String>,
    pub merge: MergeStrategy,
}

impl SyncTarget {
    pub fn new(
        table: &str,
        remote_name: &str,
        pattern: ReplicationPattern,
        primary_key: &[&str],
        merge: MergeStrategy,
    ) -> Self {
        Self {
            table: table.to_string(),
            remote_name: remote_name.to_string(),
            pattern,
            primary_key: primary_key.iter().map(|c| c.to_string()).collect(),
            merge,
        }
    }

    fn answers_to(&self, name: &str) -> bool {
        name == self.table
            || name == self.remote_name
            || format!("ml_{}", self.remote_name) == name
    }
}

/// Ordered list of sync targets. Order is the dependency order of a full run.
#[derive(Debug, Clone)]
pub struct Catalog {
    targets: Vec<SyncTarget>,
}

impl Catalog {
    pub fn new(targets: Vec<SyncTarget>) -> Self {
        Self { targets }
    }

    /// The production catalog.
    pub fn standard() -> Self {
        use MergeStrategy::*;
        use ReplicationPattern::*;

        Self::new(vec![
            SyncTarget::new(
                "ml_citizen_master",
                "citizen_master",
                Paginated,
                &["citizen_id"],
                ManualUpsert,
            ),
            SyncTarget::new(
                "ml_provision",
                "provision",
                Paginated,
                &["bsk_id", "customer_id", "service_id", "prov_date"],
                PureInsert,
            ),
            SyncTarget::new(
                "ml_district",
                "district",
                DumpAll,
                &["district_id"],
                InsertOnlyAfterTruncate,
            ),
            SyncTarget::new(
                "ml_bsk_master",
                "bsk_master",
                DumpAll,
                &["bsk_id"],
                InsertOnlyAfterTruncate,
            ),
            SyncTarget::new(
                "services",
                "service_master",
                DumpAll,
                &["service_id"],
                InsertOnlyAfterTruncate,
            ),
            // No surrogate id; rows are keyed by service id and name
            SyncTarget::new(
                "services_eligibility",
                "services_eligibility",
                DumpAll,
                &["service_id", "service_name"],
                InsertOnlyAfterTruncate,
            ),
        ])
    }

    pub fn targets(&self) -> &[SyncTarget] {
        &self.targets
    }

    /// Accepts the local name, the remote name or the `ml_` alias of the remote name.
    pub fn resolve(&self, name: &str) -> Result<&SyncTarget> {
        let name = name.trim();
        self.targets
            .iter()
            .find(|t| t.answers_to(name))
            .ok_or_else(|| {
                SyncError::Structural(format!(
                    "Unknown table '{}'. Known tables: {}",
                    name,
                    self.targets
                        .iter()
                        .map(|t| t.table.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::standard()
    }
}
