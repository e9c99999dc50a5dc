// ABOUTME: DistributedLock - PostgreSQL session advisory locks around bulk replaces
// ABOUTME: Lock ids are derived from the table name so every process agrees on them

use sha2::{Digest, Sha256};
use tokio_postgres::GenericClient;

use crate::error::{Result, SyncError};

const LOCK_NAMESPACE: &str = "citizen-sync:";

/// Stable advisory-lock id for a table: the first eight bytes of
/// SHA-256("citizen-sync:" + table), big-endian.
pub fn lock_id_for(table: &str) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(LOCK_NAMESPACE.as_bytes());
    hasher.update(table.as_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Session-scoped advisory lock for one table.
///
/// The lock belongs to the database session that took it and is released by
/// the server if that session ends.
#[derive(Debug, Clone)]
pub struct AdvisoryLock {
    table: String,
    id: i64,
}

impl AdvisoryLock {
    pub fn for_table(table: &str) -> Self {
        Self {
            table: table.to_string(),
            id: lock_id_for(table),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Block until the lock is ours.
    pub async fn acquire<C: GenericClient>(&self, client: &C) -> Result<()> {
        tracing::debug!("Acquiring replace lock {} for {}", self.id, self.table);
        client
            .execute("SELECT pg_advisory_lock($1)", &[&self.id])
            .await
            .map_err(|e| SyncError::storage(format!("acquire replace lock for {}", self.table), e))?;
        Ok(())
    }

    /// Take the lock if it is free, otherwise report contention.
    pub async fn try_acquire<C: GenericClient>(&self, client: &C) -> Result<()> {
        let row = client
            .query_one("SELECT pg_try_advisory_lock($1)", &[&self.id])
            .await
            .map_err(|e| SyncError::storage(format!("try replace lock for {}", self.table), e))?;
        let acquired: bool = row.get(0);
        if acquired {
            Ok(())
        } else {
            Err(SyncError::LockContention {
                table: self.table.clone(),
                lock_id: self.id,
            })
        }
    }

    /// Release the lock. Returns whether this session actually held it.
    pub async fn release<C: GenericClient>(&self, client: &C) -> Result<bool> {
        let row = client
            .query_one("SELECT pg_advisory_unlock($1)", &[&self.id])
            .await
            .map_err(|e| SyncError::storage(format!("release replace lock for {}", self.table), e))?;
        let released: bool = row.get(0);
        if !released {
            tracing::warn!(
                "Replace lock {} for {} was not held by this session",
                self.id,
                self.table
            );
        }
        Ok(released)
    }
}
