// ABOUTME: Warehouse port - the local store as seen by the orchestrator
// ABOUTME: PgWarehouse combines the merge engine, replace locks and cursor persistence

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_postgres::Client;

use crate::catalog::SyncTarget;
use crate::cursor::{CursorRepository, SyncCursor};
use crate::error::{Result, SyncError};
use crate::lock::AdvisoryLock;
use crate::merge::{MergeEngine, MergeOutcome};
use crate::remote::Record;

#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn load_cursor(&self, table: &str) -> Result<Option<SyncCursor>>;

    async fn save_cursor(&self, cursor: &SyncCursor) -> Result<()>;

    async fn cursors(&self) -> Result<Vec<SyncCursor>>;

    /// Merge one page in its own unit of work.
    async fn merge_batch(&self, target: &SyncTarget, records: &[Record]) -> Result<MergeOutcome>;

    /// Replace the table's entire contents with `records`, all or nothing,
    /// while holding the table's replace lock. A single failed record
    /// rolls the whole replace back.
    async fn replace_all(&self, target: &SyncTarget, records: &[Record]) -> Result<MergeOutcome>;
}

/// PostgreSQL-backed warehouse on a single session.
///
/// Advisory locks are session scoped, so every statement goes through the
/// same connection, serialized by the mutex.
pub struct PgWarehouse {
    client: Arc<Mutex<Client>>,
    merge: MergeEngine,
    cursors: CursorRepository,
}

impl PgWarehouse {
    pub fn new(client: Arc<Mutex<Client>>, schema: &str) -> Self {
        Self {
            client,
            merge: MergeEngine::new(schema),
            cursors: CursorRepository::new(schema),
        }
    }

    /// Connect, then make sure the cursor table exists.
    pub async fn connect(database_url: &str, schema: &str) -> anyhow::Result<Self> {
        let client = crate::postgres::connect_with_retry(database_url).await?;
        let warehouse = Self::new(Arc::new(Mutex::new(client)), schema);
        warehouse.ensure_schema().await?;
        Ok(warehouse)
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        let client = self.client.lock().await;
        self.cursors.ensure_table(&*client).await
    }

    /// Connection shared with the regenerator.
    pub fn shared_client(&self) -> Arc<Mutex<Client>> {
        self.client.clone()
    }

    async fn replace_locked(
        &self,
        client: &mut Client,
        target: &SyncTarget,
        records: &[Record],
    ) -> Result<MergeOutcome> {
        let mut tx = client
            .transaction()
            .await
            .map_err(|e| SyncError::storage(format!("begin replace of {}", target.table), e))?;

        let table = self.merge.table_schema(&tx, &target.table).await?;
        let deleted = tx
            .execute(&format!("DELETE FROM {}", table.qualified_name()), &[])
            .await
            .map_err(|e| SyncError::storage(format!("clear {}", target.table), e))?;

        let outcome = self.merge.merge(&mut tx, target, records).await?;

        if outcome.failed > 0 {
            tx.rollback()
                .await
                .map_err(|e| SyncError::storage(format!("roll back replace of {}", target.table), e))?;
            let (key, reason) = outcome
                .failures
                .first()
                .map(|f| (f.key.clone(), f.reason.clone()))
                .unwrap_or_default();
            tracing::warn!(
                "{}: {} of {} records failed, replace rolled back",
                target.table,
                outcome.failed,
                records.len()
            );
            return Err(SyncError::Record {
                table: target.table.clone(),
                key,
                message: format!(
                    "{} (1 of {} failed records; replace rolled back)",
                    reason, outcome.failed
                ),
            });
        }

        tx.commit()
            .await
            .map_err(|e| SyncError::storage(format!("commit replace of {}", target.table), e))?;

        tracing::info!(
            "{}: replaced {} rows with {} (skipped {})",
            target.table,
            deleted,
            outcome.inserted,
            outcome.skipped
        );
        Ok(outcome)
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn load_cursor(&self, table: &str) -> Result<Option<SyncCursor>> {
        let client = self.client.lock().await;
        self.cursors.load(&*client, table).await
    }

    async fn save_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        let client = self.client.lock().await;
        self.cursors.save(&*client, cursor).await
    }

    async fn cursors(&self) -> Result<Vec<SyncCursor>> {
        let client = self.client.lock().await;
        self.cursors.load_all(&*client).await
    }

    async fn merge_batch(&self, target: &SyncTarget, records: &[Record]) -> Result<MergeOutcome> {
        let mut client = self.client.lock().await;
        let mut tx = client
            .transaction()
            .await
            .map_err(|e| SyncError::storage(format!("begin batch for {}", target.table), e))?;

        let outcome = self.merge.merge(&mut tx, target, records).await?;

        tx.commit()
            .await
            .map_err(|e| SyncError::storage(format!("commit batch for {}", target.table), e))?;
        Ok(outcome)
    }

    async fn replace_all(&self, target: &SyncTarget, records: &[Record]) -> Result<MergeOutcome> {
        let mut client = self.client.lock().await;
        let lock = AdvisoryLock::for_table(&target.table);

        match lock.try_acquire(&*client).await {
            Ok(()) => {}
            Err(SyncError::LockContention { lock_id, .. }) => {
                tracing::info!(
                    "{}: replace lock {} held by another process, waiting",
                    target.table,
                    lock_id
                );
                lock.acquire(&*client).await?;
            }
            Err(e) => return Err(e),
        }

        let result = self.replace_locked(&mut client, target, records).await;

        match lock.release(&*client).await {
            Ok(_) => result,
            Err(release_err) => match result {
                Ok(_) => Err(release_err),
                Err(e) => {
                    tracing::error!(
                        "{}: failed to release replace lock after error: {:?}",
                        target.table,
                        release_err
                    );
                    Err(e)
                }
            },
        }
    }
}
