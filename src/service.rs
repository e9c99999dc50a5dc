// ABOUTME: SyncService - builds the token manager, API client, warehouse, orchestrator and regenerator
// ABOUTME: from a SyncConfig and exposes them as the scheduler's jobs

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;

use crate::auth::TokenManager;
use crate::config::SyncConfig;
use crate::orchestrator::{SyncOrchestrator, SyncRunReport};
use crate::regenerate::{Regenerator, TriggerSource};
use crate::remote::SyncApiClient;
use crate::scheduler::SchedulerJobs;
use crate::utils::mask_url_password;
use crate::warehouse::PgWarehouse;

/// Remote side only; enough for `test-auth` and `test-fetch`.
pub struct RemoteContext {
    pub tokens: Arc<TokenManager>,
    pub api: Arc<SyncApiClient>,
}

impl RemoteContext {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let tokens = Arc::new(
            TokenManager::new(&config.api).context("Failed to build login client")?,
        );
        let api = Arc::new(
            SyncApiClient::new(&config.api, tokens.clone())
                .context("Failed to build sync API client")?,
        );
        Ok(Self { tokens, api })
    }
}

pub struct SyncService {
    orchestrator: SyncOrchestrator,
    regenerator: Regenerator,
}

impl SyncService {
    /// Connect to the warehouse and prepare the bookkeeping tables.
    pub async fn connect(config: &SyncConfig) -> Result<Self> {
        let database_url = config.require_database_url()?;
        tracing::info!("Connecting to {}", mask_url_password(database_url));

        let remote = RemoteContext::new(config)?;
        let warehouse = Arc::new(
            PgWarehouse::connect(database_url, &config.schema)
                .await
                .context("Failed to prepare warehouse")?,
        );

        let regenerator = Regenerator::new(warehouse.shared_client(), &config.schema);
        regenerator
            .ensure_log_table()
            .await
            .context("Failed to create regeneration log table")?;

        let orchestrator =
            SyncOrchestrator::new(remote.api.clone(), warehouse, &config.sync);

        Ok(Self {
            orchestrator,
            regenerator,
        })
    }

    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.orchestrator
    }

    pub fn regenerator(&self) -> &Regenerator {
        &self.regenerator
    }
}

#[async_trait]
impl SchedulerJobs for SyncService {
    async fn sync_all(&self) -> SyncRunReport {
        self.orchestrator.sync_all().await
    }

    async fn regenerate(&self, trigger: TriggerSource) -> Result<()> {
        let report = self
            .regenerator
            .regenerate(&[], trigger)
            .await
            .context("Derived table regeneration failed")?;
        tracing::info!(
            "Regenerated {} derived tables in {:.2}s",
            report.entries.len(),
            report.duration_seconds
        );
        Ok(())
    }
}
