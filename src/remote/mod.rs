// ABOUTME: Remote sync API access - the RecordSource port and its HTTP client
// ABOUTME: The orchestrator and fetcher depend only on RecordSource

pub mod client;
pub mod models;

use async_trait::async_trait;

use crate::cursor::DateWindow;
use crate::error::Result;

pub use client::SyncApiClient;
pub use models::Record;

/// Where records come from. Table arguments are remote table names.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Announced record count for a paginated table over `window`.
    async fn fetch_total(&self, table: &str, window: &DateWindow) -> Result<u64>;

    /// One page (1-based) of a paginated table.
    async fn fetch_page(
        &self,
        table: &str,
        window: &DateWindow,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Record>>;

    /// Every record of a dump-all table in one call.
    async fn fetch_dump(&self, table: &str) -> Result<Vec<Record>>;
}
