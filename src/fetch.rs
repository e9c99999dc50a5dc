// ABOUTME: PaginatedFetcher - meta call then numbered page calls with safety termination
// ABOUTME: Each non-empty page is handed to a BatchSink as soon as it arrives

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;

use crate::catalog::SyncTarget;
use crate::cursor::DateWindow;
use crate::error::Result;
use crate::merge::MergeOutcome;
use crate::remote::{Record, RecordSource};

/// Empty pages in a row after which the loop gives up.
pub const MAX_CONSECUTIVE_EMPTY_PAGES: u32 = 3;

/// Receives each page as it is fetched.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn write_batch(&self, page: u32, records: &[Record]) -> Result<MergeOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    /// The meta call announced zero records; no page was requested
    NothingAnnounced,
    TotalSatisfied,
    ShortPage,
    ConsecutiveEmptyPages,
    PageLimitReached,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StopReason::NothingAnnounced => "nothing announced",
            StopReason::TotalSatisfied => "announced total received",
            StopReason::ShortPage => "short page",
            StopReason::ConsecutiveEmptyPages => "consecutive empty pages",
            StopReason::PageLimitReached => "page limit reached",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchReport {
    pub announced_total: u64,
    pub page_count: u32,
    pub pages_requested: u32,
    pub records_received: u64,
    pub merge: MergeOutcome,
    pub stop: StopReason,
}

pub struct PaginatedFetcher {
    page_size: u32,
}

impl PaginatedFetcher {
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size: page_size.max(1),
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// `ceil(total / page_size)`, saturating at `u32::MAX`.
    pub fn page_count(&self, total: u64) -> u32 {
        let pages = total.div_ceil(u64::from(self.page_size));
        u32::try_from(pages).unwrap_or(u32::MAX)
    }

    /// Fetch `target` over `window`, forwarding every non-empty page to `sink`.
    ///
    /// Stops when the announced total has arrived, on a non-empty page
    /// shorter than the page size, after three empty pages in a row, or after
    /// `page_count + 1` requests.
    pub async fn run(
        &self,
        source: &dyn RecordSource,
        target: &SyncTarget,
        window: &DateWindow,
        sink: &dyn BatchSink,
    ) -> Result<FetchReport> {
        let total = source.fetch_total(&target.remote_name, window).await?;
        let page_count = self.page_count(total);
        tracing::info!(
            "{}: meta announced {} records for {} ({} pages of {})",
            target.table,
            total,
            window,
            page_count,
            self.page_size
        );

        let mut report = FetchReport {
            announced_total: total,
            page_count,
            pages_requested: 0,
            records_received: 0,
            merge: MergeOutcome::default(),
            stop: StopReason::NothingAnnounced,
        };
        if total == 0 {
            return Ok(report);
        }

        report.stop = StopReason::PageLimitReached;
        let page_limit = page_count.saturating_add(1);
        let mut empty_streak = 0;

        for page in 1..=page_limit {
            tracing::info!("{}: downloading page {}/{}", target.table, page, page_count);
            let records = source
                .fetch_page(&target.remote_name, window, page, self.page_size)
                .await?;
            report.pages_requested += 1;

            if records.is_empty() {
                empty_streak += 1;
                tracing::warn!(
                    "{}: page {} was empty ({} in a row)",
                    target.table,
                    page,
                    empty_streak
                );
                if empty_streak >= MAX_CONSECUTIVE_EMPTY_PAGES {
                    report.stop = StopReason::ConsecutiveEmptyPages;
                    break;
                }
                continue;
            }
            empty_streak = 0;

            let received = records.len() as u64;
            report.records_received += received;
            let outcome = sink.write_batch(page, &records).await?;
            report.merge.absorb(outcome);

            if report.records_received >= total {
                report.stop = StopReason::TotalSatisfied;
                break;
            }
            if received < u64::from(self.page_size) {
                report.stop = StopReason::ShortPage;
                break;
            }
        }

        tracing::info!(
            "{}: fetched {} of {} announced records in {} requests ({})",
            target.table,
            report.records_received,
            total,
            report.pages_requested,
            report.stop
        );
        Ok(report)
    }
}
