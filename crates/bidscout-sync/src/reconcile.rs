use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bidscout_core::{RawNoticeRow, ScrapeError};
use tokio::sync::Mutex;
use tracing::debug;

use crate::classify::ClassifiedRow;
use crate::store::NoticeStore;

/// Floor for the recent-URL window used to spot already stored notices.
pub const RECENT_URL_WINDOW: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Rows that survived deduplication.
    pub accepted: usize,
    /// Rows written to the main notice table.
    pub inserted: usize,
    /// Uncategorized rows written to the archive.
    pub archived: usize,
}

/// Deduplicates scraped rows against the store and assigns per-organization
/// sequence numbers.
pub struct Reconciler {
    store: Arc<dyn NoticeStore>,
    // Grows to one lock per organization and stays there.
    org_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn NoticeStore>) -> Self {
        Self {
            store,
            org_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn org_lock(&self, org_name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.org_locks.lock().await;
        locks
            .entry(org_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn known_urls(&self, org_name: &str, batch: usize) -> Result<HashSet<String>, ScrapeError> {
        Ok(self
            .store
            .recent_urls(org_name, RECENT_URL_WINDOW.max(batch))
            .await?)
    }

    /// Drops rows whose URL is already stored or repeated within the batch.
    pub async fn filter_new(
        &self,
        org_name: &str,
        rows: Vec<RawNoticeRow>,
    ) -> Result<Vec<RawNoticeRow>, ScrapeError> {
        let mut seen = self.known_urls(org_name, rows.len()).await?;
        Ok(rows
            .into_iter()
            .filter(|row| seen.insert(row.detail_url.clone()))
            .collect())
    }

    /// Persists classified rows: categorized rows get the next sequence
    /// numbers in order and go to the notice table, uncategorized rows go to
    /// the archive. A dry run writes nothing and reports what would have
    /// been written.
    pub async fn reconcile(
        &self,
        org_name: &str,
        rows: Vec<ClassifiedRow>,
        dry_run: bool,
    ) -> Result<ReconcileOutcome, ScrapeError> {
        let lock = self.org_lock(org_name).await;
        let _guard = lock.lock().await;

        let mut seen = self.known_urls(org_name, rows.len()).await?;
        let fresh: Vec<ClassifiedRow> = rows
            .into_iter()
            .filter(|c| seen.insert(c.row.detail_url.clone()))
            .collect();
        let accepted = fresh.len();
        let (archive, main): (Vec<_>, Vec<_>) =
            fresh.into_iter().partition(ClassifiedRow::is_uncategorized);

        let base = self.store.max_sequence(org_name).await?;
        let notices: Vec<_> = main
            .into_iter()
            .zip(base + 1..)
            .map(|(row, sequence)| row.into_notice(sequence))
            .collect();
        let archive: Vec<_> = archive.into_iter().map(|row| row.into_notice(0)).collect();

        if dry_run {
            debug!(org_name, accepted, "dry run, nothing persisted");
            return Ok(ReconcileOutcome {
                accepted,
                inserted: notices.len(),
                archived: archive.len(),
            });
        }

        let inserted = self.store.insert_notices(org_name, &notices).await?;
        let archived = if archive.is_empty() {
            0
        } else {
            self.store.archive_uncategorized(&archive).await?
        };
        Ok(ReconcileOutcome {
            accepted,
            inserted,
            archived,
        })
    }
}
