use chrono::{DateTime, NaiveDate, Utc};
use bidscout_storage::ArtifactStore;
use tokio::sync::watch;
use uuid::Uuid;

/// Sender half of a run-wide cancellation flag.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Receiver half, checked between organizations and between pages.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        cancel_pair().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Per-run inputs shared by the list and detail scrapers.
#[derive(Debug, Clone)]
pub struct ScrapeContext {
    pub run_id: Uuid,
    pub today: NaiveDate,
    pub scraped_at: DateTime<Utc>,
    pub cancel: CancelSignal,
    /// When set, every fetched page is written here.
    pub debug_store: Option<ArtifactStore>,
    /// Concurrent page fetches for URL-templated boards.
    pub page_concurrency: usize,
}

impl ScrapeContext {
    pub fn new(run_id: Uuid, scraped_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            today: scraped_at.date_naive(),
            scraped_at,
            cancel: CancelSignal::never(),
            debug_store: None,
            page_concurrency: 2,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_debug_store(mut self, store: Option<ArtifactStore>) -> Self {
        self.debug_store = store;
        self
    }

    pub fn with_page_concurrency(mut self, concurrency: usize) -> Self {
        self.page_concurrency = concurrency.max(1);
        self
    }

    pub(crate) async fn dump_page(&self, org_name: &str, label: &str, html: &str) {
        let Some(store) = &self.debug_store else {
            return;
        };
        match store.store_page(self.scraped_at, org_name, label, html).await {
            Ok(artifact) => tracing::debug!(
                org_name,
                path = %artifact.absolute_path.display(),
                "stored debug page"
            ),
            Err(err) => tracing::warn!(org_name, error = %err, "could not store debug page"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_visible_to_every_clone() {
        let (handle, signal) = cancel_pair();
        let clone = signal.clone();
        assert!(!signal.is_cancelled());
        handle.cancel();
        assert!(signal.is_cancelled());
        assert!(clone.is_cancelled());
    }
}
