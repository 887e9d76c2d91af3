//! Batch orchestration for bidscout: settings and notice stores, category
//! classification, deduplicating reconciliation and the run pipeline.

use std::sync::Arc;

use anyhow::Context;

mod classify;
mod config;
mod memory;
mod pipeline;
mod postgres;
mod reconcile;
mod store;

pub use classify::{ClassifiedRow, RuleSet};
pub use config::{StoreBackend, SyncConfig};
pub use memory::{MemoryNoticeStore, OrganizationsFile, RulesFile};
pub use pipeline::{build_scheduler, BatchReport, DateRange, Orchestrator, RunOptions, MIN_EXPECTED_ROWS};
pub use postgres::PgNoticeStore;
pub use reconcile::{ReconcileOutcome, Reconciler, RECENT_URL_WINDOW};
pub use store::{sequence_unstored, NoticeDetailRecord, NoticeStore, RunLog, StoreError};

pub const CRATE_NAME: &str = "bidscout-sync";

/// Opens the store selected by `BIDSCOUT_STORE`.
pub async fn open_store(config: &SyncConfig) -> anyhow::Result<Arc<dyn NoticeStore>> {
    match config.store {
        StoreBackend::Postgres => {
            let store = PgNoticeStore::connect(&config.database_url)
                .await
                .context("connecting to postgres")?;
            Ok(Arc::new(store))
        }
        StoreBackend::Yaml => {
            let store =
                MemoryNoticeStore::from_files(&config.organizations_file(), &config.rules_file())
                    .await
                    .context("loading yaml settings")?;
            Ok(Arc::new(store))
        }
    }
}
