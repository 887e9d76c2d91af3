use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use bidscout_core::{
    CategoryRuleRecord, DetailSettingsRecord, ListSettingsRecord, PersistedNotice, RunStatus,
    ScrapeError,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("settings file {path}: {message}")]
    Settings { path: String, message: String },
    #[error("notice {0} not found")]
    NoticeNotFound(i64),
}

impl From<StoreError> for ScrapeError {
    fn from(err: StoreError) -> Self {
        ScrapeError::DataPersistence(err.to_string())
    }
}

/// Scraped detail fields of one stored notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoticeDetailRecord {
    pub notice_id: i64,
    pub org_name: String,
    pub detail_url: String,
    pub fields: BTreeMap<String, String>,
    pub scraped_at: DateTime<Utc>,
}

/// One row of `scrape_logs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLog {
    pub run_id: Uuid,
    pub endpoint: String,
    pub params: serde_json::Value,
    pub total_seen: usize,
    pub collected: usize,
    pub new: usize,
    pub inserted: usize,
    pub archived: usize,
    pub error_count: usize,
    pub status: RunStatus,
    pub error_text: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Renumbers a batch at write time: rows whose URL is already stored (or
/// repeated in the batch) are left out and the rest get `current_max + 1..`
/// in batch order, so sequences stay dense even when the batch was numbered
/// against a stale maximum.
pub fn sequence_unstored(
    batch: &[PersistedNotice],
    stored: &HashSet<String>,
    current_max: i64,
) -> Vec<PersistedNotice> {
    let mut seen = HashSet::new();
    batch
        .iter()
        .filter(|n| !stored.contains(&n.detail_url) && seen.insert(n.detail_url.as_str()))
        .zip(current_max + 1..)
        .map(|(notice, sequence)| PersistedNotice {
            sequence,
            ..notice.clone()
        })
        .collect()
}

/// Persistence boundary for settings, rules, notices and run logs.
#[async_trait]
pub trait NoticeStore: Send + Sync {
    /// Every list settings row, active or not.
    async fn list_configs(&self) -> Result<Vec<ListSettingsRecord>, StoreError>;

    async fn list_config(&self, org_name: &str) -> Result<Option<ListSettingsRecord>, StoreError>;

    async fn detail_config(
        &self,
        org_name: &str,
    ) -> Result<Option<DetailSettingsRecord>, StoreError>;

    async fn active_rules(&self) -> Result<Vec<CategoryRuleRecord>, StoreError>;

    /// Detail URLs of the `limit` most recent notices of `org_name`, taken
    /// from both the main table and the uncategorized archive.
    async fn recent_urls(&self, org_name: &str, limit: usize)
        -> Result<HashSet<String>, StoreError>;

    async fn max_sequence(&self, org_name: &str) -> Result<i64, StoreError>;

    /// Inserts notices keyed by `(org_name, detail_url)`, skipping existing
    /// ones. Sequence numbers are reassigned under the store's own lock with
    /// [`sequence_unstored`]. Returns how many rows were written.
    async fn insert_notices(
        &self,
        org_name: &str,
        notices: &[PersistedNotice],
    ) -> Result<usize, StoreError>;

    async fn archive_uncategorized(&self, notices: &[PersistedNotice])
        -> Result<usize, StoreError>;

    async fn notice(&self, id: i64) -> Result<Option<PersistedNotice>, StoreError>;

    async fn upsert_detail(&self, detail: &NoticeDetailRecord) -> Result<(), StoreError>;

    async fn append_run_log(&self, log: &RunLog) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use bidscout_core::NoticeStatus;
    use chrono::NaiveDate;

    use super::*;

    fn notice(url: &str, sequence: i64) -> PersistedNotice {
        PersistedNotice {
            id: None,
            org_name: "양천구".into(),
            title: "정보보안 관제 용역".into(),
            detail_url: url.into(),
            posted_date: NaiveDate::from_ymd_opt(2024, 3, 5).unwrap(),
            posted_by: String::new(),
            category: "정보보안".into(),
            sequence,
            status: NoticeStatus::Normal,
            scraped_at: Utc::now(),
        }
    }

    #[test]
    fn stored_rows_are_dropped_and_the_rest_numbered_densely() {
        let batch = [notice("u1", 1), notice("u2", 2), notice("u2", 3), notice("u4", 4)];
        let stored: HashSet<String> = ["u1".to_string()].into();

        let got: Vec<(String, i64)> = sequence_unstored(&batch, &stored, 7)
            .into_iter()
            .map(|n| (n.detail_url, n.sequence))
            .collect();
        assert_eq!(got, vec![("u2".to_string(), 8), ("u4".to_string(), 9)]);
    }
}
