use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use bidscout_core::{
    CategoryRuleRecord, DetailSettingsRecord, ListSettingsRecord, PersistedNotice,
};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::store::{sequence_unstored, NoticeDetailRecord, NoticeStore, RunLog, StoreError};

/// `organizations.yaml`: list and detail settings per organization.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrganizationsFile {
    #[serde(default)]
    pub list: Vec<ListSettingsRecord>,
    #[serde(default)]
    pub detail: Vec<DetailSettingsRecord>,
}

/// `rules/categories.yaml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RulesFile {
    #[serde(default)]
    pub rules: Vec<CategoryRuleRecord>,
}

#[derive(Debug, Default)]
struct MemoryState {
    notices: Vec<PersistedNotice>,
    archive: Vec<PersistedNotice>,
    details: HashMap<i64, NoticeDetailRecord>,
    run_logs: Vec<RunLog>,
    next_id: i64,
}

/// Store backed by YAML settings and in-process tables. Used for local
/// runs without a database and by tests.
#[derive(Debug, Default)]
pub struct MemoryNoticeStore {
    organizations: OrganizationsFile,
    rules: Vec<CategoryRuleRecord>,
    state: Mutex<MemoryState>,
}

fn settings_error(path: &Path, err: impl std::fmt::Display) -> StoreError {
    StoreError::Settings {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}

impl MemoryNoticeStore {
    pub fn new(organizations: OrganizationsFile, rules: Vec<CategoryRuleRecord>) -> Self {
        Self {
            organizations,
            rules,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Loads both settings files. A missing rules file means no rules.
    pub async fn from_files(organizations: &Path, rules: &Path) -> Result<Self, StoreError> {
        let orgs = read_yaml::<OrganizationsFile>(organizations)
            .await
            .map_err(|e| settings_error(organizations, format!("{e:#}")))?;
        let rules_file = if tokio::fs::try_exists(rules).await.unwrap_or(false) {
            read_yaml::<RulesFile>(rules)
                .await
                .map_err(|e| settings_error(rules, format!("{e:#}")))?
        } else {
            RulesFile::default()
        };
        Ok(Self::new(orgs, rules_file.rules))
    }

    pub async fn notices(&self) -> Vec<PersistedNotice> {
        self.state.lock().await.notices.clone()
    }

    pub async fn archived(&self) -> Vec<PersistedNotice> {
        self.state.lock().await.archive.clone()
    }

    pub async fn run_logs(&self) -> Vec<RunLog> {
        self.state.lock().await.run_logs.clone()
    }

    pub async fn detail(&self, notice_id: i64) -> Option<NoticeDetailRecord> {
        self.state.lock().await.details.get(&notice_id).cloned()
    }
}

async fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn insert_unique(
    table: &mut Vec<PersistedNotice>,
    next_id: &mut i64,
    notice: &PersistedNotice,
) -> bool {
    let exists = table
        .iter()
        .any(|n| n.org_name == notice.org_name && n.detail_url == notice.detail_url);
    if exists {
        return false;
    }
    *next_id += 1;
    let mut stored = notice.clone();
    stored.id = Some(*next_id);
    table.push(stored);
    true
}

fn recent_of(table: &[PersistedNotice], org_name: &str, limit: usize) -> Vec<String> {
    table
        .iter()
        .rev()
        .filter(|n| n.org_name == org_name)
        .take(limit)
        .map(|n| n.detail_url.clone())
        .collect()
}

#[async_trait]
impl NoticeStore for MemoryNoticeStore {
    async fn list_configs(&self) -> Result<Vec<ListSettingsRecord>, StoreError> {
        Ok(self.organizations.list.clone())
    }

    async fn list_config(&self, org_name: &str) -> Result<Option<ListSettingsRecord>, StoreError> {
        Ok(self
            .organizations
            .list
            .iter()
            .find(|r| r.org_name == org_name)
            .cloned())
    }

    async fn detail_config(
        &self,
        org_name: &str,
    ) -> Result<Option<DetailSettingsRecord>, StoreError> {
        Ok(self
            .organizations
            .detail
            .iter()
            .find(|r| r.org_name == org_name)
            .cloned())
    }

    async fn active_rules(&self) -> Result<Vec<CategoryRuleRecord>, StoreError> {
        Ok(self.rules.iter().filter(|r| r.active).cloned().collect())
    }

    async fn recent_urls(
        &self,
        org_name: &str,
        limit: usize,
    ) -> Result<HashSet<String>, StoreError> {
        let state = self.state.lock().await;
        let mut urls: HashSet<String> = recent_of(&state.notices, org_name, limit)
            .into_iter()
            .collect();
        urls.extend(recent_of(&state.archive, org_name, limit));
        Ok(urls)
    }

    async fn max_sequence(&self, org_name: &str) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .notices
            .iter()
            .filter(|n| n.org_name == org_name)
            .map(|n| n.sequence)
            .max()
            .unwrap_or(0))
    }

    async fn insert_notices(
        &self,
        org_name: &str,
        notices: &[PersistedNotice],
    ) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let MemoryState {
            notices: table,
            next_id,
            ..
        } = &mut *state;
        let of_org = || table.iter().filter(|n| n.org_name == org_name);
        let stored: HashSet<String> = of_org().map(|n| n.detail_url.clone()).collect();
        let current = of_org().map(|n| n.sequence).max().unwrap_or(0);
        let batch = sequence_unstored(notices, &stored, current);
        Ok(batch
            .iter()
            .filter(|n| insert_unique(table, next_id, n))
            .count())
    }

    async fn archive_uncategorized(
        &self,
        notices: &[PersistedNotice],
    ) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let MemoryState {
            archive, next_id, ..
        } = &mut *state;
        Ok(notices
            .iter()
            .filter(|n| insert_unique(archive, next_id, n))
            .count())
    }

    async fn notice(&self, id: i64) -> Result<Option<PersistedNotice>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.notices.iter().find(|n| n.id == Some(id)).cloned())
    }

    async fn upsert_detail(&self, detail: &NoticeDetailRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.notices.iter().any(|n| n.id == Some(detail.notice_id)) {
            return Err(StoreError::NoticeNotFound(detail.notice_id));
        }
        state.details.insert(detail.notice_id, detail.clone());
        Ok(())
    }

    async fn append_run_log(&self, log: &RunLog) -> Result<(), StoreError> {
        self.state.lock().await.run_logs.push(log.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bidscout_core::NoticeStatus;
    use chrono::{NaiveDate, Utc};
    use tempfile::tempdir;

    use super::*;

    fn notice(org: &str, url: &str, sequence: i64) -> PersistedNotice {
        PersistedNotice {
            id: None,
            org_name: org.into(),
            title: "청사 청소 용역".into(),
            detail_url: url.into(),
            posted_date: NaiveDate::from_ymd_opt(2024, 3, 5).unwrap(),
            posted_by: String::new(),
            category: "용역".into(),
            sequence,
            status: NoticeStatus::Normal,
            scraped_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn loads_settings_and_rules_from_yaml() {
        let dir = tempdir().unwrap();
        let orgs = dir.path().join("organizations.yaml");
        let rules = dir.path().join("categories.yaml");
        std::fs::write(
            &orgs,
            r#"
list:
  - org_name: 가평군청
    url: https://www.gp.go.kr/board/list.do?page=${i}
    rowXpath: //table/tbody/tr
    title: td[2]/a
    detail_url: td[2]/a|-href
  - org_name: 양천구
    use: false
detail:
  - org_name: 가평군청
    title: //h3
"#,
        )
        .unwrap();
        std::fs::write(
            &rules,
            "rules:\n  - priority: 1\n    category: 용역\n    keywords: 용역*3\n  - priority: 2\n    category: 보류\n    active: false\n",
        )
        .unwrap();

        let store = MemoryNoticeStore::from_files(&orgs, &rules).await.unwrap();
        assert_eq!(store.list_configs().await.unwrap().len(), 2);
        assert!(!store.list_config("양천구").await.unwrap().unwrap().active);
        assert!(store.detail_config("가평군청").await.unwrap().is_some());
        assert_eq!(store.active_rules().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn shipped_settings_are_valid() {
        let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let store = MemoryNoticeStore::from_files(
            &root.join("organizations.yaml"),
            &root.join("rules/categories.yaml"),
        )
        .await
        .unwrap();

        let active: Vec<_> = store
            .list_configs()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.active)
            .collect();
        assert_eq!(active.len(), 2);
        for record in active {
            let config = bidscout_core::OrganizationListConfig::from_record(record).unwrap();
            for (_, expr) in config.fields.iter() {
                bidscout_adapters::FieldExpression::parse(expr).unwrap();
            }
        }
        let rules = crate::classify::RuleSet::from_records(store.active_rules().await.unwrap());
        assert_eq!(rules.len(), 4);
        assert_eq!(rules.category_for("통합 보안관제 서버 구축"), "정보보안");
    }

    #[tokio::test]
    async fn missing_rules_file_means_no_rules() {
        let dir = tempdir().unwrap();
        let orgs = dir.path().join("organizations.yaml");
        std::fs::write(&orgs, "list: []\n").unwrap();
        let store = MemoryNoticeStore::from_files(&orgs, &dir.path().join("nope.yaml"))
            .await
            .unwrap();
        assert!(store.active_rules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn inserts_skip_existing_keys() {
        let store = MemoryNoticeStore::default();
        let first = [notice("가평군청", "https://a/1", 1), notice("가평군청", "https://a/2", 2)];
        assert_eq!(store.insert_notices("가평군청", &first).await.unwrap(), 2);
        assert_eq!(store.insert_notices("가평군청", &first).await.unwrap(), 0);
        assert_eq!(store.max_sequence("가평군청").await.unwrap(), 2);
        assert_eq!(store.max_sequence("양천구").await.unwrap(), 0);

        store
            .archive_uncategorized(&[notice("가평군청", "https://a/3", 0)])
            .await
            .unwrap();
        let urls = store.recent_urls("가평군청", 100).await.unwrap();
        assert_eq!(urls.len(), 3);
    }

    #[tokio::test]
    async fn stale_overlapping_batches_leave_no_sequence_gaps() {
        let store = MemoryNoticeStore::default();
        // Two writers numbered their batches against the same empty table.
        let first = [notice("가평군청", "https://a/1", 1)];
        let stale = [notice("가평군청", "https://a/1", 1), notice("가평군청", "https://a/4", 2)];
        assert_eq!(store.insert_notices("가평군청", &first).await.unwrap(), 1);
        assert_eq!(store.insert_notices("가평군청", &stale).await.unwrap(), 1);

        let stored: Vec<(String, i64)> = store
            .notices()
            .await
            .into_iter()
            .map(|n| (n.detail_url, n.sequence))
            .collect();
        assert_eq!(
            stored,
            vec![("https://a/1".to_string(), 1), ("https://a/4".to_string(), 2)]
        );
    }
}
