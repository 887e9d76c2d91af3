use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bidscout_adapters::PageFetcher;
use bidscout_core::{
    CategoryRuleRecord, DetailField, DetailSettingsRecord, ListSettingsRecord, RunStatus,
    UNCATEGORIZED,
};
use bidscout_storage::{FetchError, RenderRequest};
use bidscout_sync::{
    DateRange, MemoryNoticeStore, NoticeStore, Orchestrator, OrganizationsFile, RunOptions,
    SyncConfig,
};
use chrono::NaiveDate;
use uuid::Uuid;

const ORG: &str = "가평군청";
const LIST_URL: &str = "https://www.gp.go.kr/board/list.do?bbsId=BID";
const VIEW_URL: &str = "https://www.gp.go.kr/board/view.do?bbsId=BID&nttId=245";

fn fixture(name: &str) -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/gapyeong")
        .join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

struct FixtureFetcher {
    pages: HashMap<&'static str, String>,
}

impl FixtureFetcher {
    fn new() -> Self {
        let mut pages = HashMap::new();
        pages.insert(LIST_URL, fixture("list-p1.html"));
        pages.insert(VIEW_URL, fixture("view-245.html"));
        Self { pages }
    }
}

#[async_trait]
impl PageFetcher for FixtureFetcher {
    async fn get(&self, _run_id: Uuid, _org: &str, url: &str) -> Result<String, FetchError> {
        self.pages.get(url).cloned().ok_or_else(|| FetchError::HttpStatus {
            status: 404,
            url: url.to_string(),
        })
    }

    async fn render(
        &self,
        _run_id: Uuid,
        _org: &str,
        _request: &RenderRequest,
    ) -> Result<String, FetchError> {
        Err(FetchError::BrowserUnavailable)
    }
}

fn organizations() -> OrganizationsFile {
    OrganizationsFile {
        list: vec![
            ListSettingsRecord {
                org_name: ORG.into(),
                url: Some(LIST_URL.into()),
                row_xpath: Some("//table[@class='board']/tbody/tr".into()),
                title: Some("td[@class='subject']".into()),
                detail_url: Some("td[@class='subject']/a|-href".into()),
                posted_date: Some("td[4]".into()),
                posted_by: Some("td[3]".into()),
                exception_row: Some("td[1]/img/@alt".into()),
                active: true,
                ..Default::default()
            },
            ListSettingsRecord {
                org_name: "양천구".into(),
                url: Some("https://www.yangcheon.go.kr/list.do".into()),
                active: false,
                ..Default::default()
            },
        ],
        detail: vec![DetailSettingsRecord {
            org_name: ORG.into(),
            title: Some("//h3[@class='view_title']".into()),
            file_name: Some("//ul[@class='file_list']/li/a".into()),
            file_url: Some("//ul[@class='file_list']/li/a|-href".into()),
            org_tel: Some("//dd[@class='tel']".into()),
            active: true,
            ..Default::default()
        }],
    }
}

fn rules(keywords: &str) -> Vec<CategoryRuleRecord> {
    vec![CategoryRuleRecord {
        priority: 1,
        category: "입찰".into(),
        keywords: keywords.into(),
        nots: String::new(),
        min_point: 1,
        active: true,
    }]
}

fn orchestrator(store: Arc<MemoryNoticeStore>) -> Orchestrator {
    Orchestrator::new(
        SyncConfig::from_lookup(|_| None),
        store,
        Arc::new(FixtureFetcher::new()),
    )
}

#[tokio::test]
async fn batch_stores_complete_rows_in_posting_order() {
    let store = Arc::new(MemoryNoticeStore::new(organizations(), rules("입찰*1")));
    let report = orchestrator(store.clone()).run_batch(&RunOptions::default()).await;

    assert_eq!(report.organizations.len(), 1);
    assert_eq!(report.total.status, RunStatus::Success);
    assert_eq!(report.total.collected, 2);
    assert_eq!(report.total.dropped, 1);
    assert_eq!(report.total.inserted, 2);

    let notices = store.notices().await;
    let ordered: Vec<(i64, &str)> = notices
        .iter()
        .map(|n| (n.sequence, n.title.as_str()))
        .collect();
    assert_eq!(
        ordered,
        vec![
            (1, "통합 보안관제 서버 구축 사업 긴급 입찰 공고"),
            (2, "2024년 청사 시설 경비 용역 입찰 공고"),
        ]
    );
    assert_eq!(store.run_logs().await.len(), 1);

    let again = orchestrator(store.clone()).run_batch(&RunOptions::default()).await;
    assert_eq!(again.total.collected, 2);
    assert_eq!(again.total.new, 0);
    assert_eq!(again.total.inserted, 0);
    assert_eq!(store.notices().await.len(), 2);
}

#[tokio::test]
async fn uncategorized_rows_go_to_the_archive() {
    let store = Arc::new(MemoryNoticeStore::new(organizations(), rules("보안*1")));
    let report = orchestrator(store.clone()).run_batch(&RunOptions::default()).await;

    assert_eq!(report.total.inserted, 1);
    assert_eq!(report.total.archived, 1);
    let archived = store.archived().await;
    assert_eq!(archived[0].category, UNCATEGORIZED);
    assert_eq!(archived[0].detail_url, VIEW_URL);
}

#[tokio::test]
async fn dry_run_matches_real_counts_and_persists_nothing() {
    let dry_store = Arc::new(MemoryNoticeStore::new(organizations(), rules("입찰*1")));
    let dry = orchestrator(dry_store.clone())
        .run_batch(&RunOptions {
            dry_run: true,
            ..Default::default()
        })
        .await;
    assert!(dry_store.notices().await.is_empty());
    assert!(dry_store.run_logs().await.is_empty());

    let real_store = Arc::new(MemoryNoticeStore::new(organizations(), rules("입찰*1")));
    let real = orchestrator(real_store).run_batch(&RunOptions::default()).await;

    assert_eq!(dry.total.collected, real.total.collected);
    assert_eq!(dry.total.new, real.total.new);
    assert_eq!(dry.total.inserted, real.total.inserted);
    assert_eq!(dry.total.archived, real.total.archived);
}

#[tokio::test]
async fn date_range_filters_rows_before_persisting() {
    let store = Arc::new(MemoryNoticeStore::new(organizations(), rules("입찰*1")));
    let options = RunOptions {
        date_range: Some(DateRange {
            from: NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
            to: NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
        }),
        ..Default::default()
    };
    let report = orchestrator(store.clone()).run_batch(&options).await;
    assert_eq!(report.total.collected, 2);
    assert_eq!(report.total.inserted, 1);
}

#[tokio::test]
async fn single_runs_report_missing_settings_without_failing() {
    let store = Arc::new(MemoryNoticeStore::new(organizations(), rules("입찰*1")));
    let orchestrator = orchestrator(store.clone());

    let result = orchestrator.run_single("없는기관", &RunOptions::default()).await;
    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.errors[0].starts_with("[100]"));

    let inactive = orchestrator.run_single("양천구", &RunOptions::default()).await;
    assert!(inactive.errors[0].starts_with("[100]"));
}

#[tokio::test]
async fn notice_details_are_scraped_and_stored() {
    let store = Arc::new(MemoryNoticeStore::new(organizations(), rules("입찰*1")));
    let orchestrator = orchestrator(store.clone());
    orchestrator.run_batch(&RunOptions::default()).await;

    let id = store
        .notices()
        .await
        .iter()
        .find(|n| n.detail_url == VIEW_URL)
        .and_then(|n| n.id)
        .unwrap();
    let scrape = orchestrator
        .fetch_notice_detail(id, &RunOptions::default())
        .await
        .unwrap();
    assert_eq!(scrape.field(DetailField::OrgTel), Some("031-580-2245"));

    let stored = store.detail(id).await.unwrap();
    assert_eq!(
        stored.fields.get("file_name").map(String::as_str),
        Some("입찰공고문.hwp|-과업지시서.pdf")
    );
    assert_eq!(stored.fields.get("org_name").map(String::as_str), Some(ORG));
    assert!(orchestrator.store().notice(9999).await.unwrap().is_none());
}

#[tokio::test]
async fn unreachable_next_pages_are_recorded_but_rows_still_persist() {
    let mut orgs = organizations();
    orgs.list[0].paging = Some("//div[@class='pager']/a[text()='${i}']".into());
    orgs.list[0].end_page = Some(2);
    let store = Arc::new(MemoryNoticeStore::new(orgs, rules("입찰*1")));

    let result = orchestrator(store.clone())
        .run_single(ORG, &RunOptions::default())
        .await;
    assert_eq!(result.inserted, 2);
    assert_eq!(result.error_count, 1);
    assert!(result.errors[0].starts_with("[220]"));
    assert_eq!(store.notices().await.len(), 2);
}
