use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use bidscout_adapters::{
    scrape_detail, scrape_list, FetchStrategy, PageFetcher, ScrapeContext,
};
use bidscout_core::{
    DetailField, DetailSettingsRecord, ListSettingsRecord, OrganizationDetailConfig,
    OrganizationListConfig, ScrapeError,
};
use bidscout_storage::{ArtifactStore, FetchError, RenderRequest};
use chrono::{NaiveDate, TimeZone, Utc};
use uuid::Uuid;

const LIST_URL: &str = "https://www.gp.go.kr/board/list.do?bbsId=BID";
const VIEW_URL: &str = "https://www.gp.go.kr/board/view.do?bbsId=BID&nttId=245";

fn fixture(name: &str) -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/gapyeong")
        .join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

/// Serves fixture pages over "HTTP"; the browser tier is never available.
struct FixtureFetcher {
    pages: HashMap<String, String>,
    requested: Mutex<Vec<String>>,
}

impl FixtureFetcher {
    fn new() -> Self {
        let mut pages = HashMap::new();
        pages.insert(LIST_URL.to_string(), fixture("list-p1.html"));
        pages.insert(VIEW_URL.to_string(), fixture("view-245.html"));
        Self {
            pages,
            requested: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl PageFetcher for FixtureFetcher {
    async fn get(&self, _run_id: Uuid, _org: &str, url: &str) -> Result<String, FetchError> {
        self.requested.lock().unwrap().push(url.to_string());
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

fn list_record(end_page: u32) -> ListSettingsRecord {
    ListSettingsRecord {
        org_name: "가평군청".into(),
        url: Some(LIST_URL.into()),
        row_xpath: Some("//table[@class='board']/tbody/tr".into()),
        paging: Some("//div[@class='paging']/a[normalize-space(text())='${i}']".into()),
        start_page: Some(1),
        end_page: Some(end_page),
        title: Some("td[@class='subject']".into()),
        detail_url: Some("td[@class='subject']/a|-href".into()),
        posted_date: Some("td[4]".into()),
        posted_by: Some("td[3]".into()),
        exception_row: Some("td[1]/img/@alt".into()),
        active: true,
        ..Default::default()
    }
}

fn list_config(end_page: u32) -> OrganizationListConfig {
    OrganizationListConfig::from_record(list_record(end_page)).unwrap()
}

fn ctx() -> ScrapeContext {
    ScrapeContext::new(Uuid::new_v4(), Utc.with_ymd_and_hms(2024, 3, 6, 0, 30, 0).unwrap())
}

#[tokio::test]
async fn fixture_board_yields_complete_rows_oldest_first() {
    let fetcher = FixtureFetcher::new();
    let out = scrape_list(&fetcher, &list_config(1), &ctx()).await;

    assert!(out.error.is_none(), "{:?}", out.error);
    assert_eq!(out.seen, 4);
    assert_eq!(out.skipped, 1);
    assert_eq!(out.dropped, 1);
    assert_eq!(out.strategies, vec![FetchStrategy::Http]);

    let titles: Vec<&str> = out.rows.iter().map(|r| r.title.as_str()).collect();
    assert_eq!(
        titles,
        vec![
            "통합 보안관제 서버 구축 사업 긴급 입찰 공고",
            "2024년 청사 시설 경비 용역 입찰 공고",
        ]
    );
    assert_eq!(
        out.rows[1].detail_url,
        "https://www.gp.go.kr/board/view.do?bbsId=BID&nttId=245"
    );
    assert_eq!(out.rows[0].posted_date, NaiveDate::from_ymd_opt(2024, 3, 2).unwrap());
    assert_eq!(out.rows[1].posted_by, "재무과");
    assert!(out.rows.iter().all(|r| r.org_name == "가평군청"));
}

#[tokio::test]
async fn later_page_failures_keep_first_page_rows() {
    let fetcher = FixtureFetcher::new();
    let out = scrape_list(&fetcher, &list_config(2), &ctx()).await;

    assert!(out.error.is_none());
    assert_eq!(out.pages, 1);
    assert_eq!(out.rows.len(), 2);
    let requested = fetcher.requested.lock().unwrap().clone();
    assert_eq!(
        requested,
        vec![
            LIST_URL.to_string(),
            "https://www.gp.go.kr/board/list.do?bbsId=BID&pageIndex=2".to_string(),
        ]
    );
}

#[tokio::test]
async fn broken_paging_selectors_are_reported_without_losing_rows() {
    let record = ListSettingsRecord {
        paging: Some("//div[@class='pagination']/a[normalize-space(text())='${i}']".into()),
        ..list_record(3)
    };
    let config = OrganizationListConfig::from_record(record).unwrap();
    let fetcher = FixtureFetcher::new();
    let out = scrape_list(&fetcher, &config, &ctx()).await;

    assert!(out.error.is_none());
    assert_eq!(out.rows.len(), 2);
    assert_eq!(out.warnings.len(), 1);
    assert!(matches!(
        &out.warnings[0],
        ScrapeError::SelectorResolution { expression, .. } if expression.contains("'2'")
    ));
    assert_eq!(*fetcher.requested.lock().unwrap(), vec![LIST_URL.to_string()]);
}

#[tokio::test]
async fn debug_mode_stores_every_fetched_page() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = FixtureFetcher::new();
    let ctx = ctx().with_debug_store(Some(ArtifactStore::new(dir.path())));
    let out = scrape_list(&fetcher, &list_config(1), &ctx).await;
    assert_eq!(out.rows.len(), 2);

    let org_dir = dir.path().join("20240306_003000").join("가평군청");
    let stored: Vec<_> = std::fs::read_dir(&org_dir).unwrap().collect();
    assert_eq!(stored.len(), 1);
}

#[tokio::test]
async fn fixture_detail_page_is_fully_extracted() {
    let config = OrganizationDetailConfig::from_record(DetailSettingsRecord {
        org_name: "가평군청".into(),
        title: Some("//h3[@class='view_title']".into()),
        body_html: Some("//div[@class='view_cont']|-innerhtml".into()),
        file_name: Some("//ul[@class='file_list']/li/a".into()),
        file_url: Some("//ul[@class='file_list']/li/a|-href".into()),
        notice_num: Some("//dd[@class='notice_num']|-|-rst.split('제')[1].replace('호', '')".into()),
        org_dept: Some("//dd[@class='dept']".into()),
        org_man: Some("//dd[@class='man']".into()),
        org_tel: Some("//dd[@class='tel']".into()),
        active: true,
        ..Default::default()
    })
    .unwrap();

    let fetcher = FixtureFetcher::new();
    let out = scrape_detail(&fetcher, "가평군청", VIEW_URL, &config, &ctx()).await;

    assert!(out.error.is_none());
    assert_eq!(
        out.field(DetailField::Title),
        Some("2024년 청사 시설 경비 용역 입찰 공고")
    );
    assert_eq!(out.field(DetailField::NoticeNum), Some("2024-311"));
    assert_eq!(
        out.field(DetailField::FileName),
        Some("입찰공고문.hwp|-과업지시서.pdf")
    );
    assert_eq!(
        out.field(DetailField::FileUrl),
        Some(
            "https://www.gp.go.kr/cmm/fms/FileDown.do?atchFileId=F001&fileSn=0\
             |-https://www.gp.go.kr/cmm/fms/FileDown.do?atchFileId=F001&fileSn=1"
        )
    );
    assert_eq!(out.field(DetailField::OrgTel), Some("031-580-2245"));
    assert!(out
        .field(DetailField::BodyHtml)
        .is_some_and(|body| body.contains("<p>1. 입찰에 부치는 사항</p>")));
}
