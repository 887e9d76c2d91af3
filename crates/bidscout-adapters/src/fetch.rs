use std::sync::Arc;

use async_trait::async_trait;
use bidscout_core::ScrapeError;
use bidscout_storage::{resolve_url, BrowserPool, FetchError, HttpFetcher, RenderRequest};
use scraper::Html;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::ScrapeContext;
use crate::expression::FieldExpression;
use crate::extract::extract_field;
use crate::xpath::{XDocument, XNode, XPath};

/// Pages shorter than this are treated as shells that need a real browser.
pub const MIN_HTML_BYTES: usize = 1000;
/// A list page with fewer matching rows is retried in the browser.
pub const MIN_LIST_ROWS: usize = 2;
/// A detail page whose title is shorter than this is retried in the browser.
pub const MIN_TITLE_CHARS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStrategy {
    Http,
    Browser,
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub html: String,
    pub strategy: FetchStrategy,
}

/// The two ways of getting a page. Both return raw HTML.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn get(&self, run_id: Uuid, org_name: &str, url: &str) -> Result<String, FetchError>;

    async fn render(
        &self,
        run_id: Uuid,
        org_name: &str,
        request: &RenderRequest,
    ) -> Result<String, FetchError>;
}

/// Production fetcher: shared HTTP client plus an optional browser pool.
#[derive(Debug, Clone)]
pub struct FetchLayer {
    http: Arc<HttpFetcher>,
    browser: Option<Arc<BrowserPool>>,
}

impl FetchLayer {
    pub fn new(http: Arc<HttpFetcher>, browser: Option<Arc<BrowserPool>>) -> Self {
        Self { http, browser }
    }
}

#[async_trait]
impl PageFetcher for FetchLayer {
    async fn get(&self, run_id: Uuid, org_name: &str, url: &str) -> Result<String, FetchError> {
        Ok(self.http.get_html(run_id, org_name, url).await?.html)
    }

    async fn render(
        &self,
        run_id: Uuid,
        org_name: &str,
        request: &RenderRequest,
    ) -> Result<String, FetchError> {
        match &self.browser {
            Some(pool) => pool.render(run_id, org_name, request).await,
            None => Err(FetchError::BrowserUnavailable),
        }
    }
}

/// Which fetch tiers a plan may use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchMode {
    /// HTTP first, browser when the result looks incomplete.
    #[default]
    Escalating,
    /// HTTP only. Thin pages come back as they are.
    HttpOnly,
    /// Straight to the browser.
    BrowserOnly,
}

impl FetchMode {
    /// Mode for the pages after one fetched with `strategy`: the escalation
    /// decision is made once per board.
    pub fn following(strategy: FetchStrategy) -> Self {
        match strategy {
            FetchStrategy::Http => FetchMode::HttpOnly,
            FetchStrategy::Browser => FetchMode::BrowserOnly,
        }
    }
}

/// What makes a fetched page good enough to skip the browser.
#[derive(Debug, Clone, Copy)]
pub enum Sufficiency<'p> {
    Rows(&'p XPath),
    Field(&'p FieldExpression),
    LengthOnly,
}

#[derive(Debug, Clone)]
pub struct FetchPlan<'p> {
    pub url: String,
    pub iframe: Option<&'p XPath>,
    pub check: Sufficiency<'p>,
    pub mode: FetchMode,
    /// Selector the browser waits for before reading the DOM.
    pub wait_for: Option<String>,
    /// Browser-only navigation: selectors clicked after loading `url`.
    pub clicks: Vec<String>,
}

impl<'p> FetchPlan<'p> {
    pub fn new(url: impl Into<String>, check: Sufficiency<'p>) -> Self {
        Self {
            url: url.into(),
            iframe: None,
            check,
            mode: FetchMode::Escalating,
            wait_for: None,
            clicks: Vec::new(),
        }
    }
}

pub fn is_sufficient(html: &str, check: Sufficiency<'_>) -> bool {
    if html.len() < MIN_HTML_BYTES {
        return false;
    }
    let parsed = Html::parse_document(html);
    let doc = XDocument::new(&parsed);
    match check {
        Sufficiency::Rows(rows) => rows
            .select(&doc, XNode::Root)
            .map(|nodes| nodes.len() >= MIN_LIST_ROWS)
            .unwrap_or(false),
        Sufficiency::Field(expr) => {
            extract_field(&doc, XNode::Root, "title", expr, false)
                .value
                .chars()
                .count()
                >= MIN_TITLE_CHARS
        }
        Sufficiency::LengthOnly => true,
    }
}

fn iframe_src(html: &str, base_url: &str, iframe: &XPath) -> Option<String> {
    let parsed = Html::parse_document(html);
    let doc = XDocument::new(&parsed);
    let nodes = iframe.select(&doc, XNode::Root).ok()?;
    let src = match nodes.first()? {
        XNode::Element(el) => el.value().attr("src")?.to_string(),
        other => doc.string_value(other),
    };
    resolve_url(base_url, &src)
}

async fn fetch_http(
    fetcher: &dyn PageFetcher,
    ctx: &ScrapeContext,
    org_name: &str,
    plan: &FetchPlan<'_>,
) -> Result<FetchedPage, FetchError> {
    let html = fetcher.get(ctx.run_id, org_name, &plan.url).await?;
    let inner = plan
        .iframe
        .and_then(|iframe| iframe_src(&html, &plan.url, iframe));
    match inner {
        Some(src) => {
            debug!(%src, "following iframe");
            let html = fetcher.get(ctx.run_id, org_name, &src).await?;
            Ok(FetchedPage {
                url: src,
                html,
                strategy: FetchStrategy::Http,
            })
        }
        None => Ok(FetchedPage {
            url: plan.url.clone(),
            html,
            strategy: FetchStrategy::Http,
        }),
    }
}

/// Fetches over HTTP first and escalates to the browser when the result is
/// missing or looks incomplete. Quota and credential rejections are returned
/// as-is. When the browser also fails, an incomplete HTTP page still wins
/// over an error. `plan.mode` can pin the fetch to one tier; click
/// navigation always needs the browser.
pub async fn fetch_page(
    fetcher: &dyn PageFetcher,
    ctx: &ScrapeContext,
    org_name: &str,
    plan: &FetchPlan<'_>,
) -> Result<FetchedPage, ScrapeError> {
    if ctx.cancel.is_cancelled() {
        return Err(ScrapeError::Cancelled);
    }

    let mut http_page = None;
    let mut http_error = None;

    let http_only = plan.mode == FetchMode::HttpOnly;
    if plan.clicks.is_empty() && plan.mode != FetchMode::BrowserOnly {
        match fetch_http(fetcher, ctx, org_name, plan).await {
            Ok(page) if http_only || is_sufficient(&page.html, plan.check) => return Ok(page),
            Ok(page) => {
                debug!(url = %plan.url, bytes = page.html.len(), "http result incomplete, escalating");
                http_page = Some(page);
            }
            Err(err) if http_only || err.is_quota_or_credential() => {
                return Err(err.into_scrape_error(&plan.url));
            }
            Err(err) => {
                warn!(url = %plan.url, error = %err, "http fetch failed, escalating");
                http_error = Some(err);
            }
        }
    }

    let request = RenderRequest {
        url: plan.url.clone(),
        iframe_xpath: plan.iframe.map(|x| x.as_str().to_string()),
        wait_for_xpath: plan.wait_for.clone(),
        clicks: plan.clicks.clone(),
        scroll: true,
    };

    match fetcher.render(ctx.run_id, org_name, &request).await {
        Ok(html) => Ok(FetchedPage {
            url: plan.url.clone(),
            html,
            strategy: FetchStrategy::Browser,
        }),
        Err(browser_err) => match http_page {
            Some(page) => {
                warn!(url = %plan.url, error = %browser_err, "browser escalation failed, keeping http page");
                Ok(page)
            }
            None => {
                let http = http_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "skipped".to_string());
                Err(ScrapeError::PageAccess {
                    url: plan.url.clone(),
                    message: format!("http: {http}; browser: {browser_err}"),
                })
            }
        },
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// Serves canned HTML and records every call.
    #[derive(Default)]
    pub struct FakeFetcher {
        pub http: HashMap<String, String>,
        pub browser: HashMap<String, String>,
        pub gets: Mutex<Vec<String>>,
        pub renders: Mutex<Vec<RenderRequest>>,
        pub http_status: Option<u16>,
    }

    impl FakeFetcher {
        pub fn with_http(mut self, url: &str, html: impl Into<String>) -> Self {
            self.http.insert(url.to_string(), html.into());
            self
        }

        pub fn with_browser(mut self, url: &str, html: impl Into<String>) -> Self {
            self.browser.insert(url.to_string(), html.into());
            self
        }

        pub fn render_count(&self) -> usize {
            self.renders.lock().map(|r| r.len()).unwrap_or(0)
        }
    }

    #[async_trait]
    impl PageFetcher for FakeFetcher {
        async fn get(&self, _run_id: Uuid, _org: &str, url: &str) -> Result<String, FetchError> {
            if let Ok(mut gets) = self.gets.lock() {
                gets.push(url.to_string());
            }
            if let Some(status) = self.http_status {
                return Err(FetchError::HttpStatus {
                    status,
                    url: url.to_string(),
                });
            }
            self.http.get(url).cloned().ok_or_else(|| FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            })
        }

        async fn render(
            &self,
            _run_id: Uuid,
            _org: &str,
            request: &RenderRequest,
        ) -> Result<String, FetchError> {
            if let Ok(mut renders) = self.renders.lock() {
                renders.push(request.clone());
            }
            self.browser
                .get(&request.url)
                .cloned()
                .ok_or(FetchError::BrowserUnavailable)
        }
    }

    /// A board page with `rows` data rows, padded past the size threshold.
    pub fn board_html(rows: usize) -> String {
        let mut body = String::from("<html><body><table class=\"board\"><tbody>");
        for i in 0..rows {
            body.push_str(&format!(
                "<tr><td>{n}</td><td><a href=\"view.do?id={n}\">공고 제목 {n}</a></td><td>2024-03-0{d}</td></tr>",
                n = 100 + i,
                d = 1 + (i % 9)
            ));
        }
        body.push_str("</tbody></table>");
        body.push_str(&format!("<div class=\"footer\">{}</div>", "안내 ".repeat(400)));
        body.push_str("</body></html>");
        body
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::testing::{board_html, FakeFetcher};
    use super::*;

    const URL: &str = "https://example.go.kr/board/list.do";

    fn ctx() -> ScrapeContext {
        ScrapeContext::new(Uuid::new_v4(), Utc::now())
    }

    #[tokio::test]
    async fn one_row_escalates_exactly_once() {
        let fetcher = FakeFetcher::default()
            .with_http(URL, board_html(1))
            .with_browser(URL, board_html(5));
        let rows = XPath::parse("//table[@class='board']/tbody/tr").unwrap();
        let plan = FetchPlan::new(URL, Sufficiency::Rows(&rows));

        let page = fetch_page(&fetcher, &ctx(), "org", &plan).await.unwrap();
        assert_eq!(page.strategy, FetchStrategy::Browser);
        assert_eq!(fetcher.render_count(), 1);
    }

    #[tokio::test]
    async fn two_rows_never_escalate() {
        let fetcher = FakeFetcher::default().with_http(URL, board_html(2));
        let rows = XPath::parse("//table[@class='board']/tbody/tr").unwrap();
        let plan = FetchPlan::new(URL, Sufficiency::Rows(&rows));

        let page = fetch_page(&fetcher, &ctx(), "org", &plan).await.unwrap();
        assert_eq!(page.strategy, FetchStrategy::Http);
        assert_eq!(fetcher.render_count(), 0);
    }

    #[tokio::test]
    async fn short_shell_pages_escalate_even_with_rows() {
        let shell = "<html><body><table class=\"board\"><tbody><tr><td>1</td></tr><tr><td>2</td></tr></tbody></table></body></html>";
        let fetcher = FakeFetcher::default()
            .with_http(URL, shell)
            .with_browser(URL, board_html(3));
        let rows = XPath::parse("//table[@class='board']/tbody/tr").unwrap();
        let page = fetch_page(&fetcher, &ctx(), "org", &FetchPlan::new(URL, Sufficiency::Rows(&rows)))
            .await
            .unwrap();
        assert_eq!(page.strategy, FetchStrategy::Browser);
    }

    #[tokio::test]
    async fn credential_failures_are_not_escalated() {
        let fetcher = FakeFetcher {
            http_status: Some(403),
            ..Default::default()
        };
        let err = fetch_page(&fetcher, &ctx(), "org", &FetchPlan::new(URL, Sufficiency::LengthOnly))
            .await
            .unwrap_err();
        assert_eq!(err.code(), 200);
        assert_eq!(fetcher.render_count(), 0);
    }

    #[tokio::test]
    async fn both_tiers_failing_is_a_page_access_error() {
        let fetcher = FakeFetcher::default();
        let err = fetch_page(&fetcher, &ctx(), "org", &FetchPlan::new(URL, Sufficiency::LengthOnly))
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::PageAccess { .. }));
        assert_eq!(fetcher.render_count(), 1);
    }

    #[tokio::test]
    async fn pinned_modes_use_a_single_tier() {
        let fetcher = FakeFetcher::default()
            .with_http(URL, board_html(0))
            .with_browser(URL, board_html(3));
        let rows = XPath::parse("//table[@class='board']/tbody/tr").unwrap();

        let mut plan = FetchPlan::new(URL, Sufficiency::Rows(&rows));
        plan.mode = FetchMode::HttpOnly;
        let page = fetch_page(&fetcher, &ctx(), "org", &plan).await.unwrap();
        assert_eq!(page.strategy, FetchStrategy::Http);
        assert_eq!(fetcher.render_count(), 0);

        plan.mode = FetchMode::BrowserOnly;
        let page = fetch_page(&fetcher, &ctx(), "org", &plan).await.unwrap();
        assert_eq!(page.strategy, FetchStrategy::Browser);
        assert_eq!(fetcher.gets.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn iframes_are_followed_over_http() {
        let outer = format!(
            "<html><body><iframe id=\"board\" src=\"/inner/list.do\"></iframe>{}</body></html>",
            "x".repeat(1200)
        );
        let fetcher = FakeFetcher::default()
            .with_http(URL, outer)
            .with_http("https://example.go.kr/inner/list.do", board_html(3));
        let rows = XPath::parse("//table[@class='board']/tbody/tr").unwrap();
        let iframe = XPath::parse("//iframe[@id='board']").unwrap();
        let mut plan = FetchPlan::new(URL, Sufficiency::Rows(&rows));
        plan.iframe = Some(&iframe);

        let page = fetch_page(&fetcher, &ctx(), "org", &plan).await.unwrap();
        assert_eq!(page.url, "https://example.go.kr/inner/list.do");
        assert_eq!(page.strategy, FetchStrategy::Http);
    }
}
