use bidscout_core::{
    normalize_posted_date, OrganizationListConfig, RawNoticeRow, RowIssue, ScrapeError,
};
use bidscout_storage::resolve_url;
use futures::stream::{self, StreamExt};
use scraper::Html;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::context::ScrapeContext;
use crate::expression::FieldExpression;
use crate::extract::{collapse_whitespace, extract_field, is_truthy, FieldDiagnostic};
use crate::fetch::{fetch_page, FetchMode, FetchPlan, FetchStrategy, PageFetcher, Sufficiency};
use crate::xpath::{XDocument, XNode, XPath};

/// Everything one organization's list pages produced.
#[derive(Debug, Clone, Default)]
pub struct ListScrape {
    pub org_name: String,
    /// Complete rows, oldest first.
    pub rows: Vec<RawNoticeRow>,
    /// Row nodes matched across all pages, including skipped ones.
    pub seen: usize,
    /// Rows removed by the exception predicate.
    pub skipped: usize,
    /// Rows dropped for a missing title or detail URL.
    pub dropped: usize,
    pub pages: usize,
    pub strategies: Vec<FetchStrategy>,
    pub diagnostics: Vec<FieldDiagnostic>,
    /// Non-fatal problems, such as a next-page link that could not be found.
    pub warnings: Vec<ScrapeError>,
    pub error: Option<ScrapeError>,
    first_page_rows: Option<usize>,
}

impl ListScrape {
    fn new(org_name: &str) -> Self {
        Self {
            org_name: org_name.to_string(),
            ..Default::default()
        }
    }

    fn note(&mut self, diagnostic: FieldDiagnostic) {
        if !self.diagnostics.contains(&diagnostic) {
            self.diagnostics.push(diagnostic);
        }
    }

    /// Folds one page in. Returns false when pagination should stop.
    fn accept_page(&mut self, page: u32, outcome: Result<PageRows, ScrapeError>) -> bool {
        let rows = match outcome {
            Ok(rows) => rows,
            Err(err) => {
                let fatal = self.pages == 0
                    || matches!(err, ScrapeError::Cancelled)
                    || bidscout_core::is_quota_or_credential_failure(&err.to_string());
                if fatal {
                    self.error = Some(err);
                } else {
                    warn!(org_name = %self.org_name, page, error = %err, "stopping pagination");
                }
                return false;
            }
        };

        self.pages += 1;
        self.strategies.push(rows.strategy);
        self.seen += rows.matched;
        self.skipped += rows.skipped;
        for diagnostic in rows.diagnostics {
            self.note(diagnostic);
        }
        self.rows.extend(rows.rows);

        let first = *self.first_page_rows.get_or_insert(rows.matched);
        if rows.matched == 0 || rows.matched < first {
            debug!(org_name = %self.org_name, page, matched = rows.matched, "last page reached");
            return false;
        }
        true
    }

    /// Fetch mode for the pages after the first one.
    fn followup_mode(&self) -> FetchMode {
        self.strategies
            .first()
            .copied()
            .map(FetchMode::following)
            .unwrap_or_default()
    }

    fn finish(&mut self) {
        // Boards list newest first; sequence numbers must follow posting order.
        self.rows.reverse();
        let before = self.rows.len();
        self.rows.retain(RawNoticeRow::is_complete);
        self.dropped = before - self.rows.len();
    }
}

#[derive(Debug)]
struct PageRows {
    url: String,
    html: String,
    strategy: FetchStrategy,
    matched: usize,
    skipped: usize,
    rows: Vec<RawNoticeRow>,
    diagnostics: Vec<FieldDiagnostic>,
}

/// Parsed expressions for one organization's list settings.
struct CompiledList {
    rows: XPath,
    iframe: Option<XPath>,
    fields: Vec<(&'static str, FieldExpression)>,
    exception: Option<FieldExpression>,
    diagnostics: Vec<FieldDiagnostic>,
}

impl CompiledList {
    fn compile(config: &OrganizationListConfig) -> Result<Self, ScrapeError> {
        let selector_error = |expression: &str, message: String| ScrapeError::SelectorResolution {
            expression: expression.to_string(),
            message,
        };
        let rows = XPath::parse(&config.row_xpath)
            .map_err(|e| selector_error(&config.row_xpath, e.message))?;
        let iframe = match &config.iframe {
            Some(src) => Some(XPath::parse(src).map_err(|e| selector_error(src, e.message))?),
            None => None,
        };

        let mut fields = Vec::new();
        let mut diagnostics = Vec::new();
        for (name, source) in config.fields.iter() {
            match FieldExpression::parse(source) {
                Ok(expr) => fields.push((name, expr)),
                Err(err) if name == "title" || name == "detail_url" => {
                    return Err(selector_error(source, err.message));
                }
                Err(err) => diagnostics.push(FieldDiagnostic {
                    field: name.to_string(),
                    expression: source.to_string(),
                    message: err.message,
                }),
            }
        }

        let exception = match config.exception_row.as_deref().map(FieldExpression::parse) {
            Some(Ok(expr)) => Some(expr),
            Some(Err(err)) => {
                diagnostics.push(FieldDiagnostic {
                    field: "exception_row".to_string(),
                    expression: err.expression.clone(),
                    message: err.message,
                });
                None
            }
            None => None,
        };

        Ok(Self {
            rows,
            iframe,
            fields,
            exception,
            diagnostics,
        })
    }

    fn extract(
        &self,
        org_name: &str,
        page_url: &str,
        html: &str,
        ctx: &ScrapeContext,
    ) -> Result<(usize, usize, Vec<RawNoticeRow>, Vec<FieldDiagnostic>), ScrapeError> {
        let parsed = Html::parse_document(html);
        let doc = XDocument::new(&parsed);
        let nodes = self
            .rows
            .select(&doc, XNode::Root)
            .map_err(|e| ScrapeError::SelectorResolution {
                expression: e.expression,
                message: e.message,
            })?;

        let mut skipped = 0;
        let mut rows = Vec::with_capacity(nodes.len());
        let mut diagnostics = Vec::new();

        for node in &nodes {
            if let Some(exception) = &self.exception {
                let hit = extract_field(&doc, *node, "exception_row", exception, false);
                if is_truthy(&hit.value) {
                    skipped += 1;
                    continue;
                }
            }

            let mut row = RawNoticeRow {
                org_name: org_name.to_string(),
                title: String::new(),
                detail_url: String::new(),
                posted_date: ctx.today,
                posted_by: String::new(),
                scraped_at: ctx.scraped_at,
                issue: None,
            };
            for (name, expr) in &self.fields {
                let extracted = extract_field(&doc, *node, name, expr, false);
                if let Some(diagnostic) = extracted.diagnostic {
                    row.issue.get_or_insert_with(|| RowIssue {
                        code: 300,
                        message: format!("{}: {}", diagnostic.field, diagnostic.message),
                    });
                    diagnostics.push(diagnostic);
                }
                let value = extracted.value;
                match *name {
                    "title" => row.title = collapse_whitespace(&value),
                    "detail_url" => {
                        row.detail_url = resolve_url(page_url, &value).unwrap_or(value)
                    }
                    "posted_date" => row.posted_date = normalize_posted_date(&value, ctx.today),
                    "posted_by" => row.posted_by = value,
                    _ => {}
                }
            }
            rows.push(row);
        }

        Ok((nodes.len(), skipped, rows, diagnostics))
    }
}

async fn fetch_rows(
    fetcher: &dyn PageFetcher,
    ctx: &ScrapeContext,
    org_name: &str,
    compiled: &CompiledList,
    plan: FetchPlan<'_>,
    page: u32,
) -> Result<PageRows, ScrapeError> {
    let fetched = fetch_page(fetcher, ctx, org_name, &plan).await?;
    ctx.dump_page(org_name, &format!("list-p{page}"), &fetched.html)
        .await;
    let (matched, skipped, rows, diagnostics) =
        compiled.extract(org_name, &fetched.url, &fetched.html, ctx)?;
    Ok(PageRows {
        url: fetched.url,
        html: fetched.html,
        strategy: fetched.strategy,
        matched,
        skipped,
        rows,
        diagnostics,
    })
}

fn list_plan<'p>(
    compiled: &'p CompiledList,
    config: &OrganizationListConfig,
    url: String,
    mode: FetchMode,
) -> FetchPlan<'p> {
    let mut plan = FetchPlan::new(url, Sufficiency::Rows(&compiled.rows));
    plan.mode = mode;
    plan.iframe = compiled.iframe.as_ref();
    plan.wait_for = Some(config.row_xpath.clone());
    plan
}

/// How to reach the next page from the current one.
#[derive(Debug, PartialEq, Eq)]
enum NextLink {
    Url(String),
    /// Only reachable by clicking in a live browser.
    Click,
    Missing,
}

fn onclick_target(onclick: &str) -> Option<&str> {
    let start = onclick.find("location.href")?;
    let rest = &onclick[start..];
    let quote_at = rest.find(['\'', '"'])?;
    let quote = rest[quote_at..].chars().next()?;
    let value = &rest[quote_at + 1..];
    let end = value.find(quote)?;
    Some(&value[..end])
}

fn next_link(html: &str, page_url: &str, selector: &str) -> NextLink {
    let Ok(xpath) = XPath::parse(selector) else {
        return NextLink::Missing;
    };
    let parsed = Html::parse_document(html);
    let doc = XDocument::new(&parsed);
    let nodes = match xpath.select(&doc, XNode::Root) {
        Ok(nodes) => nodes,
        Err(_) => return NextLink::Missing,
    };
    let Some(node) = nodes.first() else {
        return NextLink::Missing;
    };
    let href = match node {
        XNode::Element(el) => el
            .value()
            .attr("href")
            .filter(|h| !h.trim().is_empty() && h.trim() != "#")
            .map(str::to_string)
            .or_else(|| el.value().attr("onclick").and_then(onclick_target).map(str::to_string)),
        other => Some(doc.string_value(other)),
    };
    href.and_then(|h| resolve_url(page_url, &h))
        .map(NextLink::Url)
        .unwrap_or(NextLink::Click)
}

async fn scrape_templated(
    fetcher: &dyn PageFetcher,
    config: &OrganizationListConfig,
    compiled: &CompiledList,
    ctx: &ScrapeContext,
    out: &mut ListScrape,
) {
    let org_name = config.org_name.as_str();
    let mut remaining = config.pages();
    let Some(first) = remaining.next() else {
        return;
    };
    let plan = list_plan(compiled, config, config.page_url(first), FetchMode::Escalating);
    let outcome = fetch_rows(fetcher, ctx, org_name, compiled, plan, first).await;
    if !out.accept_page(first, outcome) {
        return;
    }

    let mode = out.followup_mode();
    let mut pages = stream::iter(remaining.map(|page| {
        let plan = list_plan(compiled, config, config.page_url(page), mode);
        async move { (page, fetch_rows(fetcher, ctx, org_name, compiled, plan, page).await) }
    }))
    .buffered(ctx.page_concurrency);

    while let Some((page, outcome)) = pages.next().await {
        if !out.accept_page(page, outcome) {
            break;
        }
    }
}

async fn scrape_navigated(
    fetcher: &dyn PageFetcher,
    config: &OrganizationListConfig,
    compiled: &CompiledList,
    ctx: &ScrapeContext,
    out: &mut ListScrape,
) {
    let org_name = config.org_name.as_str();
    // Browser navigation replays clicks from the last page reachable by URL.
    let mut click_origin = config.page_url(config.start_page);
    let mut clicks: Vec<String> = Vec::new();
    let mut previous: Option<(String, String)> = None;

    for page in config.pages() {
        let mode = if out.pages == 0 {
            FetchMode::Escalating
        } else {
            out.followup_mode()
        };
        let mut plan = list_plan(compiled, config, click_origin.clone(), mode);
        if let Some((prev_url, prev_html)) = &previous {
            let Some(selector) = config.next_page_selector(page) else {
                break;
            };
            match next_link(prev_html, prev_url, &selector) {
                NextLink::Url(url) => {
                    click_origin = url.clone();
                    clicks.clear();
                    plan = list_plan(compiled, config, url, mode);
                }
                NextLink::Click => {
                    clicks.push(selector);
                    plan.clicks = clicks.clone();
                }
                NextLink::Missing => {
                    warn!(org_name, page, selector, "next page link not found");
                    out.warnings.push(ScrapeError::SelectorResolution {
                        expression: selector,
                        message: format!("no link to page {page} on {prev_url}"),
                    });
                    break;
                }
            }
        }

        let outcome = fetch_rows(fetcher, ctx, org_name, compiled, plan, page).await;
        let carry = outcome
            .as_ref()
            .ok()
            .map(|rows| (rows.url.clone(), rows.html.clone()));
        if !out.accept_page(page, outcome) {
            break;
        }
        previous = carry;
    }
}

/// Scrapes every configured list page of one organization. Never panics and
/// never returns early with an error: failures land in `ListScrape::error`.
pub async fn scrape_list(
    fetcher: &dyn PageFetcher,
    config: &OrganizationListConfig,
    ctx: &ScrapeContext,
) -> ListScrape {
    let span = info_span!("scrape_list", run_id = %ctx.run_id, org_name = %config.org_name);
    async move {
        let mut out = ListScrape::new(&config.org_name);
        let compiled = match CompiledList::compile(config) {
            Ok(compiled) => compiled,
            Err(err) => {
                out.error = Some(err);
                return out;
            }
        };
        for diagnostic in compiled.diagnostics.iter().cloned() {
            out.note(diagnostic);
        }

        if config.uses_url_placeholder() {
            scrape_templated(fetcher, config, &compiled, ctx, &mut out).await;
        } else {
            scrape_navigated(fetcher, config, &compiled, ctx, &mut out).await;
        }
        out.finish();

        info!(
            pages = out.pages,
            seen = out.seen,
            collected = out.rows.len(),
            dropped = out.dropped,
            skipped = out.skipped,
            failed = out.error.is_some(),
            "list scrape finished"
        );
        out
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use bidscout_core::ListSettingsRecord;
    use chrono::{NaiveDate, TimeZone, Utc};
    use uuid::Uuid;

    use super::*;
    use crate::fetch::testing::{board_html, FakeFetcher};

    fn config(url: &str, paging: Option<&str>, end_page: u32) -> OrganizationListConfig {
        OrganizationListConfig::from_record(ListSettingsRecord {
            org_name: "가평군청".into(),
            url: Some(url.into()),
            row_xpath: Some("//table[@class='board']/tbody/tr".into()),
            paging: paging.map(str::to_string),
            start_page: Some(1),
            end_page: Some(end_page),
            title: Some("td[2]/a".into()),
            detail_url: Some("td[2]/a|-href".into()),
            posted_date: Some("td[3]".into()),
            active: true,
            ..Default::default()
        })
        .unwrap()
    }

    fn ctx() -> ScrapeContext {
        let now = Utc.with_ymd_and_hms(2024, 3, 20, 1, 0, 0).unwrap();
        ScrapeContext::new(Uuid::new_v4(), now)
    }

    #[tokio::test]
    async fn rows_come_back_oldest_first_with_absolute_urls() {
        let fetcher =
            FakeFetcher::default().with_http("https://gp.go.kr/list?page=1", board_html(3));
        let out = scrape_list(&fetcher, &config("https://gp.go.kr/list?page=${i}", None, 1), &ctx()).await;

        assert!(out.error.is_none());
        assert_eq!(out.rows.len(), 3);
        assert_eq!(out.rows[0].title, "공고 제목 102");
        assert_eq!(out.rows[0].detail_url, "https://gp.go.kr/view.do?id=102");
        assert_eq!(
            out.rows[2].posted_date,
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
        );
    }

    #[tokio::test]
    async fn templated_paging_stops_on_a_short_page() {
        let fetcher = FakeFetcher::default()
            .with_http("https://gp.go.kr/list?page=1", board_html(4))
            .with_http("https://gp.go.kr/list?page=2", board_html(2))
            .with_http("https://gp.go.kr/list?page=3", board_html(4));
        let ctx = ctx().with_page_concurrency(1);
        let out = scrape_list(&fetcher, &config("https://gp.go.kr/list?page=${i}", None, 3), &ctx).await;

        assert_eq!(out.pages, 2);
        assert_eq!(out.rows.len(), 6);
        assert!(out.error.is_none());
    }

    #[tokio::test]
    async fn failures_after_the_first_page_keep_collected_rows() {
        let fetcher =
            FakeFetcher::default().with_http("https://gp.go.kr/list?page=1", board_html(3));
        let ctx = ctx().with_page_concurrency(1);
        let out = scrape_list(&fetcher, &config("https://gp.go.kr/list?page=${i}", None, 2), &ctx).await;

        assert_eq!(out.rows.len(), 3);
        assert!(out.error.is_none());
    }

    #[tokio::test]
    async fn first_page_failure_is_reported() {
        let fetcher = FakeFetcher::default();
        let out = scrape_list(&fetcher, &config("https://gp.go.kr/list?page=${i}", None, 2), &ctx()).await;
        assert!(out.rows.is_empty());
        assert!(matches!(out.error, Some(ScrapeError::PageAccess { .. })));
    }

    #[tokio::test]
    async fn selector_paging_follows_resolvable_links() {
        let mut first = board_html(3);
        first = first.replace(
            "</body>",
            "<div class=\"paging\"><a href=\"/list?pg=2\">2</a></div></body>",
        );
        let fetcher = FakeFetcher::default()
            .with_http("https://gp.go.kr/list", first)
            .with_http("https://gp.go.kr/list?pg=2", board_html(3));
        let cfg = config(
            "https://gp.go.kr/list",
            Some("//div[@class='paging']/a[text()='${i}']"),
            3,
        );
        let out = scrape_list(&fetcher, &cfg, &ctx()).await;

        assert_eq!(out.pages, 2);
        assert_eq!(out.rows.len(), 6);
        assert_eq!(fetcher.render_count(), 0);
    }

    #[tokio::test]
    async fn http_boards_that_end_early_never_open_the_browser() {
        let fetcher = FakeFetcher::default()
            .with_http("https://gp.go.kr/list?page=1", board_html(3))
            .with_http("https://gp.go.kr/list?page=2", board_html(1))
            .with_http("https://gp.go.kr/list?page=3", board_html(0));
        let out = scrape_list(&fetcher, &config("https://gp.go.kr/list?page=${i}", None, 5), &ctx()).await;

        assert!(out.error.is_none());
        assert_eq!(out.rows.len(), 4);
        assert_eq!(fetcher.render_count(), 0);
    }

    #[tokio::test]
    async fn an_escalated_first_page_keeps_the_browser_for_later_pages() {
        let fetcher = FakeFetcher::default()
            .with_http("https://gp.go.kr/list?page=1", board_html(1))
            .with_browser("https://gp.go.kr/list?page=1", board_html(3))
            .with_browser("https://gp.go.kr/list?page=2", board_html(3))
            .with_browser("https://gp.go.kr/list?page=3", board_html(0));
        let ctx = ctx().with_page_concurrency(1);
        let out = scrape_list(&fetcher, &config("https://gp.go.kr/list?page=${i}", None, 5), &ctx).await;

        assert_eq!(out.rows.len(), 6);
        assert_eq!(out.strategies, vec![FetchStrategy::Browser; 3]);
        assert_eq!(fetcher.render_count(), 3);
        assert_eq!(
            *fetcher.gets.lock().unwrap(),
            vec!["https://gp.go.kr/list?page=1".to_string()]
        );
    }

    #[tokio::test]
    async fn missing_next_page_links_are_reported() {
        let fetcher = FakeFetcher::default().with_http("https://gp.go.kr/list", board_html(3));
        let cfg = config(
            "https://gp.go.kr/list",
            Some("//div[@class='paging']/a[text()='${i}']"),
            3,
        );
        let out = scrape_list(&fetcher, &cfg, &ctx()).await;

        assert!(out.error.is_none());
        assert_eq!(out.rows.len(), 3);
        assert_eq!(out.warnings.len(), 1);
        assert_eq!(out.warnings[0].code(), 220);
    }

    #[tokio::test]
    async fn cancelled_runs_stop_before_fetching() {
        let (handle, signal) = crate::context::cancel_pair();
        handle.cancel();
        let fetcher =
            FakeFetcher::default().with_http("https://gp.go.kr/list?page=1", board_html(3));
        let ctx = ctx().with_cancel(signal);
        let out = scrape_list(&fetcher, &config("https://gp.go.kr/list?page=${i}", None, 1), &ctx).await;
        assert_eq!(out.error, Some(ScrapeError::Cancelled));
        assert!(fetcher.gets.lock().unwrap().is_empty());
    }

    #[test]
    fn onclick_targets_are_extracted() {
        assert_eq!(
            onclick_target("location.href='/list.do?page=3'; return false;"),
            Some("/list.do?page=3")
        );
        assert_eq!(onclick_target("goPage(3)"), None);
    }
}
