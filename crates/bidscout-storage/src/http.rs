use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bidscout_core::{is_quota_or_credential_failure, ScrapeError};
use encoding_rs::{Encoding, UTF_8};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, REFERER};
use reqwest::{RequestBuilder, StatusCode, Url};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";

const ACCEPT_HTML: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";
const ACCEPT_LANGUAGE_KO: &str = "ko-KR,ko;q=0.9,en-US;q=0.8,en;q=0.7";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub global_concurrency: usize,
    pub per_org_concurrency: usize,
    pub backoff: BackoffPolicy,
    /// Many municipal sites serve broken certificate chains.
    pub accept_invalid_certs: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            global_concurrency: 8,
            per_org_concurrency: 2,
            backoff: BackoffPolicy::default(),
            accept_invalid_certs: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub html: String,
    pub byte_size: usize,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid url {url}")]
    InvalidUrl { url: String },
    #[error("timed out after {seconds}s fetching {url}")]
    Timeout { url: String, seconds: u64 },
    #[error("browser fetch failed: {0}")]
    Browser(String),
    #[error("headless browser support is not available in this build")]
    BrowserUnavailable,
    #[error("fetch limiter closed")]
    LimiterClosed,
}

impl FetchError {
    /// Quota and credential rejections are never escalated to the browser.
    pub fn is_quota_or_credential(&self) -> bool {
        match self {
            FetchError::HttpStatus { status, .. } => matches!(status, 401 | 403 | 429),
            other => is_quota_or_credential_failure(&other.to_string()),
        }
    }

    pub fn into_scrape_error(self, url: &str) -> ScrapeError {
        ScrapeError::PageAccess {
            url: url.to_string(),
            message: self.to_string(),
        }
    }
}

/// `scheme://host[:port]` of `url`, sent as the Referer most sites check.
pub fn site_origin(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
        None => format!("{}://{}", parsed.scheme(), host),
    })
}

/// Resolves `href` against `base`. `javascript:` pseudo-links and empty
/// values stay unresolved.
pub fn resolve_url(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.to_ascii_lowercase().starts_with("javascript:") {
        return None;
    }
    if let Ok(absolute) = Url::parse(href) {
        return Some(absolute.to_string());
    }
    Url::parse(base)
        .ok()?
        .join(href)
        .ok()
        .map(|url| url.to_string())
}

/// Decodes a response body using the `Content-Type` charset, falling back to
/// a `<meta charset>` declaration in the first kilobytes, then UTF-8.
pub fn decode_body(bytes: &[u8], content_type: Option<&str>) -> String {
    let from_header = content_type.and_then(charset_label).and_then(|label| {
        Encoding::for_label(label.as_bytes())
    });
    let encoding = from_header.unwrap_or_else(|| {
        let head = &bytes[..bytes.len().min(4096)];
        let head = String::from_utf8_lossy(head).to_ascii_lowercase();
        charset_label(&head)
            .and_then(|label| Encoding::for_label(label.as_bytes()))
            .unwrap_or(UTF_8)
    });
    let (decoded, _, _) = encoding.decode(bytes);
    decoded.into_owned()
}

fn charset_label(text: &str) -> Option<String> {
    let lower = text.to_ascii_lowercase();
    let start = lower.find("charset=")? + "charset=".len();
    let value = lower[start..].trim_start_matches(['"', '\'', ' ']);
    let end = value
        .find(|c: char| c == '"' || c == '\'' || c == ';' || c == '>' || c == '/' || c.is_whitespace())
        .unwrap_or(value.len());
    let label = value[..end].trim();
    (!label.is_empty()).then(|| label.to_string())
}

/// Removes `<script>`/`<style>` elements and HTML comments. Row selectors and
/// text extraction then never see inline code.
pub fn strip_noise(html: &str) -> String {
    let lower = html.to_ascii_lowercase();
    let mut out = String::with_capacity(html.len());
    let mut cursor = 0;

    while cursor < html.len() {
        let next_comment = lower[cursor..].find("<!--").map(|i| (i + cursor, "-->"));
        let next_script = lower[cursor..].find("<script").map(|i| (i + cursor, "</script>"));
        let next_style = lower[cursor..].find("<style").map(|i| (i + cursor, "</style>"));

        let next = [next_comment, next_script, next_style]
            .into_iter()
            .flatten()
            .min_by_key(|(start, _)| *start);

        let Some((start, terminator)) = next else {
            out.push_str(&html[cursor..]);
            break;
        };

        out.push_str(&html[cursor..start]);
        cursor = match lower[start..].find(terminator) {
            Some(offset) => start + offset + terminator.len(),
            None => html.len(),
        };
    }

    out
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_org_limit: usize,
    // Keyed by organization name and never pruned; bounded by the
    // organization list.
    per_org: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_HTML));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static(ACCEPT_LANGUAGE_KO));

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_org_limit: config.per_org_concurrency.max(1),
            per_org: Mutex::new(HashMap::new()),
            backoff: config.backoff,
            timeout: config.timeout,
        })
    }

    async fn per_org_semaphore(&self, org_name: &str) -> Arc<Semaphore> {
        let mut map = self.per_org.lock().await;
        map.entry(org_name.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_org_limit)))
            .clone()
    }

    pub async fn get_html(
        &self,
        run_id: Uuid,
        org_name: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        self.send_with_retry(run_id, org_name, url, |client, parsed| client.get(parsed))
            .await
    }

    /// Form POST used by boards that page through `pageIndex` style fields.
    pub async fn post_form(
        &self,
        run_id: Uuid,
        org_name: &str,
        url: &str,
        form: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        self.send_with_retry(run_id, org_name, url, |client, parsed| {
            client.post(parsed).form(form)
        })
        .await
    }

    async fn send_with_retry<F>(
        &self,
        run_id: Uuid,
        org_name: &str,
        url: &str,
        build: F,
    ) -> Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client, Url) -> RequestBuilder,
    {
        let parsed = Url::parse(url).map_err(|_| FetchError::InvalidUrl {
            url: url.to_string(),
        })?;
        let referer = site_origin(url);

        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;
        let per_org = self.per_org_semaphore(org_name).await;
        let _org = per_org
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;

        let span = info_span!("http_fetch", %run_id, org_name, url);
        self.attempt_until_settled(url, &parsed, referer.as_deref(), &build)
            .instrument(span)
            .await
    }

    async fn attempt_until_settled<F>(
        &self,
        url: &str,
        parsed: &Url,
        referer: Option<&str>,
        build: &F,
    ) -> Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client, Url) -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            let mut request = build(&self.client, parsed.clone());
            if let Some(origin) = referer {
                request = request.header(REFERER, origin);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let content_type = resp
                            .headers()
                            .get(CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        let bytes = resp.bytes().await?;
                        let html = strip_noise(&decode_body(&bytes, content_type.as_deref()));
                        debug!(bytes = bytes.len(), %status, "fetched page");
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            html,
                            byte_size: bytes.len(),
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%status, attempt, "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    if err.is_timeout() {
                        return Err(FetchError::Timeout {
                            url: url.to_string(),
                            seconds: self.timeout.as_secs(),
                        });
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn only_server_errors_and_throttling_retry() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn origin_keeps_scheme_host_and_port() {
        assert_eq!(
            site_origin("https://www.gp.go.kr/portal/bbs/list.do?ptIdx=1").as_deref(),
            Some("https://www.gp.go.kr")
        );
        assert_eq!(
            site_origin("http://10.0.0.5:8080/a").as_deref(),
            Some("http://10.0.0.5:8080")
        );
        assert_eq!(site_origin("not a url"), None);
    }

    #[test]
    fn resolves_relative_links_against_the_page() {
        let base = "https://www.gp.go.kr/portal/bbs/list.do?page=2";
        assert_eq!(
            resolve_url(base, "view.do?id=7").as_deref(),
            Some("https://www.gp.go.kr/portal/bbs/view.do?id=7")
        );
        assert_eq!(
            resolve_url(base, "/dn?f=1").as_deref(),
            Some("https://www.gp.go.kr/dn?f=1")
        );
        assert_eq!(
            resolve_url(base, "https://other.kr/a").as_deref(),
            Some("https://other.kr/a")
        );
        assert_eq!(resolve_url(base, "javascript:goView('7')"), None);
    }

    #[test]
    fn decodes_euc_kr_from_header_and_meta() {
        let (bytes, _, _) = encoding_rs::EUC_KR.encode("입찰공고");
        assert_eq!(
            decode_body(&bytes, Some("text/html; charset=EUC-KR")),
            "입찰공고"
        );

        let mut page = b"<html><head><meta charset=\"euc-kr\"></head><body>".to_vec();
        page.extend_from_slice(&bytes);
        page.extend_from_slice(b"</body></html>");
        assert!(decode_body(&page, Some("text/html")).contains("입찰공고"));
        assert_eq!(decode_body("공고".as_bytes(), None), "공고");
    }

    #[test]
    fn strips_scripts_styles_and_comments() {
        let html = "<div>a<!-- hidden --><SCRIPT type=\"x\">var x = '<td>';</SCRIPT>b<style>td{}</style>c</div>";
        assert_eq!(strip_noise(html), "<div>abc</div>");
        assert_eq!(strip_noise("<p>open<!-- never closed"), "<p>open");
    }

    #[test]
    fn auth_statuses_count_as_credential_failures() {
        let err = FetchError::HttpStatus {
            status: 403,
            url: "https://x".into(),
        };
        assert!(err.is_quota_or_credential());
        let err = FetchError::HttpStatus {
            status: 500,
            url: "https://x".into(),
        };
        assert!(!err.is_quota_or_credential());
    }
}
