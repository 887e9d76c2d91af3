use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::http::{FetchError, DEFAULT_USER_AGENT};

/// Pixels per auto-scroll step.
pub const SCROLL_STEP_PX: u32 = 300;
const MAX_SCROLL_STEPS: usize = 40;
/// Share of the render budget held back for closing the browser.
const TEARDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct BrowserPoolConfig {
    /// `CHROMIUM_EXECUTABLE_PATH`; the bundled lookup is used when unset.
    pub executable: Option<PathBuf>,
    pub user_agent: String,
    /// Upper bound for one whole render, launch to teardown.
    pub timeout: Duration,
    /// How long to wait for a row or title selector to appear.
    pub selector_wait: Duration,
    pub max_sessions: usize,
}

impl Default for BrowserPoolConfig {
    fn default() -> Self {
        Self {
            executable: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(60),
            selector_wait: Duration::from_secs(10),
            max_sessions: 2,
        }
    }
}

/// What the browser should do before handing back the DOM.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderRequest {
    pub url: String,
    pub iframe_xpath: Option<String>,
    pub wait_for_xpath: Option<String>,
    /// XPath selectors clicked in order, each followed by a navigation wait.
    pub clicks: Vec<String>,
    pub scroll: bool,
}

impl RenderRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Bounded pool of headless browser sessions. At most `max_sessions` renders
/// run at once, and renders for the same organization never overlap.
#[derive(Debug)]
pub struct BrowserPool {
    config: BrowserPoolConfig,
    sessions: Arc<Semaphore>,
    // One entry per organization ever rendered; the set is the configured
    // organization list, so it is not pruned.
    per_org: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl BrowserPool {
    pub fn new(config: BrowserPoolConfig) -> Self {
        let sessions = Arc::new(Semaphore::new(config.max_sessions.max(1)));
        Self {
            config,
            sessions,
            per_org: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BrowserPoolConfig {
        &self.config
    }

    pub fn is_available(&self) -> bool {
        cfg!(feature = "browser")
    }

    async fn org_lock(&self, org_name: &str) -> Arc<Mutex<()>> {
        let mut map = self.per_org.lock().await;
        map.entry(org_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn render(
        &self,
        run_id: Uuid,
        org_name: &str,
        request: &RenderRequest,
    ) -> Result<String, FetchError> {
        if !self.is_available() {
            return Err(FetchError::BrowserUnavailable);
        }

        let org_lock = self.org_lock(org_name).await;
        let _serial = org_lock.lock().await;
        let _session = self
            .sessions
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;

        let span = info_span!("browser_render", %run_id, org_name, url = %request.url);
        let session = session::render(&self.config, request).instrument(span);
        within(self.config.timeout, &request.url, session).await?
    }
}

/// Caps a whole browser session, so a hung launch or teardown cannot hold a
/// session slot past the render timeout.
async fn within<T>(
    limit: Duration,
    url: &str,
    work: impl Future<Output = T>,
) -> Result<T, FetchError> {
    tokio::time::timeout(limit, work)
        .await
        .map_err(|_| FetchError::Timeout {
            url: url.to_string(),
            seconds: limit.as_secs(),
        })
}

#[cfg(feature = "browser")]
mod session {
    use std::time::Duration;

    use chromiumoxide::browser::{Browser, BrowserConfig};
    use chromiumoxide::error::CdpError;
    use chromiumoxide::Page;
    use futures::StreamExt;
    use reqwest::Url;
    use tracing::{debug, warn};

    use super::{
        within, BrowserPoolConfig, RenderRequest, MAX_SCROLL_STEPS, SCROLL_STEP_PX, TEARDOWN_GRACE,
    };
    use crate::http::FetchError;

    fn cdp(err: CdpError) -> FetchError {
        FetchError::Browser(err.to_string())
    }

    /// Launches a fresh browser, drives it, and tears it down. Driving gets
    /// the render budget minus the teardown grace; dropping the browser
    /// kills the child if the outer deadline cuts teardown short.
    pub(super) async fn render(
        config: &BrowserPoolConfig,
        request: &RenderRequest,
    ) -> Result<String, FetchError> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .arg(format!("--user-agent={}", config.user_agent))
            .arg("--ignore-certificate-errors")
            .arg("--lang=ko-KR")
            .request_timeout(config.timeout);
        if let Some(path) = &config.executable {
            builder = builder.chrome_executable(path);
        }
        let browser_config = builder.build().map_err(FetchError::Browser)?;

        let (mut browser, mut handler) = Browser::launch(browser_config).await.map_err(cdp)?;
        let driver = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let budget = config.timeout.saturating_sub(TEARDOWN_GRACE);
        let outcome = within(budget, &request.url, drive(&browser, config, request)).await;

        let teardown = async {
            if let Err(err) = browser.close().await {
                warn!(error = %err, "browser close failed");
            }
            let _ = browser.wait().await;
        };
        if tokio::time::timeout(TEARDOWN_GRACE, teardown).await.is_err() {
            warn!(url = %request.url, "browser teardown timed out");
        }
        driver.abort();

        outcome?
    }

    async fn drive(
        browser: &Browser,
        config: &BrowserPoolConfig,
        request: &RenderRequest,
    ) -> Result<String, FetchError> {
        let page = browser.new_page(request.url.as_str()).await.map_err(cdp)?;
        let _ = page.wait_for_navigation().await;

        if let Some(iframe) = &request.iframe_xpath {
            let frame = page.find_xpath(iframe.as_str()).await.map_err(cdp)?;
            if let Some(src) = frame.attribute("src").await.map_err(cdp)? {
                let target = Url::parse(&request.url)
                    .and_then(|base| base.join(&src))
                    .map_err(|_| FetchError::InvalidUrl { url: src.clone() })?;
                debug!(%target, "entering iframe");
                page.goto(target.as_str()).await.map_err(cdp)?;
                let _ = page.wait_for_navigation().await;
            }
        }

        for selector in &request.clicks {
            let element = page.find_xpath(selector.as_str()).await.map_err(cdp)?;
            element.click().await.map_err(cdp)?;
            let _ = page.wait_for_navigation().await;
        }

        if let Some(xpath) = &request.wait_for_xpath {
            if !wait_for_xpath(&page, xpath, config.selector_wait).await {
                debug!(xpath = %xpath, "selector never appeared, using DOM as is");
            }
        }

        if request.scroll {
            auto_scroll(&page).await;
        }

        let html = page.content().await.map_err(cdp)?;
        let _ = page.close().await;
        Ok(html)
    }

    async fn wait_for_xpath(page: &Page, xpath: &str, limit: Duration) -> bool {
        tokio::time::timeout(limit, async {
            loop {
                if page.find_xpath(xpath).await.is_ok() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        })
        .await
        .is_ok()
    }

    async fn auto_scroll(page: &Page) {
        let step = format!("window.scrollBy(0, {SCROLL_STEP_PX}); (window.innerHeight + window.scrollY) >= document.body.scrollHeight");
        for _ in 0..MAX_SCROLL_STEPS {
            let at_bottom = match page.evaluate(step.as_str()).await {
                Ok(result) => result.into_value::<bool>().unwrap_or(true),
                Err(_) => true,
            };
            if at_bottom {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[cfg(not(feature = "browser"))]
mod session {
    use super::{BrowserPoolConfig, RenderRequest};
    use crate::http::FetchError;

    pub(super) async fn render(
        _config: &BrowserPoolConfig,
        _request: &RenderRequest,
    ) -> Result<String, FetchError> {
        Err(FetchError::BrowserUnavailable)
    }
}
