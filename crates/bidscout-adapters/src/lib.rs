//! Extraction and scraping for bidscout: an XPath 1.0 subset over `scraper`'s
//! DOM, field expressions with sandboxed post-processing, the HTTP/browser
//! fetch escalation, and the list and detail scrapers built on them.

mod callback;
mod context;
mod detail;
mod expression;
mod extract;
mod fetch;
mod list;
mod xpath;

pub use callback::{Callback, CallbackError};
pub use context::{cancel_pair, CancelHandle, CancelSignal, ScrapeContext};
pub use detail::{scrape_detail, DetailScrape};
pub use expression::{FieldExpression, PostProcess, Target};
pub use extract::{
    collapse_whitespace, extract_attachments, extract_field, is_truthy, Extracted,
    FieldDiagnostic,
};
pub use fetch::{
    fetch_page, is_sufficient, FetchLayer, FetchMode, FetchPlan, FetchStrategy, FetchedPage,
    PageFetcher, Sufficiency, MIN_HTML_BYTES, MIN_LIST_ROWS, MIN_TITLE_CHARS,
};
pub use list::{scrape_list, ListScrape};
pub use xpath::{Value, XDocument, XNode, XPath, XPathError};

pub const CRATE_NAME: &str = "bidscout-adapters";
