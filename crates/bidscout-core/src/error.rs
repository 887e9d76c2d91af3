use thiserror::Error;

/// Coarse category of a scrape failure, stable across message wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConfigurationMissing,
    PageAccess,
    SelectorResolution,
    FieldExtraction,
    RowValidation,
    DataPersistence,
    Cancelled,
    Unknown,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScrapeError {
    #[error("settings for {org_name} unusable: {detail}")]
    ConfigurationMissing { org_name: String, detail: String },
    #[error("page {url} not accessible: {message}")]
    PageAccess { url: String, message: String },
    #[error("selector `{expression}` did not resolve: {message}")]
    SelectorResolution { expression: String, message: String },
    #[error("field {field} extraction failed: {message}")]
    FieldExtraction { field: String, message: String },
    #[error("row rejected ({field}): {message}")]
    RowValidation { field: String, message: String },
    #[error("persistence failed: {0}")]
    DataPersistence(String),
    #[error("run cancelled")]
    Cancelled,
    #[error("{0}")]
    Unknown(String),
}

impl ScrapeError {
    /// Numeric code written to scrape logs.
    pub fn code(&self) -> u16 {
        match self {
            ScrapeError::ConfigurationMissing { .. } => 100,
            ScrapeError::PageAccess { .. } => 200,
            ScrapeError::SelectorResolution { .. } => 220,
            ScrapeError::FieldExtraction { .. } => 300,
            ScrapeError::RowValidation { field, .. } if field == "title" => 301,
            ScrapeError::RowValidation { .. } => 302,
            ScrapeError::DataPersistence(_) => 500,
            ScrapeError::Cancelled => 800,
            ScrapeError::Unknown(_) => 900,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ScrapeError::ConfigurationMissing { .. } => ErrorKind::ConfigurationMissing,
            ScrapeError::PageAccess { .. } => ErrorKind::PageAccess,
            ScrapeError::SelectorResolution { .. } => ErrorKind::SelectorResolution,
            ScrapeError::FieldExtraction { .. } => ErrorKind::FieldExtraction,
            ScrapeError::RowValidation { .. } => ErrorKind::RowValidation,
            ScrapeError::DataPersistence(_) => ErrorKind::DataPersistence,
            ScrapeError::Cancelled => ErrorKind::Cancelled,
            ScrapeError::Unknown(_) => ErrorKind::Unknown,
        }
    }
}

const QUOTA_OR_CREDENTIAL_PATTERNS: &[&str] = &[
    "quota",
    "rate limit",
    "too many requests",
    "429",
    "unauthorized",
    "401",
    "forbidden",
    "invalid api key",
    "api key",
    "service key",
    "credential",
];

/// True when an error message reads like an exhausted quota or a rejected
/// credential. Such failures abort the current run instead of being retried
/// org by org.
pub fn is_quota_or_credential_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    QUOTA_OR_CREDENTIAL_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
}
