//! Core domain model for bidscout: organization settings, scraped rows,
//! persisted notices, category rules and run results.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

mod dates;
mod error;

pub use dates::{normalize_posted_date, MIN_POSTED_YEAR};
pub use error::{is_quota_or_credential_failure, ErrorKind, ScrapeError};

pub const CRATE_NAME: &str = "bidscout-core";

/// Category label given to rows no rule claimed. Never null, never persisted
/// to the main notice table.
pub const UNCATEGORIZED: &str = "무관";

/// Joins multi-valued detail fields (attachment names/URLs). Downstream code
/// splits on it, so it is part of the stored data contract.
pub const MULTI_VALUE_SEPARATOR: &str = "|-";

/// Title keywords marking a notice whose procurement already concluded.
pub const DONE_NOTICE_KEYWORDS: &[&str] = &["결과"];

/// Placeholder substituted with the page number in list URLs and page selectors.
pub const PAGE_PLACEHOLDER: &str = "${i}";

/// Settings row for a list page as it is stored: loosely typed, every
/// expression optional. Validated into [`OrganizationListConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSettingsRecord {
    pub org_name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub iframe: Option<String>,
    #[serde(default, alias = "rowXpath")]
    pub row_xpath: Option<String>,
    #[serde(default)]
    pub paging: Option<String>,
    #[serde(default, alias = "startPage")]
    pub start_page: Option<u32>,
    #[serde(default, alias = "endPage")]
    pub end_page: Option<u32>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub detail_url: Option<String>,
    #[serde(default)]
    pub posted_date: Option<String>,
    #[serde(default)]
    pub posted_by: Option<String>,
    #[serde(default)]
    pub exception_row: Option<String>,
    #[serde(default)]
    pub org_region: Option<String>,
    #[serde(default)]
    pub registration: Option<String>,
    #[serde(default = "default_true", alias = "use")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

/// Field expressions of one list row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFieldExpressions {
    pub title: String,
    pub detail_url: String,
    pub posted_date: Option<String>,
    pub posted_by: Option<String>,
}

impl ListFieldExpressions {
    /// `(field name, expression)` pairs in extraction order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("title", Some(self.title.as_str())),
            ("detail_url", Some(self.detail_url.as_str())),
            ("posted_date", self.posted_date.as_deref()),
            ("posted_by", self.posted_by.as_deref()),
        ]
        .into_iter()
        .filter_map(|(name, expr)| expr.map(|e| (name, e)))
    }
}

/// Validated list-page settings for one organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationListConfig {
    pub org_name: String,
    pub url_template: String,
    pub iframe: Option<String>,
    pub row_xpath: String,
    pub next_page: Option<String>,
    pub start_page: u32,
    pub end_page: u32,
    pub fields: ListFieldExpressions,
    pub exception_row: Option<String>,
    pub org_region: Option<String>,
    pub active: bool,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl OrganizationListConfig {
    pub fn from_record(record: ListSettingsRecord) -> Result<Self, ScrapeError> {
        let org_name = record.org_name.trim().to_string();
        let missing = |what: &str| ScrapeError::ConfigurationMissing {
            org_name: org_name.clone(),
            detail: format!("{what} is not configured"),
        };

        if org_name.is_empty() {
            return Err(missing("org_name"));
        }
        let url_template = non_blank(record.url).ok_or_else(|| missing("url"))?;
        let row_xpath = non_blank(record.row_xpath).ok_or_else(|| missing("row selector"))?;
        let title = non_blank(record.title).ok_or_else(|| missing("title expression"))?;
        let detail_url =
            non_blank(record.detail_url).ok_or_else(|| missing("detail_url expression"))?;

        let start_page = record.start_page.unwrap_or(1).max(1);
        let end_page = record.end_page.unwrap_or(start_page).max(start_page);

        Ok(Self {
            org_name,
            url_template,
            iframe: non_blank(record.iframe),
            row_xpath,
            next_page: non_blank(record.paging),
            start_page,
            end_page,
            fields: ListFieldExpressions {
                title,
                detail_url,
                posted_date: non_blank(record.posted_date),
                posted_by: non_blank(record.posted_by),
            },
            exception_row: non_blank(record.exception_row),
            org_region: non_blank(record.org_region),
            active: record.active,
        })
    }

    pub fn uses_url_placeholder(&self) -> bool {
        self.url_template.contains(PAGE_PLACEHOLDER)
    }

    /// URL for `page`; templates without a placeholder always return the base URL.
    pub fn page_url(&self, page: u32) -> String {
        self.url_template.replace(PAGE_PLACEHOLDER, &page.to_string())
    }

    /// Next-page selector that navigates to `page`, if pagination is selector driven.
    pub fn next_page_selector(&self, page: u32) -> Option<String> {
        if self.uses_url_placeholder() {
            return None;
        }
        self.next_page
            .as_ref()
            .map(|tpl| tpl.replace(PAGE_PLACEHOLDER, &page.to_string()))
    }

    pub fn pages(&self) -> std::ops::RangeInclusive<u32> {
        self.start_page..=self.end_page
    }
}

/// Named fields of a detail page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailField {
    Title,
    BodyHtml,
    FileName,
    FileUrl,
    NoticeDiv,
    NoticeNum,
    OrgDept,
    OrgMan,
    OrgTel,
}

impl DetailField {
    pub const ALL: [DetailField; 9] = [
        DetailField::Title,
        DetailField::BodyHtml,
        DetailField::FileName,
        DetailField::FileUrl,
        DetailField::NoticeDiv,
        DetailField::NoticeNum,
        DetailField::OrgDept,
        DetailField::OrgMan,
        DetailField::OrgTel,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DetailField::Title => "title",
            DetailField::BodyHtml => "body_html",
            DetailField::FileName => "file_name",
            DetailField::FileUrl => "file_url",
            DetailField::NoticeDiv => "notice_div",
            DetailField::NoticeNum => "notice_num",
            DetailField::OrgDept => "org_dept",
            DetailField::OrgMan => "org_man",
            DetailField::OrgTel => "org_tel",
        }
    }

    pub fn is_multi_valued(self) -> bool {
        matches!(self, DetailField::FileName | DetailField::FileUrl)
    }
}

impl fmt::Display for DetailField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings row for a detail page as it is stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailSettingsRecord {
    pub org_name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body_html: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub notice_div: Option<String>,
    #[serde(default)]
    pub notice_num: Option<String>,
    #[serde(default)]
    pub org_dept: Option<String>,
    #[serde(default)]
    pub org_man: Option<String>,
    #[serde(default)]
    pub org_tel: Option<String>,
    #[serde(default = "default_true", alias = "use")]
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationDetailConfig {
    pub org_name: String,
    pub fields: BTreeMap<DetailField, String>,
    pub active: bool,
}

impl OrganizationDetailConfig {
    pub fn from_record(record: DetailSettingsRecord) -> Result<Self, ScrapeError> {
        let org_name = record.org_name.trim().to_string();
        let pairs = [
            (DetailField::Title, record.title),
            (DetailField::BodyHtml, record.body_html),
            (DetailField::FileName, record.file_name),
            (DetailField::FileUrl, record.file_url),
            (DetailField::NoticeDiv, record.notice_div),
            (DetailField::NoticeNum, record.notice_num),
            (DetailField::OrgDept, record.org_dept),
            (DetailField::OrgMan, record.org_man),
            (DetailField::OrgTel, record.org_tel),
        ];
        let fields: BTreeMap<_, _> = pairs
            .into_iter()
            .filter_map(|(field, expr)| non_blank(expr).map(|e| (field, e)))
            .collect();

        if org_name.is_empty() || fields.is_empty() {
            return Err(ScrapeError::ConfigurationMissing {
                org_name,
                detail: "no detail field expressions configured".to_string(),
            });
        }

        Ok(Self {
            org_name,
            fields,
            active: record.active,
        })
    }

    pub fn expression(&self, field: DetailField) -> Option<&str> {
        self.fields.get(&field).map(String::as_str)
    }
}

/// Non-fatal problem attached to a scraped row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowIssue {
    pub code: u16,
    pub message: String,
}

/// One extracted list row, alive between extraction and persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawNoticeRow {
    pub org_name: String,
    pub title: String,
    pub detail_url: String,
    pub posted_date: NaiveDate,
    pub posted_by: String,
    pub scraped_at: DateTime<Utc>,
    pub issue: Option<RowIssue>,
}

impl RawNoticeRow {
    pub fn is_complete(&self) -> bool {
        !self.title.trim().is_empty() && !self.detail_url.trim().is_empty()
    }
}

/// Review status of a stored notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeStatus {
    Normal,
    InProgress,
    Excluded,
    Concluded,
}

/// Operator actions on a stored notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatorAction {
    Start,
    Exclude,
    Restore,
    MarkDone,
}

impl NoticeStatus {
    /// Numeric code used by the `is_selected` column.
    pub fn code(self) -> i16 {
        match self {
            NoticeStatus::Normal => 0,
            NoticeStatus::InProgress => 1,
            NoticeStatus::Excluded => 8,
            NoticeStatus::Concluded => 9,
        }
    }

    pub fn from_code(code: i16) -> Self {
        match code {
            1 => NoticeStatus::InProgress,
            8 => NoticeStatus::Excluded,
            9 => NoticeStatus::Concluded,
            _ => NoticeStatus::Normal,
        }
    }

    /// Every state is re-enterable; there is no terminal state.
    pub fn transition(self, action: OperatorAction) -> Self {
        match action {
            OperatorAction::Start => NoticeStatus::InProgress,
            OperatorAction::Exclude => NoticeStatus::Excluded,
            OperatorAction::Restore => NoticeStatus::Normal,
            OperatorAction::MarkDone => NoticeStatus::Concluded,
        }
    }
}

/// Notice as written to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedNotice {
    pub id: Option<i64>,
    pub org_name: String,
    pub title: String,
    pub detail_url: String,
    pub posted_date: NaiveDate,
    pub posted_by: String,
    pub category: String,
    pub sequence: i64,
    pub status: NoticeStatus,
    pub scraped_at: DateTime<Utc>,
}

/// Title keyword with its score weight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedKeyword {
    pub keyword: String,
    pub weight: i64,
}

impl WeightedKeyword {
    /// Parses `kw1*3, kw2, kw3*2`. Missing weights default to 1. A weight is
    /// read from its leading digits (`3점` is 3); items whose weight has no
    /// leading digits are skipped.
    pub fn parse_list(input: &str) -> Vec<WeightedKeyword> {
        input
            .split(',')
            .filter_map(|item| {
                let mut parts = item.split('*');
                let keyword = parts.next()?.trim();
                if keyword.is_empty() {
                    return None;
                }
                let weight = match parts.next() {
                    Some(w) => leading_integer(w)?,
                    None => 1,
                };
                if parts.next().is_some() {
                    return None;
                }
                Some(WeightedKeyword {
                    keyword: keyword.to_string(),
                    weight,
                })
            })
            .collect()
    }
}

fn leading_integer(text: &str) -> Option<i64> {
    let text = text.trim_start();
    let (sign, digits) = match text.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, text.strip_prefix('+').unwrap_or(text)),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end].parse::<i64>().ok().map(|n| sign * n)
}

/// Category rule as stored: comma-separated keyword strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRuleRecord {
    pub priority: i32,
    pub category: String,
    #[serde(default)]
    pub keywords: String,
    #[serde(default)]
    pub nots: String,
    #[serde(default)]
    pub min_point: i64,
    #[serde(default = "default_true", alias = "use")]
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRule {
    pub priority: i32,
    pub category: String,
    pub keywords: Vec<WeightedKeyword>,
    pub exclusions: Vec<String>,
    pub min_point: i64,
    pub active: bool,
}

impl From<CategoryRuleRecord> for CategoryRule {
    fn from(record: CategoryRuleRecord) -> Self {
        Self {
            priority: record.priority,
            category: record.category.trim().to_string(),
            keywords: WeightedKeyword::parse_list(&record.keywords),
            exclusions: record
                .nots
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect(),
            min_point: record.min_point,
            active: record.active,
        }
    }
}

impl CategoryRule {
    /// Keyword score for `title`, or `None` when an exclusion keyword matches.
    pub fn score(&self, title: &str) -> Option<i64> {
        if self.exclusions.iter().any(|word| title.contains(word.as_str())) {
            return None;
        }
        Some(
            self.keywords
                .iter()
                .filter(|kw| title.contains(kw.keyword.as_str()))
                .map(|kw| kw.weight)
                .sum(),
        )
    }

    pub fn matches(&self, title: &str) -> bool {
        !self.keywords.is_empty()
            && self
                .score(title)
                .is_some_and(|score| score >= self.min_point)
    }
}

pub fn is_done_notice(title: &str) -> bool {
    DONE_NOTICE_KEYWORDS.iter().any(|kw| title.contains(kw))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
    Cancelled,
}

/// Counters and error strings for one run scope (an organization or a date range).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionResult {
    pub scope: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_seen: usize,
    pub collected: usize,
    pub dropped: usize,
    pub new: usize,
    pub inserted: usize,
    pub archived: usize,
    pub error_count: usize,
    pub errors: Vec<String>,
    pub status: RunStatus,
}

impl CollectionResult {
    pub fn new(scope: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            scope: scope.into(),
            started_at,
            finished_at: None,
            total_seen: 0,
            collected: 0,
            dropped: 0,
            new: 0,
            inserted: 0,
            archived: 0,
            error_count: 0,
            errors: Vec::new(),
            status: RunStatus::Success,
        }
    }

    pub fn record_error(&mut self, error: &ScrapeError) {
        self.error_count += 1;
        self.errors
            .push(format!("[{}] {}", error.code(), error));
        self.status = match error.kind() {
            ErrorKind::Cancelled => RunStatus::Cancelled,
            _ => RunStatus::Failed,
        };
    }

    pub fn finish(&mut self, at: DateTime<Utc>) {
        self.finished_at = Some(at);
    }

    /// Folds another scope's counters into this one.
    pub fn absorb(&mut self, other: &CollectionResult) {
        self.total_seen += other.total_seen;
        self.collected += other.collected;
        self.dropped += other.dropped;
        self.new += other.new;
        self.inserted += other.inserted;
        self.archived += other.archived;
        self.error_count += other.error_count;
        self.errors.extend(
            other
                .errors
                .iter()
                .map(|e| format!("{}: {}", other.scope, e)),
        );
        if other.status == RunStatus::Cancelled {
            self.status = RunStatus::Cancelled;
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ListSettingsRecord {
        ListSettingsRecord {
            org_name: "가평군청".to_string(),
            url: Some("https://www.gp.go.kr/board/list?page=${i}".to_string()),
            row_xpath: Some("//table[@class='board']/tbody/tr".to_string()),
            start_page: Some(1),
            end_page: Some(3),
            title: Some("td[2]/a".to_string()),
            detail_url: Some("td[2]/a|-href".to_string()),
            posted_date: Some("td[4]".to_string()),
            active: true,
            ..Default::default()
        }
    }

    #[test]
    fn list_config_requires_row_selector_and_core_fields() {
        let mut rec = record();
        rec.row_xpath = Some("   ".to_string());
        let err = OrganizationListConfig::from_record(rec).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationMissing);

        let mut rec = record();
        rec.detail_url = None;
        assert!(OrganizationListConfig::from_record(rec).is_err());

        let cfg = OrganizationListConfig::from_record(record()).unwrap();
        assert_eq!(cfg.page_url(2), "https://www.gp.go.kr/board/list?page=2");
        assert_eq!(cfg.fields.iter().count(), 3);
        assert_eq!(cfg.next_page_selector(2), None);
    }

    #[test]
    fn page_range_is_clamped() {
        let mut rec = record();
        rec.start_page = Some(0);
        rec.end_page = None;
        let cfg = OrganizationListConfig::from_record(rec).unwrap();
        assert_eq!(cfg.pages(), 1..=1);
    }

    #[test]
    fn next_page_selector_substitutes_target_page() {
        let mut rec = record();
        rec.url = Some("https://example.go.kr/list.do".to_string());
        rec.paging = Some("//div[@class='paging']/a[text()='${i}']".to_string());
        let cfg = OrganizationListConfig::from_record(rec).unwrap();
        assert_eq!(
            cfg.next_page_selector(3).as_deref(),
            Some("//div[@class='paging']/a[text()='3']")
        );
    }

    #[test]
    fn weighted_keywords_default_to_one_and_skip_malformed_weights() {
        let parsed = WeightedKeyword::parse_list("보안*10, 서버 ,점검*x,, 감리*3");
        assert_eq!(
            parsed,
            vec![
                WeightedKeyword { keyword: "보안".into(), weight: 10 },
                WeightedKeyword { keyword: "서버".into(), weight: 1 },
                WeightedKeyword { keyword: "감리".into(), weight: 3 },
            ]
        );
    }

    #[test]
    fn weights_are_read_from_leading_digits() {
        let parsed = WeightedKeyword::parse_list("서버*3점, 보안* 12 , 감리*점3");
        assert_eq!(
            parsed,
            vec![
                WeightedKeyword { keyword: "서버".into(), weight: 3 },
                WeightedKeyword { keyword: "보안".into(), weight: 12 },
            ]
        );
    }

    #[test]
    fn exclusion_disqualifies_rule_regardless_of_score() {
        let rule = CategoryRule::from(CategoryRuleRecord {
            priority: 1,
            category: "성능평가".into(),
            keywords: "성능평가*10".into(),
            nots: "취소, 정정".into(),
            min_point: 5,
            active: true,
        });
        assert!(rule.matches("시설물 성능평가 용역"));
        assert_eq!(rule.score("[취소] 시설물 성능평가 용역"), None);
        assert!(!rule.matches("[취소] 시설물 성능평가 용역"));
    }

    #[test]
    fn status_transitions_follow_operator_actions() {
        let s = NoticeStatus::Normal.transition(OperatorAction::Start);
        assert_eq!(s, NoticeStatus::InProgress);
        let s = s.transition(OperatorAction::Exclude);
        assert_eq!(s.code(), 8);
        assert_eq!(s.transition(OperatorAction::Restore), NoticeStatus::Normal);
        assert_eq!(NoticeStatus::from_code(9), NoticeStatus::Concluded);
    }

    #[test]
    fn detail_config_keeps_only_configured_fields() {
        let cfg = OrganizationDetailConfig::from_record(DetailSettingsRecord {
            org_name: "강남구".into(),
            title: Some("//h3".into()),
            file_url: Some("//ul[@class='files']/li/a|-href".into()),
            body_html: Some(" ".into()),
            active: true,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(cfg.fields.len(), 2);
        assert!(DetailField::FileUrl.is_multi_valued());
        assert_eq!(cfg.expression(DetailField::Title), Some("//h3"));
    }

    #[test]
    fn collection_result_absorbs_scope_errors() {
        let now = Utc::now();
        let mut total = CollectionResult::new("batch", now);
        let mut org = CollectionResult::new("양천구", now);
        org.collected = 4;
        org.record_error(&ScrapeError::PageAccess {
            url: "https://x".into(),
            message: "timeout".into(),
        });
        total.absorb(&org);
        assert_eq!(total.collected, 4);
        assert_eq!(total.error_count, 1);
        assert!(total.errors[0].starts_with("양천구: [200]"));
    }
}
