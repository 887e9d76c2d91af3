use std::sync::Arc;

use bidscout_core::{
    is_done_notice, CategoryRule, CategoryRuleRecord, NoticeStatus, PersistedNotice, RawNoticeRow,
    UNCATEGORIZED,
};

/// A scraped row with its category and initial status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedRow {
    pub row: RawNoticeRow,
    pub category: String,
    pub status: NoticeStatus,
}

impl ClassifiedRow {
    pub fn is_uncategorized(&self) -> bool {
        self.category == UNCATEGORIZED
    }

    pub fn into_notice(self, sequence: i64) -> PersistedNotice {
        PersistedNotice {
            id: None,
            org_name: self.row.org_name,
            title: self.row.title,
            detail_url: self.row.detail_url,
            posted_date: self.row.posted_date,
            posted_by: self.row.posted_by,
            category: self.category,
            sequence,
            status: self.status,
            scraped_at: self.row.scraped_at,
        }
    }
}

/// Active rules in evaluation order, loaded once per run and shared read-only.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Arc<[CategoryRule]>,
}

impl RuleSet {
    pub fn from_records(records: Vec<CategoryRuleRecord>) -> Self {
        let mut rules: Vec<CategoryRule> = records
            .into_iter()
            .map(CategoryRule::from)
            .filter(|r| r.active)
            .collect();
        // Stable: equal priorities keep their stored order.
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self {
            rules: rules.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Category of the first rule that claims `title`.
    pub fn category_for(&self, title: &str) -> &str {
        self.rules
            .iter()
            .find(|rule| rule.matches(title))
            .map(|rule| rule.category.as_str())
            .unwrap_or(UNCATEGORIZED)
    }

    pub fn classify(&self, rows: Vec<RawNoticeRow>) -> Vec<ClassifiedRow> {
        rows.into_iter()
            .map(|row| {
                let category = self.category_for(&row.title).to_string();
                let status = if is_done_notice(&row.title) {
                    NoticeStatus::Concluded
                } else {
                    NoticeStatus::Normal
                };
                ClassifiedRow {
                    row,
                    category,
                    status,
                }
            })
            .collect()
    }
}
