use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate};
use regex::Regex;

/// Dates before this year are treated as parse noise.
pub const MIN_POSTED_YEAR: i32 = 2000;

static DATE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{4}|\d{2})\s*[-./년]?\s*(\d{1,2})\s*[-./월]?\s*(\d{1,2})")
        .expect("date pattern compiles")
});

/// Normalizes a scraped posting date into a calendar date.
///
/// The first date-looking run anywhere in the string wins, so labels such as
/// `등록일 2024-03-05` and Korean forms such as `2024년 3월 5일` are read as
/// well as `2024.3.5`, `24/03/05`, `20240305` and `2024-03-05 10:11`. For
/// ranges (`2024.03.05 ~ 2024.03.20`) the start date is used. Strings that are
/// too short, unparsable, before 2000 or in the future resolve to `today`.
pub fn normalize_posted_date(raw: &str, today: NaiveDate) -> NaiveDate {
    let trimmed = raw.trim();
    if trimmed.chars().count() < 5 {
        return today;
    }
    let head = trimmed.split('~').next().unwrap_or(trimmed);

    let parsed = DATE_PATTERN
        .captures(head)
        .and_then(|caps| parse_ymd(&caps[1], &caps[2], &caps[3]));

    match parsed {
        Some(date) if date > today => today,
        Some(date) if date.year() < MIN_POSTED_YEAR => today,
        Some(date) => date,
        None => today,
    }
}

fn parse_ymd(year: &str, month: &str, day: &str) -> Option<NaiveDate> {
    let mut y: i32 = year.parse().ok()?;
    if year.len() == 2 {
        y += 2000;
    }
    NaiveDate::from_ymd_opt(y, month.parse().ok()?, day.parse().ok()?)
}
