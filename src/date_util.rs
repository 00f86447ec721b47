use chrono::{Duration, NaiveDate};

use crate::error::{Error, Result};

/// Get the last day of a given month.
pub fn last_day_of_month(year: i32, month: u32) -> NaiveDate {
    if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1).unwrap() - Duration::days(1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1).unwrap() - Duration::days(1)
    }
}

/// First and last day of a calendar year.
pub fn year_bounds(year: i32) -> (NaiveDate, NaiveDate) {
    (
        NaiveDate::from_ymd_opt(year, 1, 1).unwrap(),
        NaiveDate::from_ymd_opt(year, 12, 31).unwrap(),
    )
}

/// First and last day of a calendar month.
pub fn month_bounds(year: i32, month: u32) -> (NaiveDate, NaiveDate) {
    (
        NaiveDate::from_ymd_opt(year, month, 1).unwrap(),
        last_day_of_month(year, month),
    )
}

/// The month after (year, month).
pub fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

/// Parse a `YYYY-MM-DD` date. Anything after the first ten characters
/// (a time component, for instance) is ignored.
pub fn parse_iso_date(s: &str) -> Result<NaiveDate> {
    let s = s.trim();
    let head = s.get(..10).unwrap_or(s);
    NaiveDate::parse_from_str(head, "%Y-%m-%d")
        .map_err(|e| Error::Other(format!("invalid date '{s}': {e}")))
}

pub fn iso(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}
