use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate};
use regex::Regex;
use serde_json::{Map, Value};

use crate::date_util::{month_bounds, next_month, year_bounds};
use crate::vendor::Period;

static RE_YEAR_KEY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{4}$").unwrap());
static RE_MONTH_KEY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}$").unwrap());

/// A date range [start, end] inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// One time slice of a period endpoint, keyed `YYYY` or `YYYY-MM`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub key: String,
    pub range: DateRange,
}

/// Which buckets of one endpoint to fetch this pass, and which to leave alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketPlan {
    pub fetch: Vec<Bucket>,
    pub skipped: Vec<String>,
}

/// Every bucket from the anchor's period through today's, oldest first.
/// Empty when the anchor lies after today.
pub fn enumerate_buckets(period: Period, anchor: NaiveDate, today: NaiveDate) -> Vec<Bucket> {
    let mut buckets = Vec::new();
    match period {
        Period::None => {}
        Period::Year => {
            for year in anchor.year()..=today.year() {
                let (start, end) = year_bounds(year);
                buckets.push(Bucket {
                    key: format!("{year:04}"),
                    range: DateRange { start, end },
                });
            }
        }
        Period::Month => {
            let last = (today.year(), today.month());
            let (mut year, mut month) = (anchor.year(), anchor.month());
            while (year, month) <= last {
                let (start, end) = month_bounds(year, month);
                buckets.push(Bucket {
                    key: format!("{year:04}-{month:02}"),
                    range: DateRange { start, end },
                });
                (year, month) = next_month(year, month);
            }
        }
    }
    buckets
}

/// Treat `null`, `""`, `{}` and `[]` as "no data".
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn is_bucket_key(period: Period, key: &str) -> bool {
    match period {
        Period::None => false,
        Period::Year => RE_YEAR_KEY.is_match(key),
        Period::Month => RE_MONTH_KEY.is_match(key),
    }
}

/// The newest bucket key already stored for an endpoint. Keys of the same
/// shape sort chronologically as strings.
pub fn latest_recorded(period: Period, existing: &Map<String, Value>) -> Option<&str> {
    existing
        .keys()
        .filter(|k| is_bucket_key(period, k))
        .max()
        .map(String::as_str)
}

/// Decide which buckets to fetch. A bucket is left alone when it already
/// holds data and is not the newest recorded bucket; the newest one is still
/// accumulating and is always refreshed.
pub fn plan_buckets(
    period: Period,
    anchor: NaiveDate,
    today: NaiveDate,
    existing: &Map<String, Value>,
) -> BucketPlan {
    let latest = latest_recorded(period, existing);
    let mut plan = BucketPlan::default();

    for bucket in enumerate_buckets(period, anchor, today) {
        let have_data = existing
            .get(&bucket.key)
            .is_some_and(|v| !is_empty_value(v));
        let is_latest = latest == Some(bucket.key.as_str());

        if have_data && !is_latest {
            plan.skipped.push(bucket.key);
        } else {
            plan.fetch.push(bucket);
        }
    }
    plan
}
