use std::time::Duration;

use chrono::NaiveDate;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::sync::buckets::plan_buckets;
use crate::sync::document::MergedDocument;
use crate::sync::rate_limit::{is_429, RateLimiter};
use crate::vendor::{Period, ProfileSnapshot, VendorAdapter, VendorClient, VendorResponse};

/// Everything one fetch pass needs besides the document itself.
pub struct FetchContext<'a> {
    pub adapter: &'a dyn VendorAdapter,
    pub client: &'a dyn VendorClient,
    pub limiter: &'a RateLimiter,
    pub oh_id: &'a str,
    pub access_token: &'a str,
    pub today: NaiveDate,
    /// Store non-200 bodies as bucket data instead of leaving the bucket pending.
    pub store_error_responses: bool,
}

/// How a fetch pass ended.
#[derive(Debug)]
pub enum FetchOutcome {
    Complete,
    /// A realm hit its quota; the rest of the pass was abandoned.
    RateLimited { realm: String, retry_after: Duration },
    Failed(Error),
}

#[derive(Debug)]
pub struct FetchReport {
    pub outcome: FetchOutcome,
    pub requests: u64,
    pub buckets_fetched: u64,
    pub buckets_skipped: u64,
    pub buckets_failed: u64,
    /// The freshly fetched profile, when the pass got that far.
    pub profile: Option<ProfileSnapshot>,
}

#[derive(Debug, Default)]
struct Counters {
    requests: u64,
    fetched: u64,
    skipped: u64,
    failed: u64,
}

struct Pass<'c, 'a> {
    ctx: &'c FetchContext<'a>,
    realms: [String; 2],
    authorization: String,
    counters: Counters,
    profile: Option<ProfileSnapshot>,
}

/// Bring `doc` up to date: refresh the profile, re-fetch period-none
/// endpoints, then fetch every missing or still-open bucket of the yearly
/// endpoints and after them the monthly ones, oldest first. Whatever was merged before a failure stays in `doc`.
pub async fn fetch_all(ctx: &FetchContext<'_>, doc: &mut MergedDocument) -> FetchReport {
    let mut pass = Pass {
        ctx,
        realms: [ctx.adapter.global_realm(), ctx.adapter.user_realm(ctx.oh_id)],
        authorization: ctx.adapter.auth_header(ctx.access_token),
        counters: Counters::default(),
        profile: None,
    };

    let outcome = match pass.run(doc).await {
        Ok(()) => FetchOutcome::Complete,
        Err(Error::RateLimited { realm, retry_after }) => {
            log::info!(
                "Rate limit reached in realm {realm} for member {} after {} requests",
                ctx.oh_id,
                pass.counters.requests
            );
            FetchOutcome::RateLimited { realm, retry_after }
        }
        Err(e) => {
            log::warn!("Fetch for member {} stopped: {e}", ctx.oh_id);
            FetchOutcome::Failed(e)
        }
    };

    FetchReport {
        outcome,
        requests: pass.counters.requests,
        buckets_fetched: pass.counters.fetched,
        buckets_skipped: pass.counters.skipped,
        buckets_failed: pass.counters.failed,
        profile: pass.profile,
    }
}

impl Pass<'_, '_> {
    async fn run(&mut self, doc: &mut MergedDocument) -> Result<()> {
        let adapter = self.ctx.adapter;
        let catalog = adapter.catalog();

        let resp = self.get(&adapter.profile_url()).await?;
        if !resp.is_success() {
            return Err(Error::Vendor(format!("profile request returned HTTP {}", resp.status)));
        }
        let profile = adapter.parse_profile(&resp.json()?)?;

        if let Some(previous) = doc.profile_id() {
            if previous != profile.encoded_id {
                log::info!(
                    "Member {} is now linked to {} account {} (was {previous}), discarding stored data",
                    self.ctx.oh_id,
                    adapter.tag(),
                    profile.encoded_id
                );
                doc.reset(catalog);
            }
        }
        doc.set_profile(&profile)?;
        let anchor = profile.anchor_date()?;
        let user_id = profile.encoded_id.clone();
        self.profile = Some(profile);

        for ep in catalog.iter().filter(|ep| ep.period == Period::None) {
            let url = adapter.endpoint_url(ep, &user_id, None);
            if let Some(value) = self.fetch_value(&url, ep.name).await? {
                doc.set_entry(ep.name, value);
                self.counters.fetched += 1;
            }
        }

        // Yearly series before monthly ones, each group in catalog order.
        for period in [Period::Year, Period::Month] {
            for ep in catalog.iter().filter(|ep| ep.period == period) {
                let plan = {
                    let empty = Map::new();
                    let existing = doc.buckets(ep.name).unwrap_or(&empty);
                    plan_buckets(ep.period, anchor, self.ctx.today, existing)
                };
                self.counters.skipped += plan.skipped.len() as u64;

                for bucket in plan.fetch {
                    let url = adapter.endpoint_url(ep, &user_id, Some(&bucket.range));
                    let label = format!("{} {}", ep.name, bucket.key);
                    if let Some(value) = self.fetch_value(&url, &label).await? {
                        doc.set_bucket(ep.name, &bucket.key, value);
                        self.counters.fetched += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// One rate-limited GET. A vendor 429 counts as hitting the global realm.
    async fn get(&mut self, url: &str) -> Result<VendorResponse> {
        let [global, user] = &self.realms;
        self.ctx.limiter.acquire(&[global.as_str(), user.as_str()])?;
        self.counters.requests += 1;

        log::debug!("GET {url}");
        let resp = self.ctx.client.get(url, &self.authorization).await?;
        if is_429(resp.status) {
            log::warn!("{} answered 429 Too Many Requests", self.ctx.adapter.tag());
            return Err(Error::RateLimited {
                realm: global.clone(),
                retry_after: Duration::ZERO,
            });
        }
        Ok(resp)
    }

    async fn fetch_value(&mut self, url: &str, label: &str) -> Result<Option<Value>> {
        let resp = self.get(url).await?;
        if resp.is_success() {
            return resp.json().map(Some);
        }
        if self.ctx.store_error_responses {
            log::warn!("{label}: HTTP {} body stored as data", resp.status);
            return resp.json().map(Some);
        }
        log::warn!("{label}: HTTP {}, left for the next sync", resp.status);
        self.counters.failed += 1;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testing::FakeVendor;
    use crate::vendor::fitbit::CATALOG;
    use crate::vendor::FitbitAdapter;
    use serde_json::json;

    const HOUR: Duration = Duration::from_secs(3600);
    const YEAR_ENDPOINTS: u64 = 18;
    const MONTH_ENDPOINTS: u64 = 3;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 6, 1).unwrap()
    }

    fn ctx<'a>(
        adapter: &'a FitbitAdapter,
        vendor: &'a FakeVendor,
        limiter: &'a RateLimiter,
        store_error_responses: bool,
    ) -> FetchContext<'a> {
        FetchContext {
            adapter,
            client: vendor,
            limiter,
            oh_id: "1001",
            access_token: "vendor-access",
            today: today(),
            store_error_responses,
        }
    }

    fn keys(doc: &MergedDocument, name: &str) -> Vec<String> {
        doc.buckets(name).unwrap().keys().cloned().collect()
    }

    #[tokio::test]
    async fn test_first_pass_covers_every_bucket() {
        let adapter = FitbitAdapter::default();
        let vendor = FakeVendor::new("ABC123", "2020-03-15");
        let limiter = RateLimiter::new();
        let mut doc = MergedDocument::skeleton(CATALOG);

        let report = fetch_all(&ctx(&adapter, &vendor, &limiter, true), &mut doc).await;
        assert!(matches!(report.outcome, FetchOutcome::Complete));

        // profile + overview + 16 months x 3 + 2 years x 18
        assert_eq!(report.requests, 1 + 1 + 16 * MONTH_ENDPOINTS + 2 * YEAR_ENDPOINTS);
        assert_eq!(report.buckets_fetched, report.requests - 1);
        assert_eq!(report.buckets_skipped, 0);
        assert_eq!(report.profile.as_ref().unwrap().encoded_id, "ABC123");

        assert_eq!(doc.profile_id(), Some("ABC123"));
        assert_eq!(keys(&doc, "tracker-steps"), ["2020", "2021"]);
        let months = keys(&doc, "heart");
        assert_eq!(months.len(), 16);
        assert_eq!(months.first().map(String::as_str), Some("2020-03"));
        assert_eq!(months.last().map(String::as_str), Some("2021-06"));
        assert!(months.contains(&"2020-12".to_string()) && months.contains(&"2021-01".to_string()));
        assert!(doc.get("activities-overview").unwrap()["url"]
            .as_str()
            .unwrap()
            .ends_with("/1/user/ABC123/activities.json"));

        // profile, overview, every yearly series, then the monthly ones
        let calls = vendor.calls();
        assert!(calls[0].ends_with("/-/profile.json"));
        assert!(calls[1].ends_with("/activities.json"));
        assert!(calls[2].ends_with("/activities/tracker/calories/date/2020-01-01/2020-12-31.json"));
        let first_month = (2 + 2 * YEAR_ENDPOINTS) as usize;
        assert!(calls[first_month - 1].ends_with("/sleep/timeInBed/date/2021-01-01/2021-12-31.json"));
        assert!(calls[first_month].ends_with("/activities/heart/date/2020-03-01/2020-03-31.json"));
        assert!(calls.last().unwrap().ends_with("/body/log/weight/date/2021-06-01/2021-06-30.json"));
    }

    #[tokio::test]
    async fn test_second_pass_only_reopens_latest_buckets() {
        let adapter = FitbitAdapter::default();
        let vendor = FakeVendor::new("ABC123", "2020-03-15");
        let limiter = RateLimiter::new();
        let mut doc = MergedDocument::skeleton(CATALOG);
        fetch_all(&ctx(&adapter, &vendor, &limiter, true), &mut doc).await;
        let first = doc.clone();
        vendor.clear_calls();

        let report = fetch_all(&ctx(&adapter, &vendor, &limiter, true), &mut doc).await;
        assert!(matches!(report.outcome, FetchOutcome::Complete));
        assert_eq!(report.requests, 1 + 1 + MONTH_ENDPOINTS + YEAR_ENDPOINTS);
        assert_eq!(report.buckets_skipped, 15 * MONTH_ENDPOINTS + YEAR_ENDPOINTS);
        assert!(vendor.calls().iter().all(|u| !u.contains("2020-")));

        for ep in CATALOG.iter().filter(|e| e.period != Period::None) {
            let before = first.buckets(ep.name).unwrap();
            let after = doc.buckets(ep.name).unwrap();
            assert_eq!(before.keys().collect::<Vec<_>>(), after.keys().collect::<Vec<_>>());
            let latest = before.keys().max().unwrap();
            for (key, value) in before {
                if key == latest {
                    assert_ne!(&after[key], value, "{} {key} not refreshed", ep.name);
                } else {
                    assert_eq!(&after[key], value, "{} {key} changed", ep.name);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_empty_bucket_is_refetched() {
        let adapter = FitbitAdapter::default();
        let vendor = FakeVendor::new("ABC123", "2020-03-15");
        let limiter = RateLimiter::new();
        let mut doc = MergedDocument::skeleton(CATALOG);
        doc.set_bucket("weight", "2020", json!({}));
        doc.set_bucket("weight", "2021", json!({"body-weight": [{"value": 80}]}));

        fetch_all(&ctx(&adapter, &vendor, &limiter, true), &mut doc).await;
        let weight = doc.buckets("weight").unwrap();
        assert!(weight["2020"]["url"].as_str().unwrap().contains("2020-01-01/2020-12-31"));
        assert!(weight["2021"]["url"].is_string());
    }

    #[tokio::test]
    async fn test_identity_change_discards_stored_buckets() {
        let adapter = FitbitAdapter::default();
        let vendor = FakeVendor::new("NEW456", "2020-03-15");
        let limiter = RateLimiter::new();

        let stored = json!({
            "profile": {"encodedId": "OLD999", "memberSince": "2015-01-01"},
            "weight": {"2015": {"body-weight": [1]}, "2021": {"body-weight": [2]}},
            "heart": {"2015-01": {"activities-heart": []}},
        });
        let mut doc = MergedDocument::from_value(stored, CATALOG).unwrap();

        let report = fetch_all(&ctx(&adapter, &vendor, &limiter, true), &mut doc).await;
        assert!(matches!(report.outcome, FetchOutcome::Complete));
        assert_eq!(report.buckets_skipped, 0);
        assert_eq!(doc.profile_id(), Some("NEW456"));
        assert_eq!(keys(&doc, "weight"), ["2020", "2021"]);
        assert!(doc.buckets("weight").unwrap()["2021"]["url"].is_string());
        assert!(!keys(&doc, "heart").contains(&"2015-01".to_string()));
    }

    #[tokio::test]
    async fn test_rate_limit_stops_pass_and_keeps_progress() {
        let adapter = FitbitAdapter::default();
        let vendor = FakeVendor::new("ABC123", "2020-03-15");
        let limiter = RateLimiter::new();
        limiter.register_realm("fitbit-1001", 10, HOUR);
        let mut doc = MergedDocument::skeleton(CATALOG);

        let report = fetch_all(&ctx(&adapter, &vendor, &limiter, true), &mut doc).await;
        match &report.outcome {
            FetchOutcome::RateLimited { realm, retry_after } => {
                assert_eq!(realm, "fitbit-1001");
                assert!(*retry_after <= HOUR);
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
        assert_eq!(report.requests, 10);
        assert_eq!(vendor.calls().len(), 10);
        assert_eq!(report.buckets_fetched, 9);

        // profile, overview, then two years each of the first four yearly series
        assert_eq!(doc.profile_id(), Some("ABC123"));
        assert_eq!(keys(&doc, "tracker-floors"), ["2020", "2021"]);
        assert!(keys(&doc, "tracker-minutes-fairly-active").is_empty());
        assert!(keys(&doc, "heart").is_empty());
        assert_eq!(limiter.remaining("fitbit-1001"), Some(0));
    }

    #[tokio::test]
    async fn test_vendor_429_is_rate_limited() {
        let adapter = FitbitAdapter::default();
        let vendor = FakeVendor::new("ABC123", "2020-03-15");
        vendor.respond("/activities/heart/", 429, r#"{"errors":[{"errorType":"system"}]}"#);
        let limiter = RateLimiter::new();
        let mut doc = MergedDocument::skeleton(CATALOG);

        let report = fetch_all(&ctx(&adapter, &vendor, &limiter, true), &mut doc).await;
        assert!(matches!(
            report.outcome,
            FetchOutcome::RateLimited { ref realm, .. } if realm == "Fitbit"
        ));
        assert_eq!(report.requests, 2 + 2 * YEAR_ENDPOINTS + 1);
        assert_eq!(keys(&doc, "time-in-bed").len(), 2);
        assert!(keys(&doc, "heart").is_empty());
    }

    #[tokio::test]
    async fn test_error_bodies_stored_by_default() {
        let adapter = FitbitAdapter::default();
        let vendor = FakeVendor::new("ABC123", "2020-03-15");
        vendor.respond("/body/weight/", 500, r#"{"errors":[{"errorType":"system"}]}"#);
        let limiter = RateLimiter::new();
        let mut doc = MergedDocument::skeleton(CATALOG);

        let report = fetch_all(&ctx(&adapter, &vendor, &limiter, true), &mut doc).await;
        assert!(matches!(report.outcome, FetchOutcome::Complete));
        assert_eq!(report.buckets_failed, 0);
        let weight = doc.buckets("weight").unwrap();
        assert_eq!(weight.len(), 2);
        assert_eq!(weight["2020"]["errors"][0]["errorType"], "system");
    }

    #[tokio::test]
    async fn test_error_bodies_left_pending_when_disabled() {
        let adapter = FitbitAdapter::default();
        let vendor = FakeVendor::new("ABC123", "2020-03-15");
        vendor.respond("/body/weight/", 500, r#"{"errors":[{"errorType":"system"}]}"#);
        let limiter = RateLimiter::new();
        let mut doc = MergedDocument::skeleton(CATALOG);

        let report = fetch_all(&ctx(&adapter, &vendor, &limiter, false), &mut doc).await;
        assert!(matches!(report.outcome, FetchOutcome::Complete));
        assert_eq!(report.buckets_failed, 2);
        assert!(keys(&doc, "weight").is_empty());
        assert_eq!(keys(&doc, "tracker-steps").len(), 2);
    }

    #[tokio::test]
    async fn test_non_json_body_fails_pass() {
        let adapter = FitbitAdapter::default();
        let vendor = FakeVendor::new("ABC123", "2020-03-15");
        vendor.respond("/body/weight/", 502, "<html>Bad Gateway</html>");
        let limiter = RateLimiter::new();
        let mut doc = MergedDocument::skeleton(CATALOG);

        let report = fetch_all(&ctx(&adapter, &vendor, &limiter, true), &mut doc).await;
        assert!(matches!(report.outcome, FetchOutcome::Failed(Error::Vendor(_))));
        // Everything before the failing endpoint is kept
        assert_eq!(keys(&doc, "tracker-steps").len(), 2);
        assert!(keys(&doc, "weight").is_empty());
        assert!(keys(&doc, "sleep-awakenings").is_empty());
        assert!(keys(&doc, "heart").is_empty());
        assert_eq!(doc.profile_id(), Some("ABC123"));
    }

    #[tokio::test]
    async fn test_profile_failure_leaves_document_untouched() {
        let adapter = FitbitAdapter::default();
        let vendor = FakeVendor::new("ABC123", "2020-03-15");
        vendor.respond("/-/profile.json", 401, r#"{"errors":[{"errorType":"expired_token"}]}"#);
        let limiter = RateLimiter::new();
        let mut doc = MergedDocument::skeleton(CATALOG);

        let report = fetch_all(&ctx(&adapter, &vendor, &limiter, true), &mut doc).await;
        assert!(matches!(report.outcome, FetchOutcome::Failed(Error::Vendor(_))));
        assert!(report.profile.is_none());
        assert_eq!(report.requests, 1);
        assert_eq!(doc, MergedDocument::skeleton(CATALOG));
    }

    #[tokio::test]
    async fn test_anchor_after_today_fetches_no_buckets() {
        let adapter = FitbitAdapter::default();
        let vendor = FakeVendor::new("ABC123", "2022-01-01");
        let limiter = RateLimiter::new();
        let mut doc = MergedDocument::skeleton(CATALOG);

        let report = fetch_all(&ctx(&adapter, &vendor, &limiter, true), &mut doc).await;
        assert!(matches!(report.outcome, FetchOutcome::Complete));
        assert_eq!(report.requests, 2);
        assert!(keys(&doc, "heart").is_empty());
    }
}
