use std::sync::Arc;

use chrono::Utc;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::oauth::{Provider, TokenRefresher};
use crate::openhumans::StorageService;
use crate::storage::repository::{self, Member};
use crate::storage::Database;
use crate::sync::engine::{self, FetchContext, FetchOutcome};
use crate::sync::rate_limit::RateLimiter;
use crate::sync::retry::RetryScheduler;
use crate::sync::{loader, upload, SyncOptions, SyncReport, SyncStatus};
use crate::vendor::{VendorAdapter, VendorClient};

/// Runs the full sync job for members: tokens, existing data, fetch, upload.
#[derive(Clone)]
pub struct Syncer {
    db: Database,
    adapter: Arc<dyn VendorAdapter>,
    vendor: Arc<dyn VendorClient>,
    storage: Arc<dyn StorageService>,
    tokens: TokenRefresher,
    limiter: RateLimiter,
    scheduler: Arc<dyn RetryScheduler>,
}

impl Syncer {
    pub fn new(
        db: Database,
        adapter: Arc<dyn VendorAdapter>,
        vendor: Arc<dyn VendorClient>,
        storage: Arc<dyn StorageService>,
        tokens: TokenRefresher,
        limiter: RateLimiter,
        scheduler: Arc<dyn RetryScheduler>,
    ) -> Self {
        Self {
            db,
            adapter,
            vendor,
            storage,
            tokens,
            limiter,
            scheduler,
        }
    }

    pub fn adapter(&self) -> &dyn VendorAdapter {
        self.adapter.as_ref()
    }

    pub fn storage(&self) -> &dyn StorageService {
        self.storage.as_ref()
    }

    pub fn tokens(&self) -> &TokenRefresher {
        &self.tokens
    }

    async fn load_member(&self, oh_id: &str) -> Result<Member> {
        let id = oh_id.to_string();
        self.db
            .reader()
            .call(move |conn| repository::get_member(conn, &id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("member {oh_id}")))
    }

    fn register_realms(&self, settings: &Settings, oh_id: &str) {
        self.limiter.register_realm(
            &self.adapter.global_realm(),
            settings.global_max_requests,
            settings.global_timespan,
        );
        self.limiter.register_realm(
            &self.adapter.user_realm(oh_id),
            settings.realm_max_requests,
            settings.realm_timespan,
        );
    }

    /// Sync one member and record the run. Failures inside the job end up
    /// in the report; only a missing member or a database error is an `Err`.
    pub async fn sync_member(&self, oh_id: &str, options: &SyncOptions) -> Result<SyncReport> {
        let mut member = self.load_member(oh_id).await?;
        let settings = Settings::load(&self.db).await?;
        self.register_realms(&settings, oh_id);

        let run_id = {
            let id = oh_id.to_string();
            self.db
                .writer()
                .call(move |conn| repository::insert_sync_run(conn, &id))
                .await?
        };

        log::info!("Syncing {} data for member {oh_id}", self.adapter.tag());
        let mut report = SyncReport::new(oh_id, SyncStatus::Failed);
        if let Err(e) = self.run(&mut member, &settings, options, &mut report).await {
            log::warn!("Sync for member {oh_id} failed: {e}");
            report.fail(&e);
        }

        let finished = report.clone();
        self.db
            .writer()
            .call(move |conn| repository::finish_sync_run(conn, run_id, &finished.totals()))
            .await?;

        log::info!(
            "Member {oh_id}: {} ({} requests, {} fetched, {} skipped, {} failed)",
            report.status,
            report.requests,
            report.buckets_fetched,
            report.buckets_skipped,
            report.buckets_failed
        );
        Ok(report)
    }

    async fn run(
        &self,
        member: &mut Member,
        settings: &Settings,
        options: &SyncOptions,
        report: &mut SyncReport,
    ) -> Result<()> {
        let vendor_token = self
            .tokens
            .get_valid_access_token(member, Provider::Vendor)
            .await?;
        let oh_token = self
            .tokens
            .get_valid_access_token(member, Provider::OpenHumans)
            .await?;

        let existing = loader::load_existing(self.storage(), self.adapter(), &oh_token).await?;
        let mut doc = existing.document;

        let ctx = FetchContext {
            adapter: self.adapter(),
            client: self.vendor.as_ref(),
            limiter: &self.limiter,
            oh_id: &member.oh_id,
            access_token: &vendor_token,
            today: options.today(),
            store_error_responses: settings.store_error_responses,
        };
        let fetch = engine::fetch_all(&ctx, &mut doc).await;
        report.absorb(&fetch);

        if let FetchOutcome::RateLimited { .. } = fetch.outcome {
            self.scheduler.retry(&member.oh_id, settings.retry_delay);
            report.retry_scheduled = true;
        }

        if let Some(profile) = &fetch.profile {
            if member.vendor_user_id.as_deref() != Some(profile.encoded_id.as_str()) {
                member.vendor_user_id = Some(profile.encoded_id.clone());
                let updated = member.clone();
                if let Err(e) = self
                    .db
                    .writer()
                    .call(move |conn| repository::update_credentials(conn, &updated))
                    .await
                {
                    log::warn!("Could not store vendor user id for member {}: {e}", member.oh_id);
                }
            }
        }

        upload::replace_file(
            self.storage(),
            self.adapter(),
            &oh_token,
            &existing.project_member_id,
            &doc,
        )
        .await?;
        report.uploaded = true;

        let id = member.oh_id.clone();
        self.db
            .writer()
            .call(move |conn| repository::set_last_updated(conn, &id, Utc::now()))
            .await?;
        Ok(())
    }

    /// Sync every stored member in turn. One member failing does not stop
    /// the batch.
    pub async fn sync_all(&self, options: &SyncOptions) -> Result<Vec<SyncReport>> {
        let members = self
            .db
            .reader()
            .call(|conn| repository::list_members(conn))
            .await?;

        let mut reports = Vec::with_capacity(members.len());
        for member in members {
            match self.sync_member(&member.oh_id, options).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    log::error!("Sync for member {} aborted: {e}", member.oh_id);
                    let mut report = SyncReport::new(&member.oh_id, SyncStatus::Failed);
                    report.fail(&e);
                    reports.push(report);
                }
            }
        }
        Ok(reports)
    }

    /// Hand a sync to the scheduler to run as soon as possible.
    pub async fn queue_sync(&self, oh_id: &str) -> Result<SyncReport> {
        self.load_member(oh_id).await?;
        let id = oh_id.to_string();
        self.db
            .writer()
            .call(move |conn| repository::set_last_submitted(conn, &id, Utc::now()))
            .await?;
        self.scheduler.queue(oh_id);
        Ok(SyncReport::new(oh_id, SyncStatus::Queued))
    }
}
