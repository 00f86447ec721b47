pub mod config;
pub mod date_util;
pub mod error;
pub mod oauth;
pub mod openhumans;
pub mod storage;
pub mod sync;
pub mod vendor;

use std::sync::Arc;

pub use config::{Config, Settings};
pub use error::{Error, Result};
pub use storage::Database;
pub use sync::retry::{RetryQueue, RetryReceiver, RetryScheduler, ScheduledSync};
pub use sync::{SyncOptions, SyncReport, SyncStatus};

// Row types the CLI prints
pub use storage::repository::{Member, SyncRun};

use oauth::{Credentials, HttpTokenEndpoint, Provider, TokenRefresher};
use openhumans::OpenHumansClient;
use serde::Serialize;
use storage::repository;
use sync::rate_limit::RateLimiter;
use sync::syncer::Syncer;
use vendor::{FitbitAdapter, HttpVendorClient, VendorAdapter};

/// A member connecting for the first time, known only by refresh tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMember {
    pub oh_id: String,
    pub oh_refresh_token: String,
    pub vendor_refresh_token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub added: usize,
    pub updated: usize,
}

/// Result of refreshing one member's vendor token.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub oh_id: String,
    pub error: Option<String>,
}

/// Parse `oh_id<d>oh_refresh_token<d>vendor_refresh_token` lines. Blank
/// lines and `proj_member_id` header lines are skipped.
pub fn parse_member_csv(input: &str, delimiter: char) -> Result<Vec<NewMember>> {
    let mut members = Vec::new();
    for (n, line) in input.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("proj_member_id") {
            continue;
        }
        let fields: Vec<&str> = line.split(delimiter).map(str::trim).collect();
        match fields.as_slice() {
            [oh_id, oh_refresh, vendor_refresh, ..]
                if !oh_id.is_empty() && !oh_refresh.is_empty() && !vendor_refresh.is_empty() =>
            {
                members.push(NewMember {
                    oh_id: oh_id.to_string(),
                    oh_refresh_token: oh_refresh.to_string(),
                    vendor_refresh_token: vendor_refresh.to_string(),
                });
            }
            _ => {
                return Err(Error::Config(format!(
                    "line {}: expected oh_id{delimiter}oh_refresh_token{delimiter}vendor_refresh_token",
                    n + 1
                )))
            }
        }
    }
    Ok(members)
}

/// Main entry point for Open Humans sync.
pub struct OhSync {
    db: Database,
    syncer: Syncer,
}

impl OhSync {
    /// Wire up the HTTP clients for Fitbit and Open Humans.
    pub fn new(db: Database, config: &Config, scheduler: Arc<dyn RetryScheduler>) -> Result<Self> {
        let adapter = FitbitAdapter::new(config.fitbit_api_base.as_str());
        let open_humans = OpenHumansClient::new(&config.oh_base_url)?;

        let vendor_tokens = HttpTokenEndpoint::new(
            adapter.tag(),
            &adapter.token_url(),
            &config.fitbit_client_id,
            &config.fitbit_client_secret,
        )?;
        let oh_tokens = HttpTokenEndpoint::new(
            "Open Humans",
            open_humans.token_url()?.as_str(),
            &config.oh_client_id,
            &config.oh_client_secret,
        )?;
        let tokens = TokenRefresher::new(db.clone(), Arc::new(vendor_tokens), Arc::new(oh_tokens));

        let syncer = Syncer::new(
            db.clone(),
            Arc::new(adapter),
            Arc::new(HttpVendorClient::new()?),
            Arc::new(open_humans),
            tokens,
            RateLimiter::new(),
            scheduler,
        );
        Ok(Self { db, syncer })
    }

    pub fn from_syncer(db: Database, syncer: Syncer) -> Self {
        Self { db, syncer }
    }

    /// Access the database (for direct queries in the CLI).
    pub fn db(&self) -> &Database {
        &self.db
    }

    // ── Members ────────────────────────────────────────────────────

    pub async fn get_member(&self, oh_id: &str) -> Result<Member> {
        let id = oh_id.to_string();
        self.db
            .reader()
            .call(move |conn| repository::get_member(conn, &id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("member {oh_id}")))
    }

    pub async fn list_members(&self) -> Result<Vec<Member>> {
        Ok(self
            .db
            .reader()
            .call(|conn| repository::list_members(conn))
            .await?)
    }

    fn new_record(&self, new: &NewMember) -> Member {
        Member {
            oh_id: new.oh_id.clone(),
            oh_credentials: Credentials::expired(&new.oh_refresh_token),
            vendor: self.syncer.adapter().name().to_string(),
            vendor_user_id: None,
            vendor_credentials: Credentials::expired(&new.vendor_refresh_token),
            vendor_scope: None,
            last_updated: None,
            last_submitted: None,
        }
    }

    /// Store a newly connected member and queue their first sync. Access
    /// tokens are fetched on first use.
    pub async fn add_member(&self, new: &NewMember) -> Result<SyncReport> {
        let record = self.new_record(new);
        self.db
            .writer()
            .call(move |conn| repository::upsert_member(conn, &record))
            .await?;
        log::info!("Added member {}", new.oh_id);
        self.syncer.queue_sync(&new.oh_id).await
    }

    /// Import members from delimited text. New members are stored and
    /// queued for a sync. For existing members the CSV vendor token is only
    /// swapped in when the stored one no longer refreshes; their Open Humans
    /// tokens are left alone.
    pub async fn import_members(&self, input: &str, delimiter: char) -> Result<ImportSummary> {
        let mut summary = ImportSummary::default();
        for new in parse_member_csv(input, delimiter)? {
            let stored = {
                let id = new.oh_id.clone();
                self.db
                    .reader()
                    .call(move |conn| repository::get_member(conn, &id))
                    .await?
            };
            match stored {
                Some(mut member) => {
                    self.repair_vendor_token(&mut member, &new.vendor_refresh_token)
                        .await?;
                    summary.updated += 1;
                }
                None => {
                    let record = self.new_record(&new);
                    self.db
                        .writer()
                        .call(move |conn| repository::upsert_member(conn, &record))
                        .await?;
                    self.syncer.queue_sync(&new.oh_id).await?;
                    summary.added += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn repair_vendor_token(&self, member: &mut Member, refresh_token: &str) -> Result<()> {
        let tokens = self.syncer.tokens();
        match tokens.refresh(member, Provider::Vendor).await {
            Ok(()) => {
                log::info!("Vendor token for member {} still refreshes, kept", member.oh_id);
                return Ok(());
            }
            Err(e) => log::info!(
                "Vendor token for member {} is broken ({e}), using imported one",
                member.oh_id
            ),
        }

        member.vendor_credentials = Credentials::expired(refresh_token);
        let updated = member.clone();
        self.db
            .writer()
            .call(move |conn| repository::update_credentials(conn, &updated))
            .await?;
        if let Err(e) = tokens.refresh(member, Provider::Vendor).await {
            log::warn!("Imported vendor token for member {} does not refresh either: {e}", member.oh_id);
        }
        Ok(())
    }

    /// Delete the member's file from Open Humans (best effort), then the
    /// local record.
    pub async fn remove_member(&self, oh_id: &str) -> Result<()> {
        let mut member = self.get_member(oh_id).await?;
        if let Err(e) = self.delete_remote_file(&mut member).await {
            log::warn!("Could not delete remote file for member {oh_id}: {e}");
        }

        let id = oh_id.to_string();
        self.db
            .writer()
            .call(move |conn| repository::remove_member(conn, &id))
            .await?;
        log::info!("Removed member {oh_id}");
        Ok(())
    }

    async fn delete_remote_file(&self, member: &mut Member) -> Result<()> {
        let token = self
            .syncer
            .tokens()
            .get_valid_access_token(member, Provider::OpenHumans)
            .await?;
        let storage = self.syncer.storage();
        let info = storage.exchange_member(&token).await?;
        storage
            .delete_file(&token, &info.project_member_id, self.syncer.adapter().file_basename())
            .await
    }

    /// Download URL of the member's current vendor file, if there is one.
    pub async fn download_url(&self, oh_id: &str) -> Result<Option<String>> {
        let mut member = self.get_member(oh_id).await?;
        let token = self
            .syncer
            .tokens()
            .get_valid_access_token(&mut member, Provider::OpenHumans)
            .await?;
        let info = self.syncer.storage().exchange_member(&token).await?;
        Ok(info
            .latest_tagged(self.syncer.adapter().tag())
            .map(|f| f.download_url.clone()))
    }

    /// Refresh every member's vendor token.
    pub async fn refresh_all(&self) -> Result<Vec<RefreshReport>> {
        let mut reports = Vec::new();
        for mut member in self.list_members().await? {
            let error = match self.syncer.tokens().refresh(&mut member, Provider::Vendor).await {
                Ok(()) => None,
                Err(e) => {
                    log::warn!("Token refresh for member {} failed: {e}", member.oh_id);
                    Some(e.to_string())
                }
            };
            reports.push(RefreshReport {
                oh_id: member.oh_id,
                error,
            });
        }
        Ok(reports)
    }

    // ── Sync commands ──────────────────────────────────────────────

    pub async fn sync(&self, oh_id: &str, options: &SyncOptions) -> Result<SyncReport> {
        self.syncer.sync_member(oh_id, options).await
    }

    pub async fn sync_all(&self, options: &SyncOptions) -> Result<Vec<SyncReport>> {
        self.syncer.sync_all(options).await
    }

    pub async fn queue_sync(&self, oh_id: &str) -> Result<SyncReport> {
        self.syncer.queue_sync(oh_id).await
    }

    pub async fn recent_runs(&self, oh_id: Option<&str>, limit: u32) -> Result<Vec<SyncRun>> {
        let id = oh_id.map(str::to_string);
        Ok(self
            .db
            .reader()
            .call(move |conn| repository::recent_sync_runs(conn, id.as_deref(), limit))
            .await?)
    }
}
