use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::oauth::{Credentials, Provider};

// ── Members ────────────────────────────────────────────────────────

/// Credential record for one connected Open Humans member.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Member {
    pub oh_id: String,
    #[serde(skip)]
    pub oh_credentials: Credentials,
    pub vendor: String,
    pub vendor_user_id: Option<String>,
    #[serde(skip)]
    pub vendor_credentials: Credentials,
    pub vendor_scope: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
    pub last_submitted: Option<DateTime<Utc>>,
}

impl Member {
    pub fn credentials(&self, provider: Provider) -> &Credentials {
        match provider {
            Provider::Vendor => &self.vendor_credentials,
            Provider::OpenHumans => &self.oh_credentials,
        }
    }
}

fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

const MEMBER_COLUMNS: &str = "oh_id, oh_access_token, oh_refresh_token, oh_token_expires,
     vendor, vendor_user_id, vendor_access_token, vendor_refresh_token, vendor_token_expires,
     vendor_scope, last_updated, last_submitted";

fn member_from_row(row: &Row<'_>) -> Result<Member, rusqlite::Error> {
    Ok(Member {
        oh_id: row.get(0)?,
        oh_credentials: Credentials {
            access_token: row.get(1)?,
            refresh_token: row.get(2)?,
            expires_at: from_unix(row.get(3)?),
        },
        vendor: row.get(4)?,
        vendor_user_id: row.get(5)?,
        vendor_credentials: Credentials {
            access_token: row.get(6)?,
            refresh_token: row.get(7)?,
            expires_at: from_unix(row.get(8)?),
        },
        vendor_scope: row.get(9)?,
        last_updated: row.get::<_, Option<i64>>(10)?.map(from_unix),
        last_submitted: row.get::<_, Option<i64>>(11)?.map(from_unix),
    })
}

/// Insert a member, or replace the credentials of an existing one. Sync
/// stamps of an existing row are kept.
pub fn upsert_member(conn: &Connection, m: &Member) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO members (oh_id, oh_access_token, oh_refresh_token, oh_token_expires,
             vendor, vendor_user_id, vendor_access_token, vendor_refresh_token,
             vendor_token_expires, vendor_scope)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(oh_id) DO UPDATE SET
           oh_access_token = excluded.oh_access_token,
           oh_refresh_token = excluded.oh_refresh_token,
           oh_token_expires = excluded.oh_token_expires,
           vendor = excluded.vendor,
           vendor_user_id = COALESCE(excluded.vendor_user_id, members.vendor_user_id),
           vendor_access_token = excluded.vendor_access_token,
           vendor_refresh_token = excluded.vendor_refresh_token,
           vendor_token_expires = excluded.vendor_token_expires,
           vendor_scope = COALESCE(excluded.vendor_scope, members.vendor_scope)",
        params![
            m.oh_id,
            m.oh_credentials.access_token,
            m.oh_credentials.refresh_token,
            m.oh_credentials.expires_at.timestamp(),
            m.vendor,
            m.vendor_user_id,
            m.vendor_credentials.access_token,
            m.vendor_credentials.refresh_token,
            m.vendor_credentials.expires_at.timestamp(),
            m.vendor_scope,
        ],
    )?;
    Ok(())
}

/// Persist both credential sets plus the vendor identity fields.
pub fn update_credentials(conn: &Connection, m: &Member) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE members SET
            oh_access_token = ?2, oh_refresh_token = ?3, oh_token_expires = ?4,
            vendor_user_id = ?5, vendor_access_token = ?6, vendor_refresh_token = ?7,
            vendor_token_expires = ?8, vendor_scope = ?9
         WHERE oh_id = ?1",
        params![
            m.oh_id,
            m.oh_credentials.access_token,
            m.oh_credentials.refresh_token,
            m.oh_credentials.expires_at.timestamp(),
            m.vendor_user_id,
            m.vendor_credentials.access_token,
            m.vendor_credentials.refresh_token,
            m.vendor_credentials.expires_at.timestamp(),
            m.vendor_scope,
        ],
    )?;
    Ok(())
}

pub fn get_member(conn: &Connection, oh_id: &str) -> Result<Option<Member>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {MEMBER_COLUMNS} FROM members WHERE oh_id = ?1"),
        params![oh_id],
        member_from_row,
    )
    .optional()
}

pub fn list_members(conn: &Connection) -> Result<Vec<Member>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!("SELECT {MEMBER_COLUMNS} FROM members ORDER BY oh_id"))?;
    let rows = stmt.query_map([], member_from_row)?;
    rows.collect()
}

pub fn remove_member(conn: &Connection, oh_id: &str) -> Result<bool, rusqlite::Error> {
    let count = conn.execute("DELETE FROM members WHERE oh_id = ?1", params![oh_id])?;
    Ok(count > 0)
}

pub fn set_last_updated(conn: &Connection, oh_id: &str, at: DateTime<Utc>) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE members SET last_updated = ?2 WHERE oh_id = ?1",
        params![oh_id, at.timestamp()],
    )?;
    Ok(())
}

pub fn set_last_submitted(conn: &Connection, oh_id: &str, at: DateTime<Utc>) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE members SET last_submitted = ?2 WHERE oh_id = ?1",
        params![oh_id, at.timestamp()],
    )?;
    Ok(())
}

// ── Config ─────────────────────────────────────────────────────────

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO app_config (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))",
        params![key, value],
    )?;
    Ok(())
}

pub fn list_config(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

// ── Sync Runs ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncRun {
    pub id: i64,
    pub oh_id: String,
    pub status: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub requests: u64,
    pub buckets_fetched: u64,
    pub buckets_skipped: u64,
    pub buckets_failed: u64,
    pub uploaded: bool,
    pub retry_scheduled: bool,
    pub error_message: Option<String>,
}

/// Counters written when a run finishes.
#[derive(Debug, Clone, Default)]
pub struct RunTotals<'a> {
    pub status: &'a str,
    pub requests: u64,
    pub buckets_fetched: u64,
    pub buckets_skipped: u64,
    pub buckets_failed: u64,
    pub uploaded: bool,
    pub retry_scheduled: bool,
    pub error_message: Option<&'a str>,
}

pub fn insert_sync_run(conn: &Connection, oh_id: &str) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO sync_runs (oh_id, status, started_at) VALUES (?1, 'running', datetime('now'))",
        params![oh_id],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn finish_sync_run(conn: &Connection, run_id: i64, totals: &RunTotals<'_>) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE sync_runs SET
            status = ?2, completed_at = datetime('now'),
            requests = ?3, buckets_fetched = ?4, buckets_skipped = ?5, buckets_failed = ?6,
            uploaded = ?7, retry_scheduled = ?8, error_message = ?9
         WHERE id = ?1",
        params![
            run_id,
            totals.status,
            totals.requests as i64,
            totals.buckets_fetched as i64,
            totals.buckets_skipped as i64,
            totals.buckets_failed as i64,
            totals.uploaded,
            totals.retry_scheduled,
            totals.error_message,
        ],
    )?;
    Ok(())
}

/// Most recent runs, newest first, optionally for a single member.
pub fn recent_sync_runs(
    conn: &Connection,
    oh_id: Option<&str>,
    limit: u32,
) -> Result<Vec<SyncRun>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, oh_id, status, started_at, completed_at, requests, buckets_fetched,
                buckets_skipped, buckets_failed, uploaded, retry_scheduled, error_message
         FROM sync_runs
         WHERE ?1 IS NULL OR oh_id = ?1
         ORDER BY id DESC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![oh_id, limit], |row| {
        Ok(SyncRun {
            id: row.get(0)?,
            oh_id: row.get(1)?,
            status: row.get(2)?,
            started_at: row.get(3)?,
            completed_at: row.get(4)?,
            requests: row.get::<_, i64>(5)? as u64,
            buckets_fetched: row.get::<_, i64>(6)? as u64,
            buckets_skipped: row.get::<_, i64>(7)? as u64,
            buckets_failed: row.get::<_, i64>(8)? as u64,
            uploaded: row.get(9)?,
            retry_scheduled: row.get(10)?,
            error_message: row.get(11)?,
        })
    })?;
    rows.collect()
}
