use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};

use ohsync::{Config, Database, NewMember, OhSync, RetryQueue, RetryReceiver, SyncOptions, SyncReport};

#[derive(Parser)]
#[command(name = "ohsync", about = "Mirror Fitbit data into Open Humans")]
struct Cli {
    /// Database path (default: ~/.ohsync/ohsync.db)
    #[arg(long)]
    db: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage connected members
    Member {
        #[command(subcommand)]
        action: MemberAction,
    },
    /// Fetch vendor data and upload it to Open Humans
    Sync {
        /// Open Humans member id
        oh_id: Option<String>,
        /// Sync every stored member
        #[arg(long, conflicts_with = "oh_id")]
        all: bool,
        /// Drop retries scheduled after hitting a rate limit
        #[arg(long)]
        no_retry: bool,
        /// Treat this date as today (YYYY-MM-DD)
        #[arg(long)]
        today: Option<NaiveDate>,
        /// Output reports as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show members and their latest sync
    Status,
}

#[derive(Subcommand)]
enum MemberAction {
    /// Store a newly connected member and run their first sync
    Add {
        oh_id: String,
        #[arg(long)]
        oh_refresh_token: String,
        #[arg(long)]
        vendor_refresh_token: String,
        /// Drop retries scheduled after hitting a rate limit
        #[arg(long)]
        no_retry: bool,
    },
    /// Import members from a delimited file (oh_id, oh_refresh_token, vendor_refresh_token)
    Import {
        infile: PathBuf,
        #[arg(long, default_value = ",")]
        delimiter: char,
        /// Drop retries scheduled after hitting a rate limit
        #[arg(long)]
        no_retry: bool,
    },
    /// List stored members
    List {
        #[arg(long)]
        json: bool,
    },
    /// Delete a member's uploaded file and local record
    Remove { oh_id: String },
    /// Refresh every member's vendor token
    Refresh,
    /// Print the download URL of a member's current file
    Url { oh_id: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// List all config values
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let db = match &cli.db {
        Some(path) => Database::open_at(path).await?,
        None => Database::open().await?,
    };

    match cli.command {
        Commands::Status => print_status(&db).await?,
        Commands::Config { action } => handle_config(&db, action).await?,
        Commands::Member {
            action: MemberAction::List { json },
        } => list_members(&db, json).await?,
        Commands::Member { action } => {
            let (queue, mut rx) = RetryQueue::channel();
            let app = OhSync::new(db, &Config::from_env()?, Arc::new(queue))?;
            handle_member(&app, &mut rx, action).await?;
        }
        Commands::Sync {
            oh_id,
            all,
            no_retry,
            today,
            json,
        } => {
            let (queue, mut rx) = RetryQueue::channel();
            let app = OhSync::new(db, &Config::from_env()?, Arc::new(queue))?;
            let options = SyncOptions { today };

            let reports = if all {
                app.sync_all(&options).await?
            } else if let Some(oh_id) = oh_id {
                vec![app.sync(&oh_id, &options).await?]
            } else {
                anyhow::bail!("Give a member id or --all");
            };
            print_reports(&reports, json)?;
            run_queued(&app, &mut rx, &options, no_retry, json).await?;
        }
    }
    Ok(())
}

async fn handle_member(app: &OhSync, rx: &mut RetryReceiver, action: MemberAction) -> anyhow::Result<()> {
    let options = SyncOptions::default();
    match action {
        MemberAction::Add {
            oh_id,
            oh_refresh_token,
            vendor_refresh_token,
            no_retry,
        } => {
            let new = NewMember {
                oh_id,
                oh_refresh_token,
                vendor_refresh_token,
            };
            let report = app.add_member(&new).await?;
            println!("Member {} added, sync {}.", report.oh_id, report.status);
            run_queued(app, rx, &options, no_retry, false).await?;
        }
        MemberAction::Import {
            infile,
            delimiter,
            no_retry,
        } => {
            let input = tokio::fs::read_to_string(&infile).await?;
            let summary = app.import_members(&input, delimiter).await?;
            println!(
                "Imported {}: {} added, {} updated.",
                infile.display(),
                summary.added,
                summary.updated
            );
            run_queued(app, rx, &options, no_retry, false).await?;
        }
        MemberAction::Remove { oh_id } => {
            app.remove_member(&oh_id).await?;
            println!("Member {oh_id} removed.");
        }
        MemberAction::Refresh => {
            for report in app.refresh_all().await? {
                match report.error {
                    None => println!("{}: refreshed", report.oh_id),
                    Some(e) => println!("{}: FAILED {e}", report.oh_id),
                }
            }
        }
        MemberAction::Url { oh_id } => match app.download_url(&oh_id).await? {
            Some(url) => println!("{url}"),
            None => println!("No file uploaded for member {oh_id} yet."),
        },
        MemberAction::List { json } => list_members(app.db(), json).await?,
    }
    Ok(())
}

/// Run queued syncs and retries until nothing is left.
async fn run_queued(
    app: &OhSync,
    rx: &mut RetryReceiver,
    options: &SyncOptions,
    no_retry: bool,
    json: bool,
) -> anyhow::Result<()> {
    while let Some(job) = rx.next() {
        if job.is_retry() {
            if no_retry {
                log::info!("Dropping retry for member {} (--no-retry)", job.oh_id);
                eprintln!("Retry for member {} skipped.", job.oh_id);
                continue;
            }
            eprintln!(
                "Rate limited; retrying member {} in {}s...",
                job.oh_id,
                job.delay.as_secs()
            );
        }
        job.wait().await;
        let report = app.sync(&job.oh_id, options).await?;
        print_reports(std::slice::from_ref(&report), json)?;
    }
    Ok(())
}

fn print_reports(reports: &[SyncReport], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(reports)?);
        return Ok(());
    }
    for r in reports {
        println!(
            "{}: {} ({} requests, {} fetched, {} skipped, {} failed{})",
            r.oh_id,
            r.status,
            r.requests,
            r.buckets_fetched,
            r.buckets_skipped,
            r.buckets_failed,
            if r.uploaded { ", uploaded" } else { "" }
        );
        if let Some(e) = &r.error {
            println!("  Error: {e}");
        }
    }
    Ok(())
}

fn format_time(t: Option<chrono::DateTime<chrono::Utc>>) -> String {
    t.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "never".to_string())
}

async fn list_members(db: &Database, json: bool) -> anyhow::Result<()> {
    let members = db
        .reader()
        .call(|conn| ohsync::storage::repository::list_members(conn))
        .await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&members)?);
    } else if members.is_empty() {
        println!("No members.");
    } else {
        for m in members {
            println!(
                "{}  {} {}  updated {}",
                m.oh_id,
                m.vendor,
                m.vendor_user_id.as_deref().unwrap_or("-"),
                format_time(m.last_updated)
            );
        }
    }
    Ok(())
}

async fn print_status(db: &Database) -> anyhow::Result<()> {
    let (members, runs) = db
        .reader()
        .call(|conn| {
            let members = ohsync::storage::repository::list_members(conn)?;
            let runs = ohsync::storage::repository::recent_sync_runs(conn, None, 10)?;
            Ok::<_, rusqlite::Error>((members, runs))
        })
        .await?;
    let settings = ohsync::Settings::load(db).await?;

    println!("Sync Status");
    println!("  Members:     {}", members.len());
    println!(
        "  Quota:       {} requests / {}s per member, {} / {}s overall",
        settings.realm_max_requests,
        settings.realm_timespan.as_secs(),
        settings.global_max_requests,
        settings.global_timespan.as_secs()
    );
    for m in &members {
        println!(
            "  {}  submitted {}  updated {}",
            m.oh_id,
            format_time(m.last_submitted),
            format_time(m.last_updated)
        );
    }
    if !runs.is_empty() {
        println!("Recent runs");
        for run in runs {
            println!(
                "  #{} {} {} {} ({} requests){}",
                run.id,
                run.oh_id,
                run.started_at,
                run.status,
                run.requests,
                run.error_message.map(|e| format!(": {e}")).unwrap_or_default()
            );
        }
    }
    Ok(())
}

async fn handle_config(db: &Database, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let val: Option<String> = db
                .reader()
                .call({
                    let key = key.clone();
                    move |conn| ohsync::storage::repository::get_config(conn, &key)
                })
                .await?;
            let default = ohsync::config::SETTING_KEYS
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, d)| *d);
            match (val, default) {
                (Some(v), _) => println!("{key} = {v}"),
                (None, Some(d)) => println!("{key} = {d} (default)"),
                (None, None) => println!("{key} is not set"),
            }
        }
        ConfigAction::Set { key, value } => {
            if !ohsync::config::is_setting_key(&key) {
                eprintln!("Warning: {key} is not a setting ohsync reads.");
            }
            db.writer()
                .call(move |conn| ohsync::storage::repository::set_config(conn, &key, &value))
                .await?;
            println!("Config updated.");
        }
        ConfigAction::List => {
            let items: Vec<(String, String)> = db
                .reader()
                .call(|conn| ohsync::storage::repository::list_config(conn))
                .await?;
            for (key, default) in ohsync::config::SETTING_KEYS {
                match items.iter().find(|(k, _)| k == key) {
                    Some((_, v)) => println!("{key} = {v}"),
                    None => println!("{key} = {default} (default)"),
                }
            }
            for (k, v) in items.iter().filter(|(k, _)| !ohsync::config::is_setting_key(k)) {
                println!("{k} = {v}");
            }
        }
    }
    Ok(())
}
