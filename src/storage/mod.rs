pub mod repository;

use rusqlite_migration::{Migrations, M};

use crate::error::{Error, Result};

const PRAGMAS: &str = "PRAGMA journal_mode=WAL;\
                       PRAGMA foreign_keys=ON;\
                       PRAGMA busy_timeout=5000;";

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(include_str!("migrations/001_initial.sql"))])
}

/// Member records, runtime settings and the sync run log.
///
/// Two connections share one WAL-mode file: writes go through `writer`, which
/// `tokio_rusqlite` serializes on its own thread, while `reader` serves
/// status queries during a sync.
#[derive(Clone)]
pub struct Database {
    writer: tokio_rusqlite::Connection,
    reader: tokio_rusqlite::Connection,
}

impl Database {
    /// Open `~/.ohsync/ohsync.db`, creating the directory if needed.
    pub async fn open() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Config("cannot determine home directory".into()))?;
        let dir = home.join(".ohsync");
        std::fs::create_dir_all(&dir)?;
        Self::open_at(dir.join("ohsync.db")).await
    }

    pub async fn open_at(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let writer = tokio_rusqlite::Connection::open(path).await?;
        Self::migrate(&writer).await?;
        let reader = tokio_rusqlite::Connection::open(path).await?;
        reader.call(|conn| conn.execute_batch(PRAGMAS)).await?;
        Ok(Self { writer, reader })
    }

    /// Open an in-memory database (for testing).
    pub async fn open_memory() -> Result<Self> {
        let writer = tokio_rusqlite::Connection::open_in_memory().await?;
        Self::migrate(&writer).await?;
        // An in-memory database lives in one connection, so both handles share it.
        Ok(Self {
            reader: writer.clone(),
            writer,
        })
    }

    async fn migrate(conn: &tokio_rusqlite::Connection) -> Result<()> {
        conn.call(|conn| {
            conn.execute_batch(PRAGMAS).map_err(|e| e.to_string())?;
            migrations().to_latest(conn).map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| Error::Migration(e.to_string()))
    }

    /// Get a reference to the writer connection.
    pub fn writer(&self) -> &tokio_rusqlite::Connection {
        &self.writer
    }

    /// Get a reference to the reader connection.
    pub fn reader(&self) -> &tokio_rusqlite::Connection {
        &self.reader
    }
}
