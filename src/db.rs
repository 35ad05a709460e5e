// 🗄️ Store access - connections, pragmas and catalog queries
//
// Both stores are SQLite files. The ETL never creates a store: opening a
// missing file is a Connectivity error, and read-only handles cannot create
// one by accident.

use crate::config::DatabaseConfig;
use crate::error::{EtlError, Result};
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Which side of the pipeline a connection belongs to (used in messages)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Store {
    Operational,
    Analytics,
    Backup,
}

impl Store {
    pub fn as_str(&self) -> &'static str {
        match self {
            Store::Operational => "operational",
            Store::Analytics => "analytics",
            Store::Backup => "backup",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadWrite,
    ReadOnly,
}

/// A declared foreign key, as reported by PRAGMA foreign_key_list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKey {
    pub from_column: String,
    pub target_table: String,
    pub target_column: Option<String>,
}

// ============================================================================
// CONNECTIONS
// ============================================================================

/// True when the backing file exists and holds at least one byte.
pub fn store_exists(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

pub fn file_size_mb(path: &Path) -> f64 {
    let bytes = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    (bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0
}

pub fn open_read_write(path: &Path, config: &DatabaseConfig) -> Result<Connection> {
    open(path, config, AccessMode::ReadWrite)
}

pub fn open_read_only(path: &Path, config: &DatabaseConfig) -> Result<Connection> {
    open(path, config, AccessMode::ReadOnly)
}

/// Open an existing store, retrying while it is busy or locked.
pub fn open(path: &Path, config: &DatabaseConfig, mode: AccessMode) -> Result<Connection> {
    if !path.is_file() {
        return Err(EtlError::Connectivity {
            path: path.to_path_buf(),
            reason: "file not found".to_string(),
        });
    }

    let attempts = config.max_retries.max(1);
    let mut attempt = 1;
    loop {
        match try_open(path, config, mode) {
            Ok(conn) => return Ok(conn),
            Err(EtlError::ConcurrentRun(reason)) if attempt < attempts => {
                warn!(path = %path.display(), attempt, %reason, "store busy, retrying open");
                thread::sleep(Duration::from_millis(100 * u64::from(attempt)));
                attempt += 1;
            }
            Err(EtlError::Connectivity { reason, .. }) => {
                return Err(EtlError::Connectivity {
                    path: path.to_path_buf(),
                    reason,
                })
            }
            Err(e) => return Err(e),
        }
    }
}

fn try_open(path: &Path, config: &DatabaseConfig, mode: AccessMode) -> Result<Connection> {
    let flags = match mode {
        AccessMode::ReadWrite => OpenFlags::SQLITE_OPEN_READ_WRITE,
        AccessMode::ReadOnly => OpenFlags::SQLITE_OPEN_READ_ONLY,
    } | OpenFlags::SQLITE_OPEN_NO_MUTEX;

    let conn = Connection::open_with_flags(path, flags)?;
    conn.busy_timeout(config.busy_timeout())?;
    apply_pragmas(&conn, config, mode)?;

    // Forces SQLite to read the header so a non-database file fails here.
    conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| {
        row.get::<_, i64>(0)
    })?;

    Ok(conn)
}

fn apply_pragmas(conn: &Connection, config: &DatabaseConfig, mode: AccessMode) -> Result<()> {
    conn.pragma_update(None, "foreign_keys", config.enable_foreign_keys)?;

    if mode == AccessMode::ReadWrite {
        if config.enable_wal_mode {
            let journal: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            debug!(%journal, "journal mode set");
        }
        conn.pragma_update(None, "synchronous", "NORMAL")?;
    }

    conn.pragma_update(None, "cache_size", -64000)?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;

    Ok(())
}

// ============================================================================
// CATALOG QUERIES
// ============================================================================

pub fn list_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )?;

    let tables = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;

    Ok(tables)
}

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Names from `required` that are absent from the store.
pub fn missing_tables(conn: &Connection, required: &[&str]) -> Result<Vec<String>> {
    let present = list_tables(conn)?;
    Ok(required
        .iter()
        .filter(|name| !present.iter().any(|p| p == *name))
        .map(|name| name.to_string())
        .collect())
}

pub fn require_tables(conn: &Connection, store: Store, required: &[&str]) -> Result<()> {
    let missing = missing_tables(conn, required)?;
    if missing.is_empty() {
        Ok(())
    } else {
        Err(EtlError::missing_tables(store.as_str(), &missing))
    }
}

pub fn count_rows(conn: &Connection, table: &str) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM {}", quote_identifier(table));
    let count = conn.query_row(&sql, [], |row| row.get(0))?;
    Ok(count)
}

pub fn foreign_keys(conn: &Connection, table: &str) -> Result<Vec<ForeignKey>> {
    let mut stmt = conn.prepare("SELECT \"from\", \"table\", \"to\" FROM pragma_foreign_key_list(?1)")?;

    let keys = stmt
        .query_map(params![table], |row| {
            Ok(ForeignKey {
                from_column: row.get(0)?,
                target_table: row.get(1)?,
                target_column: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(keys)
}

/// Write a consistent copy of the main database to `dest`.
pub fn snapshot(conn: &Connection, dest: &Path) -> Result<()> {
    if dest.exists() {
        return Err(EtlError::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("snapshot target {} already exists", dest.display()),
        )));
    }
    conn.execute("VACUUM INTO ?1", params![dest.to_string_lossy()])?;
    Ok(())
}

pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
