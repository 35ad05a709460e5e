// 🌱 Seed Copy - bulk-load star data from a backup store
//
// Used to bootstrap a fresh analytics store from a known-good copy. The
// backup is attached under the alias `source` and the star tables are copied
// in one transaction, so either every table lands or none does.

use crate::db::{self, quote_identifier, Store};
use crate::error::{EtlError, Result};
use crate::schema::STAR_TABLES;
use rusqlite::{params, Connection};
use std::path::Path;
use tracing::{info, warn};

pub fn copy_star_data(conn: &mut Connection, backup_path: &Path) -> Result<Vec<(String, i64)>> {
    if !db::store_exists(backup_path) {
        return Err(EtlError::Connectivity {
            path: backup_path.to_path_buf(),
            reason: "backup store missing or empty".to_string(),
        });
    }

    conn.execute(
        "ATTACH DATABASE ?1 AS source",
        params![backup_path.to_string_lossy().into_owned()],
    )?;

    let copied = copy_attached(conn);

    // Detach on every path; a failed copy must not leave the alias behind.
    if let Err(e) = conn.execute_batch("DETACH DATABASE source") {
        warn!(error = %e, "could not detach backup store");
        if copied.is_ok() {
            return Err(e.into());
        }
    }

    let copied = copied?;
    let total: i64 = copied.iter().map(|(_, n)| n).sum();
    info!(backup = %backup_path.display(), rows = total, "star data copied from backup");
    Ok(copied)
}

fn copy_attached(conn: &mut Connection) -> Result<Vec<(String, i64)>> {
    let mut missing = Vec::new();
    for table in STAR_TABLES {
        if !attached_table_exists(conn, table)? {
            missing.push(table.to_string());
        }
    }
    if !missing.is_empty() {
        return Err(EtlError::missing_tables(Store::Backup.as_str(), &missing));
    }
    db::require_tables(conn, Store::Analytics, &STAR_TABLES)?;

    // Dimensions first so the fact rows find their references.
    let tx = conn.transaction()?;
    let mut copied = Vec::with_capacity(STAR_TABLES.len());
    for table in STAR_TABLES {
        let quoted = quote_identifier(table);
        let rows = tx.execute(
            &format!("INSERT INTO main.{} SELECT * FROM source.{}", quoted, quoted),
            [],
        )?;
        copied.push((table.to_string(), rows as i64));
    }
    tx.commit()?;

    Ok(copied)
}

fn attached_table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM source.sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}
