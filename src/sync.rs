// 🔄 Orchestrator - one atomic sync run: resolve dimensions, then load facts
//
// The whole unit runs in a single BEGIN IMMEDIATE transaction on the
// analytics store. Either every new dimension row and fact row commits
// together or nothing does. The immediate write lock also keeps a second
// concurrent sync out: it waits for the busy timeout and then fails with
// ConcurrentRun.

use crate::config::EtlConfig;
use crate::db::{self, Store};
use crate::dimension::{self, DimensionDefaults, ResolveOutcome};
use crate::error::{EtlError, Result};
use crate::facts::{self, FactLoadOptions, FactLoadOutcome};
use crate::schema::{self, STAR_TABLES};
use crate::source::{self, SourceSnapshot};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, TransactionBehavior};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, info_span, warn};

// ============================================================================
// SYNC REPORT
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: String,
    pub load_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub vendors: ResolveOutcome,
    pub commodities: ResolveOutcome,
    pub facts: FactLoadOutcome,
    pub backup_path: Option<PathBuf>,
}

impl SyncReport {
    pub fn dimension_rows_inserted(&self) -> usize {
        self.vendors.inserted + self.commodities.inserted
    }

    /// Transactions left out or dimension drift detected; the run still committed.
    pub fn has_warnings(&self) -> bool {
        self.facts.excluded.total() > 0 || self.vendors.drifted > 0 || self.commodities.drifted > 0
    }

    pub fn summary(&self) -> String {
        format!(
            "vendors +{}, commodities +{}, facts +{} ({} already loaded, {} excluded)",
            self.vendors.inserted,
            self.commodities.inserted,
            self.facts.inserted,
            self.facts.already_loaded,
            self.facts.excluded.total()
        )
    }
}

// ============================================================================
// SYNC ENGINE
// ============================================================================

pub struct SyncEngine<'a> {
    config: &'a EtlConfig,
    defaults: DimensionDefaults,
}

impl<'a> SyncEngine<'a> {
    pub fn new(config: &'a EtlConfig) -> Self {
        SyncEngine {
            config,
            defaults: DimensionDefaults::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: DimensionDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Daily sync stamped with today's (UTC) date.
    pub fn run(&self) -> Result<SyncReport> {
        self.run_on(Utc::now().date_naive())
    }

    pub fn run_on(&self, load_date: NaiveDate) -> Result<SyncReport> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let _span = info_span!("sync", run_id = %run_id).entered();

        let database = &self.config.database;
        for path in [&database.operational_db_path, &database.analytics_db_path] {
            if !db::store_exists(path) {
                return Err(EtlError::Connectivity {
                    path: path.clone(),
                    reason: "store file missing or empty".to_string(),
                });
            }
        }

        let snapshot = {
            let operational = db::open_read_only(&database.operational_db_path, database)?;
            source::read_snapshot(&operational).map_err(|e| e.in_step("read_source"))?
        };
        info!(source = %snapshot.summary(), "operational snapshot read");

        let mut analytics = db::open_read_write(&database.analytics_db_path, database)?;
        db::require_tables(&analytics, Store::Analytics, &STAR_TABLES)?;
        ensure_run_log(&analytics)?;

        let backup_path = if self.config.etl.backup_before_etl {
            let target = self.backup_target(&run_id, started_at);
            db::snapshot(&analytics, &target).map_err(|e| e.in_step("backup"))?;
            info!(path = %target.display(), "analytics store backed up");
            Some(target)
        } else {
            None
        };

        let tx = analytics.transaction_with_behavior(TransactionBehavior::Immediate)?;

        match self.execute_unit(&tx, &snapshot, load_date) {
            Ok((vendors, commodities, facts)) => {
                let report = SyncReport {
                    run_id,
                    load_date,
                    started_at,
                    finished_at: Utc::now(),
                    vendors,
                    commodities,
                    facts,
                    backup_path,
                };
                record_run(&tx, &report.run_id, started_at, "SUCCESS", &serde_json::json!(report))
                    .map_err(|e| e.in_step("record_run"))?;
                tx.commit().map_err(|e| EtlError::from(e).in_step("commit"))?;

                info!(summary = %report.summary(), "sync committed");
                Ok(report)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    warn!(error = %rollback_err, "rollback reported an error");
                }
                warn!(error = %err, "sync rolled back");

                let detail = serde_json::json!({
                    "step": err.failing_step(),
                    "error": err.to_string(),
                });
                if let Err(log_err) = record_run(&analytics, &run_id, started_at, "FAILED", &detail) {
                    warn!(error = %log_err, "could not record failed run");
                }
                Err(err)
            }
        }
    }

    fn execute_unit(
        &self,
        conn: &Connection,
        snapshot: &SourceSnapshot,
        load_date: NaiveDate,
    ) -> Result<(ResolveOutcome, ResolveOutcome, FactLoadOutcome)> {
        let settings = &self.config.etl;

        if settings.auto_create_indexes {
            schema::ensure_indexes(conn).map_err(|e| e.in_step("ensure_indexes"))?;
        }

        let vendors = dimension::resolve(conn, &snapshot.vendors, load_date, &self.defaults)
            .map_err(|e| e.in_step("resolve_vendors"))?;
        let commodities = dimension::resolve(conn, &snapshot.commodities, load_date, &self.defaults)
            .map_err(|e| e.in_step("resolve_commodities"))?;

        let options = FactLoadOptions {
            batch_size: settings.batch_size,
            validate: settings.enable_data_validation,
            strict_joins: settings.strict_joins,
        };
        let facts = facts::load_facts(conn, &snapshot.transactions, load_date, &options)
            .map_err(|e| e.in_step("load_facts"))?;

        Ok((vendors, commodities, facts))
    }

    /// Snapshot file named after the analytics store, placed next to the
    /// configured backup path (or next to the analytics store).
    fn backup_target(&self, run_id: &str, at: DateTime<Utc>) -> PathBuf {
        let database = &self.config.database;
        let dir = database
            .backup_db_path
            .as_ref()
            .and_then(|p| p.parent())
            .or_else(|| database.analytics_db_path.parent())
            .map(PathBuf::from)
            .unwrap_or_default();
        let stem = database
            .analytics_db_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "analytics".to_string());

        dir.join(format!(
            "{}_pre_sync_{}_{}.db",
            stem,
            at.format("%Y%m%d_%H%M%S"),
            &run_id[..8]
        ))
    }
}

// ============================================================================
// RUN LOG
// ============================================================================

fn ensure_run_log(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS etl_run_log (
            run_id TEXT PRIMARY KEY,
            started_at TEXT NOT NULL,
            finished_at TEXT NOT NULL,
            status TEXT NOT NULL,
            detail TEXT NOT NULL
        )",
    )?;
    Ok(())
}

fn record_run(
    conn: &Connection,
    run_id: &str,
    started_at: DateTime<Utc>,
    status: &str,
    detail: &serde_json::Value,
) -> Result<()> {
    conn.execute(
        "INSERT INTO etl_run_log (run_id, started_at, finished_at, status, detail)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            run_id,
            started_at.to_rfc3339(),
            Utc::now().to_rfc3339(),
            status,
            detail.to_string(),
        ],
    )?;
    Ok(())
}

/// Most recent run statuses, newest first.
pub fn recent_runs(conn: &Connection, limit: usize) -> Result<Vec<(String, String, String)>> {
    if !db::table_exists(conn, "etl_run_log")? {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(
        "SELECT run_id, finished_at, status FROM etl_run_log
         ORDER BY finished_at DESC LIMIT ?1",
    )?;
    let runs = stmt
        .query_map(params![limit as i64], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn setup(dir: &TempDir) -> EtlConfig {
        let config = EtlConfig::for_paths(dir.path().join("op.db"), dir.path().join("an.db"));

        let op = Connection::open(&config.database.operational_db_path).unwrap();
        schema::create_operational_schema(&op).unwrap();
        op.execute_batch(
            "INSERT INTO vendors (vendor_id, vendor_name) VALUES ('V1', 'Acme'), ('V2', 'Globex');
             INSERT INTO commodities (commodity_id, commodity_description) VALUES ('C1', 'Steel');
             INSERT INTO spend_transactions (transaction_id, vendor_id, commodity_id, award_date, total_amount)
                VALUES (1, 'V1', 'C1', '2024-01-05', 100.0),
                       (2, 'V2', 'C1', '2024-01-06', 200.0);",
        )
        .unwrap();

        let an = Connection::open(&config.database.analytics_db_path).unwrap();
        schema::create_analytics_schema(&an).unwrap();
        schema::populate_time_dimension(&an, date(2024, 1, 1), date(2024, 12, 31)).unwrap();

        config
    }

    fn count(config: &EtlConfig, table: &str) -> i64 {
        let conn = Connection::open(&config.database.analytics_db_path).unwrap();
        db::count_rows(&conn, table).unwrap()
    }

    #[test]
    fn test_run_commits_dimensions_and_facts() {
        let dir = TempDir::new().unwrap();
        let config = setup(&dir);

        let report = SyncEngine::new(&config).run_on(date(2024, 2, 1)).unwrap();

        assert_eq!(report.vendors.inserted, 2);
        assert_eq!(report.commodities.inserted, 1);
        assert_eq!(report.facts.inserted, 2);
        assert!(!report.has_warnings());
        assert_eq!(count(&config, "fact_spend_analytics"), 2);

        let conn = Connection::open(&config.database.analytics_db_path).unwrap();
        let runs = recent_runs(&conn, 5).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].0, report.run_id);
        assert_eq!(runs[0].2, "SUCCESS");
    }

    #[test]
    fn test_missing_store_is_connectivity_error() {
        let dir = TempDir::new().unwrap();
        let config = EtlConfig::for_paths(dir.path().join("missing_op.db"), dir.path().join("an.db"));

        let err = SyncEngine::new(&config).run_on(date(2024, 2, 1)).unwrap_err();

        assert!(matches!(err, EtlError::Connectivity { .. }));
    }

    #[test]
    fn test_failure_rolls_back_whole_unit() {
        let dir = TempDir::new().unwrap();
        let config = setup(&dir);

        // Forces the fact insert to fail after both dimensions were resolved.
        let an = Connection::open(&config.database.analytics_db_path).unwrap();
        an.execute_batch(
            "CREATE TRIGGER reject_facts BEFORE INSERT ON fact_spend_analytics
             BEGIN SELECT RAISE(ABORT, 'fact table frozen'); END;",
        )
        .unwrap();
        drop(an);

        let err = SyncEngine::new(&config).run_on(date(2024, 2, 1)).unwrap_err();

        assert_eq!(err.failing_step(), Some("load_facts"));
        assert!(matches!(err.root(), EtlError::IntegrityViolation(_)));
        assert_eq!(count(&config, "dim_vendors"), 0, "no dimension rows without their facts");
        assert_eq!(count(&config, "dim_commodities"), 0);
        assert_eq!(count(&config, "fact_spend_analytics"), 0);

        let conn = Connection::open(&config.database.analytics_db_path).unwrap();
        let runs = recent_runs(&conn, 5).unwrap();
        assert_eq!(runs[0].2, "FAILED");
    }

    #[test]
    fn test_concurrent_writer_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = setup(&dir);
        config.database.connection_timeout = 0;
        config.database.max_retries = 1;

        let holder = Connection::open(&config.database.analytics_db_path).unwrap();
        holder.execute_batch("BEGIN IMMEDIATE;").unwrap();

        let err = SyncEngine::new(&config).run_on(date(2024, 2, 1)).unwrap_err();
        assert!(matches!(err.root(), EtlError::ConcurrentRun(_)), "got {err:?}");

        holder.execute_batch("ROLLBACK;").unwrap();
        assert_eq!(count(&config, "dim_vendors"), 0);
    }

    #[test]
    fn test_backup_before_run() {
        let dir = TempDir::new().unwrap();
        let mut config = setup(&dir);
        config.etl.backup_before_etl = true;

        let report = SyncEngine::new(&config).run_on(date(2024, 2, 1)).unwrap();

        let backup = report.backup_path.expect("backup path recorded");
        assert!(backup.exists());
        let copy = Connection::open(&backup).unwrap();
        assert_eq!(db::count_rows(&copy, "fact_spend_analytics").unwrap(), 0, "taken before the load");
    }
}
