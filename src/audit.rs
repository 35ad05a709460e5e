// 🔍 Consistency Auditor - read-only health check over both stores
//
// Every check opens its own short-lived read-only connection and turns any
// failure into a FAILED entry, so one broken check never stops the others.
// Overall status is HEALTHY when both schema checks PASSED and the
// consistency check is PASSED or WARNING.

use crate::config::DatabaseConfig;
use crate::db::{self, ForeignKey, Store};
use crate::error::Result;
use crate::schema::{FACT_FOREIGN_KEYS, OPERATIONAL_TABLES, STAR_TABLES};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// ============================================================================
// STATUS TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckStatus {
    Passed,
    Warning,
    Failed,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Passed => "PASSED",
            CheckStatus::Warning => "WARNING",
            CheckStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverallStatus {
    Healthy,
    IssuesDetected,
}

impl OverallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverallStatus::Healthy => "HEALTHY",
            OverallStatus::IssuesDetected => "ISSUES_DETECTED",
        }
    }
}

/// Tolerances for the row-count comparison
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AuditThresholds {
    /// Largest vendor-count difference that still passes
    pub vendor_delta_tolerance: i64,
    /// Fact/transaction ratio must be strictly above this to pass
    pub min_fact_ratio: f64,
}

impl Default for AuditThresholds {
    fn default() -> Self {
        AuditThresholds {
            vendor_delta_tolerance: 10,
            min_fact_ratio: 0.9,
        }
    }
}

// ============================================================================
// CHECK RESULTS
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ExistenceCheck {
    pub status: CheckStatus,
    pub operational_exists: bool,
    pub analytics_exists: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreInfo {
    pub path: PathBuf,
    pub tables: Vec<String>,
    pub table_counts: BTreeMap<String, i64>,
    pub total_tables: usize,
    pub size_mb: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaCheck {
    pub store: Store,
    pub status: CheckStatus,
    pub required_tables: Vec<String>,
    pub missing_tables: Vec<String>,
    /// Declared fact-table foreign keys (analytics store only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub foreign_keys: Option<usize>,
    pub table_counts: BTreeMap<String, i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SchemaCheck {
    fn failed(store: Store, required: &[&str], reason: String) -> Self {
        SchemaCheck {
            store,
            status: CheckStatus::Failed,
            required_tables: required.iter().map(|t| t.to_string()).collect(),
            missing_tables: Vec::new(),
            foreign_keys: None,
            table_counts: BTreeMap::new(),
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyCheck {
    pub status: CheckStatus,
    pub operational_vendors: i64,
    pub analytics_vendors: i64,
    pub operational_transactions: i64,
    pub analytics_facts: i64,
    pub vendor_consistent: bool,
    pub transaction_ratio: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityProbe {
    pub status: CheckStatus,
    pub orphan_facts: i64,
    pub duplicate_source_ids: i64,
    pub vendors_with_multiple_current: i64,
    pub commodities_with_multiple_current: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyReport {
    pub timestamp: DateTime<Utc>,
    pub operational_db: PathBuf,
    pub analytics_db: PathBuf,
    pub existence: ExistenceCheck,
    pub operational_info: Option<StoreInfo>,
    pub analytics_info: Option<StoreInfo>,
    pub operational_schema: SchemaCheck,
    pub star_schema: SchemaCheck,
    pub consistency: ConsistencyCheck,
    pub integrity: IntegrityProbe,
    pub overall_status: OverallStatus,
}

impl ConsistencyReport {
    pub fn is_healthy(&self) -> bool {
        self.overall_status == OverallStatus::Healthy
    }

    pub fn has_warnings(&self) -> bool {
        self.consistency.status == CheckStatus::Warning
            || self.integrity.status != CheckStatus::Passed
    }

    /// 0 = healthy and clean, 1 = issues detected or warnings.
    pub fn exit_code(&self) -> i32 {
        if self.is_healthy() && !self.has_warnings() {
            0
        } else {
            1
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{}: operational schema {}, star schema {}, consistency {} (ratio {:.3}), integrity {}",
            self.overall_status.as_str(),
            self.operational_schema.status.as_str(),
            self.star_schema.status.as_str(),
            self.consistency.status.as_str(),
            self.consistency.transaction_ratio,
            self.integrity.status.as_str()
        )
    }
}

// ============================================================================
// AUDITOR
// ============================================================================

pub struct ConsistencyAuditor<'a> {
    config: &'a DatabaseConfig,
    thresholds: AuditThresholds,
}

impl<'a> ConsistencyAuditor<'a> {
    pub fn new(config: &'a DatabaseConfig) -> Self {
        ConsistencyAuditor {
            config,
            thresholds: AuditThresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: AuditThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Run every check. Never fails: problems become report entries.
    pub fn run(&self) -> ConsistencyReport {
        let operational = &self.config.operational_db_path;
        let analytics = &self.config.analytics_db_path;

        let existence = self.check_existence();
        let operational_info = self.store_info(operational);
        let analytics_info = self.store_info(analytics);
        let operational_schema = self.check_operational_schema();
        let star_schema = self.check_star_schema();
        let consistency = self.check_consistency();
        let integrity = self.probe_integrity();

        let healthy = operational_schema.status == CheckStatus::Passed
            && star_schema.status == CheckStatus::Passed
            && consistency.status != CheckStatus::Failed;
        let overall_status = if healthy {
            OverallStatus::Healthy
        } else {
            OverallStatus::IssuesDetected
        };

        let report = ConsistencyReport {
            timestamp: Utc::now(),
            operational_db: operational.clone(),
            analytics_db: analytics.clone(),
            existence,
            operational_info,
            analytics_info,
            operational_schema,
            star_schema,
            consistency,
            integrity,
            overall_status,
        };
        info!(summary = %report.summary(), "health check complete");
        report
    }

    pub fn check_existence(&self) -> ExistenceCheck {
        let operational_exists = db::store_exists(&self.config.operational_db_path);
        let analytics_exists = db::store_exists(&self.config.analytics_db_path);
        ExistenceCheck {
            status: if operational_exists && analytics_exists {
                CheckStatus::Passed
            } else {
                CheckStatus::Failed
            },
            operational_exists,
            analytics_exists,
        }
    }

    pub fn store_info(&self, path: &Path) -> Option<StoreInfo> {
        if !db::store_exists(path) {
            return None;
        }
        match self.read_store_info(path) {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read store info");
                None
            }
        }
    }

    fn read_store_info(&self, path: &Path) -> Result<StoreInfo> {
        let conn = db::open_read_only(path, self.config)?;
        let tables = db::list_tables(&conn)?;
        let table_counts = count_tables(&conn, tables.iter().map(String::as_str));
        Ok(StoreInfo {
            path: path.to_path_buf(),
            total_tables: tables.len(),
            tables,
            table_counts,
            size_mb: db::file_size_mb(path),
        })
    }

    pub fn check_operational_schema(&self) -> SchemaCheck {
        let store = Store::Operational;
        let path = &self.config.operational_db_path;
        if !db::store_exists(path) {
            return SchemaCheck::failed(store, &OPERATIONAL_TABLES, "Operational database not found".to_string());
        }

        let result = db::open_read_only(path, self.config).and_then(|conn| {
            let missing = db::missing_tables(&conn, &OPERATIONAL_TABLES)?;
            let present = OPERATIONAL_TABLES.iter().copied().filter(|t| !missing.iter().any(|m| m == t));
            Ok((missing.clone(), count_tables(&conn, present)))
        });

        match result {
            Ok((missing, table_counts)) => schema_result(store, &OPERATIONAL_TABLES, missing, None, table_counts),
            Err(e) => SchemaCheck::failed(store, &OPERATIONAL_TABLES, format!("Schema validation error: {}", e)),
        }
    }

    /// Star tables present and the fact table declares its dimension FKs.
    pub fn check_star_schema(&self) -> SchemaCheck {
        let store = Store::Analytics;
        let path = &self.config.analytics_db_path;
        if !db::store_exists(path) {
            return SchemaCheck::failed(store, &STAR_TABLES, "Analytics database not found".to_string());
        }

        let result = db::open_read_only(path, self.config).and_then(|conn| {
            let missing = db::missing_tables(&conn, &STAR_TABLES)?;
            if !missing.is_empty() {
                return Ok((missing, None, BTreeMap::new()));
            }
            let keys = db::foreign_keys(&conn, "fact_spend_analytics")?;
            let counts = count_tables(&conn, STAR_TABLES.iter().copied());
            Ok((missing, Some(keys), counts))
        });

        let (missing, keys, table_counts) = match result {
            Ok(found) => found,
            Err(e) => {
                return SchemaCheck::failed(store, &STAR_TABLES, format!("Schema validation error: {}", e))
            }
        };

        let mut check = schema_result(store, &STAR_TABLES, missing, None, table_counts);
        if let Some(keys) = keys {
            check.foreign_keys = Some(keys.len());
            let undeclared = undeclared_foreign_keys(&keys);
            if !undeclared.is_empty() {
                check.status = CheckStatus::Failed;
                check.reason = Some(format!(
                    "fact_spend_analytics is missing foreign keys: {}",
                    undeclared.join(", ")
                ));
            }
        }
        check
    }

    pub fn check_consistency(&self) -> ConsistencyCheck {
        match self.read_volumes() {
            Ok((op_vendors, an_vendors, op_transactions, an_facts)) => {
                evaluate_consistency(op_vendors, an_vendors, op_transactions, an_facts, &self.thresholds)
            }
            Err(e) => ConsistencyCheck {
                status: CheckStatus::Failed,
                operational_vendors: 0,
                analytics_vendors: 0,
                operational_transactions: 0,
                analytics_facts: 0,
                vendor_consistent: false,
                transaction_ratio: 0.0,
                reason: Some(format!("Consistency check error: {}", e)),
            },
        }
    }

    fn read_volumes(&self) -> Result<(i64, i64, i64, i64)> {
        let (op_vendors, op_transactions) = {
            let conn = db::open_read_only(&self.config.operational_db_path, self.config)?;
            (
                db::count_rows(&conn, "vendors")?,
                db::count_rows(&conn, "spend_transactions")?,
            )
        };
        let (an_vendors, an_facts) = {
            let conn = db::open_read_only(&self.config.analytics_db_path, self.config)?;
            (
                db::count_rows(&conn, "dim_vendors")?,
                db::count_rows(&conn, "fact_spend_analytics")?,
            )
        };
        debug!(op_vendors, an_vendors, op_transactions, an_facts, "volumes read");
        Ok((op_vendors, an_vendors, op_transactions, an_facts))
    }

    /// Data-level counterparts of the schema invariants. Reported only.
    pub fn probe_integrity(&self) -> IntegrityProbe {
        match self.read_integrity() {
            Ok((orphans, duplicates, multi_vendor, multi_commodity)) => {
                let clean = orphans == 0 && duplicates == 0 && multi_vendor == 0 && multi_commodity == 0;
                IntegrityProbe {
                    status: if clean { CheckStatus::Passed } else { CheckStatus::Warning },
                    orphan_facts: orphans,
                    duplicate_source_ids: duplicates,
                    vendors_with_multiple_current: multi_vendor,
                    commodities_with_multiple_current: multi_commodity,
                    reason: None,
                }
            }
            Err(e) => IntegrityProbe {
                status: CheckStatus::Failed,
                orphan_facts: 0,
                duplicate_source_ids: 0,
                vendors_with_multiple_current: 0,
                commodities_with_multiple_current: 0,
                reason: Some(format!("Integrity probe error: {}", e)),
            },
        }
    }

    fn read_integrity(&self) -> Result<(i64, i64, i64, i64)> {
        let conn = db::open_read_only(&self.config.analytics_db_path, self.config)?;
        let scalar = |sql: &str| -> Result<i64> { Ok(conn.query_row(sql, [], |row| row.get(0))?) };

        let orphans = scalar(
            "SELECT COUNT(*) FROM fact_spend_analytics f
             WHERE NOT EXISTS (SELECT 1 FROM dim_vendors d WHERE d.vendor_key = f.vendor_key)
                OR NOT EXISTS (SELECT 1 FROM dim_commodities c WHERE c.commodity_key = f.commodity_key)
                OR NOT EXISTS (SELECT 1 FROM dim_time t WHERE t.time_key = f.time_key)",
        )?;
        let duplicates = scalar(
            "SELECT COUNT(*) FROM (
                SELECT source_transaction_id FROM fact_spend_analytics
                WHERE source_transaction_id IS NOT NULL
                GROUP BY source_transaction_id HAVING COUNT(*) > 1
             )",
        )?;
        let multi_vendor = scalar(
            "SELECT COUNT(*) FROM (
                SELECT vendor_id FROM dim_vendors WHERE is_current_record = 1
                GROUP BY vendor_id HAVING COUNT(*) > 1
             )",
        )?;
        let multi_commodity = scalar(
            "SELECT COUNT(*) FROM (
                SELECT commodity_id FROM dim_commodities WHERE is_current_record = 1
                GROUP BY commodity_id HAVING COUNT(*) > 1
             )",
        )?;

        Ok((orphans, duplicates, multi_vendor, multi_commodity))
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Row-count rule: vendor delta within tolerance and fact ratio strictly
/// above the minimum. No transactions means a ratio of 0.
pub fn evaluate_consistency(
    operational_vendors: i64,
    analytics_vendors: i64,
    operational_transactions: i64,
    analytics_facts: i64,
    thresholds: &AuditThresholds,
) -> ConsistencyCheck {
    let vendor_consistent =
        (operational_vendors - analytics_vendors).abs() <= thresholds.vendor_delta_tolerance;
    let transaction_ratio = if operational_transactions > 0 {
        analytics_facts as f64 / operational_transactions as f64
    } else {
        0.0
    };
    let status = if vendor_consistent && transaction_ratio > thresholds.min_fact_ratio {
        CheckStatus::Passed
    } else {
        CheckStatus::Warning
    };

    ConsistencyCheck {
        status,
        operational_vendors,
        analytics_vendors,
        operational_transactions,
        analytics_facts,
        vendor_consistent,
        transaction_ratio,
        reason: None,
    }
}

fn undeclared_foreign_keys(keys: &[ForeignKey]) -> Vec<String> {
    FACT_FOREIGN_KEYS
        .iter()
        .filter(|(column, table)| {
            !keys
                .iter()
                .any(|k| k.from_column == *column && k.target_table == *table)
        })
        .map(|(column, table)| format!("{} -> {}", column, table))
        .collect()
}

fn schema_result(
    store: Store,
    required: &[&str],
    missing: Vec<String>,
    foreign_keys: Option<usize>,
    table_counts: BTreeMap<String, i64>,
) -> SchemaCheck {
    let (status, reason) = if missing.is_empty() {
        (CheckStatus::Passed, None)
    } else {
        (
            CheckStatus::Failed,
            Some(format!("Missing {} tables: {}", store.as_str(), missing.join(", "))),
        )
    };
    SchemaCheck {
        store,
        status,
        required_tables: required.iter().map(|t| t.to_string()).collect(),
        missing_tables: missing,
        foreign_keys,
        table_counts,
        reason,
    }
}

/// Row counts per table; tables that cannot be counted are left out.
fn count_tables<'t>(conn: &Connection, tables: impl Iterator<Item = &'t str>) -> BTreeMap<String, i64> {
    let mut counts = BTreeMap::new();
    for table in tables {
        match db::count_rows(conn, table) {
            Ok(count) => {
                counts.insert(table.to_string(), count);
            }
            Err(e) => debug!(table, error = %e, "row count failed"),
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EtlConfig;
    use crate::schema;
    use tempfile::TempDir;

    fn stores(dir: &TempDir) -> EtlConfig {
        let config = EtlConfig::for_paths(dir.path().join("op.db"), dir.path().join("an.db"));
        let op = Connection::open(&config.database.operational_db_path).unwrap();
        schema::create_operational_schema(&op).unwrap();
        let an = Connection::open(&config.database.analytics_db_path).unwrap();
        schema::create_analytics_schema(&an).unwrap();
        config
    }

    #[test]
    fn test_vendor_tolerance_boundary() {
        let t = AuditThresholds::default();

        let at_limit = evaluate_consistency(110, 100, 100, 100, &t);
        assert!(at_limit.vendor_consistent);
        assert_eq!(at_limit.status, CheckStatus::Passed);

        let over = evaluate_consistency(111, 100, 100, 100, &t);
        assert!(!over.vendor_consistent);
        assert_eq!(over.status, CheckStatus::Warning);
    }

    #[test]
    fn test_ratio_boundary_is_strict() {
        let t = AuditThresholds::default();

        assert_eq!(evaluate_consistency(5, 5, 100, 90, &t).status, CheckStatus::Warning);
        assert_eq!(evaluate_consistency(5, 5, 100, 91, &t).status, CheckStatus::Passed);
    }

    #[test]
    fn test_zero_transactions_gives_zero_ratio() {
        let check = evaluate_consistency(0, 0, 0, 0, &AuditThresholds::default());

        assert_eq!(check.transaction_ratio, 0.0);
        assert_eq!(check.status, CheckStatus::Warning);
    }

    #[test]
    fn test_empty_but_valid_stores_are_healthy_with_warning() {
        let dir = TempDir::new().unwrap();
        let config = stores(&dir);

        let report = ConsistencyAuditor::new(&config.database).run();

        assert_eq!(report.existence.status, CheckStatus::Passed);
        assert_eq!(report.operational_schema.status, CheckStatus::Passed);
        assert_eq!(report.star_schema.status, CheckStatus::Passed);
        assert_eq!(report.star_schema.foreign_keys, Some(3));
        assert_eq!(report.consistency.status, CheckStatus::Warning);
        assert_eq!(report.overall_status, OverallStatus::Healthy);
        assert_eq!(report.exit_code(), 1, "warnings are surfaced through the exit code");
    }

    #[test]
    fn test_missing_tables_fail_schema_check() {
        let dir = TempDir::new().unwrap();
        let config = stores(&dir);
        let op = Connection::open(&config.database.operational_db_path).unwrap();
        op.execute_batch("DROP TABLE contracts;").unwrap();
        drop(op);

        let report = ConsistencyAuditor::new(&config.database).run();

        assert_eq!(report.operational_schema.status, CheckStatus::Failed);
        assert_eq!(report.operational_schema.missing_tables, vec!["contracts".to_string()]);
        assert_eq!(report.star_schema.status, CheckStatus::Passed, "other checks still run");
        assert_eq!(report.overall_status, OverallStatus::IssuesDetected);
    }

    #[test]
    fn test_undeclared_foreign_keys_fail_star_schema() {
        let dir = TempDir::new().unwrap();
        let config = stores(&dir);
        let an = Connection::open(&config.database.analytics_db_path).unwrap();
        an.execute_batch(
            "DROP TABLE fact_spend_analytics;
             CREATE TABLE fact_spend_analytics (
                fact_key INTEGER PRIMARY KEY, vendor_key INTEGER, commodity_key INTEGER,
                time_key INTEGER, source_transaction_id TEXT,
                FOREIGN KEY (vendor_key) REFERENCES dim_vendors(vendor_key)
             );",
        )
        .unwrap();
        drop(an);

        let check = ConsistencyAuditor::new(&config.database).check_star_schema();

        assert_eq!(check.status, CheckStatus::Failed);
        assert_eq!(check.foreign_keys, Some(1));
        let reason = check.reason.unwrap();
        assert!(reason.contains("commodity_key -> dim_commodities"));
        assert!(reason.contains("time_key -> dim_time"));
    }

    #[test]
    fn test_missing_store_never_raises_and_creates_nothing() {
        let dir = TempDir::new().unwrap();
        let config = EtlConfig::for_paths(dir.path().join("op.db"), dir.path().join("an.db"));

        let report = ConsistencyAuditor::new(&config.database).run();

        assert_eq!(report.existence.status, CheckStatus::Failed);
        assert!(!report.existence.operational_exists);
        assert_eq!(report.operational_schema.status, CheckStatus::Failed);
        assert_eq!(report.star_schema.status, CheckStatus::Failed);
        assert_eq!(report.consistency.status, CheckStatus::Failed);
        assert_eq!(report.overall_status, OverallStatus::IssuesDetected);
        assert!(!config.database.operational_db_path.exists());
        assert!(!config.database.analytics_db_path.exists());
    }

    #[test]
    fn test_integrity_probe_flags_duplicates_and_orphans() {
        let dir = TempDir::new().unwrap();
        let config = stores(&dir);
        let an = Connection::open(&config.database.analytics_db_path).unwrap();
        // Bundled SQLite enforces foreign keys by default; orphans need it off.
        an.execute_batch(
            "PRAGMA foreign_keys = OFF;
             INSERT INTO dim_vendors (vendor_key, vendor_id, is_current_record) VALUES (1, 'V1', 1), (2, 'V1', 1);
             INSERT INTO fact_spend_analytics (vendor_key, commodity_key, time_key, source_transaction_id)
                VALUES (1, 99, 20240101, 'T1'), (1, 99, 20240101, 'T1');",
        )
        .unwrap();
        drop(an);

        let probe = ConsistencyAuditor::new(&config.database).probe_integrity();

        assert_eq!(probe.status, CheckStatus::Warning);
        assert_eq!(probe.orphan_facts, 2);
        assert_eq!(probe.duplicate_source_ids, 1);
        assert_eq!(probe.vendors_with_multiple_current, 1);
        assert_eq!(probe.commodities_with_multiple_current, 0);
    }

    #[test]
    fn test_report_serializes_status_names() {
        let dir = TempDir::new().unwrap();
        let config = stores(&dir);

        let report = ConsistencyAuditor::new(&config.database).run();
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["overall_status"], "HEALTHY");
        assert_eq!(json["star_schema"]["status"], "PASSED");
        assert_eq!(json["consistency"]["status"], "WARNING");
    }
}
