// 📐 Store layouts - operational tables and the analytics star schema
//
// The DDL here bootstraps empty stores (the `init` command and tests).
// The table lists are also the contract the auditor checks against.

use crate::config::DatabaseConfig;
use crate::error::Result;
use chrono::{Datelike, NaiveDate};
use rusqlite::{params, Connection};
use std::path::Path;
use tracing::info;

pub const OPERATIONAL_TABLES: [&str; 4] = ["vendors", "spend_transactions", "contracts", "commodities"];

pub const STAR_TABLES: [&str; 4] = [
    "dim_vendors",
    "dim_commodities",
    "dim_time",
    "fact_spend_analytics",
];

/// (fact column, referenced dimension table) pairs the fact table must declare
pub const FACT_FOREIGN_KEYS: [(&str, &str); 3] = [
    ("vendor_key", "dim_vendors"),
    ("commodity_key", "dim_commodities"),
    ("time_key", "dim_time"),
];

// ============================================================================
// OPERATIONAL STORE
// ============================================================================

pub fn create_operational_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS vendors (
            vendor_id TEXT PRIMARY KEY,
            vendor_name TEXT NOT NULL,
            vendor_tier TEXT,
            diversity_classification TEXT,
            country TEXT,
            region TEXT
        );

        CREATE TABLE IF NOT EXISTS commodities (
            commodity_id TEXT PRIMARY KEY,
            commodity_description TEXT NOT NULL,
            parent_category TEXT,
            sub_category TEXT,
            category_manager TEXT
        );

        CREATE TABLE IF NOT EXISTS contracts (
            contract_id TEXT PRIMARY KEY,
            vendor_id TEXT REFERENCES vendors(vendor_id),
            commodity_id TEXT REFERENCES commodities(commodity_id),
            contract_value REAL,
            start_date DATE,
            end_date DATE
        );

        CREATE TABLE IF NOT EXISTS spend_transactions (
            transaction_id INTEGER PRIMARY KEY,
            vendor_id TEXT NOT NULL,
            commodity_id TEXT NOT NULL,
            contract_id TEXT,
            award_date DATE NOT NULL,
            total_amount REAL NOT NULL,
            quantity REAL,
            unit_price REAL
        );",
    )?;
    Ok(())
}

// ============================================================================
// ANALYTICS STORE (STAR SCHEMA)
// ============================================================================

pub fn create_analytics_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS dim_vendors (
            vendor_key INTEGER PRIMARY KEY,
            vendor_id TEXT,
            vendor_name TEXT,
            vendor_tier TEXT,
            diversity_classification TEXT,
            risk_rating TEXT,
            esg_score REAL,
            country TEXT,
            region TEXT,
            effective_start_date DATE,
            effective_end_date DATE,
            is_current_record BOOLEAN
        );

        CREATE TABLE IF NOT EXISTS dim_commodities (
            commodity_key INTEGER PRIMARY KEY,
            commodity_id TEXT,
            commodity_description TEXT,
            parent_category TEXT,
            sub_category TEXT,
            business_criticality TEXT,
            sourcing_complexity TEXT,
            category_manager TEXT,
            effective_start_date DATE,
            is_current_record BOOLEAN
        );

        CREATE TABLE IF NOT EXISTS dim_time (
            time_key INTEGER PRIMARY KEY,
            date_actual DATE,
            year INTEGER,
            quarter INTEGER,
            month INTEGER,
            fiscal_year INTEGER,
            fiscal_quarter INTEGER,
            month_name TEXT,
            quarter_name TEXT,
            day_of_week TEXT,
            week_of_year INTEGER
        );

        CREATE TABLE IF NOT EXISTS fact_spend_analytics (
            fact_key INTEGER PRIMARY KEY,
            vendor_key INTEGER,
            commodity_key INTEGER,
            contract_key INTEGER,
            time_key INTEGER,
            business_unit_key INTEGER,
            spend_amount REAL,
            transaction_count INTEGER,
            quantity REAL,
            unit_price REAL,
            delivery_performance_score REAL,
            quality_score REAL,
            compliance_score REAL,
            risk_weighted_spend REAL,
            esg_weighted_spend REAL,
            savings_amount REAL,
            discount_amount REAL,
            source_transaction_id TEXT,
            load_date DATE,
            FOREIGN KEY (vendor_key) REFERENCES dim_vendors(vendor_key),
            FOREIGN KEY (commodity_key) REFERENCES dim_commodities(commodity_key),
            FOREIGN KEY (time_key) REFERENCES dim_time(time_key)
        );",
    )?;
    Ok(())
}

/// Lookup indexes for the resolver and loader. The unique index on
/// source_transaction_id makes a duplicate fact an IntegrityViolation.
pub fn ensure_indexes(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_dim_vendors_natural
            ON dim_vendors(vendor_id, is_current_record);
        CREATE INDEX IF NOT EXISTS idx_dim_commodities_natural
            ON dim_commodities(commodity_id, is_current_record);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_fact_source_transaction
            ON fact_spend_analytics(source_transaction_id);
        CREATE INDEX IF NOT EXISTS idx_fact_time
            ON fact_spend_analytics(time_key);",
    )?;
    Ok(())
}

// ============================================================================
// TIME DIMENSION
// ============================================================================

/// Integer date key: year*10000 + month*100 + day.
pub fn time_key(date: NaiveDate) -> i64 {
    i64::from(date.year()) * 10000 + i64::from(date.month()) * 100 + i64::from(date.day())
}

/// Fiscal year starts in July and is named after the year it ends in.
fn fiscal_period(date: NaiveDate) -> (i32, u32) {
    let month = date.month();
    let fiscal_year = if month >= 7 { date.year() + 1 } else { date.year() };
    let fiscal_quarter = ((month + 5) % 12) / 3 + 1;
    (fiscal_year, fiscal_quarter)
}

/// Fill dim_time for every day in `start..=end`. Existing days are kept.
pub fn populate_time_dimension(conn: &Connection, start: NaiveDate, end: NaiveDate) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut inserted = 0;

    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO dim_time (
                time_key, date_actual, year, quarter, month, fiscal_year,
                fiscal_quarter, month_name, quarter_name, day_of_week, week_of_year
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )?;

        for date in start.iter_days().take_while(|d| *d <= end) {
            let quarter = (date.month() - 1) / 3 + 1;
            let (fiscal_year, fiscal_quarter) = fiscal_period(date);
            inserted += stmt.execute(params![
                time_key(date),
                date.format("%Y-%m-%d").to_string(),
                date.year(),
                quarter,
                date.month(),
                fiscal_year,
                fiscal_quarter,
                date.format("%B").to_string(),
                format!("Q{}", quarter),
                date.format("%A").to_string(),
                date.iso_week().week(),
            ])?;
        }
    }

    tx.commit()?;
    info!(inserted, %start, %end, "time dimension populated");
    Ok(inserted)
}

// ============================================================================
// BOOTSTRAP
// ============================================================================

/// Create both stores (and their directories) if needed, lay down the
/// schemas and indexes, and fill dim_time for `start..=end`.
/// Returns the number of new dim_time rows.
pub fn initialize_stores(database: &DatabaseConfig, start: NaiveDate, end: NaiveDate) -> Result<usize> {
    let operational = create_store(&database.operational_db_path)?;
    create_operational_schema(&operational)?;

    let analytics = create_store(&database.analytics_db_path)?;
    create_analytics_schema(&analytics)?;
    ensure_indexes(&analytics)?;
    populate_time_dimension(&analytics, start, end)
}

fn create_store(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    Ok(Connection::open(path)?)
}
