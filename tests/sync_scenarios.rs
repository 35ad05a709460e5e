// End-to-end sync scenarios against file-backed stores

use chrono::NaiveDate;
use procurement_etl::{
    initialize_stores, CheckStatus, ConsistencyAuditor, EtlConfig, EtlError, OverallStatus, SyncEngine,
};
use rusqlite::{params, Connection};
use tempfile::TempDir;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Fresh stores with dim_time covering 2024.
fn setup() -> (TempDir, EtlConfig) {
    let dir = TempDir::new().unwrap();
    let config = EtlConfig::for_paths(dir.path().join("operational.db"), dir.path().join("analytics.db"));
    initialize_stores(&config.database, date(2024, 1, 1), date(2024, 12, 31)).unwrap();
    (dir, config)
}

fn operational(config: &EtlConfig) -> Connection {
    Connection::open(&config.database.operational_db_path).unwrap()
}

fn analytics(config: &EtlConfig) -> Connection {
    Connection::open(&config.database.analytics_db_path).unwrap()
}

fn add_vendors(conn: &Connection, count: usize) {
    for i in 1..=count {
        conn.execute(
            "INSERT INTO vendors (vendor_id, vendor_name, vendor_tier, country)
             VALUES (?1, ?2, 'Preferred', 'US')",
            params![format!("V{:03}", i), format!("Vendor {}", i)],
        )
        .unwrap();
    }
}

fn add_commodities(conn: &Connection) {
    conn.execute_batch(
        "INSERT INTO commodities (commodity_id, commodity_description, parent_category)
            VALUES ('C1', 'Steel', 'Raw Materials'), ('C2', 'Laptops', 'IT');",
    )
    .unwrap();
}

/// transaction_id is INTEGER PRIMARY KEY at the source, so ids are numeric.
fn add_transaction(conn: &Connection, id: i64, vendor: &str, award_date: &str) {
    conn.execute(
        "INSERT INTO spend_transactions
            (transaction_id, vendor_id, commodity_id, award_date, total_amount, quantity, unit_price)
         VALUES (?1, ?2, 'C1', ?3, 1000.0, 10, 100.0)",
        params![id, vendor, award_date],
    )
    .unwrap();
}

fn count(conn: &Connection, sql: &str) -> i64 {
    conn.query_row(sql, [], |row| row.get(0)).unwrap()
}

fn seed_standard(config: &EtlConfig, vendors: usize, transactions: usize) {
    let op = operational(config);
    add_vendors(&op, vendors);
    add_commodities(&op);
    for i in 1..=transactions {
        let vendor = format!("V{:03}", (i - 1) % vendors + 1);
        add_transaction(&op, i as i64, &vendor, &format!("2024-03-{:02}", i % 28 + 1));
    }
}

#[test]
fn test_hundred_vendors_load_as_current_rows() {
    let (_dir, config) = setup();
    seed_standard(&config, 100, 0);

    let report = SyncEngine::new(&config).run_on(date(2024, 6, 1)).unwrap();

    assert_eq!(report.vendors.inserted, 100);
    let an = analytics(&config);
    assert_eq!(count(&an, "SELECT COUNT(*) FROM dim_vendors"), 100);
    assert_eq!(count(&an, "SELECT COUNT(*) FROM dim_vendors WHERE is_current_record = 1"), 100);
    assert_eq!(
        count(&an, "SELECT COUNT(*) FROM dim_vendors WHERE effective_start_date = '2024-06-01'"),
        100
    );
}

#[test]
fn test_second_run_is_idempotent() {
    let (_dir, config) = setup();
    seed_standard(&config, 20, 40);
    let engine = SyncEngine::new(&config);

    let first = engine.run_on(date(2024, 6, 1)).unwrap();
    assert_eq!(first.facts.inserted, 40);
    assert!(!first.has_warnings());

    let second = engine.run_on(date(2024, 6, 2)).unwrap();
    assert_eq!(second.dimension_rows_inserted(), 0);
    assert_eq!(second.facts.inserted, 0);
    assert_eq!(second.facts.already_loaded, 40);

    let an = analytics(&config);
    assert_eq!(count(&an, "SELECT COUNT(*) FROM fact_spend_analytics"), 40);
    assert_eq!(count(&an, "SELECT COUNT(*) FROM etl_run_log WHERE status = 'SUCCESS'"), 2);
}

#[test]
fn test_new_transactions_only_add_facts() {
    let (_dir, config) = setup();
    seed_standard(&config, 10, 30);
    let engine = SyncEngine::new(&config);
    engine.run_on(date(2024, 6, 1)).unwrap();

    let op = operational(&config);
    for i in 1..=5 {
        add_transaction(&op, 1000 + i, "V001", "2024-05-15");
    }
    drop(op);

    let report = engine.run_on(date(2024, 6, 2)).unwrap();

    assert_eq!(report.facts.inserted, 5);
    assert_eq!(report.dimension_rows_inserted(), 0);
    assert_eq!(count(&analytics(&config), "SELECT COUNT(*) FROM fact_spend_analytics"), 35);
}

#[test]
fn test_transaction_outside_time_range_is_excluded_and_audited() {
    let (_dir, config) = setup();
    seed_standard(&config, 5, 9);
    let op = operational(&config);
    add_transaction(&op, 9001, "V001", "2019-05-01");
    drop(op);

    let report = SyncEngine::new(&config).run_on(date(2024, 6, 1)).unwrap();

    assert_eq!(report.facts.inserted, 9);
    assert_eq!(report.facts.excluded.missing_time, 1);
    assert!(report.has_warnings());

    // 9 of 10 loaded: exactly the 0.9 boundary, which is not enough to pass
    let audit = ConsistencyAuditor::new(&config.database).run();
    assert_eq!(audit.consistency.transaction_ratio, 0.9);
    assert_eq!(audit.consistency.status, CheckStatus::Warning);
    assert_eq!(audit.overall_status, OverallStatus::Healthy);
    assert_eq!(audit.exit_code(), 1);
}

#[test]
fn test_strict_joins_fail_and_roll_back() {
    let (_dir, mut config) = setup();
    config.etl.strict_joins = true;
    seed_standard(&config, 5, 3);
    let op = operational(&config);
    add_transaction(&op, 9999, "V999", "2024-02-02");
    drop(op);

    let err = SyncEngine::new(&config).run_on(date(2024, 6, 1)).unwrap_err();

    assert!(matches!(err.root(), EtlError::UnresolvedTransactions { count: 1 }));
    let an = analytics(&config);
    assert_eq!(count(&an, "SELECT COUNT(*) FROM dim_vendors"), 0);
    assert_eq!(count(&an, "SELECT COUNT(*) FROM fact_spend_analytics"), 0);
}

#[test]
fn test_star_invariants_hold_after_sync() {
    let (_dir, config) = setup();
    seed_standard(&config, 15, 60);
    let engine = SyncEngine::new(&config);
    engine.run_on(date(2024, 6, 1)).unwrap();
    engine.run_on(date(2024, 6, 2)).unwrap();

    let an = analytics(&config);
    assert_eq!(
        count(
            &an,
            "SELECT COUNT(*) FROM (SELECT source_transaction_id FROM fact_spend_analytics
             GROUP BY source_transaction_id HAVING COUNT(*) > 1)"
        ),
        0,
        "source_transaction_id is unique"
    );
    assert_eq!(
        count(
            &an,
            "SELECT COUNT(*) FROM fact_spend_analytics f
             LEFT JOIN dim_vendors v ON v.vendor_key = f.vendor_key
             LEFT JOIN dim_commodities c ON c.commodity_key = f.commodity_key
             LEFT JOIN dim_time t ON t.time_key = f.time_key
             WHERE v.vendor_key IS NULL OR c.commodity_key IS NULL OR t.time_key IS NULL"
        ),
        0,
        "every fact resolves its dimensions"
    );
    assert_eq!(
        count(
            &an,
            "SELECT COUNT(*) FROM (SELECT vendor_id FROM dim_vendors WHERE is_current_record = 1
             GROUP BY vendor_id HAVING COUNT(*) > 1)"
        ),
        0,
        "one current row per vendor"
    );

    let audit = ConsistencyAuditor::new(&config.database).run();
    assert_eq!(audit.overall_status, OverallStatus::Healthy);
    assert_eq!(audit.consistency.status, CheckStatus::Passed);
    assert_eq!(audit.integrity.status, CheckStatus::Passed);
    assert_eq!(audit.exit_code(), 0);
}
