// 📊 Fact Loader - one fact row per operational transaction
//
// Surrogate keys come from the current dimension rows and the pre-populated
// time dimension (inner-join semantics). A transaction missing any of the
// three lookups is excluded from this run and counted by reason, so
// "nothing new" and "dropped for missing dimension data" stay distinguishable.
// source_transaction_id is the idempotence key.

use crate::dimension::surrogate_keys;
use crate::error::{EtlError, Result};
use crate::schema::time_key;
use crate::source::{Commodity, SpendTransaction, Vendor};
use chrono::NaiveDate;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct FactLoadOptions {
    pub batch_size: usize,
    /// Exclude transactions without a finite amount
    pub validate: bool,
    /// Any exclusion aborts the load instead of being counted
    pub strict_joins: bool,
}

impl Default for FactLoadOptions {
    fn default() -> Self {
        FactLoadOptions {
            batch_size: 1000,
            validate: true,
            strict_joins: false,
        }
    }
}

/// Why transactions were left out of the fact table this run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Exclusions {
    pub missing_vendor: usize,
    pub missing_commodity: usize,
    pub missing_time: usize,
    pub invalid_date: usize,
    pub invalid_amount: usize,
}

impl Exclusions {
    pub fn total(&self) -> usize {
        self.missing_vendor
            + self.missing_commodity
            + self.missing_time
            + self.invalid_date
            + self.invalid_amount
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FactLoadOutcome {
    pub inserted: usize,
    pub already_loaded: usize,
    pub excluded: Exclusions,
}

enum Resolution {
    Resolved {
        vendor_key: i64,
        commodity_key: i64,
        time_key: i64,
    },
    Excluded,
}

/// Parse the date part of a source timestamp ("YYYY-MM-DD", optionally
/// followed by a time separated by a space or 'T').
pub fn parse_award_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    let date_part = match raw.get(..10) {
        Some(head) if raw.len() == 10 => head,
        Some(head) if matches!(raw.as_bytes().get(10), Some(&b' ') | Some(&b'T')) => head,
        _ => return None,
    };
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

pub fn load_facts(
    conn: &Connection,
    transactions: &[SpendTransaction],
    load_date: NaiveDate,
    options: &FactLoadOptions,
) -> Result<FactLoadOutcome> {
    let mut loaded = loaded_source_ids(conn)?;
    let vendor_keys = surrogate_keys::<Vendor>(conn, "vendor_key")?;
    let commodity_keys = surrogate_keys::<Commodity>(conn, "commodity_key")?;
    let time_keys = calendar_keys(conn)?;

    let mut stmt = conn.prepare(
        "INSERT INTO fact_spend_analytics (
            vendor_key, commodity_key, time_key, spend_amount, transaction_count,
            quantity, unit_price, source_transaction_id, load_date
        ) VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7, ?8)",
    )?;

    let load_date = load_date.format("%Y-%m-%d").to_string();
    let batch_size = options.batch_size.max(1);
    let mut outcome = FactLoadOutcome::default();

    for tx in transactions {
        if loaded.contains(&tx.transaction_id) {
            outcome.already_loaded += 1;
            continue;
        }

        if options.validate && !tx.total_amount.is_some_and(f64::is_finite) {
            outcome.excluded.invalid_amount += 1;
            debug!(transaction_id = %tx.transaction_id, "excluded: invalid amount");
            continue;
        }

        let resolution = {
            let date = tx.award_date.as_deref().and_then(parse_award_date);
            let vendor = tx.vendor_id.as_ref().and_then(|id| vendor_keys.get(id));
            let commodity = tx.commodity_id.as_ref().and_then(|id| commodity_keys.get(id));

            match (date, vendor, commodity) {
                (None, _, _) => {
                    outcome.excluded.invalid_date += 1;
                    Resolution::Excluded
                }
                (_, None, _) => {
                    outcome.excluded.missing_vendor += 1;
                    Resolution::Excluded
                }
                (_, _, None) => {
                    outcome.excluded.missing_commodity += 1;
                    Resolution::Excluded
                }
                (Some(date), Some(&vendor_key), Some(&commodity_key)) => {
                    let key = time_key(date);
                    if time_keys.contains(&key) {
                        Resolution::Resolved {
                            vendor_key,
                            commodity_key,
                            time_key: key,
                        }
                    } else {
                        outcome.excluded.missing_time += 1;
                        Resolution::Excluded
                    }
                }
            }
        };

        let Resolution::Resolved {
            vendor_key,
            commodity_key,
            time_key,
        } = resolution
        else {
            debug!(transaction_id = %tx.transaction_id, "excluded: dimension lookup missed");
            continue;
        };

        stmt.execute(params![
            vendor_key,
            commodity_key,
            time_key,
            tx.total_amount,
            tx.quantity,
            tx.unit_price,
            tx.transaction_id,
            load_date,
        ])?;
        loaded.insert(tx.transaction_id.clone());
        outcome.inserted += 1;

        if outcome.inserted % batch_size == 0 {
            debug!(inserted = outcome.inserted, "fact batch written");
        }
    }

    let excluded = outcome.excluded.total();
    if excluded > 0 {
        warn!(
            excluded,
            missing_vendor = outcome.excluded.missing_vendor,
            missing_commodity = outcome.excluded.missing_commodity,
            missing_time = outcome.excluded.missing_time,
            invalid_date = outcome.excluded.invalid_date,
            invalid_amount = outcome.excluded.invalid_amount,
            "transactions excluded from fact table"
        );
        if options.strict_joins {
            return Err(EtlError::UnresolvedTransactions { count: excluded });
        }
    }

    info!(
        inserted = outcome.inserted,
        already_loaded = outcome.already_loaded,
        "facts loaded"
    );

    Ok(outcome)
}

fn loaded_source_ids(conn: &Connection) -> Result<HashSet<String>> {
    let mut stmt = conn.prepare(
        "SELECT CAST(source_transaction_id AS TEXT) FROM fact_spend_analytics
         WHERE source_transaction_id IS NOT NULL",
    )?;
    let ids = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<HashSet<String>, _>>()?;
    Ok(ids)
}

fn calendar_keys(conn: &Connection) -> Result<HashSet<i64>> {
    let mut stmt = conn.prepare("SELECT time_key FROM dim_time WHERE time_key IS NOT NULL")?;
    let keys = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<HashSet<i64>, _>>()?;
    Ok(keys)
}
