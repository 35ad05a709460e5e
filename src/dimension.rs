// 🧭 Dimension Resolver - natural key → surrogate key, append-only
//
// A natural key with no current row gets exactly one new row, stamped with
// the load date and is_current_record = 1. Keys that already have a current
// row are left untouched even when the source attributes changed: drift is
// counted and logged, never written.

use crate::error::Result;
use crate::source::{Commodity, Vendor};
use chrono::NaiveDate;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{info, warn};

// ============================================================================
// DEFAULTS FOR ATTRIBUTES THE SOURCE CANNOT SUPPLY
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct DimensionDefaults {
    pub vendor_risk_rating: String,
    pub commodity_business_criticality: String,
    pub commodity_sourcing_complexity: String,
}

impl Default for DimensionDefaults {
    fn default() -> Self {
        DimensionDefaults {
            vendor_risk_rating: "Medium".to_string(),
            commodity_business_criticality: "Medium".to_string(),
            commodity_sourcing_complexity: "Medium".to_string(),
        }
    }
}

// ============================================================================
// DIMENSION MEMBERS
// ============================================================================

/// An operational entity that maps onto one row of a dimension table.
pub trait DimensionMember {
    const TABLE: &'static str;
    const NATURAL_KEY: &'static str;
    /// Columns copied from the source, in `attributes()` order
    const ATTRIBUTES: &'static [&'static str];

    fn natural_key(&self) -> &str;
    fn attributes(&self) -> Vec<Option<String>>;
    /// Placeholder columns filled on insert only
    fn default_columns(defaults: &DimensionDefaults) -> Vec<(&'static str, String)>;
}

impl DimensionMember for Vendor {
    const TABLE: &'static str = "dim_vendors";
    const NATURAL_KEY: &'static str = "vendor_id";
    const ATTRIBUTES: &'static [&'static str] = &[
        "vendor_name",
        "vendor_tier",
        "diversity_classification",
        "country",
        "region",
    ];

    fn natural_key(&self) -> &str {
        &self.vendor_id
    }

    fn attributes(&self) -> Vec<Option<String>> {
        vec![
            self.vendor_name.clone(),
            self.vendor_tier.clone(),
            self.diversity_classification.clone(),
            self.country.clone(),
            self.region.clone(),
        ]
    }

    fn default_columns(defaults: &DimensionDefaults) -> Vec<(&'static str, String)> {
        vec![("risk_rating", defaults.vendor_risk_rating.clone())]
    }
}

impl DimensionMember for Commodity {
    const TABLE: &'static str = "dim_commodities";
    const NATURAL_KEY: &'static str = "commodity_id";
    const ATTRIBUTES: &'static [&'static str] = &[
        "commodity_description",
        "parent_category",
        "sub_category",
        "category_manager",
    ];

    fn natural_key(&self) -> &str {
        &self.commodity_id
    }

    fn attributes(&self) -> Vec<Option<String>> {
        vec![
            self.commodity_description.clone(),
            self.parent_category.clone(),
            self.sub_category.clone(),
            self.category_manager.clone(),
        ]
    }

    fn default_columns(defaults: &DimensionDefaults) -> Vec<(&'static str, String)> {
        vec![
            ("business_criticality", defaults.commodity_business_criticality.clone()),
            ("sourcing_complexity", defaults.commodity_sourcing_complexity.clone()),
        ]
    }
}

// ============================================================================
// RESOLUTION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolveOutcome {
    pub dimension: &'static str,
    pub inserted: usize,
    pub unchanged: usize,
    /// Existing keys whose source attributes differ from the current row
    pub drifted: usize,
}

/// Insert a current row for every natural key that lacks one.
pub fn resolve<M: DimensionMember>(
    conn: &Connection,
    members: &[M],
    load_date: NaiveDate,
    defaults: &DimensionDefaults,
) -> Result<ResolveOutcome> {
    let mut current = current_rows::<M>(conn)?;
    let default_columns = M::default_columns(defaults);

    let mut columns: Vec<&str> = vec![M::NATURAL_KEY];
    columns.extend_from_slice(M::ATTRIBUTES);
    columns.extend(default_columns.iter().map(|(name, _)| *name));
    columns.push("effective_start_date");
    columns.push("is_current_record");

    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        M::TABLE,
        columns.join(", "),
        placeholders.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;

    let load_date = load_date.format("%Y-%m-%d").to_string();
    let mut outcome = ResolveOutcome {
        dimension: M::TABLE,
        inserted: 0,
        unchanged: 0,
        drifted: 0,
    };

    for member in members {
        let attributes = member.attributes();

        if let Some(existing) = current.get(member.natural_key()) {
            if *existing == attributes {
                outcome.unchanged += 1;
            } else {
                outcome.drifted += 1;
            }
            continue;
        }

        let mut values: Vec<Value> = Vec::with_capacity(columns.len());
        values.push(Value::Text(member.natural_key().to_string()));
        values.extend(attributes.iter().map(|a| match a {
            Some(text) => Value::Text(text.clone()),
            None => Value::Null,
        }));
        values.extend(default_columns.iter().map(|(_, v)| Value::Text(v.clone())));
        values.push(Value::Text(load_date.clone()));
        values.push(Value::Integer(1));

        stmt.execute(params_from_iter(values))?;
        outcome.inserted += 1;
        current.insert(member.natural_key().to_string(), attributes);
    }

    info!(
        dimension = M::TABLE,
        inserted = outcome.inserted,
        unchanged = outcome.unchanged,
        "dimension resolved"
    );
    if outcome.drifted > 0 {
        warn!(
            dimension = M::TABLE,
            drifted = outcome.drifted,
            "source attributes changed for existing keys; dimension rows left as-is"
        );
    }

    Ok(outcome)
}

/// Current rows keyed by natural key, with attributes in ATTRIBUTES order.
fn current_rows<M: DimensionMember>(conn: &Connection) -> Result<HashMap<String, Vec<Option<String>>>> {
    let sql = format!(
        "SELECT {}, {} FROM {} WHERE is_current_record = 1 AND {} IS NOT NULL",
        M::NATURAL_KEY,
        M::ATTRIBUTES.join(", "),
        M::TABLE,
        M::NATURAL_KEY
    );
    let mut stmt = conn.prepare(&sql)?;
    let width = M::ATTRIBUTES.len();

    let rows = stmt
        .query_map([], |row| {
            let key = as_text(row.get_ref(0)?).unwrap_or_default();
            let mut attributes = Vec::with_capacity(width);
            for i in 1..=width {
                attributes.push(as_text(row.get_ref(i)?));
            }
            Ok((key, attributes))
        })?
        .collect::<std::result::Result<HashMap<_, _>, _>>()?;

    Ok(rows)
}

/// Surrogate keys of the current rows, keyed by natural key.
pub fn surrogate_keys<M: DimensionMember>(conn: &Connection, key_column: &str) -> Result<HashMap<String, i64>> {
    let sql = format!(
        "SELECT {}, {} FROM {} WHERE is_current_record = 1 AND {} IS NOT NULL",
        M::NATURAL_KEY,
        key_column,
        M::TABLE,
        M::NATURAL_KEY
    );
    let mut stmt = conn.prepare(&sql)?;

    let keys = stmt
        .query_map([], |row| {
            let natural = as_text(row.get_ref(0)?).unwrap_or_default();
            Ok((natural, row.get::<_, i64>(1)?))
        })?
        .collect::<std::result::Result<HashMap<_, _>, _>>()?;

    Ok(keys)
}

/// Dimension values may have been seeded with any storage class.
fn as_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) | ValueRef::Blob(t) => Some(String::from_utf8_lossy(t).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;

    fn vendor(id: &str, name: &str) -> Vendor {
        Vendor {
            vendor_id: id.to_string(),
            vendor_name: Some(name.to_string()),
            vendor_tier: Some("Preferred".to_string()),
            diversity_classification: None,
            country: Some("US".to_string()),
            region: None,
        }
    }

    fn commodity(id: &str) -> Commodity {
        Commodity {
            commodity_id: id.to_string(),
            commodity_description: Some(format!("Commodity {}", id)),
            parent_category: Some("Direct".to_string()),
            sub_category: None,
            category_manager: None,
        }
    }

    fn analytics() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::create_analytics_schema(&conn).unwrap();
        conn
    }

    fn load_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    #[test]
    fn test_resolve_inserts_new_keys_with_defaults() {
        let conn = analytics();
        let vendors = vec![vendor("V1", "Acme"), vendor("V2", "Globex")];

        let outcome = resolve(&conn, &vendors, load_date(), &DimensionDefaults::default()).unwrap();

        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.unchanged, 0);

        let (risk, start, current): (String, String, i64) = conn
            .query_row(
                "SELECT risk_rating, effective_start_date, is_current_record
                 FROM dim_vendors WHERE vendor_id = 'V1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(risk, "Medium");
        assert_eq!(start, "2024-06-01");
        assert_eq!(current, 1);
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let conn = analytics();
        let vendors = vec![vendor("V1", "Acme"), vendor("V2", "Globex")];
        let defaults = DimensionDefaults::default();

        resolve(&conn, &vendors, load_date(), &defaults).unwrap();
        let second = resolve(&conn, &vendors, load_date(), &defaults).unwrap();

        assert_eq!(second.inserted, 0, "steady state inserts nothing");
        assert_eq!(second.unchanged, 2);
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM dim_vendors", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 2);
    }

    #[test]
    fn test_attribute_drift_is_counted_not_applied() {
        let conn = analytics();
        let defaults = DimensionDefaults::default();
        resolve(&conn, &[vendor("V1", "Acme")], load_date(), &defaults).unwrap();

        let renamed = vec![vendor("V1", "Acme Holdings")];
        let outcome = resolve(&conn, &renamed, load_date(), &defaults).unwrap();

        assert_eq!(outcome.inserted, 0);
        assert_eq!(outcome.drifted, 1);
        let name: String = conn
            .query_row("SELECT vendor_name FROM dim_vendors WHERE vendor_id = 'V1'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(name, "Acme", "append-only: existing row keeps its attributes");
    }

    #[test]
    fn test_duplicate_source_keys_insert_once() {
        let conn = analytics();
        let vendors = vec![vendor("V1", "Acme"), vendor("V1", "Acme")];

        let outcome = resolve(&conn, &vendors, load_date(), &DimensionDefaults::default()).unwrap();

        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.unchanged, 1);
    }

    #[test]
    fn test_non_current_rows_do_not_block_insert() {
        let conn = analytics();
        conn.execute(
            "INSERT INTO dim_vendors (vendor_id, vendor_name, is_current_record) VALUES ('V1', 'Old', 0)",
            [],
        )
        .unwrap();

        let outcome =
            resolve(&conn, &[vendor("V1", "Acme")], load_date(), &DimensionDefaults::default()).unwrap();

        assert_eq!(outcome.inserted, 1);
        let current: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM dim_vendors WHERE vendor_id = 'V1' AND is_current_record = 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(current, 1);
    }

    #[test]
    fn test_commodity_resolution_and_surrogate_lookup() {
        let conn = analytics();
        let commodities = vec![commodity("C1"), commodity("C2")];

        let outcome =
            resolve(&conn, &commodities, load_date(), &DimensionDefaults::default()).unwrap();
        assert_eq!(outcome.dimension, "dim_commodities");
        assert_eq!(outcome.inserted, 2);

        let keys = surrogate_keys::<Commodity>(&conn, "commodity_key").unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains_key("C1"));
        assert_ne!(keys["C1"], keys["C2"]);

        let criticality: String = conn
            .query_row(
                "SELECT business_criticality FROM dim_commodities WHERE commodity_id = 'C2'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(criticality, "Medium");
    }
}
