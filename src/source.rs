// 📥 Source Connector - reads operational entities for one sync pass
//
// All three entity sets are read inside a single read transaction so the
// resolver and loader see one consistent snapshot of the operational store.

use crate::db::{self, Store};
use crate::error::Result;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

pub const SOURCE_TABLES: [&str; 3] = ["vendors", "commodities", "spend_transactions"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vendor {
    pub vendor_id: String,
    pub vendor_name: Option<String>,
    pub vendor_tier: Option<String>,
    pub diversity_classification: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commodity {
    pub commodity_id: String,
    pub commodity_description: Option<String>,
    pub parent_category: Option<String>,
    pub sub_category: Option<String>,
    pub category_manager: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendTransaction {
    /// Natural key, stored in the fact table as source_transaction_id
    pub transaction_id: String,
    pub vendor_id: Option<String>,
    pub commodity_id: Option<String>,
    /// Raw date text as stored at the source
    pub award_date: Option<String>,
    pub total_amount: Option<f64>,
    pub quantity: Option<f64>,
    pub unit_price: Option<f64>,
}

/// Everything one sync pass needs from the operational store
#[derive(Debug, Clone, Default)]
pub struct SourceSnapshot {
    pub vendors: Vec<Vendor>,
    pub commodities: Vec<Commodity>,
    pub transactions: Vec<SpendTransaction>,
}

impl SourceSnapshot {
    pub fn summary(&self) -> String {
        format!(
            "{} vendors, {} commodities, {} transactions",
            self.vendors.len(),
            self.commodities.len(),
            self.transactions.len()
        )
    }
}

pub fn read_snapshot(conn: &Connection) -> Result<SourceSnapshot> {
    db::require_tables(conn, Store::Operational, &SOURCE_TABLES)?;

    let tx = conn.unchecked_transaction()?;
    let snapshot = SourceSnapshot {
        vendors: read_vendors(&tx)?,
        commodities: read_commodities(&tx)?,
        transactions: read_transactions(&tx)?,
    };
    tx.commit()?;

    Ok(snapshot)
}

// Natural keys are cast to TEXT so integer and text ids compare the same way
// the dimension tables store them.

pub fn read_vendors(conn: &Connection) -> Result<Vec<Vendor>> {
    let mut stmt = conn.prepare(
        "SELECT CAST(vendor_id AS TEXT), vendor_name, vendor_tier,
                diversity_classification, country, region
         FROM vendors
         WHERE vendor_id IS NOT NULL
         ORDER BY vendor_id",
    )?;

    let vendors = stmt
        .query_map([], |row| {
            Ok(Vendor {
                vendor_id: row.get(0)?,
                vendor_name: row.get(1)?,
                vendor_tier: row.get(2)?,
                diversity_classification: row.get(3)?,
                country: row.get(4)?,
                region: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(vendors)
}

pub fn read_commodities(conn: &Connection) -> Result<Vec<Commodity>> {
    let mut stmt = conn.prepare(
        "SELECT CAST(commodity_id AS TEXT), commodity_description, parent_category,
                sub_category, category_manager
         FROM commodities
         WHERE commodity_id IS NOT NULL
         ORDER BY commodity_id",
    )?;

    let commodities = stmt
        .query_map([], |row| {
            Ok(Commodity {
                commodity_id: row.get(0)?,
                commodity_description: row.get(1)?,
                parent_category: row.get(2)?,
                sub_category: row.get(3)?,
                category_manager: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(commodities)
}

pub fn read_transactions(conn: &Connection) -> Result<Vec<SpendTransaction>> {
    let mut stmt = conn.prepare(
        "SELECT CAST(transaction_id AS TEXT), CAST(vendor_id AS TEXT),
                CAST(commodity_id AS TEXT), CAST(award_date AS TEXT),
                total_amount, quantity, unit_price
         FROM spend_transactions
         WHERE transaction_id IS NOT NULL
         ORDER BY transaction_id",
    )?;

    let transactions = stmt
        .query_map([], |row| {
            Ok(SpendTransaction {
                transaction_id: row.get(0)?,
                vendor_id: row.get(1)?,
                commodity_id: row.get(2)?,
                award_date: row.get(3)?,
                total_amount: row.get(4)?,
                quantity: row.get(5)?,
                unit_price: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(transactions)
}
