// Procurement ETL - Core Library
// Exposes all modules for use in CLI, health server, and tests

pub mod config;
pub mod db;
pub mod error;
pub mod schema;     // Store layouts and bootstrap DDL
pub mod source;     // Operational snapshot reader
pub mod dimension;  // Dimension Resolver
pub mod facts;      // Fact Loader
pub mod sync;       // Orchestrator - one transactional daily sync
pub mod audit;      // Consistency Auditor
pub mod seed;       // Seed copy from a backup store

// Re-export commonly used types
pub use config::{DatabaseConfig, EtlConfig, EtlSettings};
pub use db::{AccessMode, ForeignKey, Store};
pub use error::{EtlError, Result};
pub use schema::{
    create_analytics_schema, create_operational_schema, ensure_indexes, initialize_stores,
    populate_time_dimension, OPERATIONAL_TABLES, STAR_TABLES,
};
pub use source::{Commodity, SourceSnapshot, SpendTransaction, Vendor};
pub use dimension::{DimensionDefaults, DimensionMember, ResolveOutcome};
pub use facts::{Exclusions, FactLoadOptions, FactLoadOutcome};
pub use sync::{SyncEngine, SyncReport};
pub use audit::{
    AuditThresholds, CheckStatus, ConsistencyAuditor, ConsistencyReport,
    OverallStatus, StoreInfo,
};
pub use seed::copy_star_data;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
