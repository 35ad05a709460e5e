// ⚙️ Configuration - built once at process entry, passed by reference
//
// Every option comes from the environment. Tests inject values through
// EtlConfig::from_lookup instead of mutating the process environment.

use crate::error::{EtlError, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// DATABASE CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseConfig {
    pub operational_db_path: PathBuf,
    pub analytics_db_path: PathBuf,
    pub backup_db_path: Option<PathBuf>,
    /// Busy timeout applied to every connection (seconds)
    pub connection_timeout: u64,
    pub enable_foreign_keys: bool,
    pub enable_wal_mode: bool,
    /// Attempts to open a busy or locked store. Business logic never retries.
    pub max_retries: u32,
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }
}

// ============================================================================
// ETL SETTINGS
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct EtlSettings {
    /// Fact rows between progress log lines
    pub batch_size: usize,
    /// Parsed for compatibility; the sync is single-threaded.
    pub max_parallel_jobs: usize,
    pub enable_data_validation: bool,
    pub auto_create_indexes: bool,
    pub log_level: String,
    pub backup_before_etl: bool,
    /// Fail the run instead of excluding transactions that miss a dimension
    pub strict_joins: bool,
}

impl Default for EtlSettings {
    fn default() -> Self {
        EtlSettings {
            batch_size: 1000,
            max_parallel_jobs: 4,
            enable_data_validation: true,
            auto_create_indexes: true,
            log_level: "INFO".to_string(),
            backup_before_etl: true,
            strict_joins: false,
        }
    }
}

// ============================================================================
// ETL CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct EtlConfig {
    pub database: DatabaseConfig,
    pub etl: EtlSettings,
}

impl EtlConfig {
    /// Config pointing at the given stores with every other option defaulted.
    pub fn for_paths(operational: impl Into<PathBuf>, analytics: impl Into<PathBuf>) -> Self {
        EtlConfig {
            database: DatabaseConfig {
                operational_db_path: operational.into(),
                analytics_db_path: analytics.into(),
                backup_db_path: None,
                connection_timeout: 30,
                enable_foreign_keys: true,
                enable_wal_mode: true,
                max_retries: 3,
            },
            etl: EtlSettings::default(),
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = lookup("PROCUREMENT_DB_PATH").unwrap_or_else(|| "./db".to_string());
        let base = Path::new(&base);

        let database = DatabaseConfig {
            operational_db_path: lookup("OPERATIONAL_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| base.join("procurement_operational.db")),
            analytics_db_path: lookup("ANALYTICS_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| base.join("procurement_analytics.db")),
            backup_db_path: lookup("BACKUP_DB_PATH")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            connection_timeout: parse_number(&lookup, "DB_CONNECTION_TIMEOUT", 30)?,
            enable_foreign_keys: parse_flag(&lookup, "DB_ENABLE_FK", true),
            enable_wal_mode: parse_flag(&lookup, "DB_ENABLE_WAL", true),
            max_retries: parse_number(&lookup, "DB_MAX_RETRIES", 3)?,
        };

        let defaults = EtlSettings::default();
        let etl = EtlSettings {
            batch_size: parse_number(&lookup, "ETL_BATCH_SIZE", defaults.batch_size)?,
            max_parallel_jobs: parse_number(&lookup, "ETL_MAX_JOBS", defaults.max_parallel_jobs)?,
            enable_data_validation: parse_flag(&lookup, "ETL_VALIDATE_DATA", true),
            auto_create_indexes: parse_flag(&lookup, "ETL_AUTO_INDEX", true),
            log_level: lookup("ETL_LOG_LEVEL").unwrap_or(defaults.log_level),
            backup_before_etl: parse_flag(&lookup, "ETL_BACKUP_FIRST", true),
            strict_joins: parse_flag(&lookup, "ETL_STRICT_JOINS", false),
        };

        if etl.batch_size == 0 {
            return Err(EtlError::Config("ETL_BATCH_SIZE must be at least 1".to_string()));
        }

        Ok(EtlConfig { database, etl })
    }

    /// Human-readable summary lines for the CLI.
    pub fn summary(&self) -> Vec<String> {
        vec![
            format!("Operational: {}", self.database.operational_db_path.display()),
            format!("Analytics:   {}", self.database.analytics_db_path.display()),
            format!(
                "Backup:      {}",
                self.database
                    .backup_db_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "None".to_string())
            ),
            format!("Batch size:  {}", self.etl.batch_size),
            format!("Validation:  {}", self.etl.enable_data_validation),
            format!("Auto index:  {}", self.etl.auto_create_indexes),
            format!("Strict join: {}", self.etl.strict_joins),
        ]
    }
}

/// Only a case-insensitive "true" enables a flag; anything else disables it.
fn parse_flag<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => value.trim().eq_ignore_ascii_case("true"),
        None => default,
    }
}

fn parse_number<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| EtlError::Config(format!("{} must be a number, got '{}'", key, value))),
        None => Ok(default),
    }
}
