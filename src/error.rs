// ⚠️ Error taxonomy for the sync engine
//
// Connectivity and Schema errors abort a run before anything is written.
// IntegrityViolation and anything raised inside the run transaction roll the
// whole run back. Consistency warnings are never raised: the auditor records
// them as CheckStatus::Warning.

use rusqlite::ErrorCode;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EtlError>;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("Store unreachable at '{path}': {reason}")]
    Connectivity { path: PathBuf, reason: String },

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("Another sync holds the analytics store: {0}")]
    ConcurrentRun(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{count} transactions could not be resolved against the dimensions")]
    UnresolvedTransactions { count: usize },

    #[error("Step '{step}' failed: {source}")]
    Step {
        step: &'static str,
        #[source]
        source: Box<EtlError>,
    },

    #[error("SQLite error: {0}")]
    Database(rusqlite::Error),

    #[error("File system error: {0}")]
    Io(#[from] std::io::Error),
}

impl EtlError {
    /// Attach the name of the orchestrator step that produced this error.
    pub fn in_step(self, step: &'static str) -> Self {
        EtlError::Step {
            step,
            source: Box::new(self),
        }
    }

    pub fn missing_tables(store: &str, missing: &[String]) -> Self {
        EtlError::Schema(format!(
            "{} store is missing tables: {}",
            store,
            missing.join(", ")
        ))
    }

    /// Innermost error, looking through step wrappers.
    pub fn root(&self) -> &EtlError {
        match self {
            EtlError::Step { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn failing_step(&self) -> Option<&'static str> {
        match self {
            EtlError::Step { step, .. } => Some(step),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for EtlError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, msg) => {
                let message = msg.clone().unwrap_or_else(|| code.to_string());
                match code.code {
                    ErrorCode::ConstraintViolation => EtlError::IntegrityViolation(message),
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                        EtlError::ConcurrentRun(message)
                    }
                    ErrorCode::CannotOpen | ErrorCode::NotADatabase => EtlError::Connectivity {
                        path: PathBuf::new(),
                        reason: message,
                    },
                    _ if message.contains("no such table") => EtlError::Schema(message),
                    _ => EtlError::Database(err),
                }
            }
            _ => EtlError::Database(err),
        }
    }
}
