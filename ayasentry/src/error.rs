//! Error types shared across the sensor.

use std::io;

use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Loading or attaching a kernel program failed.
    #[error("failed to attach program '{program}': {source}")]
    Attach {
        program: String,
        #[source]
        source: BoxError,
    },

    /// A map named by a program spec is missing from the loaded object.
    #[error("map '{map}' not found in program '{program}'")]
    MissingMap { program: String, map: String },

    /// Reading from an event source failed.
    #[error("event source error: {0}")]
    Source(#[from] io::Error),

    /// Walking or pruning a kernel tracking table failed.
    #[error("tracking table '{table}' error: {source}")]
    Table {
        table: String,
        #[source]
        source: BoxError,
    },

    /// A domain list source could not be read or fetched.
    #[error("failed to load domain list from '{source_name}': {reason}")]
    ListSource { source_name: String, reason: String },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported log format '{0}'")]
    UnsupportedFormat(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A sub-component failed to start; siblings started before it keep running.
    #[error("failed to start {component}: {source}")]
    Start {
        component: &'static str,
        #[source]
        source: Box<Error>,
    },

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl Error {
    pub fn attach(program: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Attach {
            program: program.into(),
            source: source.into(),
        }
    }

    pub fn table(table: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Table {
            table: table.into(),
            source: source.into(),
        }
    }

    pub fn list_source(source_name: impl Into<String>, reason: impl ToString) -> Self {
        Self::ListSource {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn start(component: &'static str, source: Error) -> Self {
        Self::Start {
            component,
            source: Box::new(source),
        }
    }
}

/// Why a raw record could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("{kind} record too short: {len} bytes, need at least {min}")]
    TooShort {
        kind: &'static str,
        len: usize,
        min: usize,
    },

    #[error("unknown {kind} event type {value}")]
    UnknownEventType { kind: &'static str, value: u8 },
}
