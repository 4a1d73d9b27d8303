//! Error taxonomy for a sync pass.
//!
//! Errors fall into two groups:
//!
//! - **Fatal** ([`ConfigError`], [`SyncError`]) abort the process or the
//!   pass and are surfaced to the caller.
//! - **Per-record** ([`FileError`]) are caught by the orchestrator, recorded
//!   as `failed` in the ledger, and folded into [`PassStats`](crate::models::PassStats).
//!
//! Collaborators (stores, embedders, indexes, ledgers) return
//! `anyhow::Result`; the orchestrator classifies their failures here.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::extract::ExtractError;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A required setting is missing or malformed. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(String),

    #[error("invalid setting {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to resolve secret {name}: {reason}")]
    Secret { name: String, reason: String },
}

impl ConfigError {
    pub fn invalid(key: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors that end a pass.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("cannot list documents in {store}: {source}")]
    StoreListing {
        store: String,
        #[source]
        source: BoxError,
    },

    #[error("ledger persistence failed: {0}")]
    LedgerPersistence(#[source] BoxError),

    #[error("another sync pass holds the lock {key} (owner {owner}, expires {expires_at})")]
    LockContention {
        key: String,
        owner: String,
        expires_at: DateTime<Utc>,
    },

    #[error("pass lock {key} was lost mid-pass; stopped dispatching work")]
    LeaseLost { key: String },

    #[error("failed to initialise {component}: {source}")]
    Setup {
        component: String,
        #[source]
        source: BoxError,
    },
}

impl SyncError {
    pub fn listing(store: &str, err: anyhow::Error) -> Self {
        SyncError::StoreListing {
            store: store.to_string(),
            source: err.into(),
        }
    }

    pub fn ledger(err: anyhow::Error) -> Self {
        SyncError::LedgerPersistence(err.into())
    }

    pub fn setup(component: &str, err: anyhow::Error) -> Self {
        SyncError::Setup {
            component: component.to_string(),
            source: err.into(),
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            SyncError::LockContention { .. } | SyncError::LeaseLost { .. } => 2,
            _ => 1,
        }
    }
}

/// Failure of one document's download → extract → chunk → embed → upsert.
#[derive(Debug, Error)]
pub enum FileError {
    #[error("download failed: {0}")]
    Download(String),

    #[error("text extraction failed: {0}")]
    Extract(#[from] ExtractError),

    #[error("document produced no text to index")]
    Empty,

    #[error("embedding failed: {0}")]
    Embed(String),

    #[error("index upsert failed: {0}")]
    Upsert(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("worker panicked: {0}")]
    Panicked(String),
}

impl FileError {
    /// Short stage label used in logs and the ledger.
    pub fn stage(&self) -> &'static str {
        match self {
            FileError::Download(_) => "download",
            FileError::Extract(_) | FileError::Empty => "extract",
            FileError::Embed(_) => "embed",
            FileError::Upsert(_) => "upsert",
            FileError::Timeout(_) => "timeout",
            FileError::Panicked(_) => "panic",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_contention_has_distinct_exit_code() {
        let err = SyncError::LockContention {
            key: "fs|local".to_string(),
            owner: "host-1".to_string(),
            expires_at: Utc::now(),
        };
        assert_eq!(err.exit_code(), 2);
        let lost = SyncError::LeaseLost {
            key: "fs|local".to_string(),
        };
        assert_eq!(lost.exit_code(), 2);
        assert_eq!(SyncError::ledger(anyhow::anyhow!("disk full")).exit_code(), 1);
    }

    #[test]
    fn listing_error_keeps_source_chain() {
        let err = SyncError::listing("sharepoint:Sales", anyhow::anyhow!("401 Unauthorized"));
        let msg = err.to_string();
        assert!(msg.contains("sharepoint:Sales"));
        assert!(msg.contains("401"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn missing_setting_names_the_key() {
        let err = ConfigError::Missing("ASTRA_DB_KEYSPACE".to_string());
        assert_eq!(err.to_string(), "missing required setting: ASTRA_DB_KEYSPACE");
    }
}
