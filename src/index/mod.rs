//! Vector index abstraction.
//!
//! The orchestrator only ever writes whole documents: it clears a document's
//! entries with [`VectorIndex::delete_by_document`] and then upserts the new
//! set, so implementations need no notion of partial updates.
//!
//! | Index | Module |
//! |-------|--------|
//! | Astra DB Data API | [`astra`] |
//! | Local SQLite table | [`sqlite`] |

pub mod astra;
pub mod sqlite;

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::config::Config;
use crate::secrets::Secrets;
use crate::models::IndexEntry;

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Label used in logs and the pass lock key (e.g. `"astra:bids"`).
    fn label(&self) -> String;

    /// Insert or overwrite entries by `chunk_id`.
    async fn upsert(&self, entries: &[IndexEntry]) -> Result<()>;

    /// Remove every entry of a document. Returns how many were removed;
    /// deleting an unknown document is not an error.
    async fn delete_by_document(&self, document_id: &str) -> Result<u64>;
}

/// Build the index selected by `config.index.kind`.
pub async fn create_index(config: &Config, secrets: &Secrets) -> Result<Arc<dyn VectorIndex>> {
    match config.index.kind.as_str() {
        "astra" => Ok(Arc::new(astra::AstraIndex::new(&config.index, secrets)?)),
        "local" => {
            let path = config
                .index
                .path
                .clone()
                .unwrap_or_else(|| config.ledger.path.clone());
            Ok(Arc::new(sqlite::SqliteIndex::open(&path).await?))
        }
        other => bail!("Unknown index kind: {}", other),
    }
}
