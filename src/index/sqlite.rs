//! Local vector index in SQLite.
//!
//! Vectors are stored as little-endian `f32` BLOBs next to the chunk text and
//! metadata. Useful for development and for the end-to-end tests; by default
//! it shares the ledger database file.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use super::VectorIndex;
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::models::IndexEntry;

pub struct SqliteIndex {
    pool: SqlitePool,
    label: String,
}

/// A stored entry as read back from the table.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub chunk_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub vector: Vec<f32>,
    pub metadata: serde_json::Value,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool, label: String) -> Self {
        Self { pool, label }
    }

    pub async fn open(path: &Path) -> Result<Self> {
        let pool = crate::db::open(path)
            .await
            .with_context(|| format!("failed to open local index {}", path.display()))?;
        Ok(Self::new(pool, format!("local:{}", path.display())))
    }

    /// Entries of one document, ordered by chunk index.
    pub async fn entries_for_document(&self, document_id: &str) -> Result<Vec<StoredEntry>> {
        let rows = sqlx::query(
            "SELECT chunk_id, chunk_index, text, vector, metadata_json FROM index_entries \
             WHERE document_id = ? ORDER BY chunk_index",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("vector");
                let metadata: String = row.get("metadata_json");
                Ok(StoredEntry {
                    chunk_id: row.get("chunk_id"),
                    chunk_index: row.get("chunk_index"),
                    text: row.get("text"),
                    vector: blob_to_vec(&blob),
                    metadata: serde_json::from_str(&metadata)?,
                })
            })
            .collect()
    }

    /// Total number of stored entries.
    pub async fn count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM index_entries")
            .fetch_one(&self.pool)
            .await?)
    }
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn upsert(&self, entries: &[IndexEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO index_entries (chunk_id, document_id, chunk_index, text, vector, dims, metadata_json)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(chunk_id) DO UPDATE SET
                    document_id = excluded.document_id,
                    chunk_index = excluded.chunk_index,
                    text = excluded.text,
                    vector = excluded.vector,
                    dims = excluded.dims,
                    metadata_json = excluded.metadata_json
                "#,
            )
            .bind(&entry.chunk_id)
            .bind(&entry.document_id)
            .bind(entry.chunk_index)
            .bind(&entry.text)
            .bind(vec_to_blob(&entry.vector))
            .bind(entry.vector.len() as i64)
            .bind(entry.metadata.to_string())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM index_entries WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
