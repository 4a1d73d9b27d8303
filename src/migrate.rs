use anyhow::Result;
use sqlx::SqlitePool;

/// Create the ledger, lock, and local index tables. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // One row per document the ledger has seen
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ledger_entries (
            document_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            path TEXT NOT NULL,
            modified_at TEXT NOT NULL,
            content_hash TEXT,
            state TEXT NOT NULL,
            chunk_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Pass lease, keyed by store/index pair
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_locks (
            name TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            acquired_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Local vector index
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_entries (
            chunk_id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            vector BLOB NOT NULL,
            dims INTEGER NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_ledger_state ON ledger_entries(state)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_index_entries_document_id ON index_entries(document_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = crate::db::connect(&tmp.path().join("ledger.sqlite")).await.unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type='table' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(tables, vec!["index_entries", "ledger_entries", "sync_locks"]);
    }
}
