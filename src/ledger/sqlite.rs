//! SQLite-backed ledger.
//!
//! Entries live in `ledger_entries`; timestamps are stored as RFC 3339 text
//! with full sub-second precision so a listing timestamp compares equal after
//! a round trip. Leases live in `sync_locks` as epoch milliseconds.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use sqlx::{Row, SqlitePool};

use super::{lease_expiry, Ledger, LockAttempt, LockInfo};
use crate::models::{LedgerEntry, SyncState};

pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open the ledger database at `path`, creating the schema if needed.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = crate::db::open(path)
            .await
            .with_context(|| format!("failed to open ledger {}", path.display()))?;
        Ok(Self::new(pool))
    }

    /// Fold the write-ahead log into the main database file, so the file
    /// alone holds every committed write.
    pub async fn checkpoint(&self) -> Result<()> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn holder(&self, key: &str) -> Result<Option<LockInfo>> {
        let row = sqlx::query(
            "SELECT name, owner, acquired_at, expires_at FROM sync_locks WHERE name = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| lock_from_row(&r)).transpose()
    }
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("invalid timestamp in ledger: '{}'", s))?
        .with_timezone(&Utc))
}

fn millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .with_context(|| format!("invalid lock timestamp: {}", ms))
}

fn lock_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<LockInfo> {
    Ok(LockInfo {
        key: row.get("name"),
        owner: row.get("owner"),
        acquired_at: millis(row.get("acquired_at"))?,
        expires_at: millis(row.get("expires_at"))?,
    })
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn load_all(&self) -> Result<HashMap<String, LedgerEntry>> {
        let rows = sqlx::query(
            "SELECT document_id, name, path, modified_at, content_hash, state, chunk_count, \
             last_error, updated_at FROM ledger_entries",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut entries = HashMap::with_capacity(rows.len());
        for row in rows {
            let state: String = row.get("state");
            let modified_at: String = row.get("modified_at");
            let updated_at: String = row.get("updated_at");
            let entry = LedgerEntry {
                document_id: row.get("document_id"),
                name: row.get("name"),
                path: row.get("path"),
                modified_at: parse_ts(&modified_at)?,
                content_hash: row.get("content_hash"),
                state: state.parse::<SyncState>()?,
                chunk_count: row.get("chunk_count"),
                last_error: row.get("last_error"),
                updated_at: parse_ts(&updated_at)?,
            };
            entries.insert(entry.document_id.clone(), entry);
        }
        Ok(entries)
    }

    async fn put(&self, entry: &LedgerEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_entries
                (document_id, name, path, modified_at, content_hash, state, chunk_count, last_error, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(document_id) DO UPDATE SET
                name = excluded.name,
                path = excluded.path,
                modified_at = excluded.modified_at,
                content_hash = excluded.content_hash,
                state = excluded.state,
                chunk_count = excluded.chunk_count,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&entry.document_id)
        .bind(&entry.name)
        .bind(&entry.path)
        .bind(ts(&entry.modified_at))
        .bind(&entry.content_hash)
        .bind(entry.state.as_str())
        .bind(entry.chunk_count)
        .bind(&entry.last_error)
        .bind(ts(&entry.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, document_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM ledger_entries WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn try_acquire_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<LockAttempt> {
        let now = Utc::now();
        let expires = lease_expiry(now, ttl);

        // Single statement: takes the row only when it is free, expired, or ours.
        let result = sqlx::query(
            r#"
            INSERT INTO sync_locks (name, owner, acquired_at, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                owner = excluded.owner,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
            WHERE sync_locks.expires_at <= excluded.acquired_at
               OR sync_locks.owner = excluded.owner
            "#,
        )
        .bind(key)
        .bind(owner)
        .bind(now.timestamp_millis())
        .bind(expires.timestamp_millis())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(LockAttempt::Acquired);
        }
        match self.holder(key).await? {
            Some(info) => Ok(LockAttempt::Held(info)),
            // Released between the two statements; report it as held so the
            // caller backs off rather than racing again.
            None => Ok(LockAttempt::Held(LockInfo {
                key: key.to_string(),
                owner: "unknown".to_string(),
                acquired_at: now,
                expires_at: now,
            })),
        }
    }

    async fn renew_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let expires = lease_expiry(Utc::now(), ttl);
        let result = sqlx::query("UPDATE sync_locks SET expires_at = ? WHERE name = ? AND owner = ?")
            .bind(expires.timestamp_millis())
            .bind(key)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_lock(&self, key: &str, owner: &str) -> Result<()> {
        sqlx::query("DELETE FROM sync_locks WHERE name = ? AND owner = ?")
            .bind(key)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn force_release(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sync_locks WHERE name = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn locks(&self) -> Result<Vec<LockInfo>> {
        let rows = sqlx::query(
            "SELECT name, owner, acquired_at, expires_at FROM sync_locks ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(lock_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::super::conformance;
    use super::*;
    use tempfile::TempDir;

    async fn open(tmp: &TempDir) -> SqliteLedger {
        SqliteLedger::open(&tmp.path().join("data/ledger.sqlite"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn entries_roundtrip() {
        let tmp = TempDir::new().unwrap();
        conformance::entries_roundtrip(&open(&tmp).await).await;
    }

    #[tokio::test]
    async fn lock_lifecycle() {
        let tmp = TempDir::new().unwrap();
        conformance::lock_lifecycle(&open(&tmp).await).await;
    }

    #[tokio::test]
    async fn expired_lock_is_taken_over() {
        let tmp = TempDir::new().unwrap();
        conformance::expired_lock_is_taken_over(&open(&tmp).await).await;
    }

    #[tokio::test]
    async fn entries_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let rec = conformance::record("doc");
        {
            let ledger = open(&tmp).await;
            let mut entry = LedgerEntry::pending(&rec, None);
            entry.mark_failed(&rec, "embedding failed: 503".to_string());
            ledger.put(&entry).await.unwrap();
            ledger.close().await;
        }
        let ledger = open(&tmp).await;
        let all = ledger.load_all().await.unwrap();
        assert_eq!(all["doc"].state, SyncState::Failed);
        assert_eq!(all["doc"].last_error.as_deref(), Some("embedding failed: 503"));
    }

    #[tokio::test]
    async fn two_handles_contend_for_one_lock() {
        let tmp = TempDir::new().unwrap();
        let a = open(&tmp).await;
        let b = open(&tmp).await;
        let ttl = Duration::from_secs(30);
        assert_eq!(a.try_acquire_lock("k", "a", ttl).await.unwrap(), LockAttempt::Acquired);
        assert!(matches!(
            b.try_acquire_lock("k", "b", ttl).await.unwrap(),
            LockAttempt::Held(ref info) if info.owner == "a"
        ));
    }
}
