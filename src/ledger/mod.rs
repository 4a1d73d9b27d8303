//! Durable status ledger.
//!
//! The ledger maps document ids to their last-known [`LedgerEntry`] and also
//! hosts the pass lock: a lease keyed by the (store, index) pair so two
//! passes never reconcile the same index at once.
//!
//! Writes are per-key atomic, so concurrent workers update their own entries
//! without a pass-wide lock.
//!
//! | Implementation | Module |
//! |----------------|--------|
//! | SQLite (`sqlx`) | [`sqlite`] |
//! | In-memory | [`memory`] |

pub mod memory;
pub mod sqlite;

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::LedgerEntry;

pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;

/// Current holder of a pass lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockInfo {
    pub key: String,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Result of [`Ledger::try_acquire_lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    Acquired,
    /// Another owner holds an unexpired lease.
    Held(LockInfo),
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Every entry, keyed by document id.
    async fn load_all(&self) -> Result<HashMap<String, LedgerEntry>>;

    /// Insert or replace one entry.
    async fn put(&self, entry: &LedgerEntry) -> Result<()>;

    /// Drop an entry once its deletion has reached the index.
    async fn remove(&self, document_id: &str) -> Result<()>;

    /// Take the lease `key` for `ttl` if it is free, expired, or already ours.
    async fn try_acquire_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<LockAttempt>;

    /// Extend a lease we hold. Returns `false` if we no longer hold it.
    async fn renew_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Release a lease we hold. Releasing someone else's lease is a no-op.
    async fn release_lock(&self, key: &str, owner: &str) -> Result<()>;

    /// Remove a lease regardless of owner (operator recovery).
    async fn force_release(&self, key: &str) -> Result<bool>;

    /// All recorded leases, expired ones included.
    async fn locks(&self) -> Result<Vec<LockInfo>>;
}

pub(crate) fn lease_expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Behaviour shared by every implementation, run against each one in its tests.
#[cfg(test)]
pub(crate) mod conformance {
    use super::*;
    use crate::models::{DocumentRecord, SyncState};

    pub fn record(id: &str) -> DocumentRecord {
        DocumentRecord {
            id: id.to_string(),
            name: format!("{}.md", id),
            path: format!("/{}.md", id),
            modified_at: Utc::now(),
            content_hash: Some(format!("hash-{}", id)),
            content_type: "text/markdown".to_string(),
            metadata: serde_json::json!({}),
        }
    }

    pub async fn entries_roundtrip(ledger: &dyn Ledger) {
        let rec = record("a");
        let mut entry = LedgerEntry::pending(&rec, None);
        ledger.put(&entry).await.unwrap();
        entry.mark_ingested(&rec, 4);
        ledger.put(&entry).await.unwrap();
        ledger.put(&LedgerEntry::pending(&record("b"), None)).await.unwrap();

        let all = ledger.load_all().await.unwrap();
        assert_eq!(all.len(), 2);
        let a = &all["a"];
        assert_eq!(a.state, SyncState::Ingested);
        assert_eq!(a.chunk_count, 4);
        assert_eq!(a.modified_at, rec.modified_at);
        assert_eq!(a.content_hash.as_deref(), Some("hash-a"));
        assert_eq!(all["b"].state, SyncState::Pending);

        ledger.remove("a").await.unwrap();
        ledger.remove("missing").await.unwrap();
        let all = ledger.load_all().await.unwrap();
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["b"]);
    }

    pub async fn lock_lifecycle(ledger: &dyn Ledger) {
        let ttl = Duration::from_secs(60);
        assert_eq!(
            ledger.try_acquire_lock("fs|local", "run-1", ttl).await.unwrap(),
            LockAttempt::Acquired
        );
        // Re-entrant for the same owner.
        assert_eq!(
            ledger.try_acquire_lock("fs|local", "run-1", ttl).await.unwrap(),
            LockAttempt::Acquired
        );
        match ledger.try_acquire_lock("fs|local", "run-2", ttl).await.unwrap() {
            LockAttempt::Held(info) => {
                assert_eq!(info.owner, "run-1");
                assert_eq!(info.key, "fs|local");
            }
            other => panic!("expected Held, got {:?}", other),
        }
        // A different key is independent.
        assert_eq!(
            ledger.try_acquire_lock("sp|astra", "run-2", ttl).await.unwrap(),
            LockAttempt::Acquired
        );

        assert!(ledger.renew_lock("fs|local", "run-1", ttl).await.unwrap());
        assert!(!ledger.renew_lock("fs|local", "run-2", ttl).await.unwrap());

        ledger.release_lock("fs|local", "run-2").await.unwrap();
        assert!(matches!(
            ledger.try_acquire_lock("fs|local", "run-2", ttl).await.unwrap(),
            LockAttempt::Held(_)
        ));
        ledger.release_lock("fs|local", "run-1").await.unwrap();
        assert_eq!(
            ledger.try_acquire_lock("fs|local", "run-2", ttl).await.unwrap(),
            LockAttempt::Acquired
        );

        assert_eq!(ledger.locks().await.unwrap().len(), 2);
        assert!(ledger.force_release("sp|astra").await.unwrap());
        assert!(!ledger.force_release("sp|astra").await.unwrap());
    }

    pub async fn expired_lock_is_taken_over(ledger: &dyn Ledger) {
        assert_eq!(
            ledger
                .try_acquire_lock("k", "crashed", Duration::from_secs(0))
                .await
                .unwrap(),
            LockAttempt::Acquired
        );
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(
            ledger
                .try_acquire_lock("k", "next", Duration::from_secs(60))
                .await
                .unwrap(),
            LockAttempt::Acquired
        );
        let locks = ledger.locks().await.unwrap();
        assert_eq!(locks[0].owner, "next");
    }
}
