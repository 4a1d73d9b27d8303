//! In-memory ledger for tests and dry runs.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{lease_expiry, Ledger, LockAttempt, LockInfo};
use crate::models::LedgerEntry;

#[derive(Default)]
pub struct MemoryLedger {
    entries: RwLock<HashMap<String, LedgerEntry>>,
    locks: RwLock<HashMap<String, LockInfo>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with existing entries.
    pub fn with_entries(entries: impl IntoIterator<Item = LedgerEntry>) -> Self {
        Self {
            entries: RwLock::new(
                entries
                    .into_iter()
                    .map(|e| (e.document_id.clone(), e))
                    .collect(),
            ),
            locks: RwLock::default(),
        }
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn load_all(&self) -> Result<HashMap<String, LedgerEntry>> {
        Ok(self.entries.read().await.clone())
    }

    async fn put(&self, entry: &LedgerEntry) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(entry.document_id.clone(), entry.clone());
        Ok(())
    }

    async fn remove(&self, document_id: &str) -> Result<()> {
        self.entries.write().await.remove(document_id);
        Ok(())
    }

    async fn try_acquire_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<LockAttempt> {
        let now = Utc::now();
        let mut locks = self.locks.write().await;
        if let Some(current) = locks.get(key) {
            if current.owner != owner && !current.is_expired(now) {
                return Ok(LockAttempt::Held(current.clone()));
            }
        }
        locks.insert(
            key.to_string(),
            LockInfo {
                key: key.to_string(),
                owner: owner.to_string(),
                acquired_at: now,
                expires_at: lease_expiry(now, ttl),
            },
        );
        Ok(LockAttempt::Acquired)
    }

    async fn renew_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut locks = self.locks.write().await;
        match locks.get_mut(key) {
            Some(info) if info.owner == owner => {
                info.expires_at = lease_expiry(Utc::now(), ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, key: &str, owner: &str) -> Result<()> {
        let mut locks = self.locks.write().await;
        if locks.get(key).is_some_and(|info| info.owner == owner) {
            locks.remove(key);
        }
        Ok(())
    }

    async fn force_release(&self, key: &str) -> Result<bool> {
        Ok(self.locks.write().await.remove(key).is_some())
    }

    async fn locks(&self) -> Result<Vec<LockInfo>> {
        let mut all: Vec<LockInfo> = self.locks.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(all)
    }
}
