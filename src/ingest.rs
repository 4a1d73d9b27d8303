//! Sync pass orchestration.
//!
//! A pass takes the (store, index) lease, lists the store, diffs the listing
//! against the ledger, drives new and changed documents through
//! download → extract → chunk → embed → upsert on a bounded pool of tokio
//! tasks, and propagates deletions for documents that disappeared.
//!
//! Per-document failures (including timeouts and panics) are recorded as
//! `failed` in the ledger and never abort the pass; they are retried on the
//! next one. Listing, ledger and lock failures end the pass with a
//! [`SyncError`].
//!
//! Ledger writes happen per document as soon as its outcome is known, so an
//! interrupted pass keeps all completed work. When a pass ends early (ledger
//! failure or a lost lease) in-flight documents are cancelled and awaited
//! before the lock is released; their entries stay `pending`.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::chunk::chunk_text;
use crate::config::{ChunkingConfig, Config, SyncConfig};
use crate::embedding::{create_embedder, Embedder};
use crate::error::{FileError, SyncError};
use crate::extract::extract_text;
use crate::index::{create_index, VectorIndex};
use crate::ledger::{Ledger, LockAttempt, SqliteLedger};
use crate::models::{DocumentRecord, IndexEntry, LedgerEntry, PassStats, SyncState};
use crate::progress::{NoProgress, SyncProgressEvent, SyncProgressReporter};
use crate::secrets::{self, SecretKey};
use crate::staging::BlobStaging;
use crate::store::{create_store, DocumentStore};

/// Per-invocation options for a pass.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Plan and report only; no lock, no ledger or index writes.
    pub dry_run: bool,
    /// Ingest at most this many documents; the rest are deferred.
    pub limit: Option<usize>,
    pub workers: usize,
    pub file_timeout: Duration,
    pub lock_ttl: Duration,
    /// Identity recorded as the lease owner.
    pub owner: String,
}

impl SyncOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            dry_run: false,
            limit: None,
            workers: config.workers.max(1),
            file_timeout: Duration::from_secs(config.file_timeout_secs),
            lock_ttl: Duration::from_secs(config.lock_ttl_secs),
            owner: default_owner(),
        }
    }
}

/// `host:pid:random`, unique per process.
pub fn default_owner() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "csync".to_string());
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!("{}:{}:{}", host, std::process::id(), &nonce[..8])
}

/// Work selected for one pass.
#[derive(Debug, Default)]
pub struct SyncPlan {
    /// Records to (re)ingest with their previous ledger entry, ordered by id.
    pub to_ingest: Vec<(DocumentRecord, Option<LedgerEntry>)>,
    /// Ledger entries whose documents are gone from the listing, ordered by id.
    pub to_delete: Vec<LedgerEntry>,
    pub unchanged: usize,
}

/// Diff a listing against the ledger.
///
/// A record is ingested when it has no entry, its entry is not `ingested`,
/// or its timestamp or content hash differs. Entries with no listed record
/// are deleted. Duplicate listing ids keep the first occurrence.
pub fn plan_delta(listing: Vec<DocumentRecord>, ledger: &HashMap<String, LedgerEntry>) -> SyncPlan {
    let mut plan = SyncPlan::default();
    let mut seen = HashSet::with_capacity(listing.len());

    for record in listing {
        if !seen.insert(record.id.clone()) {
            tracing::warn!(id = %record.id, path = %record.path, "duplicate id in listing, ignoring");
            continue;
        }
        match ledger.get(&record.id) {
            Some(entry) if is_current(&record, entry) => plan.unchanged += 1,
            previous => {
                let previous = previous.cloned();
                plan.to_ingest.push((record, previous));
            }
        }
    }

    plan.to_delete = ledger
        .values()
        .filter(|entry| !seen.contains(&entry.document_id))
        .cloned()
        .collect();

    plan.to_ingest.sort_by(|a, b| a.0.id.cmp(&b.0.id));
    plan.to_delete.sort_by(|a, b| a.document_id.cmp(&b.document_id));
    plan
}

fn is_current(record: &DocumentRecord, entry: &LedgerEntry) -> bool {
    entry.state == SyncState::Ingested
        && entry.modified_at == record.modified_at
        && entry.content_hash == record.content_hash
}

/// Collaborators shared by every worker.
struct Pipeline {
    store: Arc<dyn DocumentStore>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    ledger: Arc<dyn Ledger>,
    chunking: ChunkingConfig,
    embed_batch: usize,
}

enum FileOutcome {
    Ingested { chunks: usize },
    Failed,
}

impl Pipeline {
    /// Download, extract, chunk, embed and write one document's entries.
    /// Returns the number of entries written.
    async fn ingest_file(&self, record: &DocumentRecord) -> Result<usize, FileError> {
        let bytes = self
            .store
            .download(record)
            .await
            .map_err(|e| FileError::Download(format!("{:#}", e)))?;

        let content_type = record.content_type.clone();
        let text = tokio::task::spawn_blocking(move || extract_text(&bytes, &content_type))
            .await
            .map_err(|e| FileError::Panicked(format!("extraction task: {}", e)))??;

        let chunks = chunk_text(&record.id, &text, &self.chunking);
        if chunks.is_empty() {
            return Err(FileError::Empty);
        }

        let mut entries = Vec::with_capacity(chunks.len());
        let mut pending = chunks.into_iter().peekable();
        while pending.peek().is_some() {
            let batch: Vec<_> = pending.by_ref().take(self.embed_batch).collect();
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self
                .embedder
                .embed(&texts)
                .await
                .map_err(|e| FileError::Embed(format!("{:#}", e)))?;
            if vectors.len() != batch.len() {
                return Err(FileError::Embed(format!(
                    "{} vectors returned for {} chunks",
                    vectors.len(),
                    batch.len()
                )));
            }
            for (chunk, vector) in batch.into_iter().zip(vectors) {
                entries.push(IndexEntry::new(record, chunk, vector));
            }
        }

        // Clear the previous version so a shorter document leaves no stale chunks.
        self.index
            .delete_by_document(&record.id)
            .await
            .map_err(|e| FileError::Upsert(format!("clearing previous entries: {:#}", e)))?;
        self.index
            .upsert(&entries)
            .await
            .map_err(|e| FileError::Upsert(format!("{:#}", e)))?;

        Ok(entries.len())
    }

    /// Process one record end to end, recording the outcome in the ledger.
    /// Only ledger failures are returned as errors.
    async fn process(
        self: Arc<Self>,
        record: DocumentRecord,
        previous: Option<LedgerEntry>,
        timeout: Duration,
    ) -> anyhow::Result<FileOutcome> {
        let mut entry = LedgerEntry::pending(&record, previous.as_ref());
        self.ledger.put(&entry).await?;

        // Runs inline so aborting this task also stops the document's writes.
        let ingest = AssertUnwindSafe(self.ingest_file(&record)).catch_unwind();
        let result = match tokio::time::timeout(timeout, ingest).await {
            Ok(Ok(result)) => result,
            Ok(Err(payload)) => Err(FileError::Panicked(panic_message(payload))),
            Err(_) => Err(FileError::Timeout(timeout)),
        };

        match result {
            Ok(chunks) => {
                entry.mark_ingested(&record, chunks);
                self.ledger.put(&entry).await?;
                tracing::info!(chunks, "ingested");
                Ok(FileOutcome::Ingested { chunks })
            }
            Err(err) => {
                tracing::warn!(stage = err.stage(), error = %err, "file failed");
                if let Err(e) = self.index.delete_by_document(&record.id).await {
                    tracing::warn!(error = %format!("{:#}", e), "cleanup of partial entries failed");
                }
                entry.mark_failed(&record, err.to_string());
                self.ledger.put(&entry).await?;
                Ok(FileOutcome::Failed)
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs sync passes for one (store, embedder, index, ledger) set.
pub struct Orchestrator {
    pipeline: Arc<Pipeline>,
    progress: Arc<dyn SyncProgressReporter>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        ledger: Arc<dyn Ledger>,
        chunking: ChunkingConfig,
        embed_batch: usize,
    ) -> Self {
        Self {
            pipeline: Arc::new(Pipeline {
                store,
                embedder,
                index,
                ledger,
                chunking,
                embed_batch: embed_batch.max(1),
            }),
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn SyncProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Lease key for this (store, index) pair.
    pub fn lock_key(&self) -> String {
        format!(
            "{}|{}",
            self.pipeline.store.label(),
            self.pipeline.index.label()
        )
    }

    fn lease_lost(&self) -> SyncError {
        tracing::error!(key = %self.lock_key(), "stopping pass after losing the lock");
        SyncError::LeaseLost {
            key: self.lock_key(),
        }
    }

    /// Run one pass.
    pub async fn run_sync(&self, opts: &SyncOptions) -> Result<PassStats, SyncError> {
        if opts.dry_run {
            return self.run_pass(opts, &CancellationToken::new()).await;
        }

        let key = self.lock_key();
        let ledger = &self.pipeline.ledger;
        match ledger
            .try_acquire_lock(&key, &opts.owner, opts.lock_ttl)
            .await
            .map_err(SyncError::ledger)?
        {
            LockAttempt::Acquired => {
                tracing::debug!(key = %key, owner = %opts.owner, "acquired pass lock");
            }
            LockAttempt::Held(info) => {
                return Err(SyncError::LockContention {
                    key,
                    owner: info.owner,
                    expires_at: info.expires_at,
                })
            }
        }

        let lease = CancellationToken::new();
        let renewal = spawn_lease_renewal(Arc::clone(ledger), key.clone(), opts, lease.clone());
        let result = self.run_pass(opts, &lease).await;
        renewal.abort();

        if let Err(e) = ledger.release_lock(&key, &opts.owner).await {
            tracing::warn!(key = %key, error = %format!("{:#}", e), "failed to release pass lock");
        }
        result
    }

    /// `lease` is cancelled when the pass lock is lost; no new work starts after that.
    async fn run_pass(
        &self,
        opts: &SyncOptions,
        lease: &CancellationToken,
    ) -> Result<PassStats, SyncError> {
        let store_label = self.pipeline.store.label();
        let mut stats = PassStats::default();

        self.progress.report(SyncProgressEvent::Listing {
            store: store_label.clone(),
        });
        let listing = self
            .pipeline
            .store
            .list()
            .await
            .map_err(|e| SyncError::listing(&store_label, e))?;
        stats.listed = listing.len() as u64;

        let entries = self
            .pipeline
            .ledger
            .load_all()
            .await
            .map_err(SyncError::ledger)?;

        let mut plan = plan_delta(listing, &entries);
        stats.skipped = plan.unchanged as u64;
        if let Some(limit) = opts.limit {
            if plan.to_ingest.len() > limit {
                stats.deferred = (plan.to_ingest.len() - limit) as u64;
                plan.to_ingest.truncate(limit);
            }
        }

        tracing::info!(
            store = %store_label,
            listed = stats.listed,
            ingest = plan.to_ingest.len(),
            delete = plan.to_delete.len(),
            unchanged = plan.unchanged,
            deferred = stats.deferred,
            "planned sync pass"
        );
        self.progress.report(SyncProgressEvent::Planned {
            store: store_label.clone(),
            ingest: plan.to_ingest.len() as u64,
            delete: plan.to_delete.len() as u64,
            unchanged: plan.unchanged as u64,
        });

        if opts.dry_run {
            for (record, previous) in &plan.to_ingest {
                let reason = match previous {
                    None => "new",
                    Some(p) if p.state != SyncState::Ingested => "retry",
                    Some(_) => "changed",
                };
                tracing::info!(id = %record.id, path = %record.path, reason, "[dry run] would ingest");
            }
            for entry in &plan.to_delete {
                tracing::info!(id = %entry.document_id, path = %entry.path, "[dry run] would delete");
            }
            stats.ingested = plan.to_ingest.len() as u64;
            stats.deleted = plan.to_delete.len() as u64;
            return Ok(stats);
        }

        self.ingest_all(plan.to_ingest, opts, lease, &store_label, &mut stats)
            .await?;
        self.delete_all(plan.to_delete, lease, &store_label, &mut stats)
            .await?;

        tracing::info!(
            store = %store_label,
            ingested = stats.ingested,
            skipped = stats.skipped,
            deleted = stats.deleted,
            failed = stats.failed,
            delete_failed = stats.delete_failed,
            chunks = stats.chunks_upserted,
            "sync pass finished"
        );
        Ok(stats)
    }

    async fn ingest_all(
        &self,
        work: Vec<(DocumentRecord, Option<LedgerEntry>)>,
        opts: &SyncOptions,
        lease: &CancellationToken,
        store_label: &str,
        stats: &mut PassStats,
    ) -> Result<(), SyncError> {
        let total = work.len() as u64;
        let workers = opts.workers.max(1);
        let mut queue = work.into_iter();
        let mut set = JoinSet::new();
        let mut done = 0u64;

        loop {
            while set.len() < workers && !lease.is_cancelled() {
                let Some((record, previous)) = queue.next() else {
                    break;
                };
                let span = tracing::info_span!("file", id = %record.id, path = %record.path);
                let pipeline = Arc::clone(&self.pipeline);
                set.spawn(
                    pipeline
                        .process(record, previous, opts.file_timeout)
                        .instrument(span),
                );
            }

            let joined = tokio::select! {
                biased;
                _ = lease.cancelled() => {
                    set.shutdown().await;
                    return Err(self.lease_lost());
                }
                joined = set.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };
            done += 1;
            match joined {
                Ok(Ok(FileOutcome::Ingested { chunks })) => {
                    stats.ingested += 1;
                    stats.chunks_upserted += chunks as u64;
                }
                Ok(Ok(FileOutcome::Failed)) => stats.failed += 1,
                Ok(Err(e)) => {
                    // Wait for the aborted workers so none writes after we return.
                    set.shutdown().await;
                    return Err(SyncError::ledger(e));
                }
                Err(join_err) => {
                    // Outcome bookkeeping itself panicked; the entry stays
                    // pending and is retried next pass.
                    tracing::error!(error = %join_err, "worker task failed");
                    stats.failed += 1;
                }
            }
            self.progress.report(SyncProgressEvent::Ingesting {
                store: store_label.to_string(),
                n: done,
                total,
            });
        }
        Ok(())
    }

    async fn delete_all(
        &self,
        work: Vec<LedgerEntry>,
        lease: &CancellationToken,
        store_label: &str,
        stats: &mut PassStats,
    ) -> Result<(), SyncError> {
        let total = work.len() as u64;
        for (n, entry) in work.into_iter().enumerate() {
            if lease.is_cancelled() {
                return Err(self.lease_lost());
            }
            match self.pipeline.index.delete_by_document(&entry.document_id).await {
                Ok(removed) => {
                    self.pipeline
                        .ledger
                        .remove(&entry.document_id)
                        .await
                        .map_err(SyncError::ledger)?;
                    tracing::info!(id = %entry.document_id, path = %entry.path, removed, "deleted");
                    stats.deleted += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        id = %entry.document_id,
                        path = %entry.path,
                        error = %format!("{:#}", e),
                        "index delete failed, will retry next pass"
                    );
                    stats.delete_failed += 1;
                }
            }
            self.progress.report(SyncProgressEvent::Deleting {
                store: store_label.to_string(),
                n: n as u64 + 1,
                total,
            });
        }
        Ok(())
    }
}

/// Renew the lease every `ttl / 3`. Cancels `lost` when another owner holds
/// the lock or renewals have failed for a whole `ttl`.
fn spawn_lease_renewal(
    ledger: Arc<dyn Ledger>,
    key: String,
    opts: &SyncOptions,
    lost: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let owner = opts.owner.clone();
    let ttl = opts.lock_ttl;
    let every = (ttl / 3).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        let mut renewed_at = tokio::time::Instant::now();
        loop {
            ticker.tick().await;
            match ledger.renew_lock(&key, &owner, ttl).await {
                Ok(true) => {
                    renewed_at = tokio::time::Instant::now();
                    tracing::debug!(key = %key, "renewed pass lock");
                }
                Ok(false) => {
                    tracing::error!(key = %key, "pass lock is no longer held by this run");
                    lost.cancel();
                    return;
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %format!("{:#}", e), "failed to renew pass lock");
                    if renewed_at.elapsed() >= ttl {
                        tracing::error!(key = %key, "pass lock expired before it could be renewed");
                        lost.cancel();
                        return;
                    }
                }
            }
        }
    })
}

/// Build every collaborator from configuration and run one pass.
///
/// In secure mode the ledger file is restored from blob storage first and
/// uploaded again afterwards, also when the pass fails.
pub async fn run_sync(
    config: &Config,
    opts: &SyncOptions,
    progress: Arc<dyn SyncProgressReporter>,
) -> Result<PassStats, SyncError> {
    let secrets = secrets::resolve(config).await?;

    let staging = if config.secure {
        let container = crate::config::require(&config.staging.container, "BLOB_CONTAINER_NAME")?;
        let conn = secrets
            .get(SecretKey::BlobConnectionString)
            .map_err(|e| SyncError::setup("blob staging", e))?;
        let staging =
            BlobStaging::new(conn, container).map_err(|e| SyncError::setup("blob staging", e))?;
        staging
            .restore(&config.staging.blob_name, &config.ledger.path)
            .await
            .map_err(|e| SyncError::setup("blob staging", e))?;
        Some(staging)
    } else {
        None
    };

    let ledger = Arc::new(
        SqliteLedger::open(&config.ledger.path)
            .await
            .map_err(|e| SyncError::setup("ledger", e))?,
    );

    let result: Result<PassStats, SyncError> = async {
        let store = create_store(&config.store, &secrets).map_err(|e| SyncError::setup("store", e))?;
        let embedder = create_embedder(&config.embedding, &secrets)
            .map_err(|e| SyncError::setup("embedder", e))?;
        let index = create_index(config, &secrets)
            .await
            .map_err(|e| SyncError::setup("index", e))?;

        tracing::info!(
            store = %store.label(),
            index = %index.label(),
            model = embedder.model_name(),
            workers = opts.workers,
            dry_run = opts.dry_run,
            "starting sync"
        );

        let ledger_dyn: Arc<dyn Ledger> = ledger.clone();
        Orchestrator::new(
            store,
            embedder,
            index,
            ledger_dyn,
            config.chunking.clone(),
            config.embedding.batch_size,
        )
        .with_progress(progress)
        .run_sync(opts)
        .await
    }
    .await;

    if let Err(e) = ledger.checkpoint().await {
        tracing::warn!(error = %format!("{:#}", e), "ledger checkpoint failed");
    }
    ledger.close().await;

    let Some(staging) = staging else {
        return result;
    };
    if opts.dry_run
        || matches!(
            result,
            Err(SyncError::LockContention { .. } | SyncError::LeaseLost { .. })
        )
    {
        return result;
    }

    let upload = staging
        .upload(&config.ledger.path, &config.staging.blob_name)
        .await;
    match (result, upload) {
        (Ok(stats), Ok(())) => Ok(stats),
        (Ok(_), Err(e)) => Err(SyncError::ledger(e)),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(e)) => {
            tracing::error!(error = %format!("{:#}", e), "failed to upload staged ledger");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record(id: &str, minute: u32, hash: Option<&str>) -> DocumentRecord {
        DocumentRecord {
            id: id.to_string(),
            name: format!("{}.md", id),
            path: format!("/{}.md", id),
            modified_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, minute, 0).unwrap(),
            content_hash: hash.map(str::to_string),
            content_type: "text/markdown".to_string(),
            metadata: serde_json::json!({}),
        }
    }

    fn ingested(rec: &DocumentRecord) -> LedgerEntry {
        let mut entry = LedgerEntry::pending(rec, None);
        entry.mark_ingested(rec, 1);
        entry
    }

    fn ledger_of(entries: Vec<LedgerEntry>) -> HashMap<String, LedgerEntry> {
        entries
            .into_iter()
            .map(|e| (e.document_id.clone(), e))
            .collect()
    }

    fn ids(plan: &SyncPlan) -> (Vec<&str>, Vec<&str>) {
        (
            plan.to_ingest.iter().map(|(r, _)| r.id.as_str()).collect(),
            plan.to_delete.iter().map(|e| e.document_id.as_str()).collect(),
        )
    }

    #[test]
    fn new_changed_removed_and_unchanged() {
        let a = record("a", 0, Some("h1"));
        let b = record("b", 0, Some("h1"));
        let c = record("c", 0, Some("h1"));
        let ledger = ledger_of(vec![ingested(&b), ingested(&c)]);

        let plan = plan_delta(vec![a, record("b", 5, Some("h1"))], &ledger);
        assert_eq!(ids(&plan), (vec!["a", "b"], vec!["c"]));
        assert_eq!(plan.unchanged, 0);
        assert!(plan.to_ingest[0].1.is_none());
        assert!(plan.to_ingest[1].1.is_some());
    }

    #[test]
    fn hash_change_with_same_timestamp_is_detected() {
        let a = record("a", 0, Some("h1"));
        let ledger = ledger_of(vec![ingested(&a)]);
        let plan = plan_delta(vec![record("a", 0, Some("h2"))], &ledger);
        assert_eq!(ids(&plan).0, vec!["a"]);
    }

    #[test]
    fn identical_listing_is_a_no_op() {
        let listing = vec![record("a", 0, Some("h")), record("b", 1, None)];
        let ledger = ledger_of(listing.iter().map(ingested).collect());
        let plan = plan_delta(listing, &ledger);
        assert!(plan.to_ingest.is_empty());
        assert!(plan.to_delete.is_empty());
        assert_eq!(plan.unchanged, 2);
    }

    #[test]
    fn failed_and_pending_entries_are_retried() {
        let a = record("a", 0, None);
        let b = record("b", 0, None);
        let mut failed = LedgerEntry::pending(&a, None);
        failed.mark_failed(&a, "boom".to_string());
        let pending = LedgerEntry::pending(&b, None);
        let plan = plan_delta(vec![a, b], &ledger_of(vec![failed, pending]));
        assert_eq!(ids(&plan).0, vec!["a", "b"]);
    }

    #[test]
    fn duplicate_ids_keep_first() {
        let first = record("a", 0, Some("first"));
        let second = record("a", 1, Some("second"));
        let plan = plan_delta(vec![first, second], &HashMap::new());
        assert_eq!(plan.to_ingest.len(), 1);
        assert_eq!(plan.to_ingest[0].0.content_hash.as_deref(), Some("first"));
    }

    #[test]
    fn owner_is_unique_per_call() {
        assert_ne!(default_owner(), default_owner());
    }
}
