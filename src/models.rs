//! Core data models used throughout corpus-sync.
//!
//! These types represent the documents listed by a store, the ledger rows that
//! track their sync state, and the chunks and index entries that flow through
//! a pass.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One source file as reported by a document store listing.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRecord {
    /// Store-unique identifier (SharePoint item id, relative path, ...).
    pub id: String,
    pub name: String,
    pub path: String,
    pub modified_at: DateTime<Utc>,
    /// Content fingerprint when the store can provide one cheaply.
    pub content_hash: Option<String>,
    pub content_type: String,
    /// Store-specific locators, copied into index entry metadata.
    pub metadata: serde_json::Value,
}

/// Sync state of a document in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Pending,
    Ingested,
    Failed,
    Deleted,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Pending => "pending",
            SyncState::Ingested => "ingested",
            SyncState::Failed => "failed",
            SyncState::Deleted => "deleted",
        }
    }

    /// Whether the per-document state machine allows `self → next`.
    pub fn can_transition_to(self, next: SyncState) -> bool {
        use SyncState::*;
        matches!(
            (self, next),
            (Pending, Ingested)
                | (Pending, Failed)
                | (Ingested, Pending)
                | (Failed, Pending)
                | (Pending, Deleted)
                | (Ingested, Deleted)
                | (Failed, Deleted)
        )
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncState::Pending),
            "ingested" => Ok(SyncState::Ingested),
            "failed" => Ok(SyncState::Failed),
            "deleted" => Ok(SyncState::Deleted),
            other => anyhow::bail!("unknown sync state: '{}'", other),
        }
    }
}

/// A ledger row: the last-known sync state of one document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub document_id: String,
    pub name: String,
    pub path: String,
    pub modified_at: DateTime<Utc>,
    pub content_hash: Option<String>,
    pub state: SyncState,
    pub chunk_count: i64,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Entry for a record about to be processed (`unseen|ingested|failed → pending`).
    ///
    /// The timestamp and hash are only committed once the record is ingested,
    /// so a crash mid-file leaves it eligible for reprocessing.
    pub fn pending(record: &DocumentRecord, previous: Option<&LedgerEntry>) -> Self {
        LedgerEntry {
            document_id: record.id.clone(),
            name: record.name.clone(),
            path: record.path.clone(),
            modified_at: previous.map(|p| p.modified_at).unwrap_or(record.modified_at),
            content_hash: previous.and_then(|p| p.content_hash.clone()),
            state: SyncState::Pending,
            chunk_count: previous.map(|p| p.chunk_count).unwrap_or(0),
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    /// `pending → ingested`, committing the record's timestamp and hash.
    pub fn mark_ingested(&mut self, record: &DocumentRecord, chunk_count: usize) {
        debug_assert!(self.state.can_transition_to(SyncState::Ingested));
        self.modified_at = record.modified_at;
        self.content_hash = record.content_hash.clone();
        self.state = SyncState::Ingested;
        self.chunk_count = chunk_count as i64;
        self.last_error = None;
        self.updated_at = Utc::now();
    }

    /// `pending → failed`. The record's timestamp is stored for reporting;
    /// failed entries are always retried regardless of it.
    pub fn mark_failed(&mut self, record: &DocumentRecord, error: String) {
        debug_assert!(self.state.can_transition_to(SyncState::Failed));
        self.modified_at = record.modified_at;
        self.content_hash = record.content_hash.clone();
        self.state = SyncState::Failed;
        self.chunk_count = 0;
        self.last_error = Some(error);
        self.updated_at = Utc::now();
    }
}

/// A chunk of a document's extracted text.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub document_id: String,
    pub chunk_index: i64,
    /// Byte offset of the chunk's first character in the source text.
    pub start: usize,
    pub text: String,
    pub hash: String,
}

impl Chunk {
    /// Deterministic id, so re-ingesting a document overwrites its entries.
    pub fn chunk_id(&self) -> String {
        format!("{}#{}", self.document_id, self.chunk_index)
    }
}

/// The vector index's representation of a chunk.
#[derive(Debug, Clone, Serialize)]
pub struct IndexEntry {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub vector: Vec<f32>,
    pub metadata: serde_json::Value,
}

impl IndexEntry {
    pub fn new(record: &DocumentRecord, chunk: Chunk, vector: Vec<f32>) -> Self {
        let mut metadata = serde_json::json!({
            "document_id": record.id,
            "name": record.name,
            "path": record.path,
            "chunk_index": chunk.chunk_index,
            "chunk_hash": chunk.hash,
            "modified_at": record.modified_at.to_rfc3339(),
        });
        if let (Some(target), Some(extra)) = (metadata.as_object_mut(), record.metadata.as_object())
        {
            for (k, v) in extra {
                target.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }

        IndexEntry {
            chunk_id: chunk.chunk_id(),
            document_id: record.id.clone(),
            chunk_index: chunk.chunk_index,
            text: chunk.text,
            vector,
            metadata,
        }
    }
}

/// Outcome counts of a single pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassStats {
    pub listed: u64,
    pub ingested: u64,
    pub skipped: u64,
    pub deleted: u64,
    pub failed: u64,
    /// Deletions that failed and stay in the ledger for the next pass.
    pub delete_failed: u64,
    /// Records left for a later pass because of `--limit`.
    pub deferred: u64,
    pub chunks_upserted: u64,
}

impl PassStats {
    /// Whether the failed-record count breaches `threshold`.
    /// `None` means partial failures never fail the pass.
    pub fn exceeds_failure_threshold(&self, threshold: Option<u64>) -> bool {
        threshold.is_some_and(|max| self.failed > max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> DocumentRecord {
        DocumentRecord {
            id: id.to_string(),
            name: format!("{}.txt", id),
            path: format!("/docs/{}.txt", id),
            modified_at: Utc::now(),
            content_hash: Some("abc".to_string()),
            content_type: "text/plain".to_string(),
            metadata: serde_json::json!({ "drive_name": "Bids", "name": "ignored" }),
        }
    }

    #[test]
    fn state_roundtrips_through_str() {
        for s in [
            SyncState::Pending,
            SyncState::Ingested,
            SyncState::Failed,
            SyncState::Deleted,
        ] {
            assert_eq!(s.as_str().parse::<SyncState>().unwrap(), s);
        }
        assert!("bogus".parse::<SyncState>().is_err());
    }

    #[test]
    fn state_machine_transitions() {
        assert!(SyncState::Pending.can_transition_to(SyncState::Ingested));
        assert!(SyncState::Ingested.can_transition_to(SyncState::Pending));
        assert!(SyncState::Failed.can_transition_to(SyncState::Deleted));
        assert!(!SyncState::Ingested.can_transition_to(SyncState::Failed));
        assert!(!SyncState::Deleted.can_transition_to(SyncState::Pending));
    }

    #[test]
    fn pending_keeps_previous_fingerprint_until_ingested() {
        let mut rec = record("a");
        let mut entry = LedgerEntry::pending(&rec, None);
        entry.mark_ingested(&rec, 3);

        rec.content_hash = Some("def".to_string());
        let pending = LedgerEntry::pending(&rec, Some(&entry));
        assert_eq!(pending.state, SyncState::Pending);
        assert_eq!(pending.content_hash.as_deref(), Some("abc"));
        assert_eq!(pending.chunk_count, 3);
    }

    #[test]
    fn index_entry_metadata_prefers_core_fields() {
        let rec = record("a");
        let chunk = Chunk {
            document_id: "a".to_string(),
            chunk_index: 2,
            start: 0,
            text: "hello".to_string(),
            hash: "h".to_string(),
        };
        let entry = IndexEntry::new(&rec, chunk, vec![0.1, 0.2]);
        assert_eq!(entry.chunk_id, "a#2");
        assert_eq!(entry.metadata["document_id"], "a");
        assert_eq!(entry.metadata["name"], "a.txt");
        assert_eq!(entry.metadata["drive_name"], "Bids");
    }

    #[test]
    fn failure_threshold() {
        let stats = PassStats {
            failed: 3,
            ..Default::default()
        };
        assert!(!stats.exceeds_failure_threshold(None));
        assert!(!stats.exceeds_failure_threshold(Some(3)));
        assert!(stats.exceeds_failure_threshold(Some(2)));
    }
}
