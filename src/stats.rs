//! Ledger status overview.
//!
//! Summarises what the ledger knows: document counts per sync state, chunk
//! totals, the most recent failures, and pass lock holders. Used by
//! `csync status` to confirm that passes are converging.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::Config;
use crate::ledger::{Ledger, LockInfo, SqliteLedger};
use crate::models::{LedgerEntry, SyncState};

const RECENT_FAILURES: usize = 10;

#[derive(Debug, Default, Serialize)]
pub struct LedgerSummary {
    pub total: u64,
    pub ingested: u64,
    pub pending: u64,
    pub failed: u64,
    pub chunks: i64,
    pub last_update: Option<DateTime<Utc>>,
    /// Most recent failures first.
    pub failures: Vec<FailureSummary>,
    pub locks: Vec<LockInfo>,
}

#[derive(Debug, Serialize)]
pub struct FailureSummary {
    pub document_id: String,
    pub path: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Build a summary from the ledger's contents.
pub async fn summarize(ledger: &dyn Ledger) -> Result<LedgerSummary> {
    let entries = ledger.load_all().await?;
    let mut summary = LedgerSummary {
        total: entries.len() as u64,
        locks: ledger.locks().await?,
        ..Default::default()
    };

    let mut failed: Vec<&LedgerEntry> = Vec::new();
    for entry in entries.values() {
        match entry.state {
            SyncState::Ingested => {
                summary.ingested += 1;
                summary.chunks += entry.chunk_count;
            }
            SyncState::Pending => summary.pending += 1,
            SyncState::Failed => {
                summary.failed += 1;
                failed.push(entry);
            }
            SyncState::Deleted => {}
        }
        if summary.last_update.map_or(true, |t| entry.updated_at > t) {
            summary.last_update = Some(entry.updated_at);
        }
    }

    failed.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    summary.failures = failed
        .into_iter()
        .take(RECENT_FAILURES)
        .map(|e| FailureSummary {
            document_id: e.document_id.clone(),
            path: e.path.clone(),
            error: e.last_error.clone().unwrap_or_default(),
            at: e.updated_at,
        })
        .collect();
    Ok(summary)
}

/// Run the status command: read the ledger and print a summary.
pub async fn run_status(config: &Config, json: bool) -> Result<()> {
    let ledger = SqliteLedger::open(&config.ledger.path).await?;
    let summary = summarize(&ledger).await?;
    ledger.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let db_size = std::fs::metadata(&config.ledger.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("corpus-sync Ledger Status");
    println!("=========================");
    println!();
    println!("  Ledger:      {}", config.ledger.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!(
        "  Last update: {}",
        summary
            .last_update
            .map(|t| format_ts_relative(t.timestamp()))
            .unwrap_or_else(|| "never".to_string())
    );
    println!();
    println!("  Documents:   {}", summary.total);
    println!("  Ingested:    {}", summary.ingested);
    println!("  Pending:     {}", summary.pending);
    println!("  Failed:      {}", summary.failed);
    println!("  Chunks:      {}", summary.chunks);

    if !summary.failures.is_empty() {
        println!();
        println!("  Recent failures:");
        println!("  {:<40} {:<16} {}", "PATH", "WHEN", "ERROR");
        println!("  {}", "-".repeat(96));
        for f in &summary.failures {
            println!(
                "  {:<40} {:<16} {}",
                truncate(&f.path, 40),
                format_ts_relative(f.at.timestamp()),
                truncate(&f.error, 60)
            );
        }
    }

    if !summary.locks.is_empty() {
        let now = Utc::now();
        println!();
        println!("  Pass locks:");
        for lock in &summary.locks {
            let state = if lock.is_expired(now) { "expired" } else { "held" };
            println!(
                "  {}  {} by {} until {}",
                lock.key,
                state,
                lock.owner,
                format_ts_iso(lock.expires_at.timestamp())
            );
        }
    }

    println!();
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::models::DocumentRecord;
    use std::time::Duration;

    fn record(id: &str) -> DocumentRecord {
        DocumentRecord {
            id: id.to_string(),
            name: id.to_string(),
            path: format!("/{}", id),
            modified_at: Utc::now(),
            content_hash: None,
            content_type: "text/plain".to_string(),
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn summary_counts_states_and_failures() {
        let mut ok = LedgerEntry::pending(&record("ok"), None);
        ok.mark_ingested(&record("ok"), 7);
        let mut bad = LedgerEntry::pending(&record("bad"), None);
        bad.mark_failed(&record("bad"), "download failed: 403".to_string());
        let waiting = LedgerEntry::pending(&record("waiting"), None);

        let ledger = MemoryLedger::with_entries([ok, bad, waiting]);
        ledger
            .try_acquire_lock("fs|local", "run-1", Duration::from_secs(60))
            .await
            .unwrap();

        let summary = summarize(&ledger).await.unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.ingested, 1);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.chunks, 7);
        assert_eq!(summary.failures[0].path, "/bad");
        assert_eq!(summary.failures[0].error, "download failed: 403");
        assert_eq!(summary.locks[0].owner, "run-1");
    }

    #[test]
    fn format_helpers() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(truncate("abcdef", 4), "abc…");
        assert_eq!(truncate("abc", 4), "abc");
    }
}
