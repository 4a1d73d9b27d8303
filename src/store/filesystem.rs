//! Local directory store.
//!
//! Walks a root directory with include/exclude globs. Documents are
//! identified by their path relative to the root, so moving the root does not
//! re-ingest everything. The content hash is a SHA-256 of the file bytes,
//! which lets an edit that preserves mtime still be detected.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::DocumentStore;
use crate::config::FilesystemConfig;
use crate::extract::content_type_for;
use crate::models::DocumentRecord;

pub struct FilesystemStore {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    follow_symlinks: bool,
}

impl FilesystemStore {
    pub fn new(config: FilesystemConfig) -> Result<Self> {
        let mut default_excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        default_excludes.extend(config.exclude_globs.iter().cloned());

        Ok(Self {
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&default_excludes)?,
            root: config.root,
            follow_symlinks: config.follow_symlinks,
        })
    }

    fn scan(&self) -> Result<Vec<DocumentRecord>> {
        if !self.root.exists() {
            bail!("Filesystem store root does not exist: {}", self.root.display());
        }

        let mut records = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(self.follow_symlinks) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().replace('\\', "/");

            if self.exclude.is_match(&rel_str) || !self.include.is_match(&rel_str) {
                continue;
            }

            records.push(file_to_record(path, &rel_str)?);
        }

        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }
}

#[async_trait]
impl DocumentStore for FilesystemStore {
    fn label(&self) -> String {
        format!("filesystem:{}", self.root.display())
    }

    async fn list(&self) -> Result<Vec<DocumentRecord>> {
        self.scan()
    }

    async fn download(&self, record: &DocumentRecord) -> Result<Vec<u8>> {
        let path = self.root.join(&record.id);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))
    }
}

fn file_to_record(path: &Path, relative_path: &str) -> Result<DocumentRecord> {
    let metadata = std::fs::metadata(path)?;
    let modified: DateTime<Utc> = metadata
        .modified()
        .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
        .into();

    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let hash = format!("{:x}", Sha256::digest(&bytes));

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    Ok(DocumentRecord {
        id: relative_path.to_string(),
        content_type: content_type_for(&name),
        name,
        path: format!("/{}", relative_path),
        modified_at: modified,
        content_hash: Some(hash),
        metadata: serde_json::json!({
            "source_url": format!("file://{}", path.display()),
            "size": metadata.len(),
        }),
    })
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
