//! Document store abstraction.
//!
//! A [`DocumentStore`] enumerates the files that should be searchable and
//! fetches their bytes on demand. Listing is cheap and happens once per pass;
//! downloads happen only for records the delta plan selects.
//!
//! | Store | Module | Identity |
//! |-------|--------|----------|
//! | SharePoint Online (Graph) | [`sharepoint`] | drive item id |
//! | Local directory | [`filesystem`] | path relative to the root |

pub mod filesystem;
pub mod sharepoint;

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::config::StoreConfig;
use crate::models::DocumentRecord;
use crate::secrets::Secrets;

/// A source of documents to keep in sync with the index.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Human-readable label used in logs and the pass lock key
    /// (e.g. `"sharepoint:GenAI-Sandbox"`).
    fn label(&self) -> String;

    /// Enumerate every eligible document. An error here is fatal for the pass:
    /// without a complete listing, deletions cannot be computed safely.
    async fn list(&self) -> Result<Vec<DocumentRecord>>;

    /// Fetch the raw bytes of one listed document.
    async fn download(&self, record: &DocumentRecord) -> Result<Vec<u8>>;
}

/// Build the store selected by `config.kind`.
pub fn create_store(config: &StoreConfig, secrets: &Secrets) -> Result<Arc<dyn DocumentStore>> {
    match config.kind.as_str() {
        "sharepoint" => Ok(Arc::new(
            sharepoint::SharePointStore::new(&config.sharepoint, secrets)?,
        )),
        "filesystem" => match &config.filesystem {
            Some(fs) => Ok(Arc::new(filesystem::FilesystemStore::new(fs.clone())?)),
            None => bail!("Filesystem store not configured"),
        },
        other => bail!("Unknown store kind: {}", other),
    }
}
