//! Ledger staging in Azure Blob Storage (secure mode).
//!
//! Containers have no durable local disk, so in secure mode the SQLite ledger
//! file is restored from a blob before the pass and uploaded again afterwards.
//! A missing blob is initialised empty so the first run starts from a fresh
//! ledger. Requests are signed with the storage account's Shared Key.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;

use crate::signing::{shared_key_authorization, SharedKeyRequest};

const STORAGE_API_VERSION: &str = "2021-08-06";

/// Parsed storage connection string.
#[derive(Clone)]
pub struct StorageAccount {
    pub name: String,
    key: Vec<u8>,
    pub blob_endpoint: String,
}

impl std::fmt::Debug for StorageAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageAccount")
            .field("name", &self.name)
            .field("blob_endpoint", &self.blob_endpoint)
            .finish_non_exhaustive()
    }
}

impl StorageAccount {
    /// Parse `DefaultEndpointsProtocol=https;AccountName=..;AccountKey=..;EndpointSuffix=..`.
    /// An explicit `BlobEndpoint` wins over the derived one.
    pub fn from_connection_string(conn: &str) -> Result<Self> {
        use base64::Engine;

        let mut name = None;
        let mut key = None;
        let mut protocol = "https".to_string();
        let mut suffix = "core.windows.net".to_string();
        let mut blob_endpoint = None;

        for part in conn.split(';').filter(|p| !p.trim().is_empty()) {
            let Some((k, v)) = part.split_once('=') else {
                bail!("malformed connection string segment");
            };
            match k.trim() {
                "AccountName" => name = Some(v.trim().to_string()),
                "AccountKey" => key = Some(v.trim().to_string()),
                "DefaultEndpointsProtocol" => protocol = v.trim().to_string(),
                "EndpointSuffix" => suffix = v.trim().to_string(),
                "BlobEndpoint" => blob_endpoint = Some(v.trim().trim_end_matches('/').to_string()),
                _ => {}
            }
        }

        let name = name.context("connection string has no AccountName")?;
        let key = base64::engine::general_purpose::STANDARD
            .decode(key.context("connection string has no AccountKey")?)
            .context("AccountKey is not valid base64")?;
        let blob_endpoint =
            blob_endpoint.unwrap_or_else(|| format!("{}://{}.blob.{}", protocol, name, suffix));

        Ok(Self {
            name,
            key,
            blob_endpoint,
        })
    }
}

pub struct BlobStaging {
    client: reqwest::Client,
    account: StorageAccount,
    container: String,
}

impl BlobStaging {
    pub fn new(connection_string: &str, container: &str) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(300))
                .build()?,
            account: StorageAccount::from_connection_string(connection_string)?,
            container: container.to_string(),
        })
    }

    fn blob_path(&self, blob: &str) -> String {
        format!("/{}/{}", self.container, blob)
    }

    fn request(
        &self,
        method: reqwest::Method,
        blob: &str,
        body: Option<Vec<u8>>,
    ) -> reqwest::RequestBuilder {
        let path = self.blob_path(blob);
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let len = body.as_ref().map(Vec::len).unwrap_or(0);
        let content_type = if body.is_some() {
            "application/octet-stream"
        } else {
            ""
        };

        let mut ms_headers = vec![("x-ms-date", date.as_str()), ("x-ms-version", STORAGE_API_VERSION)];
        if body.is_some() {
            ms_headers.push(("x-ms-blob-type", "BlockBlob"));
        }
        let auth = shared_key_authorization(
            &SharedKeyRequest {
                method: method.as_str(),
                account: &self.account.name,
                path: &path,
                query: &[],
                content_length: len,
                content_type,
                ms_headers: &ms_headers,
            },
            &self.account.key,
        );

        let mut req = self
            .client
            .request(method, format!("{}{}", self.account.blob_endpoint, path))
            .header("Authorization", auth);
        for (k, v) in &ms_headers {
            req = req.header(*k, *v);
        }
        if let Some(body) = body {
            req = req.header("Content-Type", content_type).body(body);
        }
        req
    }

    /// Download `blob` to `local`. A missing blob is created empty and the
    /// local file is removed so the ledger starts fresh. Returns whether the
    /// blob existed.
    pub async fn restore(&self, blob: &str, local: &Path) -> Result<bool> {
        let response = self
            .request(reqwest::Method::GET, blob, None)
            .send()
            .await
            .with_context(|| format!("failed to download blob {}", blob))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::info!(blob, "staged file not found, initialising");
            self.put(blob, Vec::new()).await?;
            if local.exists() {
                tokio::fs::remove_file(local).await?;
            }
            return Ok(false);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("blob download failed (HTTP {}): {}", status, body);
        }

        let bytes = response.bytes().await?;
        if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        if bytes.is_empty() {
            // An initialised-but-never-written ledger.
            if local.exists() {
                tokio::fs::remove_file(local).await?;
            }
        } else {
            tokio::fs::write(local, &bytes).await?;
        }
        tracing::info!(blob, bytes = bytes.len(), "restored staged file");
        Ok(true)
    }

    /// Upload `local` to `blob`, replacing it.
    pub async fn upload(&self, local: &Path, blob: &str) -> Result<()> {
        let bytes = tokio::fs::read(local)
            .await
            .with_context(|| format!("failed to read {}", local.display()))?;
        let len = bytes.len();
        self.put(blob, bytes).await?;
        tracing::info!(blob, bytes = len, "uploaded staged file");
        Ok(())
    }

    async fn put(&self, blob: &str, bytes: Vec<u8>) -> Result<()> {
        let response = self
            .request(reqwest::Method::PUT, blob, Some(bytes))
            .send()
            .await
            .with_context(|| format!("failed to upload blob {}", blob))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("blob upload failed (HTTP {}): {}", status, body);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_connection_string() {
        let account = StorageAccount::from_connection_string(
            "DefaultEndpointsProtocol=https;AccountName=stingest;AccountKey=a2V5;EndpointSuffix=core.windows.net",
        )
        .unwrap();
        assert_eq!(account.name, "stingest");
        assert_eq!(account.blob_endpoint, "https://stingest.blob.core.windows.net");
        assert_eq!(account.key, b"key");
        assert!(!format!("{:?}", account).contains("a2V5"));
    }

    #[test]
    fn explicit_blob_endpoint_wins() {
        let account = StorageAccount::from_connection_string(
            "AccountName=devstoreaccount1;AccountKey=a2V5;BlobEndpoint=http://127.0.0.1:10000/devstoreaccount1/",
        )
        .unwrap();
        assert_eq!(account.blob_endpoint, "http://127.0.0.1:10000/devstoreaccount1");
    }

    #[test]
    fn missing_key_is_rejected() {
        assert!(StorageAccount::from_connection_string("AccountName=x").is_err());
        assert!(StorageAccount::from_connection_string("AccountName=x;AccountKey=%%%").is_err());
    }
}
