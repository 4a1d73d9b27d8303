//! Astra DB vector collection via the Data API.
//!
//! Each chunk becomes one JSON document:
//!
//! ```json
//! { "_id": "<doc>#<n>", "content": "...", "$vector": [...], "metadata": { "document_id": "...", ... } }
//! ```
//!
//! Writes go through `insertMany` in batches; documents that already exist
//! are replaced individually with an upserting `findOneAndReplace`. Deletes
//! use `deleteMany` on `metadata.document_id`, repeated while the API reports
//! `moreData`.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use super::VectorIndex;
use crate::config::{require, IndexConfig};
use crate::http::send_with_retry;
use crate::models::IndexEntry;
use crate::secrets::{SecretKey, Secrets};

const MAX_RETRIES: u32 = 3;
const ALREADY_EXISTS: &str = "DOCUMENT_ALREADY_EXISTS";

pub struct AstraIndex {
    client: reqwest::Client,
    url: String,
    token: String,
    collection: String,
    batch_size: usize,
}

impl AstraIndex {
    pub fn new(config: &IndexConfig, secrets: &Secrets) -> Result<Self> {
        let endpoint = require(&config.endpoint, "ASTRA_DB_API_ENDPOINT")?;
        let keyspace = require(&config.keyspace, "ASTRA_DB_KEYSPACE")?;
        let collection = require(&config.collection, "SHAREPOINT_COLLECTION_NAME")?;
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()?,
            url: collection_url(endpoint, keyspace, collection),
            token: secrets.get(SecretKey::AstraDbToken)?.to_string(),
            collection: collection.to_string(),
            batch_size: config.batch_size.max(1),
        })
    }

    async fn command(&self, body: &Value) -> Result<Value> {
        let response = send_with_retry("Astra DB command", MAX_RETRIES, || {
            Ok(self
                .client
                .post(&self.url)
                .header("Token", &self.token)
                .json(body))
        })
        .await?;
        Ok(response.json().await?)
    }

    async fn replace(&self, doc: &Value) -> Result<()> {
        let body = json!({
            "findOneAndReplace": {
                "filter": { "_id": doc["_id"] },
                "replacement": doc,
                "options": { "upsert": true }
            }
        });
        let response = self.command(&body).await?;
        check_errors(&response, &[])?;
        Ok(())
    }
}

fn collection_url(endpoint: &str, keyspace: &str, collection: &str) -> String {
    format!(
        "{}/api/json/v1/{}/{}",
        endpoint.trim_end_matches('/'),
        keyspace,
        collection
    )
}

fn to_document(entry: &IndexEntry) -> Value {
    json!({
        "_id": entry.chunk_id,
        "content": entry.text,
        "$vector": entry.vector,
        "metadata": entry.metadata,
    })
}

/// Fail on any error in the response except those whose code is in `tolerated`.
/// Returns the tolerated errors.
fn check_errors<'a>(response: &'a Value, tolerated: &[&str]) -> Result<Vec<&'a Value>> {
    let Some(errors) = response.get("errors").and_then(|e| e.as_array()) else {
        return Ok(Vec::new());
    };
    let mut kept = Vec::new();
    for err in errors {
        let code = err.get("errorCode").and_then(|c| c.as_str()).unwrap_or("");
        if tolerated.contains(&code) {
            kept.push(err);
            continue;
        }
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown error");
        bail!("Astra DB error {}: {}", code, message);
    }
    Ok(kept)
}

/// Ids the API reported as already present.
fn existing_ids(errors: &[&Value]) -> Vec<String> {
    errors
        .iter()
        .filter_map(|e| {
            e.get("id")
                .or_else(|| e.get("documentId"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        })
        .collect()
}

#[async_trait]
impl VectorIndex for AstraIndex {
    fn label(&self) -> String {
        format!("astra:{}", self.collection)
    }

    async fn upsert(&self, entries: &[IndexEntry]) -> Result<()> {
        for batch in entries.chunks(self.batch_size) {
            let documents: Vec<Value> = batch.iter().map(to_document).collect();
            let body = json!({
                "insertMany": {
                    "documents": documents,
                    "options": { "ordered": false }
                }
            });
            let response = self.command(&body).await?;
            let existing = check_errors(&response, &[ALREADY_EXISTS])?;
            if existing.is_empty() {
                continue;
            }

            let ids = existing_ids(&existing);
            let retry: Vec<&Value> = if ids.is_empty() {
                // Ids not reported; replace the whole batch.
                documents.iter().collect()
            } else {
                documents
                    .iter()
                    .filter(|d| d["_id"].as_str().is_some_and(|id| ids.iter().any(|x| x == id)))
                    .collect()
            };
            tracing::debug!(count = retry.len(), "replacing existing Astra documents");
            for doc in retry {
                self.replace(doc).await?;
            }
        }
        Ok(())
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<u64> {
        let body = json!({
            "deleteMany": { "filter": { "metadata.document_id": document_id } }
        });
        let mut deleted = 0u64;
        loop {
            let response = self.command(&body).await?;
            check_errors(&response, &[])?;
            let status = response
                .get("status")
                .context("Astra deleteMany response missing status")?;
            deleted += status
                .get("deletedCount")
                .and_then(|c| c.as_i64())
                .map(|c| c.max(0) as u64)
                .unwrap_or(0);
            if !status.get("moreData").and_then(|m| m.as_bool()).unwrap_or(false) {
                break;
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_and_document_shape() {
        assert_eq!(
            collection_url("https://db-1.apps.astra.datastax.com/", "default_keyspace", "bids"),
            "https://db-1.apps.astra.datastax.com/api/json/v1/default_keyspace/bids"
        );
        let entry = IndexEntry {
            chunk_id: "doc#0".to_string(),
            document_id: "doc".to_string(),
            chunk_index: 0,
            text: "hello".to_string(),
            vector: vec![0.25, 0.5],
            metadata: json!({ "document_id": "doc" }),
        };
        let doc = to_document(&entry);
        assert_eq!(doc["_id"], "doc#0");
        assert_eq!(doc["$vector"], json!([0.25, 0.5]));
        assert_eq!(doc["metadata"]["document_id"], "doc");
    }

    #[test]
    fn error_list_is_checked() {
        assert!(check_errors(&json!({ "status": {} }), &[]).unwrap().is_empty());

        let failed = json!({ "errors": [{ "errorCode": "INVALID_REQUEST", "message": "bad vector" }] });
        let err = check_errors(&failed, &[ALREADY_EXISTS]).unwrap_err();
        assert!(err.to_string().contains("bad vector"));

        let dup = json!({ "errors": [{ "errorCode": ALREADY_EXISTS, "id": "doc#1" }] });
        let kept = check_errors(&dup, &[ALREADY_EXISTS]).unwrap();
        assert_eq!(existing_ids(&kept), vec!["doc#1".to_string()]);
    }
}
