//! Embedding provider abstraction and implementations.
//!
//! Defines the [`Embedder`] trait and concrete implementations:
//! - **[`BedrockEmbedder`]**: Amazon Titan text embeddings via Bedrock
//!   `InvokeModel`, signed with SigV4.
//! - **[`OpenAiEmbedder`]**: the OpenAI `/v1/embeddings` API with batching.
//! - **[`HashedEmbedder`]**: deterministic feature hashing; no network, used
//!   for offline runs and tests.
//!
//! Use [`create_embedder`] to build the provider named in the configuration.
//! Remote providers retry transient failures through
//! [`send_with_retry`](crate::http::send_with_retry).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;

use crate::config::EmbeddingConfig;
use crate::http::send_with_retry;
use crate::secrets::{SecretKey, Secrets};
use crate::signing::{sign_v4, uri_encode, AwsCredentials, SigV4Request};

/// Turns chunk texts into dense vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"amazon.titan-embed-text-v1"`).
    fn model_name(&self) -> &str;

    /// Embed a batch of texts. Returns one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Build the embedder selected by `config.provider`.
pub fn create_embedder(config: &EmbeddingConfig, secrets: &Secrets) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "bedrock" => Ok(Arc::new(BedrockEmbedder::new(config, secrets)?)),
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(config, secrets)?)),
        "hashed" => Ok(Arc::new(HashedEmbedder::new(
            config.dims.unwrap_or(HashedEmbedder::DEFAULT_DIMS),
        ))),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

fn http_client(config: &EmbeddingConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

// ============ Bedrock ============

/// Amazon Titan embeddings through the Bedrock runtime.
///
/// Titan text models accept one input per call, so a batch becomes a
/// sequence of `InvokeModel` requests.
pub struct BedrockEmbedder {
    client: reqwest::Client,
    creds: AwsCredentials,
    region: String,
    model: String,
    max_retries: u32,
}

impl BedrockEmbedder {
    pub fn new(config: &EmbeddingConfig, secrets: &Secrets) -> Result<Self> {
        let creds = AwsCredentials {
            access_key_id: secrets.get(SecretKey::AwsAccessKeyId)?.to_string(),
            secret_access_key: secrets.get(SecretKey::AwsSecretAccessKey)?.to_string(),
            session_token: secrets.optional(SecretKey::AwsSessionToken).map(str::to_string),
        };
        Ok(Self {
            client: http_client(config)?,
            creds,
            region: config.region.clone(),
            model: config.model_or_default(),
            max_retries: config.max_retries,
        })
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let host = format!("bedrock-runtime.{}.amazonaws.com", self.region);
        let model_segment = uri_encode(&self.model);
        let url = format!("https://{}/model/{}/invoke", host, model_segment);
        // Non-S3 services sign the path with each segment encoded twice.
        let canonical_uri = format!("/model/{}/invoke", uri_encode(&model_segment));
        let body = serde_json::to_vec(&serde_json::json!({ "inputText": text }))?;

        let response = send_with_retry("Bedrock InvokeModel", self.max_retries, || {
            let signed = sign_v4(
                &SigV4Request {
                    method: "POST",
                    host: &host,
                    canonical_uri: &canonical_uri,
                    canonical_query: "",
                    payload: &body,
                    region: &self.region,
                    service: "bedrock",
                },
                &self.creds,
                chrono::Utc::now(),
            );
            let mut req = self
                .client
                .post(&url)
                .header("Authorization", signed.authorization)
                .header("x-amz-date", signed.amz_date)
                .header("x-amz-content-sha256", signed.content_sha256)
                .header("Content-Type", "application/json")
                .header("Accept", "application/json")
                .body(body.clone());
            if let Some(token) = signed.security_token {
                req = req.header("x-amz-security-token", token);
            }
            Ok(req)
        })
        .await?;

        let json: serde_json::Value = response.json().await?;
        parse_vector(json.get("embedding"))
            .ok_or_else(|| anyhow!("Invalid Bedrock response: missing embedding"))
    }
}

#[async_trait]
impl Embedder for BedrockEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed_one(text).await?);
        }
        Ok(vectors)
    }
}

// ============ OpenAI ============

/// Embeddings from the OpenAI API.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    max_retries: u32,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig, secrets: &Secrets) -> Result<Self> {
        Ok(Self {
            client: http_client(config)?,
            api_key: secrets.get(SecretKey::OpenAiApiKey)?.to_string(),
            model: config.model_or_default(),
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = send_with_retry("OpenAI embeddings", self.max_retries, || {
            Ok(self
                .client
                .post("https://api.openai.com/v1/embeddings")
                .bearer_auth(&self.api_key)
                .json(&body))
        })
        .await?;

        let json: serde_json::Value = response.json().await?;
        parse_openai_response(&json, texts.len())
    }
}

/// Extract `data[].embedding`, ordered by `data[].index`.
fn parse_openai_response(json: &serde_json::Value, expected: usize) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .context("Invalid OpenAI response: missing data array")?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let vector = parse_vector(item.get("embedding"))
            .context("Invalid OpenAI response: missing embedding")?;
        indexed.push((index, vector));
    }
    indexed.sort_by_key(|(i, _)| *i);

    if indexed.len() != expected {
        bail!(
            "OpenAI returned {} embeddings for {} inputs",
            indexed.len(),
            expected
        );
    }
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn parse_vector(value: Option<&serde_json::Value>) -> Option<Vec<f32>> {
    value?
        .as_array()?
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

// ============ Hashed ============

/// Deterministic bag-of-words embedder using the hashing trick.
///
/// Each lowercase alphanumeric token is hashed with SHA-256 into a bucket and
/// sign; the result is L2-normalised. Texts sharing words get similar
/// vectors, which is enough for local runs and tests.
pub struct HashedEmbedder {
    dims: usize,
    model: String,
}

impl HashedEmbedder {
    pub const DEFAULT_DIMS: usize = 256;

    pub fn new(dims: usize) -> Self {
        let dims = dims.max(1);
        Self {
            dims,
            model: format!("hashed-{}", dims),
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        use sha2::{Digest, Sha256};

        let mut vector = vec![0.0f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let bucket = u64::from_le_bytes([
                digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6],
                digest[7],
            ]) as usize
                % self.dims;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashedEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

/// Encode a float vector as little-endian `f32` bytes for SQLite BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB produced by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_hashed_is_deterministic_and_normalised() {
        let e = HashedEmbedder::new(64);
        let a = e.embed_text("Bid repository pricing schedule");
        let b = e.embed_text("bid REPOSITORY pricing, schedule!");
        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
        assert!((cosine(&a, &a) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hashed_similarity_tracks_shared_words() {
        let e = HashedEmbedder::new(256);
        let base = e.embed_text("azure container group deployment guide");
        let near = e.embed_text("azure container group deployment notes");
        let far = e.embed_text("quarterly sales figures for retail");
        assert!(cosine(&base, &near) > cosine(&base, &far));
    }

    #[test]
    fn test_hashed_empty_text_is_zero_vector() {
        let e = HashedEmbedder::new(8);
        assert!(e.embed_text("  ").iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn test_hashed_batch_preserves_order() {
        let e = HashedEmbedder::new(16);
        let texts = vec!["one".to_string(), "two".to_string()];
        let vectors = e.embed(&texts).await.unwrap();
        assert_eq!(vectors[0], e.embed_text("one"));
        assert_eq!(vectors[1], e.embed_text("two"));
    }

    #[test]
    fn test_parse_openai_response_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                { "index": 1, "embedding": [0.5, 0.5] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ]
        });
        let vectors = parse_openai_response(&json, 2).unwrap();
        assert_eq!(vectors[0], vec![1.0, 0.0]);
        assert_eq!(vectors[1], vec![0.5, 0.5]);
        assert!(parse_openai_response(&json, 3).is_err());
    }

    #[test]
    fn test_create_embedder_by_name() {
        let config = EmbeddingConfig {
            provider: "hashed".to_string(),
            dims: Some(32),
            ..Default::default()
        };
        let embedder = create_embedder(&config, &Secrets::default()).unwrap();
        assert_eq!(embedder.model_name(), "hashed-32");

        let config = EmbeddingConfig {
            provider: "bedrock".to_string(),
            ..Default::default()
        };
        assert!(create_embedder(&config, &Secrets::default()).is_err());
    }
}
