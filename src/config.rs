//! Configuration loading.
//!
//! Settings come from an optional TOML file overlaid with environment
//! variables. The environment names match the deployment's container
//! contract (`SHAREPOINT_SITE_NAME`, `ASTRA_DB_KEYSPACE`, ...), so the same
//! binary runs from a checked-in file locally and from env-only in a
//! container.
//!
//! Required settings have no defaults: [`load_config`] fails with a
//! [`ConfigError::Missing`] naming the setting.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Secrets from Key Vault, ledger staged in blob storage, https-only endpoints.
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub staging: StagingConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
        }
    }
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("./data/ledger.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_file_timeout_secs")]
    pub file_timeout_secs: u64,
    /// Pass lease lifetime; renewed every third of it while a pass runs.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    /// Exit non-zero when more than this many records fail. Absent = never.
    #[serde(default)]
    pub max_failures: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            file_timeout_secs: default_file_timeout_secs(),
            lock_ttl_secs: default_lock_ttl_secs(),
            max_failures: None,
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_file_timeout_secs() -> u64 {
    300
}
fn default_lock_ttl_secs() -> u64 {
    900
}

/// Lower bound for `sync.lock_ttl_secs`. Renewal ticks at most once a second.
pub const MIN_LOCK_TTL_SECS: u64 = 3;

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Maximum chunk length in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    500
}
fn default_chunk_overlap() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `bedrock`, `openai`, or `hashed` (offline).
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            region: default_region(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "bedrock".to_string()
}
fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_batch_size() -> usize {
    16
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    /// Model id, falling back to the provider's usual model.
    pub fn model_or_default(&self) -> String {
        if let Some(ref m) = self.model {
            return m.clone();
        }
        match self.provider.as_str() {
            "openai" => "text-embedding-3-small".to_string(),
            "hashed" => "hashed-v1".to_string(),
            _ => "amazon.titan-embed-text-v1".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// `sharepoint` or `filesystem`.
    #[serde(default = "default_store_kind")]
    pub kind: String,
    #[serde(default)]
    pub sharepoint: SharePointConfig,
    #[serde(default)]
    pub filesystem: Option<FilesystemConfig>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: default_store_kind(),
            sharepoint: SharePointConfig::default(),
            filesystem: None,
        }
    }
}

fn default_store_kind() -> String {
    "sharepoint".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SharePointConfig {
    /// Tenant host, e.g. `contoso.sharepoint.com`.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub site_name: Option<String>,
    /// Drive (document library) names to ingest; empty = every drive.
    #[serde(default)]
    pub drives: Vec<String>,
    /// Ingest at most this many drives, counted after the `drives` allowlist
    /// is applied.
    #[serde(default)]
    pub max_drives: Option<usize>,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_graph_url")]
    pub graph_url: String,
    #[serde(default = "default_login_url")]
    pub login_url: String,
}

impl Default for SharePointConfig {
    fn default() -> Self {
        Self {
            host: None,
            site_name: None,
            drives: Vec::new(),
            max_drives: None,
            extensions: default_extensions(),
            graph_url: default_graph_url(),
            login_url: default_login_url(),
        }
    }
}

fn default_extensions() -> Vec<String> {
    [
        ".txt", ".md", ".csv", ".json", ".html", ".pdf", ".docx", ".pptx",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_graph_url() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}
fn default_login_url() -> String {
    "https://login.microsoftonline.com".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesystemConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// `astra` or `local`.
    #[serde(default = "default_index_kind")]
    pub kind: String,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub keyspace: Option<String>,
    /// Entries per write request.
    #[serde(default = "default_index_batch_size")]
    pub batch_size: usize,
    /// SQLite file for the `local` index; defaults to the ledger database.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            kind: default_index_kind(),
            collection: None,
            endpoint: None,
            keyspace: None,
            batch_size: default_index_batch_size(),
            path: None,
        }
    }
}

fn default_index_kind() -> String {
    "astra".to_string()
}
fn default_index_batch_size() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StagingConfig {
    /// Blob container holding the staged ledger file (secure mode).
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default = "default_blob_name")]
    pub blob_name: String,
}

fn default_blob_name() -> String {
    "ledger.sqlite".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SecretsConfig {
    #[serde(default)]
    pub key_vault_url: Option<String>,
}

/// Return the value of a required setting or a named [`ConfigError::Missing`].
pub fn require<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, ConfigError> {
    match value.as_deref() {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(name.to_string())),
    }
}

/// Load configuration from `path` (if it exists) and the process environment.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    load_config_with(path, |key| std::env::var(key).ok())
}

/// Like [`load_config`] with an explicit environment lookup.
pub fn load_config_with<F>(path: &Path, env: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config: Config = if path.exists() {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        toml::from_str(&content)?
    } else {
        Config::default()
    };

    apply_env(&mut config, &env)?;
    validate(&config)?;
    Ok(config)
}

fn apply_env<F>(config: &mut Config, env: &F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| env(key).filter(|v| !v.trim().is_empty());

    if let Some(v) = get("SECURE") {
        config.secure = match v.to_lowercase().as_str() {
            "true" => true,
            "false" => false,
            _ => {
                return Err(ConfigError::invalid(
                    "SECURE",
                    format!("must be 'True' or 'False', found '{}'", v),
                ))
            }
        };
    }
    if let Some(v) = get("SHAREPOINT_SITE_NAME") {
        config.store.sharepoint.site_name = Some(v);
    }
    if let Some(v) = get("SHAREPOINT_HOST") {
        config.store.sharepoint.host = Some(v);
    }
    if let Some(v) = get("SHAREPOINT_COLLECTION_NAME") {
        config.index.collection = Some(v);
    }
    if let Some(v) = get("ASTRA_DB_API_ENDPOINT") {
        config.index.endpoint = Some(v);
    }
    if let Some(v) = get("ASTRA_DB_KEYSPACE") {
        config.index.keyspace = Some(v);
    }
    if let Some(v) = get("BLOB_CONTAINER_NAME") {
        config.staging.container = Some(v);
    }
    if let Some(v) = get("KEY_VAULT_URL") {
        config.secrets.key_vault_url = Some(v);
    }
    Ok(())
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.chunking.chunk_size == 0 {
        return Err(ConfigError::invalid("chunking.chunk_size", "must be > 0"));
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        return Err(ConfigError::invalid(
            "chunking.chunk_overlap",
            "must be smaller than chunking.chunk_size",
        ));
    }
    if config.sync.workers == 0 {
        return Err(ConfigError::invalid("sync.workers", "must be >= 1"));
    }
    if config.sync.file_timeout_secs == 0 {
        return Err(ConfigError::invalid("sync.file_timeout_secs", "must be > 0"));
    }
    if config.sync.lock_ttl_secs < MIN_LOCK_TTL_SECS {
        return Err(ConfigError::invalid(
            "sync.lock_ttl_secs",
            format!("must be >= {}", MIN_LOCK_TTL_SECS),
        ));
    }
    if config.embedding.batch_size == 0 {
        return Err(ConfigError::invalid("embedding.batch_size", "must be >= 1"));
    }
    if config.index.batch_size == 0 {
        return Err(ConfigError::invalid("index.batch_size", "must be >= 1"));
    }

    match config.store.kind.as_str() {
        "sharepoint" => {
            require(&config.store.sharepoint.site_name, "SHAREPOINT_SITE_NAME")?;
            require(&config.store.sharepoint.host, "SHAREPOINT_HOST")?;
        }
        "filesystem" => {
            if config.store.filesystem.is_none() {
                return Err(ConfigError::Missing("store.filesystem.root".to_string()));
            }
        }
        other => {
            return Err(ConfigError::invalid(
                "store.kind",
                format!("unknown store '{}'; expected sharepoint or filesystem", other),
            ))
        }
    }

    match config.index.kind.as_str() {
        "astra" => {
            require(&config.index.collection, "SHAREPOINT_COLLECTION_NAME")?;
            let endpoint = require(&config.index.endpoint, "ASTRA_DB_API_ENDPOINT")?;
            require(&config.index.keyspace, "ASTRA_DB_KEYSPACE")?;
            if config.secure && !endpoint.starts_with("https://") {
                return Err(ConfigError::invalid(
                    "ASTRA_DB_API_ENDPOINT",
                    "secure mode requires an https:// endpoint",
                ));
            }
        }
        "local" => {}
        other => {
            return Err(ConfigError::invalid(
                "index.kind",
                format!("unknown index '{}'; expected astra or local", other),
            ))
        }
    }

    match config.embedding.provider.as_str() {
        "bedrock" | "openai" | "hashed" => {}
        other => {
            return Err(ConfigError::invalid(
                "embedding.provider",
                format!("unknown provider '{}'; expected bedrock, openai, or hashed", other),
            ))
        }
    }
    if config.embedding.provider == "hashed" && config.embedding.dims == Some(0) {
        return Err(ConfigError::invalid("embedding.dims", "must be > 0"));
    }

    if config.secure {
        require(&config.staging.container, "BLOB_CONTAINER_NAME")?;
        let vault = require(&config.secrets.key_vault_url, "KEY_VAULT_URL")?;
        if !vault.starts_with("https://") {
            return Err(ConfigError::invalid(
                "KEY_VAULT_URL",
                "must be an https:// URL",
            ));
        }
    }

    Ok(())
}
