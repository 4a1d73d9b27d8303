//! Credential resolution.
//!
//! Outside secure mode every credential is read from the process environment.
//! In secure mode they are fetched from Azure Key Vault instead, authenticating
//! with a service principal (`AZURE_TENANT_ID` / `AZURE_CLIENT_ID` /
//! `AZURE_CLIENT_SECRET`) when one is configured and with the host's managed
//! identity otherwise.
//!
//! Only the credentials the configured components need are resolved; a
//! missing one fails startup with [`ConfigError::Secret`] or
//! [`ConfigError::Missing`].

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::config::Config;
use crate::error::ConfigError;

const KEY_VAULT_API_VERSION: &str = "7.4";
const KEY_VAULT_SCOPE: &str = "https://vault.azure.net/.default";
const KEY_VAULT_RESOURCE: &str = "https://vault.azure.net";
const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecretKey {
    SharePointTenantId,
    SharePointClientId,
    SharePointClientSecret,
    SharePointServiceAccountName,
    SharePointServiceAccountPassword,
    AstraDbToken,
    AwsAccessKeyId,
    AwsSecretAccessKey,
    AwsSessionToken,
    OpenAiApiKey,
    BlobConnectionString,
}

impl SecretKey {
    /// Environment variable consulted outside secure mode.
    pub fn env_name(self) -> &'static str {
        match self {
            SecretKey::SharePointTenantId => "SHAREPOINT_TENANT_ID",
            SecretKey::SharePointClientId => "SHAREPOINT_CLIENT_ID",
            SecretKey::SharePointClientSecret => "SHAREPOINT_CLIENT_SECRET",
            SecretKey::SharePointServiceAccountName => "SHAREPOINT_SERVICE_ACCOUNT_NAME",
            SecretKey::SharePointServiceAccountPassword => "SHAREPOINT_SERVICE_ACCOUNT_PASSWORD",
            SecretKey::AstraDbToken => "ASTRA_DB_APPLICATION_TOKEN",
            SecretKey::AwsAccessKeyId => "AWS_ACCESS_KEY_ID",
            SecretKey::AwsSecretAccessKey => "AWS_SECRET_ACCESS_KEY",
            SecretKey::AwsSessionToken => "AWS_SESSION_TOKEN",
            SecretKey::OpenAiApiKey => "OPENAI_API_KEY",
            SecretKey::BlobConnectionString => "BLOB_CONNECTION_STRING",
        }
    }

    /// Secret name in Key Vault (secure mode).
    pub fn vault_name(self) -> &'static str {
        match self {
            SecretKey::SharePointTenantId => "sharepoint-tenant-id",
            SecretKey::SharePointClientId => "sharepoint-client-id",
            SecretKey::SharePointClientSecret => "sharepoint-client-secret",
            SecretKey::SharePointServiceAccountName => "sharepoint-service-account-name",
            SecretKey::SharePointServiceAccountPassword => "sharepoint-service-account-password",
            SecretKey::AstraDbToken => "astra-db-application-token",
            SecretKey::AwsAccessKeyId => "aws-access-key-id",
            SecretKey::AwsSecretAccessKey => "aws-secret-access-key",
            SecretKey::AwsSessionToken => "aws-session-token",
            SecretKey::OpenAiApiKey => "openai-api-key",
            SecretKey::BlobConnectionString => "blob-connection-string",
        }
    }
}

/// Resolved credentials. Values never appear in `Debug` output.
#[derive(Clone, Default)]
pub struct Secrets {
    values: HashMap<SecretKey, String>,
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&str> = self.values.keys().map(|k| k.env_name()).collect();
        keys.sort_unstable();
        f.debug_struct("Secrets").field("keys", &keys).finish()
    }
}

impl Secrets {
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (SecretKey, String)>,
    {
        Self {
            values: pairs.into_iter().collect(),
        }
    }

    pub fn get(&self, key: SecretKey) -> Result<&str> {
        self.optional(key)
            .ok_or_else(|| anyhow!("credential {} was not resolved", key.env_name()))
    }

    pub fn optional(&self, key: SecretKey) -> Option<&str> {
        self.values.get(&key).map(String::as_str)
    }
}

/// Credentials the configured components need, as `(key, required)` pairs.
pub fn required_secrets(config: &Config) -> Vec<(SecretKey, bool)> {
    let mut keys = Vec::new();
    if config.store.kind == "sharepoint" {
        keys.extend([
            (SecretKey::SharePointTenantId, true),
            (SecretKey::SharePointClientId, true),
            (SecretKey::SharePointClientSecret, true),
            (SecretKey::SharePointServiceAccountName, false),
            (SecretKey::SharePointServiceAccountPassword, false),
        ]);
    }
    if config.index.kind == "astra" {
        keys.push((SecretKey::AstraDbToken, true));
    }
    match config.embedding.provider.as_str() {
        "bedrock" => keys.extend([
            (SecretKey::AwsAccessKeyId, true),
            (SecretKey::AwsSecretAccessKey, true),
            (SecretKey::AwsSessionToken, false),
        ]),
        "openai" => keys.push((SecretKey::OpenAiApiKey, true)),
        _ => {}
    }
    if config.secure {
        keys.push((SecretKey::BlobConnectionString, true));
    }
    keys
}

/// Resolve every credential the configuration needs.
pub async fn resolve(config: &Config) -> Result<Secrets, ConfigError> {
    if !config.secure {
        return resolve_with_env(config, |key| std::env::var(key).ok());
    }

    let vault_url = crate::config::require(&config.secrets.key_vault_url, "KEY_VAULT_URL")?;
    let vault = KeyVaultClient::connect(vault_url, &config.store.sharepoint.login_url)
        .await
        .map_err(|e| ConfigError::Secret {
            name: "KEY_VAULT_URL".to_string(),
            reason: format!("{:#}", e),
        })?;

    let mut values = HashMap::new();
    for (key, required) in required_secrets(config) {
        match vault.get_secret(key.vault_name()).await {
            Ok(Some(value)) => {
                values.insert(key, value);
            }
            Ok(None) if !required => {}
            Ok(None) => {
                return Err(ConfigError::Secret {
                    name: key.vault_name().to_string(),
                    reason: "not found in Key Vault".to_string(),
                })
            }
            Err(e) => {
                return Err(ConfigError::Secret {
                    name: key.vault_name().to_string(),
                    reason: format!("{:#}", e),
                })
            }
        }
    }
    tracing::info!(count = values.len(), "resolved credentials from Key Vault");
    Ok(Secrets { values })
}

/// Resolve credentials from an explicit environment lookup.
pub fn resolve_with_env<F>(config: &Config, env: F) -> Result<Secrets, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut values = HashMap::new();
    for (key, required) in required_secrets(config) {
        match env(key.env_name()).filter(|v| !v.trim().is_empty()) {
            Some(value) => {
                values.insert(key, value);
            }
            None if required => return Err(ConfigError::Missing(key.env_name().to_string())),
            None => {}
        }
    }
    Ok(Secrets { values })
}

/// Minimal Key Vault secrets reader.
struct KeyVaultClient {
    client: reqwest::Client,
    vault_url: String,
    token: String,
}

impl KeyVaultClient {
    async fn connect(vault_url: &str, login_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let token = vault_token(&client, login_url).await?;
        Ok(Self {
            client,
            vault_url: vault_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// `Ok(None)` when the secret does not exist.
    async fn get_secret(&self, name: &str) -> Result<Option<String>> {
        let url = format!(
            "{}/secrets/{}?api-version={}",
            self.vault_url, name, KEY_VAULT_API_VERSION
        );
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("Key Vault request for {} failed", name))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Key Vault returned HTTP {}: {}", status, body);
        }

        let json: serde_json::Value = response.json().await?;
        json.get("value")
            .and_then(|v| v.as_str())
            .map(|v| Some(v.to_string()))
            .context("Key Vault response missing 'value'")
    }
}

async fn vault_token(client: &reqwest::Client, login_url: &str) -> Result<String> {
    let env = |k: &str| std::env::var(k).ok().filter(|v| !v.is_empty());

    let json: serde_json::Value =
        if let (Some(tenant), Some(client_id), Some(secret)) = (
            env("AZURE_TENANT_ID"),
            env("AZURE_CLIENT_ID"),
            env("AZURE_CLIENT_SECRET"),
        ) {
            tracing::debug!("authenticating to Key Vault with a service principal");
            let url = format!("{}/{}/oauth2/v2.0/token", login_url.trim_end_matches('/'), tenant);
            client
                .post(&url)
                .form(&[
                    ("grant_type", "client_credentials"),
                    ("client_id", client_id.as_str()),
                    ("client_secret", secret.as_str()),
                    ("scope", KEY_VAULT_SCOPE),
                ])
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?
        } else if let (Some(endpoint), Some(header)) =
            (env("IDENTITY_ENDPOINT"), env("IDENTITY_HEADER"))
        {
            tracing::debug!("authenticating to Key Vault with the hosting identity endpoint");
            client
                .get(&endpoint)
                .query(&[("api-version", "2019-08-01"), ("resource", KEY_VAULT_RESOURCE)])
                .header("X-IDENTITY-HEADER", header)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?
        } else {
            tracing::debug!("authenticating to Key Vault with the instance metadata service");
            client
                .get(IMDS_ENDPOINT)
                .query(&[("api-version", "2018-02-01"), ("resource", KEY_VAULT_RESOURCE)])
                .header("Metadata", "true")
                .send()
                .await
                .context("managed identity endpoint unreachable")?
                .error_for_status()?
                .json()
                .await?
        };

    json.get("access_token")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .context("token response missing access_token")
}
