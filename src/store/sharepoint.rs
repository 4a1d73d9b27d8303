//! SharePoint Online store via Microsoft Graph.
//!
//! Two tokens are used, both cached until shortly before expiry:
//!
//! - an app-only token (client credentials) for drive, item and content calls;
//! - a delegated token (resource-owner password flow with the service
//!   account) for resolving the site id. Without a service account the
//!   app-only token is used for that too.
//!
//! Listing walks every selected drive folder by folder with an explicit
//! stack, following `@odata.nextLink` pages, and keeps files whose extension
//! is on the allowlist. The item `cTag` changes only when content changes and
//! serves as the content hash.

use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use super::DocumentStore;
use crate::config::{require, SharePointConfig};
use crate::extract::content_type_for;
use crate::http::{send_with_retry, status_of};
use crate::models::DocumentRecord;
use crate::secrets::{SecretKey, Secrets};

const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";
const MAX_RETRIES: u32 = 3;
/// Refresh tokens this long before they expire.
const TOKEN_SKEW: Duration = Duration::from_secs(60);

struct CachedToken {
    value: String,
    expires_at: Instant,
}

struct ServiceAccount {
    username: String,
    password: String,
}

pub struct SharePointStore {
    client: reqwest::Client,
    config: SharePointConfig,
    host: String,
    site_name: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
    service_account: Option<ServiceAccount>,
    app_token: Mutex<Option<CachedToken>>,
    user_token: Mutex<Option<CachedToken>>,
    site_id: Mutex<Option<String>>,
}

/// A document library selected for listing.
#[derive(Debug, Clone)]
struct Drive {
    id: String,
    name: String,
}

impl SharePointStore {
    pub fn new(config: &SharePointConfig, secrets: &Secrets) -> Result<Self> {
        let service_account = match (
            secrets.optional(SecretKey::SharePointServiceAccountName),
            secrets.optional(SecretKey::SharePointServiceAccountPassword),
        ) {
            (Some(u), Some(p)) => Some(ServiceAccount {
                username: u.to_string(),
                password: p.to_string(),
            }),
            _ => None,
        };

        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()?,
            host: require(&config.host, "SHAREPOINT_HOST")?.to_string(),
            site_name: require(&config.site_name, "SHAREPOINT_SITE_NAME")?.to_string(),
            tenant_id: secrets.get(SecretKey::SharePointTenantId)?.to_string(),
            client_id: secrets.get(SecretKey::SharePointClientId)?.to_string(),
            client_secret: secrets.get(SecretKey::SharePointClientSecret)?.to_string(),
            config: config.clone(),
            service_account,
            app_token: Mutex::new(None),
            user_token: Mutex::new(None),
            site_id: Mutex::new(None),
        })
    }

    fn graph(&self, path: &str) -> String {
        format!("{}{}", self.config.graph_url.trim_end_matches('/'), path)
    }

    async fn app_token(&self) -> Result<String> {
        let form = vec![
            ("grant_type", "client_credentials".to_string()),
            ("client_id", self.client_id.clone()),
            ("client_secret", self.client_secret.clone()),
            ("scope", GRAPH_SCOPE.to_string()),
        ];
        self.cached_token(&self.app_token, form).await
    }

    async fn site_lookup_token(&self) -> Result<String> {
        let Some(account) = &self.service_account else {
            return self.app_token().await;
        };
        let form = vec![
            ("grant_type", "password".to_string()),
            ("client_id", self.client_id.clone()),
            ("client_secret", self.client_secret.clone()),
            ("scope", GRAPH_SCOPE.to_string()),
            ("username", account.username.clone()),
            ("password", account.password.clone()),
        ];
        self.cached_token(&self.user_token, form).await
    }

    async fn cached_token(
        &self,
        slot: &Mutex<Option<CachedToken>>,
        form: Vec<(&'static str, String)>,
    ) -> Result<String> {
        let mut guard = slot.lock().await;
        if let Some(token) = guard.as_ref() {
            if Instant::now() + TOKEN_SKEW < token.expires_at {
                return Ok(token.value.clone());
            }
            tracing::info!("access token expired, fetching a new one");
        }

        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.config.login_url.trim_end_matches('/'),
            self.tenant_id
        );
        let response = send_with_retry("Graph token", MAX_RETRIES, || {
            Ok(self.client.post(&url).form(&form))
        })
        .await?;
        let json: Value = response.json().await?;

        let value = json
            .get("access_token")
            .and_then(|v| v.as_str())
            .context("token response missing access_token")?
            .to_string();
        let expires_in = json.get("expires_in").and_then(|v| v.as_u64()).unwrap_or(3600);

        *guard = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + Duration::from_secs(expires_in),
        });
        Ok(value)
    }

    async fn get_json(&self, url: &str, token: &str) -> Result<Value> {
        let response = send_with_retry("Graph request", MAX_RETRIES, || {
            Ok(self.client.get(url).bearer_auth(token))
        })
        .await?;
        Ok(response.json().await?)
    }

    async fn site_id(&self) -> Result<String> {
        let mut cached = self.site_id.lock().await;
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }
        let token = self.site_lookup_token().await?;
        let url = self.graph(&format!(
            "/sites/{}:/sites/{}?$select=id",
            self.host, self.site_name
        ));
        let json = self
            .get_json(&url, &token)
            .await
            .with_context(|| format!("failed to resolve site '{}'", self.site_name))?;
        let id = json
            .get("id")
            .and_then(|v| v.as_str())
            .context("site response missing id")?
            .to_string();
        *cached = Some(id.clone());
        Ok(id)
    }

    async fn drives(&self, site_id: &str) -> Result<Vec<Drive>> {
        let mut all = Vec::new();
        let mut url = Some(self.graph(&format!("/sites/{}/drives", site_id)));
        while let Some(page_url) = url {
            let token = self.app_token().await?;
            let page = self.get_json(&page_url, &token).await?;
            for drive in page_values(&page)? {
                let id = str_field(drive, "id")?;
                let name = str_field(drive, "name")?;
                all.push(Drive { id, name });
            }
            url = next_link(&page);
        }
        Ok(select_drives(
            all,
            &self.config.drives,
            self.config.max_drives,
        ))
    }

    async fn list_drive(&self, site_id: &str, drive: &Drive) -> Result<Vec<DocumentRecord>> {
        let mut records = Vec::new();
        // (folder item id, folder path); None = drive root.
        let mut folders: Vec<(Option<String>, String)> = vec![(None, String::new())];

        while let Some((folder_id, folder_path)) = folders.pop() {
            let mut url = Some(match &folder_id {
                Some(id) => self.graph(&format!(
                    "/sites/{}/drives/{}/items/{}/children",
                    site_id, drive.id, id
                )),
                None => self.graph(&format!("/sites/{}/drives/{}/root/children", site_id, drive.id)),
            });

            while let Some(page_url) = url {
                let token = self.app_token().await?;
                let page = self.get_json(&page_url, &token).await.with_context(|| {
                    format!("failed to list '{}{}'", drive.name, display_path(&folder_path))
                })?;

                for item in page_values(&page)? {
                    let name = str_field(item, "name")?;
                    let path = format!("{}/{}", folder_path, name);
                    if item.get("folder").is_some() {
                        folders.push((Some(str_field(item, "id")?), path));
                        continue;
                    }
                    if item.get("file").is_none() {
                        continue;
                    }
                    if !extension_allowed(&name, &self.config.extensions) {
                        tracing::debug!(path = %path, "skipping file with unlisted extension");
                        continue;
                    }
                    records.push(item_to_record(item, site_id, drive, &path)?);
                }
                url = next_link(&page);
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl DocumentStore for SharePointStore {
    fn label(&self) -> String {
        format!("sharepoint:{}", self.site_name)
    }

    async fn list(&self) -> Result<Vec<DocumentRecord>> {
        let site_id = self.site_id().await?;
        let drives = self.drives(&site_id).await?;
        tracing::info!(
            site = %self.site_name,
            drives = drives.len(),
            "listing SharePoint drives"
        );

        let mut records = Vec::new();
        for drive in &drives {
            let found = self.list_drive(&site_id, drive).await?;
            tracing::debug!(drive = %drive.name, files = found.len(), "listed drive");
            records.extend(found);
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn download(&self, record: &DocumentRecord) -> Result<Vec<u8>> {
        let site_id = meta_str(record, "site_id")?;
        let drive_id = meta_str(record, "drive_id")?;
        let url = self.graph(&format!(
            "/sites/{}/drives/{}/items/{}/content",
            site_id, drive_id, record.id
        ));
        let token = self.app_token().await?;

        let response = send_with_retry("Graph download", MAX_RETRIES, || {
            Ok(self.client.get(&url).bearer_auth(&token))
        })
        .await
        .map_err(|e| download_error(e, &record.path))?;
        Ok(response.bytes().await?.to_vec())
    }
}

fn page_values(page: &Value) -> Result<&Vec<Value>> {
    page.get("value")
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow!("Graph response missing 'value' array"))
}

fn next_link(page: &Value) -> Option<String> {
    page.get("@odata.nextLink")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn str_field(item: &Value, field: &str) -> Result<String> {
    item.get(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Graph item missing '{}'", field))
}

fn meta_str<'a>(record: &'a DocumentRecord, key: &str) -> Result<&'a str> {
    record
        .metadata
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("record {} has no {} in metadata", record.id, key))
}

fn display_path(path: &str) -> &str {
    if path.is_empty() {
        "/"
    } else {
        path
    }
}

/// 403 is reported as access denied; other errors pass through.
fn download_error(err: anyhow::Error, path: &str) -> anyhow::Error {
    if status_of(&err) == Some(reqwest::StatusCode::FORBIDDEN) {
        anyhow!("access denied to '{}'", path)
    } else {
        err
    }
}

/// Apply the drive allowlist (case-insensitive; empty = all), then keep at
/// most `max` of the remaining drives in Graph order, then order by name.
fn select_drives(mut drives: Vec<Drive>, allow: &[String], max: Option<usize>) -> Vec<Drive> {
    if !allow.is_empty() {
        drives.retain(|d| allow.iter().any(|a| a.eq_ignore_ascii_case(&d.name)));
    }
    if let Some(max) = max.filter(|m| *m > 0) {
        drives.truncate(max);
    }
    drives.sort_by(|a, b| a.name.cmp(&b.name));
    drives
}

fn extension_allowed(name: &str, allow: &[String]) -> bool {
    let Some((_, ext)) = name.rsplit_once('.') else {
        return false;
    };
    allow
        .iter()
        .any(|a| a.trim_start_matches('.').eq_ignore_ascii_case(ext))
}

fn item_to_record(item: &Value, site_id: &str, drive: &Drive, path: &str) -> Result<DocumentRecord> {
    let name = str_field(item, "name")?;
    let modified_at = item
        .get("lastModifiedDateTime")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    let content_hash = item
        .get("cTag")
        .and_then(|v| v.as_str())
        .or_else(|| item.pointer("/file/hashes/quickXorHash").and_then(|v| v.as_str()))
        .map(str::to_string);

    Ok(DocumentRecord {
        id: str_field(item, "id")?,
        content_type: content_type_for(&name),
        name,
        path: path.to_string(),
        modified_at,
        content_hash,
        metadata: serde_json::json!({
            "site_id": site_id,
            "drive_id": drive.id,
            "drive_name": drive.name,
            "web_url": item.get("webUrl").cloned().unwrap_or(Value::Null),
        }),
    })
}
