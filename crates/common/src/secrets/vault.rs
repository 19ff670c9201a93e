//! HashiCorp Vault provider (KV version 2 secrets engine).
//!
//! Each secret is stored at `<mount>/data/<prefix>/<name>` with a single
//! `value` field.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;
use zeroize::Zeroizing;

use super::provider::{ProviderError, ProviderKind, SecretProvider};

const TOKEN_HEADER: &str = "X-Vault-Token";
const VALUE_FIELD: &str = "value";

fn default_mount() -> String {
    "secret".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Vault server address, e.g. `http://127.0.0.1:8200`
    pub address: Url,
    /// KV v2 mount point
    #[serde(default = "default_mount")]
    pub mount: String,
    /// Path under the mount that holds this store's secrets
    #[serde(default)]
    pub prefix: String,
}

pub struct VaultProvider {
    config: VaultConfig,
    token: Zeroizing<String>,
    client: Client,
}

impl std::fmt::Debug for VaultProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultProvider")
            .field("config", &self.config)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Deserialize)]
struct ReadResponse {
    data: ReadData,
}

#[derive(Deserialize)]
struct ReadData {
    data: HashMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct ListResponse {
    data: ListData,
}

#[derive(Deserialize)]
struct ListData {
    keys: Vec<String>,
}

#[derive(Serialize)]
struct WriteRequest<'a> {
    data: HashMap<&'a str, &'a str>,
}

impl VaultProvider {
    pub fn new(config: VaultConfig, token: impl Into<String>) -> Result<Self, ProviderError> {
        let client = Client::builder().build()?;
        Ok(Self {
            config,
            token: Zeroizing::new(token.into()),
            client,
        })
    }

    fn endpoint(&self, area: &str, key: Option<&str>) -> Result<Url, ProviderError> {
        let mut url = self.config.address.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ProviderError::Malformed("vault address cannot be a base".into()))?;
            segments.pop_if_empty().push("v1");
            for part in self.config.mount.split('/').filter(|p| !p.is_empty()) {
                segments.push(part);
            }
            segments.push(area);
            for part in self.config.prefix.split('/').filter(|p| !p.is_empty()) {
                segments.push(part);
            }
            if let Some(key) = key {
                segments.push(key);
            }
        }
        Ok(url)
    }

    async fn check(response: Response) -> Result<Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(ProviderError::Status {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            })
        }
    }
}

#[async_trait]
impl SecretProvider for VaultProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Vault
    }

    async fn get_secret(&self, key: &str) -> Result<Option<String>, ProviderError> {
        let url = self.endpoint("data", Some(key))?;
        let response = self
            .client
            .get(url)
            .header(TOKEN_HEADER, self.token.as_str())
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let body: ReadResponse = Self::check(response).await?.json().await?;
        match body.data.data.get(VALUE_FIELD) {
            Some(serde_json::Value::String(value)) => Ok(Some(value.clone())),
            Some(_) => Err(ProviderError::Malformed(format!(
                "{} field of {} is not a string",
                VALUE_FIELD, key
            ))),
            None => Ok(None),
        }
    }

    async fn set_secret(&self, key: &str, value: &str) -> Result<(), ProviderError> {
        let url = self.endpoint("data", Some(key))?;
        let body = WriteRequest {
            data: [(VALUE_FIELD, value)].into_iter().collect(),
        };
        let response = self
            .client
            .post(url)
            .header(TOKEN_HEADER, self.token.as_str())
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;
        tracing::debug!(key, "secret written to vault");
        Ok(())
    }

    async fn delete_secret(&self, key: &str) -> Result<(), ProviderError> {
        // metadata delete removes every version, not just the latest
        let url = self.endpoint("metadata", Some(key))?;
        let response = self
            .client
            .delete(url)
            .header(TOKEN_HEADER, self.token.as_str())
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }

    async fn list_secrets(&self) -> Result<Vec<String>, ProviderError> {
        let mut url = self.endpoint("metadata", None)?;
        url.query_pairs_mut().append_pair("list", "true");
        let response = self
            .client
            .get(url)
            .header(TOKEN_HEADER, self.token.as_str())
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let body: ListResponse = Self::check(response).await?.json().await?;
        // sub-paths come back with a trailing slash; only leaf secrets count
        Ok(body
            .data
            .keys
            .into_iter()
            .filter(|k| !k.ends_with('/'))
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn provider(address: &str, mount: &str, prefix: &str) -> VaultProvider {
        VaultProvider::new(
            VaultConfig {
                address: Url::parse(address).unwrap(),
                mount: mount.to_string(),
                prefix: prefix.to_string(),
            },
            "token",
        )
        .unwrap()
    }

    #[test]
    fn test_endpoint_layout() {
        let vault = provider("http://127.0.0.1:8200", "secret", "berth/demo");
        let url = vault.endpoint("data", Some("DB_PASSWORD")).unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:8200/v1/secret/data/berth/demo/DB_PASSWORD"
        );
    }

    #[test]
    fn test_endpoint_escapes_key() {
        let vault = provider("http://vault.internal/", "kv", "");
        let url = vault.endpoint("metadata", Some("a/b c")).unwrap();
        assert_eq!(url.as_str(), "http://vault.internal/v1/kv/metadata/a%2Fb%20c");
    }

    #[test]
    fn test_debug_redacts_token() {
        let vault = provider("http://127.0.0.1:8200", "secret", "");
        assert!(!format!("{:?}", vault).contains("\"token\""));
        assert!(format!("{:?}", vault).contains("redacted"));
    }
}
