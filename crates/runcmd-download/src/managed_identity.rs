use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Instance metadata service endpoint that issues managed-identity tokens.
pub const IMDS_TOKEN_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
/// Token audience for Azure storage data-plane requests.
pub const STORAGE_RESOURCE: &str = "https://storage.azure.com/";
const IMDS_API_VERSION: &str = "2018-02-01";
const IMDS_TIMEOUT_MS: u64 = 30_000;

/// Identifies which managed identity should authenticate a storage request. Both ids empty
/// selects the VM's system-assigned identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
}

impl ManagedIdentity {
    pub fn system_assigned() -> Self {
        Self::default()
    }

    pub fn is_system_assigned(&self) -> bool {
        non_empty(self.client_id.as_deref()).is_none()
            && non_empty(self.object_id.as_deref()).is_none()
    }

    fn query_pairs(&self) -> Vec<(&'static str, String)> {
        if let Some(client_id) = non_empty(self.client_id.as_deref()) {
            return vec![("client_id", client_id.to_string())];
        }
        if let Some(object_id) = non_empty(self.object_id.as_deref()) {
            return vec![("object_id", object_id.to_string())];
        }
        Vec::new()
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

#[async_trait]
/// Produces bearer tokens for a managed identity.
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self, identity: &ManagedIdentity, resource: &str) -> Result<String>;
}

/// [`TokenProvider`] backed by the instance metadata service.
#[derive(Debug, Clone)]
pub struct ImdsTokenProvider {
    http: reqwest::Client,
    endpoint: String,
}

impl ImdsTokenProvider {
    pub fn new() -> Result<Self> {
        Self::with_endpoint(IMDS_TOKEN_ENDPOINT)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Result<Self> {
        // IMDS must never be reached through a proxy.
        let http = reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_millis(IMDS_TIMEOUT_MS))
            .build()
            .context("failed to create instance metadata client")?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ImdsTokenResponse {
    access_token: String,
}

#[async_trait]
impl TokenProvider for ImdsTokenProvider {
    async fn access_token(&self, identity: &ManagedIdentity, resource: &str) -> Result<String> {
        let mut query = vec![
            ("api-version", IMDS_API_VERSION.to_string()),
            ("resource", resource.to_string()),
        ];
        query.extend(identity.query_pairs());

        let response = self
            .http
            .get(&self.endpoint)
            .header("Metadata", "true")
            .query(&query)
            .send()
            .await
            .context("managed identity token request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!(
                "managed identity token request returned {}: {}",
                status.as_u16(),
                body.trim()
            );
        }
        let token = response
            .json::<ImdsTokenResponse>()
            .await
            .context("failed to decode managed identity token response")?;
        if token.access_token.trim().is_empty() {
            bail!("managed identity token response contained an empty access token");
        }
        Ok(token.access_token)
    }
}
