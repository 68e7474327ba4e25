use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use reqwest::Method;
use runcmd_download::{
    append_sas_token, uri_for_logging, ManagedIdentity, TokenProvider, STORAGE_API_VERSION,
    STORAGE_RESOURCE,
};
use tracing::{info, warn};
use url::Url;

/// Largest body accepted by a single append-block call.
pub const MAX_APPEND_BLOCK_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// An output destination as configured in the settings.
pub struct SinkDescriptor {
    pub uri: String,
    pub sas_token: Option<String>,
    pub managed_identity: Option<ManagedIdentity>,
}

impl SinkDescriptor {
    fn sas_token(&self) -> Option<&str> {
        self.sas_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }
}

#[derive(Clone)]
pub enum SinkAuth {
    SasToken(String),
    ManagedIdentity {
        identity: ManagedIdentity,
        tokens: Arc<dyn TokenProvider>,
    },
}

impl SinkAuth {
    fn label(&self) -> &'static str {
        match self {
            Self::SasToken(_) => "sas_token",
            Self::ManagedIdentity { .. } => "managed_identity",
        }
    }
}

#[derive(Debug)]
/// Result of appending a buffer. `flushed` counts the bytes the service accepted before any
/// failure, so callers can advance their cursor by exactly that much.
pub struct AppendProgress {
    pub flushed: u64,
    pub error: Option<anyhow::Error>,
}

#[derive(Clone)]
/// A remote append blob that was created (or truncated) for this execution, bound to the
/// credential that succeeded at creation time.
pub struct AppendBlobSink {
    http: reqwest::Client,
    uri: String,
    auth: SinkAuth,
}

impl fmt::Debug for AppendBlobSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppendBlobSink")
            .field("uri", &uri_for_logging(&self.uri))
            .field("auth", &self.auth.label())
            .finish()
    }
}

impl AppendBlobSink {
    /// Creates or replaces the append blob. The SAS token is tried first; the managed identity
    /// (system-assigned when none is configured) is used when SAS is absent or rejected.
    pub async fn create_or_replace(
        http: &reqwest::Client,
        descriptor: &SinkDescriptor,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self> {
        let redacted = uri_for_logging(&descriptor.uri);
        let mut failures = Vec::new();
        if let Some(token) = descriptor.sas_token() {
            let sink = Self {
                http: http.clone(),
                uri: descriptor.uri.clone(),
                auth: SinkAuth::SasToken(token.to_string()),
            };
            match sink.put_blob().await {
                Ok(()) => {
                    info!(uri = %redacted, auth = "sas_token", "append blob created");
                    return Ok(sink);
                }
                Err(error) => {
                    warn!(uri = %redacted, error = %format!("{error:#}"), "append blob create with sas token failed");
                    failures.push(format!("sas token: {error:#}"));
                }
            }
        }

        let sink = Self {
            http: http.clone(),
            uri: descriptor.uri.clone(),
            auth: SinkAuth::ManagedIdentity {
                identity: descriptor.managed_identity.clone().unwrap_or_default(),
                tokens,
            },
        };
        match sink.put_blob().await {
            Ok(()) => {
                info!(uri = %redacted, auth = "managed_identity", "append blob created");
                Ok(sink)
            }
            Err(error) => {
                failures.push(format!("managed identity: {error:#}"));
                Err(anyhow!(
                    "failed to create append blob {redacted}: {}",
                    failures.join("; ")
                ))
            }
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    async fn request(&self, method: Method, append_block: bool) -> Result<reqwest::RequestBuilder> {
        let redacted = uri_for_logging(&self.uri);
        let mut url = match &self.auth {
            SinkAuth::SasToken(token) => append_sas_token(&self.uri, token)
                .map_err(|error| anyhow!("invalid sink uri {redacted}: {error}"))?,
            SinkAuth::ManagedIdentity { .. } => Url::parse(&self.uri)
                .map_err(|error| anyhow!("invalid sink uri {redacted}: {error}"))?,
        };
        if append_block {
            url.query_pairs_mut().append_pair("comp", "appendblock");
        }
        let mut builder = self
            .http
            .request(method, url)
            .header("x-ms-version", STORAGE_API_VERSION);
        if let SinkAuth::ManagedIdentity { identity, tokens } = &self.auth {
            let token = tokens
                .access_token(identity, STORAGE_RESOURCE)
                .await
                .context("failed to acquire managed identity token")?;
            builder = builder.bearer_auth(token);
        }
        Ok(builder)
    }

    async fn put_blob(&self) -> Result<()> {
        let response = self
            .request(Method::PUT, false)
            .await?
            .header("x-ms-blob-type", "AppendBlob")
            .header(reqwest::header::CONTENT_LENGTH, 0)
            .body(Vec::new())
            .send()
            .await
            .map_err(|error| anyhow!("http request failed: {}", error.without_url()))?;
        let status = response.status();
        if !status.is_success() {
            bail!("create append blob returned status {}", status.as_u16());
        }
        Ok(())
    }

    async fn append_block(&self, block: &[u8]) -> Result<()> {
        let response = self
            .request(Method::PUT, true)
            .await?
            .body(block.to_vec())
            .send()
            .await
            .map_err(|error| anyhow!("http request failed: {}", error.without_url()))?;
        let status = response.status();
        if !status.is_success() {
            bail!("append block returned status {}", status.as_u16());
        }
        Ok(())
    }

    /// Appends `bytes` in blocks of at most [`MAX_APPEND_BLOCK_BYTES`], stopping at the first
    /// failed block.
    pub async fn append(&self, bytes: &[u8]) -> AppendProgress {
        let mut flushed = 0_u64;
        for block in bytes.chunks(MAX_APPEND_BLOCK_BYTES) {
            if let Err(error) = self.append_block(block).await {
                return AppendProgress {
                    flushed,
                    error: Some(error.context(format!(
                        "failed to append to {}",
                        uri_for_logging(&self.uri)
                    ))),
                };
            }
            flushed += block.len() as u64;
        }
        AppendProgress {
            flushed,
            error: None,
        }
    }
}
