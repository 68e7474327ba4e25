use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::info;
use url::Url;

/// Address of the host agent plugin when no explicit endpoint is configured.
pub const WIRE_SERVER_FALLBACK_ADDRESS: &str = "http://168.63.129.16:32526";
const STATUS_PATH: &str = "status";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
/// Submits serialized status documents to the host status service. Failures are returned to
/// the caller; nothing is retried here.
pub struct RemoteStatusClient {
    http: reqwest::Client,
    endpoint: Url,
}

impl RemoteStatusClient {
    pub fn new(base_address: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .no_proxy()
            .build()
            .context("failed to create status http client")?;
        Self::with_client(http, base_address)
    }

    pub fn with_client(http: reqwest::Client, base_address: &str) -> Result<Self> {
        let mut endpoint = Url::parse(base_address)
            .with_context(|| format!("invalid status endpoint '{base_address}'"))?;
        endpoint.set_path(STATUS_PATH);
        Ok(Self { http, endpoint })
    }

    pub fn fallback() -> Result<Self> {
        Self::new(WIRE_SERVER_FALLBACK_ADDRESS)
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub async fn submit(&self, body: &str) -> Result<()> {
        let response = self
            .http
            .post(self.endpoint.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await
            .with_context(|| format!("failed to report status to {}", self.endpoint))?;
        let status = response.status();
        if !status.is_success() {
            bail!(
                "status endpoint {} rejected the report with status {}",
                self.endpoint,
                status.as_u16()
            );
        }
        info!(endpoint = %self.endpoint, status = status.as_u16(), "status uploaded");
        Ok(())
    }
}
