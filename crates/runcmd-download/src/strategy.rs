use std::fmt;
use std::sync::Arc;

use url::Url;

use crate::error::DownloadError;
use crate::managed_identity::{ManagedIdentity, TokenProvider, STORAGE_RESOURCE};
use crate::redact::uri_for_logging;

/// Storage REST version sent with bearer-token requests; older versions reject OAuth.
pub const STORAGE_API_VERSION: &str = "2020-10-02";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Enumerates the ways a download attempt can authenticate.
pub enum StrategyKind {
    PlainUrl,
    SasToken,
    ManagedIdentity,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PlainUrl => "plain_url",
            Self::SasToken => "sas_token",
            Self::ManagedIdentity => "managed_identity",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One way of fetching a resource. Each variant carries the credential state it needs to
/// build a single outbound request.
#[derive(Clone)]
pub enum DownloadStrategy {
    PlainUrl {
        url: String,
    },
    SasToken {
        url: String,
        sas_token: String,
    },
    ManagedIdentity {
        url: String,
        identity: ManagedIdentity,
        tokens: Arc<dyn TokenProvider>,
    },
}

impl fmt::Debug for DownloadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadStrategy")
            .field("kind", &self.kind())
            .field("url", &uri_for_logging(self.url()))
            .finish()
    }
}

impl DownloadStrategy {
    pub fn plain(url: impl Into<String>) -> Self {
        Self::PlainUrl { url: url.into() }
    }

    pub fn sas(url: impl Into<String>, sas_token: impl Into<String>) -> Self {
        Self::SasToken {
            url: url.into(),
            sas_token: sas_token.into(),
        }
    }

    pub fn managed_identity(
        url: impl Into<String>,
        identity: ManagedIdentity,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        Self::ManagedIdentity {
            url: url.into(),
            identity,
            tokens,
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::PlainUrl { .. } => StrategyKind::PlainUrl,
            Self::SasToken { .. } => StrategyKind::SasToken,
            Self::ManagedIdentity { .. } => StrategyKind::ManagedIdentity,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Self::PlainUrl { url } | Self::SasToken { url, .. } | Self::ManagedIdentity { url, .. } => {
                url
            }
        }
    }

    /// Builds the request for one attempt.
    pub async fn build_request(
        &self,
        http: &reqwest::Client,
    ) -> Result<reqwest::Request, DownloadError> {
        let builder = match self {
            Self::PlainUrl { url } => http.get(parse_url(url)?),
            Self::SasToken { url, sas_token } => http.get(append_sas_token(url, sas_token)?),
            Self::ManagedIdentity {
                url,
                identity,
                tokens,
            } => {
                let token = tokens
                    .access_token(identity, STORAGE_RESOURCE)
                    .await
                    .map_err(|error| DownloadError::BuildRequest(format!("{error:#}")))?;
                http.get(parse_url(url)?)
                    .bearer_auth(token)
                    .header("x-ms-version", STORAGE_API_VERSION)
            }
        };
        builder
            .build()
            .map_err(|error| DownloadError::BuildRequest(error.to_string()))
    }
}

fn parse_url(url: &str) -> Result<Url, DownloadError> {
    Url::parse(url).map_err(|error| {
        DownloadError::BuildRequest(format!("invalid uri '{}': {error}", uri_for_logging(url)))
    })
}

/// Joins a SAS token (with or without its leading `?`) onto `url`, preserving any query the
/// url already carries.
pub fn append_sas_token(url: &str, sas_token: &str) -> Result<Url, DownloadError> {
    let mut parsed = parse_url(url)?;
    let token = sas_token.trim().trim_start_matches('?');
    if token.is_empty() {
        return Ok(parsed);
    }
    let query = match parsed.query() {
        Some(existing) if !existing.is_empty() => format!("{existing}&{token}"),
        _ => token.to_string(),
    };
    parsed.set_query(Some(query.as_str()));
    Ok(parsed)
}

/// A remote file plus the credentials configured for it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadSource {
    pub uri: String,
    pub sas_token: Option<String>,
    pub managed_identity: Option<ManagedIdentity>,
}

impl DownloadSource {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Self::default()
        }
    }

    /// Builds the fallback chain for this source, most specific credential first.
    ///
    /// - SAS token configured: SAS, then the (possibly system-assigned) managed identity.
    /// - Managed identity configured: managed identity, then the plain URL.
    /// - Nothing configured: plain URL, then the system-assigned managed identity.
    pub fn strategies(&self, tokens: Arc<dyn TokenProvider>) -> Vec<DownloadStrategy> {
        let sas_token = self
            .sas_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty());
        match (sas_token, self.managed_identity.as_ref()) {
            (Some(token), identity) => vec![
                DownloadStrategy::sas(self.uri.as_str(), token),
                DownloadStrategy::managed_identity(
                    self.uri.as_str(),
                    identity.cloned().unwrap_or_default(),
                    tokens,
                ),
            ],
            (None, Some(identity)) => vec![
                DownloadStrategy::managed_identity(self.uri.as_str(), identity.clone(), tokens),
                DownloadStrategy::plain(self.uri.as_str()),
            ],
            (None, None) => vec![
                DownloadStrategy::plain(self.uri.as_str()),
                DownloadStrategy::managed_identity(
                    self.uri.as_str(),
                    ManagedIdentity::system_assigned(),
                    tokens,
                ),
            ],
        }
    }
}
