use thiserror::Error;

use crate::strategy::StrategyKind;

const MORE_INFO: &str = "For more information, see https://aka.ms/RunCommandManagedLinux";

pub const MSI_DOWNLOAD_404_MESSAGE: &str = "Failed to download the file because it was not found using the managed identity. Make sure the blob exists and that the identity has been given access to the blob's container with the 'Storage Blob Data Reader' role assignment.";
pub const MSI_DOWNLOAD_403_MESSAGE: &str = "Failed to download the file because the managed identity was denied access. Make sure the identity has been given access to the blob's container with the 'Storage Blob Data Reader' role assignment. In case of a user-assigned identity, make sure it is added under the VM's identities.";
const MSI_DOWNLOAD_GENERIC_MESSAGE: &str = "Use either a public script URI that points to .sh file, Azure storage blob SAS URI or storage blob accessible by a managed identity and retry.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How the download engine reacts to an HTTP status.
pub enum StatusClass {
    Success,
    /// Credentials or addressing are wrong for this strategy; try the next one.
    AccessIssue,
    /// Worth retrying the same strategy after a backoff.
    Transient,
    /// Anything else; give up on this strategy.
    Fatal,
}

impl StatusClass {
    pub fn of(status: u16) -> Self {
        match status {
            200..=299 => Self::Success,
            401 | 403 | 404 | 409 => Self::AccessIssue,
            408 | 429 | 500 | 502 | 503 | 504 => Self::Transient,
            _ => Self::Fatal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// One failed attempt, kept for the aggregate error.
pub struct AttemptFailure {
    pub strategy: StrategyKind,
    pub attempt: usize,
    pub status: Option<u16>,
    pub message: String,
}

#[derive(Debug, Error)]
/// Enumerates failures surfaced by the download engine.
pub enum DownloadError {
    #[error("failed to create http request: {0}")]
    BuildRequest(String),
    #[error("http request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("{message}")]
    Status {
        status: u16,
        strategy: StrategyKind,
        message: String,
    },
    #[error("{}", render_attempts(.attempts))]
    Exhausted { attempts: Vec<AttemptFailure> },
    #[error("no download strategies were provided")]
    NoStrategies,
}

impl DownloadError {
    pub(crate) fn transport(error: reqwest::Error) -> Self {
        Self::Transport(error.without_url())
    }

    /// HTTP status of the failure, or of the last attempt that got a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Exhausted { attempts } => attempts.iter().rev().find_map(|attempt| attempt.status),
            _ => None,
        }
    }
}

fn render_attempts(attempts: &[AttemptFailure]) -> String {
    attempts
        .iter()
        .enumerate()
        .map(|(index, failure)| {
            format!(
                "Attempt {} ({} try {}): {}",
                index + 1,
                failure.strategy,
                failure.attempt + 1,
                failure.message
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Builds the remediation message for a non-success response.
pub fn status_error_message(strategy: StrategyKind, uri_for_log: &str, status: u16) -> String {
    let status_text = match reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
    {
        Some(reason) => format!("{status} {reason}"),
        None => status.to_string(),
    };

    if strategy == StrategyKind::ManagedIdentity {
        let detail = match status {
            404 => MSI_DOWNLOAD_404_MESSAGE,
            403 => MSI_DOWNLOAD_403_MESSAGE,
            _ => MSI_DOWNLOAD_GENERIC_MESSAGE,
        };
        return format!(
            "Failed to download '{uri_for_log}' using managed identity ({status_text}). {detail} {MORE_INFO}"
        );
    }

    let reason = match status {
        400 => "because parts of the request were incorrectly formatted, missing, and/or invalid".to_string(),
        401 => "because access was denied".to_string(),
        403 | 408 | 429 => {
            "Please verify the machine has network connectivity and that the storage account accepts requests from it".to_string()
        }
        404 => "because it does not exist".to_string(),
        409 => "because of a conflicting storage operation".to_string(),
        500..=599 => "due to an issue with storage".to_string(),
        _ => "with an unexpected response status".to_string(),
    };
    let credential_hint = match (strategy, status) {
        (StrategyKind::SasToken, 401 | 403) => {
            " Make sure the SAS token is valid, not expired, and grants read permission."
        }
        _ => "",
    };
    format!("Failed to download '{uri_for_log}' ({status_text}) {reason}.{credential_hint}")
}
