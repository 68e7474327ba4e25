use std::path::PathBuf;

use anyhow::Result;
use runcmd_core::utc_timestamp;
use tracing::{debug, warn};

use crate::document::StatusDocument;
use crate::local::report_local;
use crate::remote::RemoteStatusClient;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStatusTarget {
    pub status_folder: PathBuf,
    pub ext_name: String,
    pub seq_num: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Per-target result of one publish. `None` means the target succeeded or is not configured.
pub struct PublishSummary {
    pub local_error: Option<String>,
    pub remote_error: Option<String>,
}

impl PublishSummary {
    pub fn is_ok(&self) -> bool {
        self.local_error.is_none() && self.remote_error.is_none()
    }
}

#[derive(Debug, Clone, Default)]
/// Publishes a status document to the local status file and the remote endpoint. The targets
/// are independent: a failure of one is logged and does not prevent the other.
pub struct StatusReporter {
    local: Option<LocalStatusTarget>,
    remote: Option<RemoteStatusClient>,
}

impl StatusReporter {
    pub fn new(local: Option<LocalStatusTarget>, remote: Option<RemoteStatusClient>) -> Self {
        Self { local, remote }
    }

    pub fn local_target(&self) -> Option<&LocalStatusTarget> {
        self.local.as_ref()
    }

    pub fn serialize(document: &StatusDocument) -> Result<String> {
        document.to_json(&utc_timestamp())
    }

    pub async fn publish(&self, document: &StatusDocument) -> PublishSummary {
        let body = match Self::serialize(document) {
            Ok(body) => body,
            Err(error) => {
                let message = format!("{error:#}");
                warn!(error = %message, "failed to serialize status document");
                return PublishSummary {
                    local_error: self.local.as_ref().map(|_| message.clone()),
                    remote_error: self.remote.as_ref().map(|_| message),
                };
            }
        };

        let mut summary = PublishSummary::default();
        if let Some(target) = self.local.as_ref() {
            match report_local(&target.status_folder, &target.ext_name, target.seq_num, &body) {
                Ok(path) => debug!(path = %path.display(), kind = ?document.kind, "status written"),
                Err(error) => {
                    let message = format!("{error:#}");
                    warn!(error = %message, "local status report failed");
                    summary.local_error = Some(message);
                }
            }
        }
        if let Some(remote) = self.remote.as_ref() {
            if let Err(error) = remote.submit(&body).await {
                let message = format!("{error:#}");
                warn!(error = %message, "remote status report failed");
                summary.remote_error = Some(message);
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;

    use super::{LocalStatusTarget, StatusReporter};
    use crate::document::{StatusDocument, StatusKind};
    use crate::remote::RemoteStatusClient;

    #[tokio::test]
    async fn functional_publish_writes_local_file_and_remote_body() {
        let temp = tempfile::tempdir().expect("tempdir");
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/status").body_includes("\"Install\"");
            then.status(200);
        });
        let reporter = StatusReporter::new(
            Some(LocalStatusTarget {
                status_folder: temp.path().to_path_buf(),
                ext_name: String::new(),
                seq_num: 3,
            }),
            Some(RemoteStatusClient::new(&server.base_url()).expect("client")),
        );
        let summary = reporter
            .publish(&StatusDocument::new("RunCommand", "Install", StatusKind::Success, ""))
            .await;
        assert!(summary.is_ok(), "{summary:?}");
        mock.assert();
        let raw = std::fs::read_to_string(temp.path().join("3.status")).expect("status file");
        assert!(raw.contains("\"success\""));
    }

    #[tokio::test]
    async fn regression_remote_failure_does_not_block_local_report() {
        let temp = tempfile::tempdir().expect("tempdir");
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/status");
            then.status(500);
        });
        let reporter = StatusReporter::new(
            Some(LocalStatusTarget {
                status_folder: temp.path().to_path_buf(),
                ext_name: "ext".to_string(),
                seq_num: 1,
            }),
            Some(RemoteStatusClient::new(&server.base_url()).expect("client")),
        );
        let summary = reporter
            .publish(&StatusDocument::new("RunCommand", "Enable", StatusKind::Error, "x"))
            .await;
        assert!(summary.local_error.is_none());
        assert!(summary.remote_error.is_some());
        assert!(temp.path().join("ext.1.status").exists());
    }

    #[tokio::test]
    async fn regression_local_failure_does_not_block_remote_report() {
        let temp = tempfile::tempdir().expect("tempdir");
        let blocker = temp.path().join("not-a-dir");
        std::fs::write(&blocker, "file").expect("write");
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/status");
            then.status(200);
        });
        let reporter = StatusReporter::new(
            Some(LocalStatusTarget {
                status_folder: blocker,
                ext_name: String::new(),
                seq_num: 1,
            }),
            Some(RemoteStatusClient::new(&server.base_url()).expect("client")),
        );
        let summary = reporter
            .publish(&StatusDocument::new("RunCommand", "Enable", StatusKind::Success, ""))
            .await;
        assert!(summary.local_error.is_some());
        assert!(summary.remote_error.is_none());
        mock.assert();
    }
}
