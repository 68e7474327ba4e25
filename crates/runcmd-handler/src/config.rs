use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use runcmd_download::{Downloader, ImdsTokenProvider, TokenProvider};
use runcmd_status::DEFAULT_REPORT_INTERVAL;

use crate::hooks::{default_cleanup, default_report_status, CleanupHook, ReportStatusHook};
use crate::settings::{JsonFileSettingsProvider, SettingsProvider};

pub const DEFAULT_DATA_DIR: &str = "/var/lib/waagent/run-command-handler";
/// Name reported in every status document.
pub const HANDLER_NAME: &str = "Microsoft.CPlat.Core.RunCommandHandlerLinux";
const DOWNLOAD_DIR_NAME: &str = "download";
const SEQUENCE_MARKER_SUFFIX: &str = "mrseq";
const PROCESS_MARKER_SUFFIX: &str = "pidstart";

/// Status and cleanup hooks shared by every registry entry.
#[derive(Clone, Copy)]
pub struct HandlerHooks {
    pub report_status: ReportStatusHook,
    pub cleanup: CleanupHook,
}

impl Default for HandlerHooks {
    fn default() -> Self {
        Self {
            report_status: default_report_status,
            cleanup: default_cleanup,
        }
    }
}

#[derive(Clone)]
/// Process-wide configuration handed to the dispatcher at construction.
pub struct HandlerConfig {
    pub version: String,
    pub data_dir: PathBuf,
    pub hooks: HandlerHooks,
    /// Base address of the host status service; `None` disables remote status.
    pub status_endpoint: Option<String>,
    pub local_status: bool,
    pub report_interval: Duration,
    pub downloader: Downloader,
    pub blob_http: reqwest::Client,
    pub token_provider: Arc<dyn TokenProvider>,
    pub settings_provider: Arc<dyn SettingsProvider>,
}

impl HandlerConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let blob_http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("failed to create blob http client")?;
        Ok(Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            data_dir: data_dir.into(),
            hooks: HandlerHooks::default(),
            status_endpoint: None,
            local_status: true,
            report_interval: DEFAULT_REPORT_INTERVAL,
            downloader: Downloader::new()?,
            blob_http,
            token_provider: Arc::new(ImdsTokenProvider::new()?),
            settings_provider: Arc::new(JsonFileSettingsProvider),
        })
    }

    pub fn with_downloader(mut self, downloader: Downloader) -> Self {
        self.downloader = downloader;
        self
    }

    pub fn with_token_provider(mut self, token_provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = token_provider;
        self
    }

    pub fn with_settings_provider(mut self, settings_provider: Arc<dyn SettingsProvider>) -> Self {
        self.settings_provider = settings_provider;
        self
    }

    pub fn with_status_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.status_endpoint = endpoint;
        self
    }

    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    pub fn with_hooks(mut self, hooks: HandlerHooks) -> Self {
        self.hooks = hooks;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Identity and well-known paths of one invocation.
pub struct InvocationMetadata {
    pub ext_name: String,
    pub seq_num: u64,
    pub most_recent_sequence: PathBuf,
    pub pid_file_path: PathBuf,
    pub download_dir: String,
}

impl InvocationMetadata {
    pub fn new(ext_name: impl Into<String>, seq_num: u64, data_dir: &Path) -> Self {
        let ext_name = ext_name.into();
        let prefix = if ext_name.is_empty() {
            String::new()
        } else {
            format!("{ext_name}.")
        };
        let download_dir = if ext_name.is_empty() {
            DOWNLOAD_DIR_NAME.to_string()
        } else {
            format!("{DOWNLOAD_DIR_NAME}/{ext_name}")
        };
        Self {
            most_recent_sequence: data_dir.join(format!("{prefix}{SEQUENCE_MARKER_SUFFIX}")),
            pid_file_path: data_dir.join(format!("{prefix}{PROCESS_MARKER_SUFFIX}")),
            download_dir,
            ext_name,
            seq_num,
        }
    }

    /// `<data>/<download>/<seq>`: downloads, the materialized script and captured output.
    pub fn execution_dir(&self, data_dir: &Path) -> PathBuf {
        data_dir
            .join(&self.download_dir)
            .join(self.seq_num.to_string())
    }
}
