//! Resilient multi-source download engine.
//!
//! A download is described by an ordered chain of [`DownloadStrategy`] values (plain URL,
//! SAS-authenticated blob, managed-identity-authenticated blob). [`Downloader::fetch`] walks
//! the chain with bounded, classification-driven retries and returns the first successful
//! response; callers stream the body with [`save_response_to_file`].

pub mod error;
pub mod managed_identity;
pub mod redact;
pub mod retry;
pub mod save;
pub mod strategy;

pub use error::{DownloadError, StatusClass};
pub use managed_identity::{
    ImdsTokenProvider, ManagedIdentity, TokenProvider, IMDS_TOKEN_ENDPOINT, STORAGE_RESOURCE,
};
pub use redact::uri_for_logging;
pub use retry::{Downloader, RetryPolicy, Sleeper, TokioSleeper};
pub use save::{checked_file_name, file_name_from_uri, save_response_to_file};
pub use strategy::{
    append_sas_token, DownloadSource, DownloadStrategy, StrategyKind, STORAGE_API_VERSION,
};
