//! Status and output reporting for lifecycle commands.
//!
//! A [`StatusDocument`] is persisted atomically to the local status folder and submitted to the
//! host status endpoint through a [`StatusReporter`]. While a script runs, an
//! [`OutputStreamer`] appends newly captured output to remote append blobs and republishes the
//! status with fresh output tails on a fixed interval.

pub mod append_blob;
pub mod document;
pub mod local;
pub mod remote;
pub mod reporter;
pub mod streamer;

pub use append_blob::{AppendBlobSink, AppendProgress, SinkAuth, SinkDescriptor};
pub use document::{ExecutionState, ExecutionWindow, InstanceView, StatusDocument, StatusKind};
pub use local::{report_local, status_file_name};
pub use remote::{RemoteStatusClient, WIRE_SERVER_FALLBACK_ADDRESS};
pub use reporter::{LocalStatusTarget, PublishSummary, StatusReporter};
pub use streamer::{
    spawn_periodic_streamer, OutputStream, OutputStreamer, OutputStreamerHandle,
    DEFAULT_REPORT_INTERVAL, STATUS_TAIL_BYTES,
};
