use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use runcmd_core::{read_from_offset, tail_file};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::append_blob::AppendBlobSink;
use crate::document::StatusDocument;
use crate::reporter::StatusReporter;

pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(30);
/// Bytes of each output stream carried in the status document.
pub const STATUS_TAIL_BYTES: u64 = 4 * 1024;

#[derive(Debug)]
/// One captured output file and the remote blob it is mirrored to.
pub struct OutputStream {
    path: PathBuf,
    sink: Option<AppendBlobSink>,
    cursor: u64,
}

impl OutputStream {
    pub fn new(path: impl Into<PathBuf>, sink: Option<AppendBlobSink>) -> Self {
        Self {
            path: path.into(),
            sink,
            cursor: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes already appended to the remote blob.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Appends everything written since the last flush. The cursor moves by the bytes the
    /// sink accepted, including on a partial failure.
    pub async fn flush(&mut self) -> Result<u64> {
        let Some(sink) = self.sink.as_ref() else {
            return Ok(0);
        };
        let pending = read_from_offset(&self.path, self.cursor)?;
        if pending.is_empty() {
            return Ok(0);
        }
        let progress = sink.append(&pending).await;
        self.cursor += progress.flushed;
        debug!(
            path = %self.path.display(),
            flushed = progress.flushed,
            cursor = self.cursor,
            "output appended"
        );
        match progress.error {
            Some(error) => Err(error),
            None => Ok(progress.flushed),
        }
    }

    pub fn tail(&self) -> String {
        match tail_file(&self.path, STATUS_TAIL_BYTES) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(error) => {
                warn!(path = %self.path.display(), error = %format!("{error:#}"), "failed to tail output");
                String::new()
            }
        }
    }
}

#[derive(Debug)]
/// Mirrors captured output to remote blobs and republishes a running status with fresh tails.
pub struct OutputStreamer {
    stdout: OutputStream,
    stderr: OutputStream,
    status: Option<(StatusReporter, StatusDocument)>,
    stdout_tail: String,
    stderr_tail: String,
}

impl OutputStreamer {
    pub fn new(stdout: OutputStream, stderr: OutputStream) -> Self {
        Self {
            stdout,
            stderr,
            status: None,
            stdout_tail: String::new(),
            stderr_tail: String::new(),
        }
    }

    /// Publishes `template` with the current output tails on every pass.
    pub fn with_status(mut self, reporter: StatusReporter, template: StatusDocument) -> Self {
        self.status = Some((reporter, template));
        self
    }

    pub fn stdout(&self) -> &OutputStream {
        &self.stdout
    }

    pub fn stderr(&self) -> &OutputStream {
        &self.stderr
    }

    pub fn tails(&self) -> (&str, &str) {
        (&self.stdout_tail, &self.stderr_tail)
    }

    /// Appends pending output to the sinks and refreshes the tails. Append failures are logged
    /// and left for the next call.
    pub async fn flush_and_tail(&mut self) {
        for stream in [&mut self.stdout, &mut self.stderr] {
            if let Err(error) = stream.flush().await {
                warn!(
                    path = %stream.path().display(),
                    cursor = stream.cursor(),
                    error = %format!("{error:#}"),
                    "output append failed; will retry on next pass"
                );
            }
        }
        self.stdout_tail = self.stdout.tail();
        self.stderr_tail = self.stderr.tail();
    }

    /// One periodic pass: [`Self::flush_and_tail`], then publish the status template with the
    /// fresh tails.
    pub async fn pass(&mut self) {
        self.flush_and_tail().await;
        if let Some((reporter, template)) = self.status.as_ref() {
            let document = template
                .clone()
                .with_output(self.stdout_tail.as_str(), self.stderr_tail.as_str());
            reporter.publish(&document).await;
        }
    }
}

/// Handle to a running periodic streamer. [`OutputStreamerHandle::shutdown`] stops the loop
/// and hands the streamer, with its cursors, back to the caller.
pub struct OutputStreamerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<OutputStreamer>,
}

impl OutputStreamerHandle {
    pub async fn shutdown(mut self) -> Result<OutputStreamer> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        self.task.await.context("output streamer task failed")
    }
}

/// Spawns the loop that calls [`OutputStreamer::pass`] every `interval`, first one interval
/// after start. A pass in progress completes before a stop request is observed.
pub fn spawn_periodic_streamer(streamer: OutputStreamer, interval: Duration) -> OutputStreamerHandle {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(run_periodic_loop(streamer, interval, shutdown_rx));
    OutputStreamerHandle {
        shutdown_tx: Some(shutdown_tx),
        task,
    }
}

async fn run_periodic_loop(
    mut streamer: OutputStreamer,
    interval: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> OutputStreamer {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut passes = 0_u64;
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            _ = ticker.tick() => {
                passes = passes.saturating_add(1);
                streamer.pass().await;
            }
        }
    }
    debug!(passes, "output streamer stopped");
    streamer
}
