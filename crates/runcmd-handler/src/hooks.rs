use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use runcmd_status::{PublishSummary, StatusDocument, StatusKind};
use runcmd_supervisor::{STDERR_FILE_NAME, STDOUT_FILE_NAME};
use tracing::{debug, info};

use crate::commands::{CommandContext, CommandKind, InvokeOutcome};
use crate::config::HANDLER_NAME;

pub type ReportStatusHook = for<'a> fn(
    &'a CommandContext<'a>,
    StatusKind,
    &'a InvokeOutcome,
) -> BoxFuture<'a, PublishSummary>;
pub type CleanupHook = for<'a> fn(&'a CommandContext<'a>) -> Result<()>;

/// Builds the status document describing `outcome`.
pub fn status_document(
    ctx: &CommandContext<'_>,
    kind: StatusKind,
    outcome: &InvokeOutcome,
) -> StatusDocument {
    let operation = ctx.command.kind.operation();
    let message = match (&outcome.error, &outcome.execution) {
        (Some(error), _) => error.message().to_string(),
        (None, Some(_)) => "Execution completed".to_string(),
        (None, None) => format!("{operation} succeeded"),
    };
    let document = StatusDocument::new(HANDLER_NAME, operation, kind, message)
        .with_exit_code(outcome.exit_code())
        .with_output(outcome.stdout_tail.as_str(), outcome.stderr_tail.as_str());
    match outcome.execution.clone() {
        Some(execution) => document.with_execution(execution),
        None => document,
    }
}

pub fn default_report_status<'a>(
    ctx: &'a CommandContext<'a>,
    kind: StatusKind,
    outcome: &'a InvokeOutcome,
) -> BoxFuture<'a, PublishSummary> {
    Box::pin(async move {
        let document = status_document(ctx, kind, outcome);
        ctx.status_reporter().publish(&document).await
    })
}

/// Removes the materialized script and downloaded files of an `enable`, keeping the captured
/// output.
pub fn default_cleanup(ctx: &CommandContext<'_>) -> Result<()> {
    if ctx.command.kind != CommandKind::Enable {
        return Ok(());
    }
    let dir = ctx.metadata.execution_dir(&ctx.config.data_dir);
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(error) => {
            return Err(error).with_context(|| format!("failed to list {}", dir.display()))
        }
    };
    let mut removed = 0_usize;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
        let name = entry.file_name();
        if name == STDOUT_FILE_NAME || name == STDERR_FILE_NAME {
            continue;
        }
        let path = entry.path();
        let file_type = entry
            .file_type()
            .with_context(|| format!("failed to stat {}", path.display()))?;
        let removal = if file_type.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        removal.with_context(|| format!("failed to remove {}", path.display()))?;
        debug!(path = %path.display(), "removed");
        removed += 1;
    }
    info!(dir = %dir.display(), removed, "execution directory cleaned");
    Ok(())
}
