use anyhow::Context;
use futures_util::future::BoxFuture;
use runcmd_supervisor::{kill_previous_extension, PreviousExecution};
use tracing::{info, warn};

use crate::commands::{CommandContext, InvokeOutcome};
use crate::error::HandlerError;
use crate::exit_codes::HandlerExitCode;

pub fn install<'a>(ctx: &'a CommandContext<'a>) -> BoxFuture<'a, InvokeOutcome> {
    Box::pin(async move {
        let data_dir = &ctx.config.data_dir;
        if let Err(error) = std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))
        {
            return InvokeOutcome::failed(HandlerError::new(
                HandlerExitCode::CreateDataDirectoryFailed,
                error,
            ));
        }
        info!(path = %data_dir.display(), "installed");
        InvokeOutcome::ok()
    })
}

pub fn uninstall<'a>(ctx: &'a CommandContext<'a>) -> BoxFuture<'a, InvokeOutcome> {
    Box::pin(async move {
        let data_dir = &ctx.config.data_dir;
        info!(path = %data_dir.display(), "removing data dir");
        match std::fs::remove_dir_all(data_dir) {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                return InvokeOutcome::failed(HandlerError::new(
                    HandlerExitCode::RemoveDataDirectoryFailed,
                    anyhow::Error::new(error).context("failed to delete data directory"),
                ));
            }
        }
        info!("uninstalled");
        InvokeOutcome::ok()
    })
}

/// Terminates the running execution, if any. Persisted markers are kept so a disabled
/// configuration version is not re-run on the next enable.
pub fn disable<'a>(ctx: &'a CommandContext<'a>) -> BoxFuture<'a, InvokeOutcome> {
    Box::pin(async move {
        terminate_previous_execution(ctx).await;
        info!("disabled");
        InvokeOutcome::ok()
    })
}

pub fn update<'a>(_ctx: &'a CommandContext<'a>) -> BoxFuture<'a, InvokeOutcome> {
    Box::pin(async move {
        info!("updated");
        InvokeOutcome::ok()
    })
}

/// Best effort: a stale or unverifiable marker is logged and otherwise ignored.
pub(crate) async fn terminate_previous_execution(ctx: &CommandContext<'_>) {
    match kill_previous_extension(&ctx.metadata.pid_file_path).await {
        Ok(PreviousExecution::Terminated { pid }) => info!(pid, "previous execution terminated"),
        Ok(outcome) => info!(?outcome, "no previous execution to terminate"),
        Err(error) => warn!(
            error = %format!("{error:#}"),
            "failed to inspect previous execution"
        ),
    }
}
