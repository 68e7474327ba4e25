use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use futures_util::future::BoxFuture;
use runcmd_core::{tail_file, utc_timestamp};
use runcmd_download::{
    checked_file_name, file_name_from_uri, save_response_to_file, uri_for_logging, DownloadSource,
};
use runcmd_status::{
    spawn_periodic_streamer, AppendBlobSink, ExecutionWindow, OutputStream, OutputStreamer,
    SinkDescriptor, StatusDocument, StatusKind, STATUS_TAIL_BYTES,
};
use runcmd_supervisor::{
    check_and_advance, output_paths, run_script, save_script_file, ProcessMarkerGuard,
    ScriptInvocation, SequenceDecision,
};
use tracing::{info, warn};

use crate::commands::{CommandContext, InvokeOutcome};
use crate::config::HANDLER_NAME;
use crate::error::{HandlerError, PreError};
use crate::exit_codes::HandlerExitCode;
use crate::lifecycle::terminate_previous_execution;
use crate::settings::HandlerSettings;

pub const INLINE_SCRIPT_FILE_NAME: &str = "script.sh";
const SCRIPT_FILE_MODE: u32 = 0o700;
const ARTIFACT_FILE_MODE: u32 = 0o600;

const SCRIPT_DOWNLOAD_REMEDIATION: &str = "File downloads failed. Use either a public script URI that points to .sh file, Azure storage blob SAS URI or storage blob accessible by a managed identity and retry. If managed identity is used, make sure it has been given access to container of storage blob with 'Storage Blob Data Reader' role assignment. In case of user-assigned identity, make sure you add it under VM's identity. For more information, see https://aka.ms/RunCommandManagedLinux";
const ARTIFACT_DOWNLOAD_REMEDIATION: &str = "Artifact downloads failed. Use either a public artifact URI, Azure storage blob SAS URI, or storage blob accessible by a managed identity and retry.";
const BLOB_CREATE_REMEDIATION: &str = "Please use a valid blob SAS URI with [read, append, create, write] permissions OR managed identity. If managed identity is used, make sure Azure blob and identity exist, and identity has been given access to storage blob's container with 'Storage Blob Data Contributor' role assignment. For more information, see https://aka.ms/RunCommandManagedLinux";

/// Accepts the invocation only for a configuration version newer than every processed one.
pub fn enable_pre<'a>(ctx: &'a CommandContext<'a>) -> Result<(), PreError> {
    let metadata = ctx.metadata;
    match check_and_advance(&metadata.most_recent_sequence, metadata.seq_num) {
        Ok(SequenceDecision::Proceed) => Ok(()),
        Ok(SequenceDecision::AlreadyProcessed { persisted }) => {
            Err(PreError::AlreadyProcessed { persisted })
        }
        Err(error) => Err(PreError::Failed(HandlerError::new(
            HandlerExitCode::ProcessSequenceNumberFailed,
            error.context("failed to process sequence number"),
        ))),
    }
}

pub fn enable<'a>(ctx: &'a CommandContext<'a>) -> BoxFuture<'a, InvokeOutcome> {
    Box::pin(async move {
        match run_enable(ctx).await {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(exit_code = error.exit_code(), error = %error, "enable failed");
                InvokeOutcome::failed(error)
            }
        }
    })
}

async fn run_enable(ctx: &CommandContext<'_>) -> Result<InvokeOutcome, HandlerError> {
    let config = ctx.config;
    let settings = config
        .settings_provider
        .load(
            &ctx.env.folders.config_folder,
            &ctx.metadata.ext_name,
            ctx.metadata.seq_num,
        )
        .map_err(|error| {
            HandlerError::new(
                HandlerExitCode::GetHandlerSettingsFailed,
                error.context("failed to get configuration"),
            )
        })?;

    let dir = ctx.metadata.execution_dir(&config.data_dir);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to prepare output directory {}", dir.display()))
        .map_err(|error| HandlerError::new(HandlerExitCode::CreateDataDirectoryFailed, error))?;

    let downloaded_script = download_script(ctx, &settings, &dir).await?;
    download_artifacts(ctx, &settings, &dir).await?;

    let output_sink = create_sink(ctx, settings.output_sink()).await?;
    let error_sink = create_sink(ctx, settings.error_sink()).await?;

    let script_path = match (settings.script(), downloaded_script) {
        (Some(script), _) => {
            let path = dir.join(INLINE_SCRIPT_FILE_NAME);
            save_script_file(&path, script).map_err(|error| {
                HandlerError::new(
                    HandlerExitCode::SaveScriptFailed,
                    error.context("failed to save script to file"),
                )
            })?;
            path
        }
        (None, Some(path)) => path,
        (None, None) => {
            return Err(HandlerError::new(
                HandlerExitCode::GetHandlerSettingsFailed,
                anyhow!("either 'script' or 'scriptUri' must be specified"),
            ))
        }
    };

    terminate_previous_execution(ctx).await;
    let marker = match ProcessMarkerGuard::acquire(ctx.metadata.pid_file_path.as_path()) {
        Ok(marker) => Some(marker),
        Err(error) => {
            warn!(error = %format!("{error:#}"), "failed to record active execution");
            None
        }
    };

    let start_time = utc_timestamp();
    let progress_kind = if settings.public.async_execution {
        StatusKind::Success
    } else {
        StatusKind::Transitioning
    };
    let template = StatusDocument::new(
        HANDLER_NAME,
        ctx.command.kind.operation(),
        progress_kind,
        "Execution in progress",
    )
    .with_execution(ExecutionWindow {
        start_time: start_time.clone(),
        end_time: None,
    });
    let reporter = ctx.status_reporter();
    if settings.public.async_execution && ctx.command.should_report_status {
        info!("async execution requested; reporting success before the script completes");
        reporter.publish(&template).await;
    }

    let (stdout_path, stderr_path) = output_paths(&dir);
    let mut streamer = OutputStreamer::new(
        OutputStream::new(&stdout_path, output_sink),
        OutputStream::new(&stderr_path, error_sink),
    );
    if ctx.command.should_report_status {
        streamer = streamer.with_status(reporter, template);
    }
    let streamer_handle = spawn_periodic_streamer(streamer, config.report_interval);

    let (env, args) = settings.script_parameters();
    let invocation = ScriptInvocation {
        script_path,
        working_dir: dir.clone(),
        args,
        env,
        run_as_user: settings.public.run_as_user.clone(),
    };
    info!(dir = %dir.display(), "executing script");
    let exit = run_script(&invocation).await;
    drop(marker);

    let (stdout_tail, stderr_tail) = match streamer_handle.shutdown().await {
        Ok(mut streamer) => {
            streamer.flush_and_tail().await;
            let (stdout_tail, stderr_tail) = streamer.tails();
            (stdout_tail.to_string(), stderr_tail.to_string())
        }
        Err(error) => {
            warn!(error = %format!("{error:#}"), "output streamer did not stop cleanly");
            (read_tail(&stdout_path), read_tail(&stderr_path))
        }
    };
    let execution = Some(ExecutionWindow {
        start_time,
        end_time: Some(utc_timestamp()),
    });

    let error = match exit {
        Ok(exit) if exit.success() => {
            info!("enabled");
            None
        }
        Ok(exit) => {
            info!(exit_code = exit.exit_code, "enable script failed");
            Some(HandlerError::with_exit_code(
                exit.exit_code,
                format!("failed to execute command: script exited with code {}", exit.exit_code),
            ))
        }
        Err(error) => Some(HandlerError::new(
            HandlerExitCode::ExecuteScriptFailed,
            error.context("failed to execute command"),
        )),
    };
    Ok(InvokeOutcome {
        stdout_tail,
        stderr_tail,
        error,
        execution,
    })
}

fn read_tail(path: &Path) -> String {
    tail_file(path, STATUS_TAIL_BYTES)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

async fn download_to_dir(
    ctx: &CommandContext<'_>,
    source: &DownloadSource,
    dir: &Path,
    file_name: Option<&str>,
    mode: u32,
) -> anyhow::Result<PathBuf> {
    let redacted = uri_for_logging(&source.uri);
    let file_name = file_name
        .map(str::to_string)
        .or_else(|| file_name_from_uri(&source.uri))
        .with_context(|| format!("cannot derive a file name from '{redacted}'"))?;
    let file_name = checked_file_name(&file_name)?;
    let strategies = source.strategies(Arc::clone(&ctx.config.token_provider));
    let response = ctx.config.downloader.fetch(&strategies).await?;
    let path = dir.join(file_name);
    let bytes = save_response_to_file(response, &path, mode).await?;
    info!(uri = %redacted, path = %path.display(), bytes, "download complete");
    Ok(path)
}

async fn download_script(
    ctx: &CommandContext<'_>,
    settings: &HandlerSettings,
    dir: &Path,
) -> Result<Option<PathBuf>, HandlerError> {
    let Some(source) = settings.script_source() else {
        return Ok(None);
    };
    let redacted = uri_for_logging(&source.uri);
    info!(uri = %redacted, "download start");
    let path = download_to_dir(ctx, &source, dir, None, SCRIPT_FILE_MODE)
        .await
        .map_err(|error| {
            HandlerError::new(
                HandlerExitCode::ScriptBlobDownloadFailed,
                error
                    .context(format!("failed to download file {redacted}"))
                    .context(SCRIPT_DOWNLOAD_REMEDIATION),
            )
        })?;
    Ok(Some(path))
}

async fn download_artifacts(
    ctx: &CommandContext<'_>,
    settings: &HandlerSettings,
    dir: &Path,
) -> Result<(), HandlerError> {
    let artifacts = settings.artifacts().map_err(|error| {
        HandlerError::new(HandlerExitCode::DownloadArtifactFailed, error)
    })?;
    for artifact in &artifacts {
        let redacted = uri_for_logging(&artifact.source.uri);
        download_to_dir(
            ctx,
            &artifact.source,
            dir,
            artifact.file_name.as_deref(),
            ARTIFACT_FILE_MODE,
        )
        .await
        .map_err(|error| {
            HandlerError::new(
                HandlerExitCode::DownloadArtifactFailed,
                error
                    .context(format!("failed to download artifact {redacted}"))
                    .context(ARTIFACT_DOWNLOAD_REMEDIATION),
            )
        })?;
    }
    Ok(())
}

async fn create_sink(
    ctx: &CommandContext<'_>,
    descriptor: Option<SinkDescriptor>,
) -> Result<Option<AppendBlobSink>, HandlerError> {
    let Some(descriptor) = descriptor else {
        return Ok(None);
    };
    let sink = AppendBlobSink::create_or_replace(
        &ctx.config.blob_http,
        &descriptor,
        Arc::clone(&ctx.config.token_provider),
    )
    .await
    .map_err(|error| {
        HandlerError::new(
            HandlerExitCode::BlobCreateOrReplaceFailed,
            error.context(format!(
                "Error creating AppendBlob '{}' using SAS token or Managed identity. {BLOB_CREATE_REMEDIATION}",
                uri_for_logging(&descriptor.uri)
            )),
        )
    })?;
    Ok(Some(sink))
}
