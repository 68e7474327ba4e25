use anyhow::{Context, Result};
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::config::{HandlerConfig, InvocationMetadata};
use crate::dispatcher::Dispatcher;
use crate::error::HandlerError;
use crate::exit_codes::HandlerExitCode;
use crate::handler_env::{current_exe_dir, load_handler_env, locate_handler_env, HandlerEnvironment};
use crate::settings::discover_sequence_number;

pub fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn load_environment(cli: &Cli) -> Result<HandlerEnvironment> {
    match cli.handler_environment.as_deref() {
        Some(path) => load_handler_env(path),
        None => locate_handler_env(&current_exe_dir()?),
    }
}

fn resolve_sequence_number(cli: &Cli, env: &HandlerEnvironment) -> Result<u64> {
    if let Some(seq_num) = cli.seq_num {
        return Ok(seq_num);
    }
    let discovered = discover_sequence_number(&env.folders.config_folder, &cli.extension_name)
        .context("failed to discover the configuration sequence number")?;
    Ok(discovered.unwrap_or_default())
}

/// Runs one handler invocation and returns the process exit code.
pub async fn run(cli: Cli) -> i32 {
    let env = match load_environment(&cli) {
        Ok(env) => env,
        Err(error) => {
            let error = HandlerError::new(HandlerExitCode::HandlerEnvironmentFailed, error);
            warn!(error = %error, "failed to load handler environment");
            return error.exit_code();
        }
    };
    let seq_num = match resolve_sequence_number(&cli, &env) {
        Ok(seq_num) => seq_num,
        Err(error) => {
            let error = HandlerError::new(HandlerExitCode::GetHandlerSettingsFailed, error);
            warn!(error = %error, "failed to resolve sequence number");
            return error.exit_code();
        }
    };
    let config = match HandlerConfig::new(&cli.data_dir) {
        Ok(config) => config
            .with_status_endpoint(cli.status_endpoint())
            .with_report_interval(cli.report_interval()),
        Err(error) => {
            warn!(error = %format!("{error:#}"), "failed to initialize handler");
            return HandlerExitCode::HandlerEnvironmentFailed.code();
        }
    };
    let config = HandlerConfig {
        local_status: !cli.no_local_status,
        ..config
    };
    info!(version = %config.version, "run-command handler starting");

    runcmd_supervisor::become_process_group_leader();
    let metadata = InvocationMetadata::new(cli.extension_name.as_str(), seq_num, &config.data_dir);
    let dispatcher = Dispatcher::new(config);
    dispatcher
        .dispatch(cli.command, &env, &metadata)
        .await
        .exit_code
}
