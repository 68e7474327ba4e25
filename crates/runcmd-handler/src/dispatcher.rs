use runcmd_status::StatusKind;
use tracing::{debug, info, warn};

use crate::commands::{CommandContext, CommandKind, CommandRegistry, InvokeOutcome};
use crate::config::{HandlerConfig, InvocationMetadata};
use crate::error::PreError;
use crate::handler_env::HandlerEnvironment;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Exit status for the process.
    pub exit_code: i32,
    /// Status kind handed to `ReportStatus`, if it ran.
    pub reported: Option<StatusKind>,
    /// The configuration version had already been processed.
    pub already_processed: bool,
}

/// Runs `Pre → Invoke → ReportStatus → Cleanup` for a command and decides the exit code.
pub struct Dispatcher {
    config: HandlerConfig,
    registry: CommandRegistry,
}

impl Dispatcher {
    pub fn new(config: HandlerConfig) -> Self {
        let registry = CommandRegistry::new(&config.hooks);
        Self { config, registry }
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    pub async fn dispatch(
        &self,
        kind: CommandKind,
        env: &HandlerEnvironment,
        metadata: &InvocationMetadata,
    ) -> DispatchOutcome {
        let command = self.registry.get(kind);
        let ctx = CommandContext {
            config: &self.config,
            env,
            metadata,
            command,
        };
        info!(
            command = kind.name(),
            seq_num = metadata.seq_num,
            ext_name = %metadata.ext_name,
            version = %self.config.version,
            "command starting"
        );

        if let Some(pre) = command.pre {
            match pre(&ctx) {
                Ok(()) => {}
                Err(PreError::AlreadyProcessed { persisted }) => {
                    info!(
                        seq_num = metadata.seq_num,
                        persisted,
                        "the script configuration has already been processed, will not run again"
                    );
                    run_cleanup(&ctx);
                    return DispatchOutcome {
                        exit_code: 0,
                        reported: None,
                        already_processed: true,
                    };
                }
                Err(PreError::Failed(error)) => {
                    warn!(command = kind.name(), error = %error, "pre-check failed");
                    let outcome = InvokeOutcome::failed(error);
                    let reported = report(&ctx, &outcome).await;
                    run_cleanup(&ctx);
                    return DispatchOutcome {
                        exit_code: outcome.exit_code(),
                        reported,
                        already_processed: false,
                    };
                }
            }
        }

        let outcome = (command.invoke)(&ctx).await;
        let reported = report(&ctx, &outcome).await;
        run_cleanup(&ctx);

        let exit_code = outcome.exit_code();
        match &outcome.error {
            Some(error) => warn!(command = kind.name(), exit_code, error = %error, "command failed"),
            None => info!(command = kind.name(), "command completed"),
        }
        DispatchOutcome {
            exit_code,
            reported,
            already_processed: false,
        }
    }
}

async fn report(ctx: &CommandContext<'_>, outcome: &InvokeOutcome) -> Option<StatusKind> {
    if !ctx.command.should_report_status {
        debug!(command = ctx.command.kind.name(), "status not reported for operation");
        return None;
    }
    let report_status = ctx.command.report_status?;
    let kind = if outcome.error.is_some() {
        StatusKind::Error
    } else {
        StatusKind::Success
    };
    let summary = report_status(ctx, kind, outcome).await;
    if !summary.is_ok() {
        warn!(?summary, "status report incomplete");
    }
    Some(kind)
}

fn run_cleanup(ctx: &CommandContext<'_>) {
    if let Some(cleanup) = ctx.command.cleanup {
        if let Err(error) = cleanup(ctx) {
            warn!(error = %format!("{error:#}"), "cleanup failed");
        }
    }
}
