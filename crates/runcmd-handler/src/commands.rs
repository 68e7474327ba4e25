use std::fmt;

use futures_util::future::BoxFuture;
use runcmd_status::{ExecutionWindow, LocalStatusTarget, RemoteStatusClient, StatusReporter};
use tracing::warn;

use crate::config::{HandlerConfig, HandlerHooks, InvocationMetadata};
use crate::error::{HandlerError, PreError};
use crate::exit_codes::HandlerExitCode;
use crate::handler_env::HandlerEnvironment;
use crate::hooks::{CleanupHook, ReportStatusHook};
use crate::{enable, lifecycle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum CommandKind {
    Install,
    Enable,
    Disable,
    Update,
    Uninstall,
}

impl CommandKind {
    pub const ALL: [CommandKind; 5] = [
        Self::Install,
        Self::Enable,
        Self::Disable,
        Self::Update,
        Self::Uninstall,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Enable => "enable",
            Self::Disable => "disable",
            Self::Update => "update",
            Self::Uninstall => "uninstall",
        }
    }

    /// Operation name as it appears in status documents.
    pub fn operation(self) -> &'static str {
        match self {
            Self::Install => "Install",
            Self::Enable => "Enable",
            Self::Disable => "Disable",
            Self::Update => "Update",
            Self::Uninstall => "Uninstall",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(name.trim()))
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything a hook may read during one invocation.
pub struct CommandContext<'a> {
    pub config: &'a HandlerConfig,
    pub env: &'a HandlerEnvironment,
    pub metadata: &'a InvocationMetadata,
    pub command: &'a Command,
}

impl CommandContext<'_> {
    /// Reporter for the configured status targets of this invocation.
    pub fn status_reporter(&self) -> StatusReporter {
        let local = self.config.local_status.then(|| LocalStatusTarget {
            status_folder: self.env.folders.status_folder.clone(),
            ext_name: self.metadata.ext_name.clone(),
            seq_num: self.metadata.seq_num,
        });
        let remote = self.config.status_endpoint.as_deref().and_then(|endpoint| {
            match RemoteStatusClient::new(endpoint) {
                Ok(client) => Some(client),
                Err(error) => {
                    warn!(error = %format!("{error:#}"), "remote status reporting disabled");
                    None
                }
            }
        });
        StatusReporter::new(local, remote)
    }
}

#[derive(Debug, Default)]
/// What `Invoke` produced. A present error carries a non-zero exit code.
pub struct InvokeOutcome {
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub error: Option<HandlerError>,
    pub execution: Option<ExecutionWindow>,
}

impl InvokeOutcome {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failed(error: HandlerError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.error
            .as_ref()
            .map_or(HandlerExitCode::Okay.code(), HandlerError::exit_code)
    }
}

pub type PreHook = for<'a> fn(&'a CommandContext<'a>) -> Result<(), PreError>;
pub type InvokeHook = for<'a> fn(&'a CommandContext<'a>) -> BoxFuture<'a, InvokeOutcome>;

/// Immutable registry entry for one lifecycle command.
pub struct Command {
    pub kind: CommandKind,
    pub should_report_status: bool,
    pub pre: Option<PreHook>,
    pub invoke: InvokeHook,
    pub report_status: Option<ReportStatusHook>,
    pub cleanup: Option<CleanupHook>,
    /// Codes `invoke` may fail with, besides a script's own exit code.
    pub exit_codes: &'static [HandlerExitCode],
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("kind", &self.kind)
            .field("should_report_status", &self.should_report_status)
            .field("has_pre", &self.pre.is_some())
            .finish()
    }
}

impl Command {
    pub fn for_kind(kind: CommandKind, hooks: &HandlerHooks) -> Self {
        let command = |should_report_status: bool,
                       invoke: InvokeHook,
                       exit_codes: &'static [HandlerExitCode]| Self {
            kind,
            should_report_status,
            pre: None,
            invoke,
            report_status: Some(hooks.report_status),
            cleanup: Some(hooks.cleanup),
            exit_codes,
        };
        match kind {
            CommandKind::Install => command(
                false,
                lifecycle::install,
                &[HandlerExitCode::CreateDataDirectoryFailed],
            ),
            CommandKind::Enable => Self {
                pre: Some(enable::enable_pre),
                ..command(
                    true,
                    enable::enable,
                    &[
                        HandlerExitCode::ProcessSequenceNumberFailed,
                        HandlerExitCode::GetHandlerSettingsFailed,
                        HandlerExitCode::CreateDataDirectoryFailed,
                        HandlerExitCode::ScriptBlobDownloadFailed,
                        HandlerExitCode::DownloadArtifactFailed,
                        HandlerExitCode::BlobCreateOrReplaceFailed,
                        HandlerExitCode::SaveScriptFailed,
                        HandlerExitCode::ExecuteScriptFailed,
                    ],
                )
            },
            CommandKind::Disable => command(true, lifecycle::disable, &[]),
            CommandKind::Update => command(true, lifecycle::update, &[]),
            CommandKind::Uninstall => command(
                false,
                lifecycle::uninstall,
                &[HandlerExitCode::RemoveDataDirectoryFailed],
            ),
        }
    }
}

#[derive(Debug)]
pub struct CommandRegistry {
    commands: Vec<Command>,
}

impl CommandRegistry {
    pub fn new(hooks: &HandlerHooks) -> Self {
        Self {
            commands: CommandKind::ALL
                .into_iter()
                .map(|kind| Command::for_kind(kind, hooks))
                .collect(),
        }
    }

    pub fn get(&self, kind: CommandKind) -> &Command {
        // `new` registers every kind in declaration order.
        &self.commands[kind as usize]
    }

    pub fn by_name(&self, name: &str) -> Option<&Command> {
        CommandKind::from_name(name).map(|kind| self.get(kind))
    }
}
