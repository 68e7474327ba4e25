//! Lifecycle command handler for the run-command VM extension.
//!
//! The host agent invokes the binary once per lifecycle command. [`Dispatcher`] selects the
//! registry entry for the command and runs its hooks; `enable` downloads and supervises the
//! configured script while output and status are reported through `runcmd-status`.

pub mod bootstrap;
pub mod cli;
pub mod commands;
pub mod config;
pub mod dispatcher;
pub mod enable;
pub mod error;
pub mod exit_codes;
pub mod handler_env;
pub mod hooks;
pub mod lifecycle;
pub mod settings;

pub use bootstrap::{init_tracing, run};
pub use cli::Cli;
pub use commands::{Command, CommandContext, CommandKind, CommandRegistry, InvokeOutcome};
pub use config::{HandlerConfig, HandlerHooks, InvocationMetadata, DEFAULT_DATA_DIR, HANDLER_NAME};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use error::{HandlerError, PreError};
pub use exit_codes::HandlerExitCode;
pub use handler_env::{locate_handler_env, parse_handler_env, HandlerEnvironment, HandlerFolders};
pub use settings::{HandlerSettings, JsonFileSettingsProvider, SettingsProvider};
