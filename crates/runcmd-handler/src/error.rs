use thiserror::Error;

use crate::exit_codes::HandlerExitCode;

#[derive(Debug, Error)]
#[error("{message}")]
/// A failed stage together with the exit code the process must terminate with.
pub struct HandlerError {
    exit_code: i32,
    message: String,
}

impl HandlerError {
    /// Wraps `error` (with its full context chain) under a taxonomy code.
    pub fn new(code: HandlerExitCode, error: anyhow::Error) -> Self {
        Self {
            exit_code: code.code(),
            message: format!("{error:#}"),
        }
    }

    pub fn with_exit_code(exit_code: i32, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Error)]
/// Outcome of a `Pre` hook that stops the command before `Invoke`.
pub enum PreError {
    /// Control flow only: the configuration version was handled by an earlier invocation.
    #[error(
        "the script configuration has already been processed, will not run again (persisted sequence number {persisted})"
    )]
    AlreadyProcessed { persisted: u64 },
    #[error(transparent)]
    Failed(#[from] HandlerError),
}
