use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::{debug, info};

pub const STDOUT_FILE_NAME: &str = "stdout";
pub const STDERR_FILE_NAME: &str = "stderr";
const SCRIPT_SHELL: &str = "/bin/bash";
const FALLBACK_SHELL: &str = "/bin/sh";
const RUN_AS_LAUNCHER: &str = "runuser";

/// Paths of the captured stdout and stderr files inside an execution directory.
pub fn output_paths(dir: &Path) -> (PathBuf, PathBuf) {
    (dir.join(STDOUT_FILE_NAME), dir.join(STDERR_FILE_NAME))
}

/// Writes inline script content to `path` and marks it executable by the owner.
pub fn save_script_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, content)
        .with_context(|| format!("failed to write script {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("failed to make {} executable", path.display()))?;
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptInvocation {
    pub script_path: PathBuf,
    pub working_dir: PathBuf,
    /// Positional arguments appended after the script path.
    pub args: Vec<String>,
    /// Environment variables exported to the script.
    pub env: Vec<(String, String)>,
    pub run_as_user: Option<String>,
}

impl ScriptInvocation {
    pub fn new(script_path: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            script_path: script_path.into(),
            working_dir: working_dir.into(),
            ..Self::default()
        }
    }

    fn command(&self) -> Command {
        let shell = if Path::new(SCRIPT_SHELL).exists() {
            SCRIPT_SHELL
        } else {
            FALLBACK_SHELL
        };
        let mut command = match self.run_as_user.as_deref() {
            Some(user) => {
                let mut command = Command::new(RUN_AS_LAUNCHER);
                command.args(["-u", user, "--", shell]);
                command
            }
            None => Command::new(shell),
        };
        command.arg(&self.script_path);
        command.args(&self.args);
        command.current_dir(&self.working_dir);
        for (key, value) in &self.env {
            command.env(key, value);
        }
        command
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptExit {
    pub exit_code: i32,
}

impl ScriptExit {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs the script to completion with stdout/stderr captured to `stdout`/`stderr` in the
/// working directory. The script inherits the caller's process group. Termination by a signal
/// is reported as `128 + signal`.
pub async fn run_script(invocation: &ScriptInvocation) -> Result<ScriptExit> {
    let (stdout_path, stderr_path) = output_paths(&invocation.working_dir);
    let stdout_file = std::fs::File::create(&stdout_path)
        .with_context(|| format!("failed to open {}", stdout_path.display()))?;
    let stderr_file = std::fs::File::create(&stderr_path)
        .with_context(|| format!("failed to open {}", stderr_path.display()))?;

    let mut command = invocation.command();
    command.kill_on_drop(true);
    command.stdin(Stdio::null());
    command.stdout(Stdio::from(stdout_file));
    command.stderr(Stdio::from(stderr_file));

    let mut child = command.spawn().with_context(|| {
        format!(
            "failed to start script {}",
            invocation.script_path.display()
        )
    })?;
    info!(
        pid = child.id(),
        script = %invocation.script_path.display(),
        run_as = invocation.run_as_user.as_deref().unwrap_or(""),
        "script started"
    );
    let status = child
        .wait()
        .await
        .context("failed waiting for script to exit")?;
    let exit_code = match status.code() {
        Some(code) => code,
        None => signal_exit_code(&status),
    };
    debug!(exit_code, "script exited");
    Ok(ScriptExit { exit_code })
}

#[cfg(unix)]
fn signal_exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|signal| 128 + signal).unwrap_or(-1)
}

#[cfg(not(unix))]
fn signal_exit_code(_status: &std::process::ExitStatus) -> i32 {
    -1
}
