use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use runcmd_core::write_text_atomic;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const TERMINATE_POLL_INTERVAL: Duration = Duration::from_millis(100);
const TERMINATE_POLL_ATTEMPTS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Identity of the handler process that owns the active execution.
///
/// `start_time` is the kernel start time in clock ticks since boot. A recorded pid is only
/// signalled when the live process still reports the same start time, which guards against
/// the pid having been recycled.
pub struct ProcessMarker {
    pub pid: u32,
    #[serde(default)]
    pub start_time: Option<u64>,
}

impl ProcessMarker {
    pub fn capture(pid: u32) -> Self {
        Self {
            pid,
            start_time: process_start_time(pid),
        }
    }

    pub fn current() -> Self {
        Self::capture(std::process::id())
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to read process marker {}", path.display()))
            }
        };
        let marker = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse process marker {}", path.display()))?;
        Ok(Some(marker))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let encoded = serde_json::to_string(self).context("failed to encode process marker")?;
        write_text_atomic(path, &encoded)
            .with_context(|| format!("failed to write process marker {}", path.display()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviousExecution {
    NoMarker,
    /// The recorded process has exited.
    NotRunning { pid: u32 },
    /// The pid is alive but belongs to a different process, or identity could not be verified.
    IdentityMismatch { pid: u32 },
    /// The marker names the calling process itself.
    CurrentProcess,
    /// The marker could not be read or parsed; nothing was signalled.
    InvalidMarker,
    Terminated { pid: u32 },
}

/// Reads the start time of `pid` from `/proc/<pid>/stat`.
#[cfg(target_os = "linux")]
pub fn process_start_time(pid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_stat_field(&stat, 22)?.parse().ok()
}

#[cfg(not(target_os = "linux"))]
pub fn process_start_time(_pid: u32) -> Option<u64> {
    None
}

/// Returns the 1-based `field` of a `/proc/<pid>/stat` line. The command name (field 2) is
/// parenthesized and may contain spaces, so fields are counted from the last `)`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_stat_field(stat: &str, field: usize) -> Option<&str> {
    if field < 3 {
        return None;
    }
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(field - 3)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| parse_stat_field(&stat, 3).map(|state| state == "Z"))
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn is_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), None).is_ok() && !is_zombie(pid)
}

#[cfg(not(unix))]
fn is_alive(_pid: u32) -> bool {
    false
}

/// Makes the calling process the leader of a new process group so that the script it spawns
/// can be terminated together with it.
#[cfg(unix)]
pub fn become_process_group_leader() {
    use nix::unistd::{setpgid, Pid};

    if let Err(error) = setpgid(Pid::from_raw(0), Pid::from_raw(0)) {
        warn!(%error, "failed to create a process group for the handler");
    }
}

#[cfg(not(unix))]
pub fn become_process_group_leader() {}

/// Sends SIGTERM to the process (or its whole group when it leads one) and escalates to
/// SIGKILL if it is still alive after the grace period.
#[cfg(unix)]
async fn terminate(pid: u32) {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::{getpgid, Pid};

    let nix_pid = Pid::from_raw(pid as i32);
    let leads_group = getpgid(Some(nix_pid)).map(|pgid| pgid == nix_pid).unwrap_or(false);
    let send = |signal: Signal| {
        let result = if leads_group {
            killpg(nix_pid, signal)
        } else {
            kill(nix_pid, signal)
        };
        if let Err(error) = result {
            warn!(pid, %signal, %error, "failed to signal previous execution");
        }
    };

    send(Signal::SIGTERM);
    for _ in 0..TERMINATE_POLL_ATTEMPTS {
        tokio::time::sleep(TERMINATE_POLL_INTERVAL).await;
        if !is_alive(pid) {
            return;
        }
    }
    warn!(pid, "previous execution did not exit after SIGTERM, sending SIGKILL");
    send(Signal::SIGKILL);
}

#[cfg(not(unix))]
async fn terminate(_pid: u32) {}

/// Records the calling process in the marker file.
pub fn save_current_pid_and_start_time(path: &Path) -> Result<ProcessMarker> {
    let marker = ProcessMarker::current();
    marker.save(path)?;
    Ok(marker)
}

pub fn delete_current_pid_and_start_time(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error)
            .with_context(|| format!("failed to delete process marker {}", path.display())),
    }
}

/// Terminates the execution recorded in the marker file, if that exact process is still alive.
/// The marker itself is left in place. A missing or unreadable marker is not an error.
pub async fn kill_previous_extension(path: &Path) -> Result<PreviousExecution> {
    let marker = match ProcessMarker::load(path) {
        Ok(Some(marker)) => marker,
        Ok(None) => return Ok(PreviousExecution::NoMarker),
        Err(error) => {
            debug!(error = %format!("{error:#}"), "ignoring invalid process marker");
            return Ok(PreviousExecution::InvalidMarker);
        }
    };
    if marker.pid == std::process::id() {
        return Ok(PreviousExecution::CurrentProcess);
    }
    if !is_alive(marker.pid) {
        return Ok(PreviousExecution::NotRunning { pid: marker.pid });
    }
    let Some(expected) = marker.start_time else {
        warn!(
            pid = marker.pid,
            "no recorded start time; skipping kill (cannot verify process identity)"
        );
        return Ok(PreviousExecution::IdentityMismatch { pid: marker.pid });
    };
    match process_start_time(marker.pid) {
        Some(actual) if actual == expected => {
            info!(pid = marker.pid, "terminating previous execution");
            terminate(marker.pid).await;
            Ok(PreviousExecution::Terminated { pid: marker.pid })
        }
        Some(actual) => {
            warn!(
                pid = marker.pid,
                expected, actual, "start time mismatch; skipping kill (likely pid reuse)"
            );
            Ok(PreviousExecution::IdentityMismatch { pid: marker.pid })
        }
        None => Ok(PreviousExecution::NotRunning { pid: marker.pid }),
    }
}

/// Holds the process marker for the lifetime of an execution and removes it on drop, on both
/// the success and the failure path.
#[derive(Debug)]
pub struct ProcessMarkerGuard {
    path: PathBuf,
}

impl ProcessMarkerGuard {
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        save_current_pid_and_start_time(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProcessMarkerGuard {
    fn drop(&mut self) {
        if let Err(error) = delete_current_pid_and_start_time(&self.path) {
            warn!(error = %format!("{error:#}"), "failed to remove process marker");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        kill_previous_extension, parse_stat_field, PreviousExecution, ProcessMarker,
        ProcessMarkerGuard,
    };

    #[test]
    fn unit_parse_stat_field_handles_spaces_in_command_name() {
        let stat = "4242 (my (odd) cmd) S 1 4242 4242 0 -1 4194560 1 2 3 4 5 6 7 8 20 0 1 0 987654 100";
        assert_eq!(parse_stat_field(stat, 3), Some("S"));
        assert_eq!(parse_stat_field(stat, 4), Some("1"));
        assert_eq!(parse_stat_field(stat, 22), Some("987654"));
        assert_eq!(parse_stat_field(stat, 2), None);
    }

    #[tokio::test]
    async fn functional_missing_marker_is_a_noop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outcome = kill_previous_extension(&temp.path().join("pidstart"))
            .await
            .expect("kill");
        assert_eq!(outcome, PreviousExecution::NoMarker);
    }

    #[tokio::test]
    async fn regression_corrupt_marker_is_ignored_without_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("pidstart");
        std::fs::write(&path, r#"{"pid": 12"#).expect("write");

        let outcome = kill_previous_extension(&path)
            .await
            .expect("corrupt marker is a no-op");
        assert_eq!(outcome, PreviousExecution::InvalidMarker);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn functional_marker_of_current_process_is_never_signalled() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("pidstart");
        ProcessMarker::current().save(&path).expect("save");
        assert_eq!(
            kill_previous_extension(&path).await.expect("kill"),
            PreviousExecution::CurrentProcess
        );
    }

    #[test]
    fn functional_guard_removes_marker_on_drop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("pidstart");
        {
            let guard = ProcessMarkerGuard::acquire(&path).expect("acquire");
            let marker = ProcessMarker::load(guard.path())
                .expect("load")
                .expect("marker present");
            assert_eq!(marker.pid, std::process::id());
        }
        assert!(!path.exists());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn functional_exited_process_is_reported_not_running() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("pidstart");
        let mut child = std::process::Command::new("true").spawn().expect("spawn");
        let marker = ProcessMarker::capture(child.id());
        child.wait().expect("wait");
        marker.save(&path).expect("save");

        let outcome = kill_previous_extension(&path).await.expect("kill");
        assert_eq!(outcome, PreviousExecution::NotRunning { pid: marker.pid });
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn regression_start_time_mismatch_does_not_kill() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("pidstart");
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn");
        let actual = super::process_start_time(child.id()).expect("start time");
        ProcessMarker {
            pid: child.id(),
            start_time: Some(actual + 1),
        }
        .save(&path)
        .expect("save");

        let outcome = kill_previous_extension(&path).await.expect("kill");
        assert_eq!(outcome, PreviousExecution::IdentityMismatch { pid: child.id() });
        assert!(child.try_wait().expect("try_wait").is_none());
        child.kill().expect("cleanup kill");
        child.wait().expect("wait");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn integration_live_process_group_is_terminated() {
        use std::os::unix::process::CommandExt;

        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("pidstart");
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .expect("spawn");
        ProcessMarker::capture(child.id()).save(&path).expect("save");

        let outcome = kill_previous_extension(&path).await.expect("kill");
        assert_eq!(outcome, PreviousExecution::Terminated { pid: child.id() });
        let status = child.wait().expect("wait");
        assert!(!status.success());
        assert!(path.exists());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn regression_grace_period_does_not_block_the_runtime() {
        use std::os::unix::process::CommandExt;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        use std::time::Duration;

        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("pidstart");
        let mut child = std::process::Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .process_group(0)
            .spawn()
            .expect("spawn");
        tokio::time::sleep(Duration::from_millis(200)).await;
        ProcessMarker::capture(child.id()).save(&path).expect("save");

        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let ticker = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(50)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        let outcome = kill_previous_extension(&path).await.expect("kill");
        ticker.abort();

        assert_eq!(outcome, PreviousExecution::Terminated { pid: child.id() });
        assert!(
            ticks.load(Ordering::SeqCst) >= 10,
            "other tasks must keep running while SIGTERM is ignored"
        );
        assert!(!child.wait().expect("wait").success());
    }
}
