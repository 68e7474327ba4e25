use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const HANDLER_ENVIRONMENT_FILE_NAME: &str = "HandlerEnvironment.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerFolders {
    pub config_folder: PathBuf,
    pub status_folder: PathBuf,
    pub log_folder: PathBuf,
    /// Host-provided fields this handler does not use.
    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Folder layout the host agent assigns to this extension.
pub struct HandlerEnvironment {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: serde_json::Value,
    #[serde(rename = "handlerEnvironment")]
    pub folders: HandlerFolders,
}

/// Where the descriptor is searched for: next to the executable, then one directory up.
pub fn candidate_paths(exe_dir: &Path) -> [PathBuf; 2] {
    [
        exe_dir.join(HANDLER_ENVIRONMENT_FILE_NAME),
        exe_dir.join("..").join(HANDLER_ENVIRONMENT_FILE_NAME),
    ]
}

/// Parses the descriptor, which must be an array holding exactly one record.
pub fn parse_handler_env(raw: &str) -> Result<HandlerEnvironment> {
    let mut records: Vec<HandlerEnvironment> =
        serde_json::from_str(raw).context("failed to parse handler environment")?;
    if records.len() != 1 {
        bail!(
            "expected 1 config in parsed HandlerEnvironment, found: {}",
            records.len()
        );
    }
    Ok(records.remove(0))
}

pub fn load_handler_env(path: &Path) -> Result<HandlerEnvironment> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read handler environment {}", path.display()))?;
    parse_handler_env(&raw).with_context(|| format!("invalid handler environment {}", path.display()))
}

/// Loads the first descriptor found among [`candidate_paths`].
pub fn locate_handler_env(exe_dir: &Path) -> Result<HandlerEnvironment> {
    let paths = candidate_paths(exe_dir);
    for path in &paths {
        match std::fs::metadata(path) {
            Ok(_) => return load_handler_env(path),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => continue,
            Err(error) => {
                return Err(error).with_context(|| {
                    format!("error examining HandlerEnvironment at '{}'", path.display())
                })
            }
        }
    }
    bail!(
        "cannot find HandlerEnvironment at paths: {}",
        paths
            .iter()
            .map(|path| path.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    )
}

/// Directory of the running executable.
pub fn current_exe_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("cannot find the running executable")?;
    exe.parent()
        .map(Path::to_path_buf)
        .context("running executable has no parent directory")
}

#[cfg(test)]
mod tests {
    use super::{locate_handler_env, parse_handler_env, HANDLER_ENVIRONMENT_FILE_NAME};

    const SAMPLE: &str = r#"[{
        "name": "Microsoft.CPlat.Core.RunCommandHandlerLinux",
        "version": 1.0,
        "handlerEnvironment": {
            "configFolder": "/var/lib/waagent/ext/config",
            "statusFolder": "/var/lib/waagent/ext/status",
            "logFolder": "/var/log/azure/ext",
            "heartbeatFile": "/var/lib/waagent/ext/heartbeat.log"
        }
    }]"#;

    #[test]
    fn unit_parse_reads_folders_and_keeps_unknown_fields() {
        let env = parse_handler_env(SAMPLE).expect("parse");
        assert_eq!(
            env.folders.status_folder.to_str(),
            Some("/var/lib/waagent/ext/status")
        );
        assert!(env.folders.other.contains_key("heartbeatFile"));
    }

    #[test]
    fn regression_parse_rejects_zero_or_many_records() {
        let error = parse_handler_env("[]").expect_err("empty");
        assert!(error.to_string().contains("found: 0"));
        let record = SAMPLE.trim().trim_start_matches('[').trim_end_matches(']');
        let error = parse_handler_env(&format!("[{record},{record}]")).expect_err("two");
        assert!(error.to_string().contains("found: 2"));
    }

    #[test]
    fn functional_locate_probes_exe_dir_then_parent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let exe_dir = temp.path().join("bin");
        std::fs::create_dir_all(&exe_dir).expect("mkdir");
        assert!(locate_handler_env(&exe_dir).is_err());

        std::fs::write(temp.path().join(HANDLER_ENVIRONMENT_FILE_NAME), SAMPLE).expect("write");
        let env = locate_handler_env(&exe_dir).expect("parent descriptor");
        assert_eq!(env.folders.log_folder.to_str(), Some("/var/log/azure/ext"));

        let local = SAMPLE.replace("/var/log/azure/ext", "/tmp/local-log");
        std::fs::write(exe_dir.join(HANDLER_ENVIRONMENT_FILE_NAME), local).expect("write");
        let env = locate_handler_env(&exe_dir).expect("local descriptor");
        assert_eq!(env.folders.log_folder.to_str(), Some("/tmp/local-log"));
    }
}
