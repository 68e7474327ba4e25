use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};
use runcmd_status::WIRE_SERVER_FALLBACK_ADDRESS;

use crate::commands::CommandKind;
use crate::config::DEFAULT_DATA_DIR;

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "run-command-handler",
    about = "Runs lifecycle commands for the run-command VM extension",
    version
)]
pub struct Cli {
    #[arg(value_enum, help = "Lifecycle command requested by the host agent")]
    pub command: CommandKind,

    #[arg(
        long = "data-dir",
        env = "RUN_COMMAND_DATA_DIR",
        default_value = DEFAULT_DATA_DIR,
        help = "Directory holding downloads, captured output and sequence/process markers"
    )]
    pub data_dir: PathBuf,

    #[arg(
        long = "extension-name",
        env = "ConfigExtensionName",
        default_value = "",
        help = "Extension name for multi-configuration handlers; scopes settings, status and marker files"
    )]
    pub extension_name: String,

    #[arg(
        long = "seq-num",
        env = "ConfigSequenceNumber",
        help = "Configuration sequence number. Defaults to the highest *.settings file in the config folder"
    )]
    pub seq_num: Option<u64>,

    #[arg(
        long = "handler-environment",
        env = "RUN_COMMAND_HANDLER_ENVIRONMENT",
        help = "Explicit HandlerEnvironment.json path. Defaults to probing next to and above the executable"
    )]
    pub handler_environment: Option<PathBuf>,

    #[arg(
        long = "status-endpoint",
        env = "RUN_COMMAND_STATUS_ENDPOINT",
        default_value = WIRE_SERVER_FALLBACK_ADDRESS,
        help = "Base address of the host status service"
    )]
    pub status_endpoint: String,

    #[arg(
        long = "no-remote-status",
        action = ArgAction::SetTrue,
        help = "Do not submit status documents to the host status service"
    )]
    pub no_remote_status: bool,

    #[arg(
        long = "no-local-status",
        action = ArgAction::SetTrue,
        help = "Do not write status files to the status folder"
    )]
    pub no_local_status: bool,

    #[arg(
        long = "report-interval-secs",
        env = "RUN_COMMAND_REPORT_INTERVAL_SECS",
        default_value_t = 30,
        value_parser = parse_positive_u64,
        help = "Seconds between partial output reports while the script runs"
    )]
    pub report_interval_secs: u64,
}

impl Cli {
    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    pub fn status_endpoint(&self) -> Option<String> {
        (!self.no_remote_status).then(|| self.status_endpoint.clone())
    }
}
