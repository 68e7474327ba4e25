use std::fmt;

/// Closed set of process exit codes, one per fatal stage. A failing script surfaces its own
/// exit code instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum HandlerExitCode {
    Okay = 0,
    CreateDataDirectoryFailed = 10,
    GetHandlerSettingsFailed = 11,
    ScriptBlobDownloadFailed = 12,
    DownloadArtifactFailed = 13,
    BlobCreateOrReplaceFailed = 14,
    SaveScriptFailed = 15,
    RemoveDataDirectoryFailed = 16,
    HandlerEnvironmentFailed = 17,
    ProcessSequenceNumberFailed = 18,
    ExecuteScriptFailed = 19,
}

impl HandlerExitCode {
    pub const fn code(self) -> i32 {
        self as i32
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Okay => "Okay",
            Self::CreateDataDirectoryFailed => "CreateDataDirectoryFailed",
            Self::GetHandlerSettingsFailed => "GetHandlerSettingsFailed",
            Self::ScriptBlobDownloadFailed => "ScriptBlobDownloadFailed",
            Self::DownloadArtifactFailed => "DownloadArtifactFailed",
            Self::BlobCreateOrReplaceFailed => "BlobCreateOrReplaceFailed",
            Self::SaveScriptFailed => "SaveScriptFailed",
            Self::RemoveDataDirectoryFailed => "RemoveDataDirectoryFailed",
            Self::HandlerEnvironmentFailed => "HandlerEnvironmentFailed",
            Self::ProcessSequenceNumberFailed => "ProcessSequenceNumberFailed",
            Self::ExecuteScriptFailed => "ExecuteScriptFailed",
        }
    }
}

impl fmt::Display for HandlerExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::HandlerExitCode;

    #[test]
    fn unit_exit_codes_are_distinct_and_only_okay_is_zero() {
        let all = [
            HandlerExitCode::Okay,
            HandlerExitCode::CreateDataDirectoryFailed,
            HandlerExitCode::GetHandlerSettingsFailed,
            HandlerExitCode::ScriptBlobDownloadFailed,
            HandlerExitCode::DownloadArtifactFailed,
            HandlerExitCode::BlobCreateOrReplaceFailed,
            HandlerExitCode::SaveScriptFailed,
            HandlerExitCode::RemoveDataDirectoryFailed,
            HandlerExitCode::HandlerEnvironmentFailed,
            HandlerExitCode::ProcessSequenceNumberFailed,
            HandlerExitCode::ExecuteScriptFailed,
        ];
        let codes = all.iter().map(|code| code.code()).collect::<HashSet<_>>();
        assert_eq!(codes.len(), all.len());
        assert_eq!(
            all.iter().filter(|code| code.code() == 0).count(),
            1
        );
        assert_eq!(
            HandlerExitCode::ScriptBlobDownloadFailed.to_string(),
            "ScriptBlobDownloadFailed (12)"
        );
    }
}
