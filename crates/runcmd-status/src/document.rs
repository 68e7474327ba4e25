use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const STATUS_SCHEMA_VERSION: f64 = 1.0;
const MESSAGE_LANG: &str = "en";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Transitioning,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionState {
    Running,
    Succeeded,
    Failed,
}

impl From<StatusKind> for ExecutionState {
    fn from(kind: StatusKind) -> Self {
        match kind {
            StatusKind::Transitioning => Self::Running,
            StatusKind::Success => Self::Succeeded,
            StatusKind::Error => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Wall-clock bounds of a script execution, as RFC 3339 UTC timestamps.
pub struct ExecutionWindow {
    pub start_time: String,
    pub end_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Execution record embedded as the status message of an `enable`.
pub struct InstanceView {
    pub execution_state: ExecutionState,
    pub execution_message: String,
    pub output: String,
    pub error: String,
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
}

/// Outcome of a command as reported to the control plane. Built fresh for every report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusDocument {
    pub name: String,
    pub operation: String,
    pub kind: StatusKind,
    pub exit_code: i32,
    pub message: String,
    pub stdout_tail: String,
    pub stderr_tail: String,
    /// Present for commands that supervise a script; switches the wire message to an
    /// [`InstanceView`].
    pub execution: Option<ExecutionWindow>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEntry {
    version: f64,
    #[serde(rename = "timestampUTC")]
    timestamp_utc: String,
    status: WireStatus,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireStatus {
    name: String,
    operation: String,
    status: StatusKind,
    code: i32,
    formatted_message: FormattedMessage,
}

#[derive(Debug, Serialize, Deserialize)]
struct FormattedMessage {
    lang: String,
    message: String,
}

impl StatusDocument {
    pub fn new(
        name: impl Into<String>,
        operation: impl Into<String>,
        kind: StatusKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            operation: operation.into(),
            kind,
            exit_code: 0,
            message: message.into(),
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            execution: None,
        }
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub fn with_output(mut self, stdout_tail: impl Into<String>, stderr_tail: impl Into<String>) -> Self {
        self.stdout_tail = stdout_tail.into();
        self.stderr_tail = stderr_tail.into();
        self
    }

    pub fn with_execution(mut self, execution: ExecutionWindow) -> Self {
        self.execution = Some(execution);
        self
    }

    pub fn instance_view(&self) -> Option<InstanceView> {
        let execution = self.execution.as_ref()?;
        Some(InstanceView {
            execution_state: self.kind.into(),
            execution_message: self.message.clone(),
            output: self.stdout_tail.clone(),
            error: self.stderr_tail.clone(),
            exit_code: self.exit_code,
            start_time: Some(execution.start_time.clone()),
            end_time: execution.end_time.clone(),
        })
    }

    fn formatted_message(&self) -> Result<String> {
        match self.instance_view() {
            Some(view) => serde_json::to_string(&view).context("failed to encode instance view"),
            None if self.stdout_tail.is_empty() && self.stderr_tail.is_empty() => {
                Ok(self.message.clone())
            }
            None => Ok(format!(
                "{}\n[stdout]\n{}\n[stderr]\n{}",
                self.message, self.stdout_tail, self.stderr_tail
            )),
        }
    }

    /// Serializes the document into the status-file array format stamped with `timestamp_utc`.
    pub fn to_json(&self, timestamp_utc: &str) -> Result<String> {
        let entries = vec![WireEntry {
            version: STATUS_SCHEMA_VERSION,
            timestamp_utc: timestamp_utc.to_string(),
            status: WireStatus {
                name: self.name.clone(),
                operation: self.operation.clone(),
                status: self.kind,
                code: self.exit_code,
                formatted_message: FormattedMessage {
                    lang: MESSAGE_LANG.to_string(),
                    message: self.formatted_message()?,
                },
            },
        }];
        serde_json::to_string_pretty(&entries).context("failed to encode status document")
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::{ExecutionWindow, InstanceView, StatusDocument, StatusKind};

    #[test]
    fn unit_plain_document_serializes_to_status_array() {
        let document = StatusDocument::new("RunCommand", "Install", StatusKind::Success, "ok");
        let json = document.to_json("2026-01-01T00:00:00Z").expect("json");
        let value: Value = serde_json::from_str(&json).expect("parse");
        let entry = &value[0];
        assert_eq!(entry["version"], 1.0);
        assert_eq!(entry["timestampUTC"], "2026-01-01T00:00:00Z");
        assert_eq!(entry["status"]["operation"], "Install");
        assert_eq!(entry["status"]["status"], "success");
        assert_eq!(entry["status"]["code"], 0);
        assert_eq!(entry["status"]["formattedMessage"]["lang"], "en");
        assert_eq!(entry["status"]["formattedMessage"]["message"], "ok");
    }

    #[test]
    fn functional_execution_document_embeds_instance_view() {
        let document = StatusDocument::new("RunCommand", "Enable", StatusKind::Error, "failed")
            .with_exit_code(3)
            .with_output("hi\n", "boom\n")
            .with_execution(ExecutionWindow {
                start_time: "2026-01-01T00:00:00Z".to_string(),
                end_time: Some("2026-01-01T00:00:05Z".to_string()),
            });
        let json = document.to_json("2026-01-01T00:00:05Z").expect("json");
        let value: Value = serde_json::from_str(&json).expect("parse");
        assert_eq!(value[0]["status"]["status"], "error");
        let message = value[0]["status"]["formattedMessage"]["message"]
            .as_str()
            .expect("message string");
        let view: InstanceView = serde_json::from_str(message).expect("instance view");
        assert_eq!(view.output, "hi\n");
        assert_eq!(view.error, "boom\n");
        assert_eq!(view.exit_code, 3);
        assert_eq!(view.end_time.as_deref(), Some("2026-01-01T00:00:05Z"));
        assert!(message.contains("\"executionState\":\"Failed\""));
    }

    #[test]
    fn unit_running_instance_view_omits_end_time() {
        let document = StatusDocument::new("RunCommand", "Enable", StatusKind::Transitioning, "")
            .with_execution(ExecutionWindow {
                start_time: "2026-01-01T00:00:00Z".to_string(),
                end_time: None,
            });
        let view = document.instance_view().expect("view");
        let encoded = serde_json::to_string(&view).expect("encode");
        assert!(encoded.contains("\"executionState\":\"Running\""));
        assert!(!encoded.contains("endTime"));
    }
}
