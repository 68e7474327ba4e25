use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use httpmock::prelude::*;
use runcmd_download::{ManagedIdentity, TokenProvider};
use runcmd_handler::{
    CommandKind, Dispatcher, HandlerConfig, HandlerEnvironment, HandlerExitCode, HandlerFolders,
    InvocationMetadata,
};
use runcmd_status::InstanceView;
use runcmd_supervisor::ProcessMarker;
use serde_json::{json, Value};
use tempfile::TempDir;

struct StaticToken;

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self, _identity: &ManagedIdentity, _resource: &str) -> anyhow::Result<String> {
        Ok("integration-token".to_string())
    }
}

struct Fixture {
    temp: TempDir,
    env: HandlerEnvironment,
}

impl Fixture {
    fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let env = HandlerEnvironment {
            folders: HandlerFolders {
                config_folder: temp.path().join("config"),
                status_folder: temp.path().join("status"),
                log_folder: temp.path().join("log"),
                ..HandlerFolders::default()
            },
            ..HandlerEnvironment::default()
        };
        std::fs::create_dir_all(&env.folders.config_folder).expect("config folder");
        Self { temp, env }
    }

    fn data_dir(&self) -> PathBuf {
        self.temp.path().join("data")
    }

    fn write_settings(&self, seq_num: u64, public: Value, protected: Value) {
        let body = json!({
            "runtimeSettings": [{
                "handlerSettings": {
                    "publicSettings": public,
                    "protectedSettings": protected
                }
            }]
        });
        std::fs::write(
            self.env
                .folders
                .config_folder
                .join(format!("{seq_num}.settings")),
            body.to_string(),
        )
        .expect("write settings");
    }

    fn dispatcher(&self) -> Dispatcher {
        let config = HandlerConfig::new(self.data_dir())
            .expect("config")
            .with_token_provider(Arc::new(StaticToken))
            .with_report_interval(Duration::from_millis(50));
        Dispatcher::new(config)
    }

    async fn enable(&self, dispatcher: &Dispatcher, seq_num: u64) -> runcmd_handler::DispatchOutcome {
        self.dispatch(dispatcher, CommandKind::Enable, seq_num).await
    }

    async fn dispatch(
        &self,
        dispatcher: &Dispatcher,
        kind: CommandKind,
        seq_num: u64,
    ) -> runcmd_handler::DispatchOutcome {
        let metadata = InvocationMetadata::new("", seq_num, &self.data_dir());
        dispatcher.dispatch(kind, &self.env, &metadata).await
    }

    fn try_status(&self, seq_num: u64) -> Option<Value> {
        let raw = std::fs::read_to_string(
            self.env
                .folders
                .status_folder
                .join(format!("{seq_num}.status")),
        )
        .ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn status(&self, seq_num: u64) -> Value {
        let raw = std::fs::read_to_string(
            self.env
                .folders
                .status_folder
                .join(format!("{seq_num}.status")),
        )
        .expect("status file");
        serde_json::from_str(&raw).expect("status json")
    }

    fn execution_dir(&self, seq_num: u64) -> PathBuf {
        self.data_dir().join("download").join(seq_num.to_string())
    }
}

fn instance_view(status: &Value) -> InstanceView {
    let message = status[0]["status"]["formattedMessage"]["message"]
        .as_str()
        .expect("message");
    serde_json::from_str(message).expect("instance view")
}

fn marker_path(data_dir: &Path) -> PathBuf {
    data_dir.join("pidstart")
}

#[tokio::test]
async fn integration_inline_script_reports_success_with_output() {
    let fixture = Fixture::new();
    fixture.write_settings(0, json!({ "source": { "script": "echo hi" } }), json!({}));
    let dispatcher = fixture.dispatcher();

    let outcome = fixture.enable(&dispatcher, 0).await;

    assert_eq!(outcome.exit_code, 0);
    let status = fixture.status(0);
    assert_eq!(status[0]["status"]["status"], "success");
    assert_eq!(status[0]["status"]["operation"], "Enable");
    let view = instance_view(&status);
    assert!(view.output.contains("hi"), "output: {}", view.output);
    assert_eq!(view.exit_code, 0);
    assert!(view.end_time.is_some());
    assert!(!marker_path(&fixture.data_dir()).exists());

    let dir = fixture.execution_dir(0);
    assert!(dir.join("stdout").exists());
    assert!(!dir.join("script.sh").exists(), "cleanup removes the script");
}

#[tokio::test]
async fn integration_script_download_denied_everywhere_fails_without_running() {
    let fixture = Fixture::new();
    let server = MockServer::start();
    let denied = server.mock(|when, then| {
        when.method(GET).path("/scripts/run.sh");
        then.status(403);
    });
    fixture.write_settings(
        1,
        json!({ "source": { "scriptUri": server.url("/scripts/run.sh") } }),
        json!({ "sourceSASToken": "sv=2020&sig=topsecret" }),
    );
    let dispatcher = fixture.dispatcher();

    let outcome = fixture.enable(&dispatcher, 1).await;

    assert_eq!(
        outcome.exit_code,
        HandlerExitCode::ScriptBlobDownloadFailed.code()
    );
    denied.assert_calls(2);
    let status = fixture.status(1);
    assert_eq!(status[0]["status"]["status"], "error");
    assert_eq!(status[0]["status"]["code"], 12);
    let message = status[0]["status"]["formattedMessage"]["message"]
        .as_str()
        .expect("message")
        .to_string();
    assert!(message.contains("Use either a public script URI that points to .sh file"));
    assert!(message.contains("Please verify the machine has network connectivity"));
    assert!(message.contains("managed identity was denied access"));
    assert!(!message.contains("topsecret"));
    assert!(!fixture.execution_dir(1).join("stdout").exists());
}

#[tokio::test]
async fn integration_failing_script_surfaces_its_exit_code() {
    let fixture = Fixture::new();
    fixture.write_settings(
        2,
        json!({ "source": { "script": "echo partial\necho broken >&2\nexit 3" } }),
        json!({}),
    );
    let dispatcher = fixture.dispatcher();

    let outcome = fixture.enable(&dispatcher, 2).await;

    assert_eq!(outcome.exit_code, 3);
    let status = fixture.status(2);
    assert_eq!(status[0]["status"]["status"], "error");
    let view = instance_view(&status);
    assert_eq!(view.exit_code, 3);
    assert!(view.output.contains("partial"));
    assert!(view.error.contains("broken"));
}

#[tokio::test]
async fn integration_replayed_version_does_not_run_again() {
    let fixture = Fixture::new();
    fixture.write_settings(
        4,
        json!({ "source": { "script": "echo run >> ../runs.log" } }),
        json!({}),
    );
    let dispatcher = fixture.dispatcher();

    assert_eq!(fixture.enable(&dispatcher, 4).await.exit_code, 0);
    let first_status = fixture.status(4);

    let replay = fixture.enable(&dispatcher, 4).await;
    assert!(replay.already_processed);
    assert_eq!(replay.exit_code, 0);
    assert_eq!(fixture.status(4), first_status);

    let runs = std::fs::read_to_string(fixture.data_dir().join("download/runs.log"))
        .expect("runs log");
    assert_eq!(runs.lines().count(), 1);
}

#[tokio::test]
async fn integration_output_is_streamed_to_append_blob() {
    let fixture = Fixture::new();
    let server = MockServer::start();
    let create = server.mock(|when, then| {
        when.method(PUT)
            .path("/logs/stdout.txt")
            .header("x-ms-blob-type", "AppendBlob");
        then.status(201);
    });
    let append = server.mock(|when, then| {
        when.method(PUT)
            .path("/logs/stdout.txt")
            .query_param("comp", "appendblock")
            .body("streamed\n");
        then.status(201);
    });
    fixture.write_settings(
        5,
        json!({
            "source": { "script": "echo streamed" },
            "outputBlobUri": server.url("/logs/stdout.txt")
        }),
        json!({ "outputBlobSASToken": "sig=out" }),
    );
    let dispatcher = fixture.dispatcher();

    let outcome = fixture.enable(&dispatcher, 5).await;

    assert_eq!(outcome.exit_code, 0);
    create.assert_calls(1);
    append.assert_calls(1);
}

#[tokio::test]
async fn integration_unreachable_output_blob_is_fatal() {
    let fixture = Fixture::new();
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(PUT).path("/logs/stdout.txt");
        then.status(403);
    });
    fixture.write_settings(
        6,
        json!({
            "source": { "script": "echo never" },
            "outputBlobUri": server.url("/logs/stdout.txt")
        }),
        json!({ "outputBlobSASToken": "sig=out" }),
    );
    let dispatcher = fixture.dispatcher();

    let outcome = fixture.enable(&dispatcher, 6).await;

    assert_eq!(
        outcome.exit_code,
        HandlerExitCode::BlobCreateOrReplaceFailed.code()
    );
    assert!(!fixture.execution_dir(6).join("stdout").exists());
}

#[tokio::test]
async fn integration_artifact_file_name_cannot_escape_execution_dir() {
    let fixture = Fixture::new();
    let server = MockServer::start();
    let artifact = server.mock(|when, then| {
        when.method(GET).path("/artifacts/tool");
        then.status(200).body("payload");
    });
    let outside = fixture.temp.path().join("outside");
    std::fs::create_dir_all(&outside).expect("outside dir");
    let absolute = outside.join("escaped.txt");
    let dispatcher = fixture.dispatcher();

    for (seq_num, file_name) in [
        (7, absolute.display().to_string()),
        (8, "../../escaped.txt".to_string()),
    ] {
        fixture.write_settings(
            seq_num,
            json!({
                "source": { "script": "echo never" },
                "artifacts": [{
                    "id": 1,
                    "artifactUri": server.url("/artifacts/tool"),
                    "fileName": file_name
                }]
            }),
            json!({}),
        );

        let outcome = fixture.enable(&dispatcher, seq_num).await;

        assert_eq!(
            outcome.exit_code,
            HandlerExitCode::DownloadArtifactFailed.code()
        );
        let message = fixture.status(seq_num)[0]["status"]["formattedMessage"]["message"]
            .as_str()
            .expect("message")
            .to_string();
        assert!(message.contains("invalid file name"), "message: {message}");
        assert!(!fixture.execution_dir(seq_num).join("stdout").exists());
    }

    assert!(!absolute.exists());
    assert!(!fixture.data_dir().join("escaped.txt").exists());
    artifact.assert_calls(0);
}

#[tokio::test]
async fn integration_async_execution_reports_success_before_the_script_finishes() {
    let fixture = Fixture::new();
    fixture.write_settings(
        9,
        json!({
            "source": { "script": "sleep 1\necho done" },
            "asyncExecution": true
        }),
        json!({}),
    );
    let dispatcher = fixture.dispatcher();

    let observe = async {
        for _ in 0..40 {
            if let Some(status) = fixture.try_status(9) {
                return Some(status);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        None
    };
    let (outcome, early) = tokio::join!(fixture.enable(&dispatcher, 9), observe);

    let early = early.expect("status published while the script was running");
    assert_eq!(early[0]["status"]["status"], "success");
    let early_view = instance_view(&early);
    assert!(early_view.end_time.is_none());
    assert!(!early_view.output.contains("done"));

    assert_eq!(outcome.exit_code, 0);
    let last = fixture.status(9);
    assert_eq!(last[0]["status"]["status"], "success");
    let last_view = instance_view(&last);
    assert!(last_view.end_time.is_some());
    assert!(last_view.output.contains("done"), "output: {}", last_view.output);
}

#[cfg(target_os = "linux")]
fn spawn_previous_execution(data_dir: &Path) -> std::process::Child {
    use std::os::unix::process::CommandExt;

    let child = std::process::Command::new("sleep")
        .arg("30")
        .process_group(0)
        .spawn()
        .expect("spawn previous execution");
    ProcessMarker::capture(child.id())
        .save(&marker_path(data_dir))
        .expect("save marker");
    child
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn integration_disable_terminates_recorded_execution() {
    let fixture = Fixture::new();
    std::fs::create_dir_all(fixture.data_dir()).expect("data dir");
    let mut previous = spawn_previous_execution(&fixture.data_dir());
    let dispatcher = fixture.dispatcher();

    let outcome = fixture.dispatch(&dispatcher, CommandKind::Disable, 10).await;

    assert_eq!(outcome.exit_code, 0);
    let status = previous.wait().expect("wait");
    assert!(!status.success(), "previous execution must have been signalled");
    assert_eq!(fixture.status(10)[0]["status"]["status"], "success");
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn integration_new_enable_terminates_recorded_execution_first() {
    let fixture = Fixture::new();
    std::fs::create_dir_all(fixture.data_dir()).expect("data dir");
    let mut previous = spawn_previous_execution(&fixture.data_dir());
    fixture.write_settings(11, json!({ "source": { "script": "echo next" } }), json!({}));
    let dispatcher = fixture.dispatcher();

    let outcome = fixture.enable(&dispatcher, 11).await;

    assert_eq!(outcome.exit_code, 0);
    assert!(!previous.wait().expect("wait").success());
    assert!(instance_view(&fixture.status(11)).output.contains("next"));
    assert!(!marker_path(&fixture.data_dir()).exists());
}
