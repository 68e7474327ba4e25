use std::path::Path;

use anyhow::{bail, Context, Result};
use runcmd_download::{DownloadSource, ManagedIdentity};
use runcmd_status::SinkDescriptor;
use serde::{Deserialize, Serialize};
use tracing::debug;

const SETTINGS_FILE_EXTENSION: &str = "settings";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptSource {
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub script_uri: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptParameter {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicArtifact {
    pub id: u32,
    pub artifact_uri: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub artifact_managed_identity: Option<ManagedIdentity>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtectedArtifact {
    pub id: u32,
    #[serde(default)]
    pub artifact_sas_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicSettings {
    #[serde(default)]
    pub source: Option<ScriptSource>,
    #[serde(default)]
    pub parameters: Vec<ScriptParameter>,
    #[serde(default)]
    pub run_as_user: Option<String>,
    #[serde(default)]
    pub output_blob_uri: Option<String>,
    #[serde(default)]
    pub error_blob_uri: Option<String>,
    #[serde(default)]
    pub async_execution: bool,
    #[serde(default)]
    pub artifacts: Vec<PublicArtifact>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtectedSettings {
    #[serde(default)]
    pub protected_parameters: Vec<ScriptParameter>,
    #[serde(default, rename = "sourceSASToken")]
    pub source_sas_token: Option<String>,
    #[serde(default)]
    pub source_managed_identity: Option<ManagedIdentity>,
    #[serde(default, rename = "outputBlobSASToken")]
    pub output_blob_sas_token: Option<String>,
    #[serde(default)]
    pub output_blob_managed_identity: Option<ManagedIdentity>,
    #[serde(default, rename = "errorBlobSASToken")]
    pub error_blob_sas_token: Option<String>,
    #[serde(default)]
    pub error_blob_managed_identity: Option<ManagedIdentity>,
    #[serde(default)]
    pub artifacts: Vec<ProtectedArtifact>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A file to download next to the script, with the credentials merged from both settings
/// sections.
pub struct Artifact {
    pub source: DownloadSource,
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Per-invocation settings of one configuration version.
pub struct HandlerSettings {
    pub public: PublicSettings,
    pub protected: ProtectedSettings,
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(|value| value.trim()).filter(|value| !value.is_empty())
}

impl HandlerSettings {
    pub fn script(&self) -> Option<&str> {
        let source = self.public.source.as_ref()?;
        source
            .script
            .as_deref()
            .filter(|script| !script.trim().is_empty())
    }

    pub fn script_uri(&self) -> Option<&str> {
        non_empty(self.public.source.as_ref()?.script_uri.as_ref())
    }

    /// Exactly one of inline script and script URI must be set.
    pub fn validate(&self) -> Result<()> {
        match (self.script(), self.script_uri()) {
            (Some(_), Some(_)) => bail!("'script' and 'scriptUri' were both specified, but only one is allowed"),
            (None, None) => bail!("either 'script' or 'scriptUri' must be specified"),
            _ => {}
        }
        if self.public.run_as_user.as_deref().is_some_and(|user| user.contains(char::is_whitespace)) {
            bail!("'runAsUser' must not contain whitespace");
        }
        Ok(())
    }

    pub fn script_source(&self) -> Option<DownloadSource> {
        let uri = self.script_uri()?;
        Some(DownloadSource {
            uri: uri.to_string(),
            sas_token: self.protected.source_sas_token.clone(),
            managed_identity: self.protected.source_managed_identity.clone(),
        })
    }

    pub fn artifacts(&self) -> Result<Vec<Artifact>> {
        let mut artifacts = Vec::with_capacity(self.public.artifacts.len());
        for public in &self.public.artifacts {
            if public.artifact_uri.trim().is_empty() {
                bail!("artifact {} has an empty artifactUri", public.id);
            }
            let sas_token = self
                .protected
                .artifacts
                .iter()
                .find(|protected| protected.id == public.id)
                .and_then(|protected| protected.artifact_sas_token.clone());
            artifacts.push(Artifact {
                source: DownloadSource {
                    uri: public.artifact_uri.clone(),
                    sas_token,
                    managed_identity: public.artifact_managed_identity.clone(),
                },
                file_name: public.file_name.clone().filter(|name| !name.trim().is_empty()),
            });
        }
        Ok(artifacts)
    }

    pub fn output_sink(&self) -> Option<SinkDescriptor> {
        Some(SinkDescriptor {
            uri: non_empty(self.public.output_blob_uri.as_ref())?.to_string(),
            sas_token: self.protected.output_blob_sas_token.clone(),
            managed_identity: self.protected.output_blob_managed_identity.clone(),
        })
    }

    pub fn error_sink(&self) -> Option<SinkDescriptor> {
        Some(SinkDescriptor {
            uri: non_empty(self.public.error_blob_uri.as_ref())?.to_string(),
            sas_token: self.protected.error_blob_sas_token.clone(),
            managed_identity: self.protected.error_blob_managed_identity.clone(),
        })
    }

    /// Named parameters become environment variables; unnamed ones are positional arguments
    /// in declaration order. Protected parameters follow public ones.
    pub fn script_parameters(&self) -> (Vec<(String, String)>, Vec<String>) {
        let mut env = Vec::new();
        let mut args = Vec::new();
        for parameter in self
            .public
            .parameters
            .iter()
            .chain(self.protected.protected_parameters.iter())
        {
            match parameter.name.as_deref().map(str::trim).filter(|name| !name.is_empty()) {
                Some(name) => env.push((name.to_string(), parameter.value.clone())),
                None => args.push(parameter.value.clone()),
            }
        }
        (env, args)
    }
}

/// Source of per-invocation settings.
pub trait SettingsProvider: Send + Sync {
    fn load(&self, config_folder: &Path, ext_name: &str, seq_num: u64) -> Result<HandlerSettings>;
}

#[derive(Debug, Clone, Copy, Default)]
/// Reads `<configFolder>/[<extName>.]<seq>.settings` as written by the host agent. Protected
/// settings are expected as a plain JSON object.
pub struct JsonFileSettingsProvider;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsFile {
    runtime_settings: Vec<RuntimeSettings>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuntimeSettings {
    handler_settings: RawHandlerSettings,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHandlerSettings {
    #[serde(default)]
    public_settings: Option<PublicSettings>,
    #[serde(default)]
    protected_settings: Option<ProtectedSettings>,
}

pub fn settings_file_name(ext_name: &str, seq_num: u64) -> String {
    if ext_name.is_empty() {
        format!("{seq_num}.{SETTINGS_FILE_EXTENSION}")
    } else {
        format!("{ext_name}.{seq_num}.{SETTINGS_FILE_EXTENSION}")
    }
}

pub fn parse_settings(raw: &str) -> Result<HandlerSettings> {
    let file: SettingsFile = serde_json::from_str(raw).context("failed to parse settings file")?;
    let Some(runtime) = file.runtime_settings.into_iter().next() else {
        bail!("settings file has no runtimeSettings entries");
    };
    Ok(HandlerSettings {
        public: runtime.handler_settings.public_settings.unwrap_or_default(),
        protected: runtime.handler_settings.protected_settings.unwrap_or_default(),
    })
}

impl SettingsProvider for JsonFileSettingsProvider {
    fn load(&self, config_folder: &Path, ext_name: &str, seq_num: u64) -> Result<HandlerSettings> {
        let path = config_folder.join(settings_file_name(ext_name, seq_num));
        debug!(path = %path.display(), "reading handler settings");
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        let settings = parse_settings(&raw)
            .with_context(|| format!("invalid settings file {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }
}

/// Finds the highest sequence number among `[<extName>.]<seq>.settings` files.
pub fn discover_sequence_number(config_folder: &Path, ext_name: &str) -> Result<Option<u64>> {
    let entries = match std::fs::read_dir(config_folder) {
        Ok(entries) => entries,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(error) => {
            return Err(error)
                .with_context(|| format!("failed to list {}", config_folder.display()))
        }
    };
    let prefix = if ext_name.is_empty() {
        String::new()
    } else {
        format!("{ext_name}.")
    };
    let suffix = format!(".{SETTINGS_FILE_EXTENSION}");
    let mut highest = None;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to list {}", config_folder.display()))?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        let Some(seq) = name
            .strip_prefix(prefix.as_str())
            .and_then(|rest| rest.strip_suffix(suffix.as_str()))
            .and_then(|seq| seq.parse::<u64>().ok())
        else {
            continue;
        };
        highest = highest.max(Some(seq));
    }
    Ok(highest)
}
