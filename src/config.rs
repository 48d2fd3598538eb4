use crate::runs::launcher::EngineCatalog;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_STATE_ROOT_DIR: &str = ".runyard";
pub const SETTINGS_FILE_NAME: &str = "config.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid settings: {0}")]
    Settings(String),
    #[error("failed to resolve home directory for the state root")]
    HomeDirectoryUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Local,
    Supervised,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default)]
    pub cwl_runner: Option<String>,
    #[serde(default)]
    pub wdl_runner: Option<String>,
    #[serde(default)]
    pub script_interpreter: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoteSettings {
    #[serde(default)]
    pub api_base: String,
    /// Opaque bearer credential forwarded to the control plane verbatim.
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub state_root: PathBuf,
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default)]
    pub engines: EngineSettings,
    #[serde(default)]
    pub remote: Option<RemoteSettings>,
    #[serde(default)]
    pub supervisor_binary: Option<PathBuf>,
}

impl Settings {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let settings: Settings =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.state_root.as_os_str().is_empty() {
            return Err(ConfigError::Settings(
                "state_root must be non-empty".to_string(),
            ));
        }
        if self.backend == BackendKind::Remote {
            let api_base = self
                .remote
                .as_ref()
                .map(|remote| remote.api_base.trim())
                .unwrap_or("");
            if api_base.is_empty() {
                return Err(ConfigError::Settings(
                    "remote backend requires remote.api_base".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn engine_catalog(&self) -> EngineCatalog {
        let defaults = EngineCatalog::default();
        EngineCatalog {
            cwl_runner: self
                .engines
                .cwl_runner
                .clone()
                .unwrap_or(defaults.cwl_runner),
            wdl_runner: self
                .engines
                .wdl_runner
                .clone()
                .unwrap_or(defaults.wdl_runner),
            script_interpreter: self
                .engines
                .script_interpreter
                .clone()
                .unwrap_or(defaults.script_interpreter),
            extra_args: self.engines.extra_args.clone(),
        }
    }
}

pub fn default_state_root_path() -> Result<PathBuf, ConfigError> {
    let home = std::env::var_os("HOME").ok_or(ConfigError::HomeDirectoryUnavailable)?;
    Ok(PathBuf::from(home).join(DEFAULT_STATE_ROOT_DIR))
}

pub fn default_settings_path() -> Result<PathBuf, ConfigError> {
    Ok(default_state_root_path()?.join(SETTINGS_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_settings_default_to_the_local_backend() {
        let settings: Settings =
            serde_yaml::from_str("state_root: /tmp/runyard\n").expect("parse settings");
        assert_eq!(settings.backend, BackendKind::Local);
        assert_eq!(settings.state_root, PathBuf::from("/tmp/runyard"));
        settings.validate().expect("validate");

        let catalog = settings.engine_catalog();
        assert_eq!(catalog.cwl_runner, "cwl-runner");
        assert_eq!(catalog.script_interpreter, "python3");
        assert!(catalog.extra_args.is_empty());
    }

    #[test]
    fn engine_overrides_replace_defaults() {
        let settings: Settings = serde_yaml::from_str(
            r#"
state_root: /tmp/runyard
engines:
  cwl_runner: toil-cwl-runner
  extra_args: ["--logLevel=CRITICAL"]
"#,
        )
        .expect("parse settings");
        let catalog = settings.engine_catalog();
        assert_eq!(catalog.cwl_runner, "toil-cwl-runner");
        assert_eq!(catalog.wdl_runner, "wdl-runner");
        assert_eq!(catalog.extra_args, vec!["--logLevel=CRITICAL"]);
    }

    #[test]
    fn remote_backend_requires_an_api_base() {
        let settings: Settings = serde_yaml::from_str(
            r#"
state_root: /tmp/runyard
backend: remote
"#,
        )
        .expect("parse settings");
        let err = settings.validate().expect_err("must fail");
        assert!(err.to_string().contains("remote.api_base"));

        let settings: Settings = serde_yaml::from_str(
            r#"
state_root: /tmp/runyard
backend: remote
remote:
  api_base: http://scheduler.example.com
  credential: secret-token
"#,
        )
        .expect("parse settings");
        settings.validate().expect("validate");
    }

    #[test]
    fn unknown_backend_kind_fails_to_parse() {
        let err = serde_yaml::from_str::<Settings>(
            r#"
state_root: /tmp/runyard
backend: kubernetes
"#,
        )
        .expect_err("unknown backend must fail");
        assert!(err.to_string().contains("unknown variant"));
        assert!(err.to_string().contains("kubernetes"));
    }
}
