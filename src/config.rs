//! Orchestrator configuration.
//!
//! The configuration is loaded once per invocation from a JSON or YAML file,
//! optionally overridden from the environment, validated, and then shared as
//! an immutable value (`Arc<OrchestratorConfig>`) by every component.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::ConfigError;

/// Default completion marker looked up under `<link>/stats/`.
pub const DEFAULT_MARKER_FILE: &str = "aseg.stats";

/// Default file name of the shared error log, relative to the output root.
pub const DEFAULT_ERROR_LOG: &str = "longsurf_errors.jsonl";

/// Default per-subject log directory, relative to the output root.
pub const DEFAULT_LOG_DIR: &str = "logs";

/// Option keys the orchestrator sets itself from the job descriptor.
pub const RESERVED_OPTION_KEYS: &[&str] = &["tid", "t1s", "tpids", "sd", "fs_license"];

/// Container runtime used to launch the processing tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    /// `singularity exec` against a local `.sif` image.
    #[default]
    Singularity,
    /// `docker run` against an image reference.
    Docker,
}

impl std::fmt::Display for ContainerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerRuntime::Singularity => write!(f, "singularity"),
            ContainerRuntime::Docker => write!(f, "docker"),
        }
    }
}

impl std::str::FromStr for ContainerRuntime {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "singularity" | "apptainer" => Ok(ContainerRuntime::Singularity),
            "docker" => Ok(ContainerRuntime::Docker),
            other => Err(ConfigError::InvalidValue {
                key: "runtime".to_string(),
                message: format!("unknown container runtime '{other}'"),
            }),
        }
    }
}

fn default_marker_file() -> String {
    DEFAULT_MARKER_FILE.to_string()
}

/// Configuration for one orchestration pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Container image: a `.sif` path for singularity, an image reference for docker.
    pub image: String,
    /// FreeSurfer license file mounted into the container.
    pub license: PathBuf,
    /// Container runtime.
    #[serde(default)]
    pub runtime: ContainerRuntime,
    /// Processing options translated into command-line flags.
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
    /// Completion marker file name under `stats/`.
    #[serde(default = "default_marker_file")]
    pub marker_file: String,
    /// Shared error log; defaults to `<output>/longsurf_errors.jsonl`.
    #[serde(default)]
    pub error_log: Option<PathBuf>,
    /// Directory for per-subject job logs; defaults to `<output>/logs`.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// Additional bind mounts (`host:container`) passed to the runtime.
    #[serde(default)]
    pub extra_binds: Vec<String>,
    /// Request GPU access from the runtime.
    #[serde(default)]
    pub gpu: bool,
    /// Replace existing `.long` symlinks that point elsewhere after a successful job.
    #[serde(default)]
    pub link_force: bool,
}

impl OrchestratorConfig {
    /// Creates a configuration with default settings for the given image and license.
    pub fn new(image: impl Into<String>, license: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            license: license.into(),
            runtime: ContainerRuntime::default(),
            options: BTreeMap::new(),
            marker_file: default_marker_file(),
            error_log: None,
            log_dir: None,
            extra_binds: Vec::new(),
            gpu: false,
            link_force: false,
        }
    }

    /// Loads configuration from a `.json`, `.yaml` or `.yml` file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file is missing, has an unknown
    /// extension, or fails to parse.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        let content = std::fs::read_to_string(path)?;

        match extension.as_str() {
            "json" => Ok(serde_json::from_str(&content)?),
            "yaml" | "yml" => Ok(serde_yaml::from_str(&content)?),
            other => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Applies environment overrides.
    ///
    /// # Environment Variables
    ///
    /// - `LONGSURF_IMAGE`: container image
    /// - `LONGSURF_LICENSE`: license file path
    /// - `LONGSURF_RUNTIME`: `singularity` or `docker`
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(val) = std::env::var("LONGSURF_IMAGE") {
            self.image = val;
        }
        if let Ok(val) = std::env::var("LONGSURF_LICENSE") {
            self.license = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("LONGSURF_RUNTIME") {
            self.runtime = val.parse()?;
        }
        Ok(self)
    }

    /// Sets the container runtime.
    pub fn with_runtime(mut self, runtime: ContainerRuntime) -> Self {
        self.runtime = runtime;
        self
    }

    /// Adds a processing option.
    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Sets the shared error log path.
    pub fn with_error_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.error_log = Some(path.into());
        self
    }

    /// Sets the per-subject log directory.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Validates the configuration.
    ///
    /// Docker images are references rather than files, so only the license
    /// is checked on disk for the docker runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "image must not be empty".to_string(),
            ));
        }
        if self.runtime == ContainerRuntime::Singularity && !Path::new(&self.image).is_file() {
            return Err(ConfigError::ValidationFailed(format!(
                "container image not found: {}",
                self.image
            )));
        }
        if !self.license.is_file() {
            return Err(ConfigError::ValidationFailed(format!(
                "license file not found: {}",
                self.license.display()
            )));
        }
        if self.marker_file.is_empty() || self.marker_file.contains('/') {
            return Err(ConfigError::InvalidValue {
                key: "marker_file".to_string(),
                message: "must be a plain file name".to_string(),
            });
        }
        for (key, value) in &self.options {
            if normalize_key(key).is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "options".to_string(),
                    message: "option keys must not be empty".to_string(),
                });
            }
            if value.is_object() {
                return Err(ConfigError::InvalidValue {
                    key: format!("options.{key}"),
                    message: "nested objects cannot be translated into flags".to_string(),
                });
            }
        }
        for bind in &self.extra_binds {
            if !bind.contains(':') {
                return Err(ConfigError::InvalidValue {
                    key: "extra_binds".to_string(),
                    message: format!("'{bind}' is not of the form host:container"),
                });
            }
        }
        Ok(())
    }

    /// Translates the options map into command-line flags.
    ///
    /// `true` becomes a bare flag, scalars become flag + value, arrays become
    /// flag + values, and `false`/`null` are omitted. Keys are emitted in
    /// sorted order; reserved keys are dropped.
    pub fn option_flags(&self) -> Vec<String> {
        let mut flags = Vec::new();

        for (raw_key, value) in &self.options {
            let key = normalize_key(raw_key);
            if RESERVED_OPTION_KEYS.contains(&key) {
                warn!(option = %key, "Ignoring option reserved by the orchestrator");
                continue;
            }
            let flag = format!("--{key}");

            match value {
                Value::Null | Value::Bool(false) => {}
                Value::Bool(true) => flags.push(flag),
                Value::String(s) => {
                    flags.push(flag);
                    flags.push(s.clone());
                }
                Value::Number(n) => {
                    flags.push(flag);
                    flags.push(n.to_string());
                }
                Value::Array(items) => {
                    let values: Vec<String> = items.iter().filter_map(scalar_to_string).collect();
                    if !values.is_empty() {
                        flags.push(flag);
                        flags.extend(values);
                    }
                }
                Value::Object(_) => {
                    warn!(option = %key, "Ignoring nested object option");
                }
            }
        }

        flags
    }

    /// Resolves the shared error log path for an output root.
    pub fn error_log_path(&self, output_root: &Path) -> PathBuf {
        self.error_log
            .clone()
            .unwrap_or_else(|| output_root.join(DEFAULT_ERROR_LOG))
    }

    /// Resolves the per-subject log directory for an output root.
    pub fn log_dir_path(&self, output_root: &Path) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| output_root.join(DEFAULT_LOG_DIR))
    }
}

fn normalize_key(key: &str) -> &str {
    key.trim().trim_start_matches('-')
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
