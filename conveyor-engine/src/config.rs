// Configuration
// User settings layered as defaults < config file < environment < flags

use crate::runners::{ContainerConfig, ImagePullPolicy};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const CACHE_DIR_VAR: &str = "CONVEYOR_CACHE_DIR";
pub const ARTIFACT_DIR_VAR: &str = "CONVEYOR_ARTIFACT_DIR";
pub const MAX_PARALLEL_VAR: &str = "CONVEYOR_MAX_PARALLEL";
pub const FAIL_FAST_VAR: &str = "CONVEYOR_FAIL_FAST";
pub const PULL_POLICY_VAR: &str = "CONVEYOR_PULL_POLICY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {}: {source}", path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {}: {source}", path.display())]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid value {value:?} for {name}")]
    InvalidValue { name: String, value: String },

    #[error("cannot determine the {what} to build; {hint}")]
    MissingTrigger { what: String, hint: String },
}

/// Settings read from `~/.conveyor/config.yaml`; every key is optional
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConveyorConfig {
    pub cache_dir: Option<PathBuf>,
    pub artifact_dir: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    /// 0 = unlimited
    pub max_parallel_jobs: Option<usize>,
    pub fail_fast: Option<bool>,
    /// Run steps inside job images with docker
    pub containers: Option<bool>,
    /// When job images are pulled before a container step
    pub container_pull: Option<ImagePullPolicy>,
    /// Extra `docker run` flags, e.g. `["--network", "host"]`
    pub container_args: Option<Vec<String>>,
    /// Default tracing filter, e.g. `info` or `conveyor_engine=debug`
    pub log_level: Option<String>,
}

impl ConveyorConfig {
    /// `~/.conveyor/config.yaml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".conveyor").join("config.yaml"))
    }

    /// Load the user config file then apply environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::default_path() {
            Some(path) => Self::from_file_if_exists(&path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Missing file yields the defaults
    pub fn from_file_if_exists(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!(path = %path.display(), "no config file");
            return Ok(Self::default());
        }
        Self::from_file(path)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&content).map_err(|source| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override fields from `CONVEYOR_*` variables
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = non_empty(lookup(CACHE_DIR_VAR)) {
            self.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = non_empty(lookup(ARTIFACT_DIR_VAR)) {
            self.artifact_dir = Some(PathBuf::from(dir));
        }
        if let Some(value) = non_empty(lookup(MAX_PARALLEL_VAR)) {
            let parsed = value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                name: MAX_PARALLEL_VAR.to_string(),
                value: value.clone(),
            })?;
            self.max_parallel_jobs = Some(parsed);
        }
        if let Some(value) = non_empty(lookup(FAIL_FAST_VAR)) {
            self.fail_fast = Some(parse_bool(FAIL_FAST_VAR, &value)?);
        }
        if let Some(value) = non_empty(lookup(PULL_POLICY_VAR)) {
            let policy = value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                name: PULL_POLICY_VAR.to_string(),
                value: value.clone(),
            })?;
            self.container_pull = Some(policy);
        }
        Ok(())
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(crate::cache::FsCacheStore::default_root)
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.artifact_dir
            .clone()
            .unwrap_or_else(crate::artifacts::FsArtifactStore::default_root)
    }

    pub fn max_parallel_jobs(&self) -> usize {
        self.max_parallel_jobs.unwrap_or(0)
    }

    pub fn fail_fast(&self) -> bool {
        self.fail_fast.unwrap_or(true)
    }

    pub fn containers(&self) -> bool {
        self.containers.unwrap_or(false)
    }

    pub fn container_config(&self) -> ContainerConfig {
        ContainerConfig {
            pull_policy: self.container_pull.unwrap_or_default(),
            extra_args: self.container_args.clone().unwrap_or_default(),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "y" => Ok(true),
        "0" | "false" | "no" | "off" | "n" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
        }),
    }
}
