//! Runtime configuration loaded from TOML.
//!
//! ```toml
//! workflows_dir = "workflows"
//! audit_dir = ".relay/audit"
//! log_filter = "relay_agent=debug"
//!
//! [workers.tester]
//! command = "./scripts/run-tests.sh"
//! args = ["--json"]
//! env = { CI = "1" }
//! ```

use crate::command::CommandWorker;
use relay_agent::workflow::WorkerRegistry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from loading a runtime configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

/// How to launch one process-backed worker.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandWorkerConfig {
    /// Program to execute
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables for the process
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

/// Runtime configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Directory scanned for `*.yaml` / `*.yml` workflow definitions
    pub workflows_dir: PathBuf,
    /// Directory receiving one JSONL audit file per run
    pub audit_dir: PathBuf,
    /// Default tracing filter when `RUST_LOG` is unset
    pub log_filter: Option<String>,
    /// Process-backed workers by id
    pub workers: BTreeMap<String, CommandWorkerConfig>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workflows_dir: PathBuf::from("workflows"),
            audit_dir: PathBuf::from(".relay/audit"),
            log_filter: None,
            workers: BTreeMap::new(),
        }
    }
}

impl RuntimeConfig {
    /// Loads a configuration file.
    ///
    /// Relative directories are resolved against the file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::load_str(&content)?;
        Ok(match path.parent() {
            Some(base) => config.relative_to(base),
            None => config,
        })
    }

    /// Parses and checks a configuration document.
    pub fn load_str(content: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(content)?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<(), ConfigError> {
        for (id, worker) in &self.workers {
            if id.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "workers".to_string(),
                    message: "worker id must not be empty".to_string(),
                });
            }
            if worker.command.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("workers.{id}.command"),
                    message: "must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }

    fn relative_to(mut self, base: &Path) -> Self {
        let rebase = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        rebase(&mut self.workflows_dir);
        rebase(&mut self.audit_dir);
        for worker in self.workers.values_mut() {
            if let Some(dir) = worker.working_dir.as_mut() {
                rebase(dir);
            }
        }
        self
    }

    /// Builds a registry holding one [`CommandWorker`] per configured worker.
    pub fn worker_registry(&self) -> WorkerRegistry {
        self.workers
            .iter()
            .fold(WorkerRegistry::new(), |registry, (id, config)| {
                registry.with_worker(id.as_str(), CommandWorker::new(config.clone()))
            })
    }
}
