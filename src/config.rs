//! Implementation of the configuration module.

use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use batchwright_engine::LocalBatchClient;
use serde::Deserialize;
use serde::Serialize;

/// The default number of describe calls a local resource spends converging.
const DEFAULT_SETTLE_DESCRIBES: usize = 1;

/// The default maximum number of events in a local log page.
const DEFAULT_PAGE_SIZE: usize = 100;

/// Represents the configuration for the batchwright CLI tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Config {
    /// Configuration for the engine.
    #[serde(default)]
    pub engine: batchwright_engine::Config,
    /// Configuration for the backend jobs are submitted to.
    #[serde(default)]
    pub backend: BackendConfig,
}

/// Represents supported batch backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum BackendConfig {
    /// Run jobs as local processes against an emulated control plane.
    Local(LocalBackendConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Local(Default::default())
    }
}

impl BackendConfig {
    /// Validates the backend configuration.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Local(config) => config.validate(),
        }
    }
}

/// Represents the configuration of the local backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct LocalBackendConfig {
    /// The directory jobs run in.
    ///
    /// Defaults to the engine's output directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
    /// The number of describe calls a resource reports a transitional status
    /// before it converges.
    #[serde(default = "default_settle_describes")]
    pub settle_describes: usize,
    /// The maximum number of events in a log page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for LocalBackendConfig {
    fn default() -> Self {
        Self {
            work_dir: None,
            settle_describes: DEFAULT_SETTLE_DESCRIBES,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl LocalBackendConfig {
    /// Validates the local backend configuration.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            anyhow::bail!("configuration value `backend.page_size` cannot be zero");
        }

        Ok(())
    }

    /// Builds a local client for the given engine configuration.
    pub fn client(&self, engine: &batchwright_engine::Config) -> LocalBatchClient {
        let work_dir = self
            .work_dir
            .clone()
            .unwrap_or_else(|| engine.monitor.output_dir.clone());
        LocalBatchClient::new(work_dir, engine.monitor.log_group.clone())
            .with_settle_describes(self.settle_describes)
            .with_page_size(self.page_size)
    }
}

/// Default settle describes function for serde.
fn default_settle_describes() -> usize {
    DEFAULT_SETTLE_DESCRIBES
}

/// Default page size function for serde.
fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

impl Config {
    /// Validate a configuration.
    pub fn validate(&self) -> Result<()> {
        self.engine
            .validate()
            .context("invalid engine configuration")?;
        self.backend.validate()
    }

    /// Read a configuration file from the specified path.
    pub fn read_config(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| {
            format!(
                "failed to read configuration file `{path}`",
                path = path.display()
            )
        })?;
        toml::from_str(&text).with_context(|| {
            format!(
                "failed to parse configuration file `{path}`",
                path = path.display()
            )
        })
    }

    /// Write a configuration to the specified path.
    pub fn write_config(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let data = toml::to_string_pretty(self).context("failed to serialize configuration")?;
        std::fs::write(path, data).with_context(|| {
            format!(
                "failed to write configuration file `{path}`",
                path = path.display()
            )
        })
    }

    /// Loads the configuration at the given path, or the default
    /// configuration if no path was given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::read_config(path)?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }
}
