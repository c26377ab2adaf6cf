//! Engine configuration.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// The prefix marking a resource value as the handle of an existing resource.
pub const EXISTING_RESOURCE_PREFIX: &str = "arn:";

/// The resource value requesting creation without a spec file.
pub const NO_SPEC: &str = "NULL";

/// The prefix marking a bucket value as the name of an existing bucket.
pub const EXISTING_BUCKET_PREFIX: &str = "s3://";

/// Default prefix for the names of created resources.
const DEFAULT_PREFIX: &str = "batchwright";

/// Default monitor poll interval, in seconds.
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Default number of status checks after creating a resource.
const DEFAULT_CREATE_ATTEMPTS: usize = 3;

/// Default interval between converge checks, in seconds.
const DEFAULT_CONVERGE_INTERVAL_SECS: u64 = 2;

/// Default number of status checks after disabling a resource.
const DEFAULT_DISABLE_ATTEMPTS: usize = 5;

/// Default initial interval between delete checks, in seconds.
const DEFAULT_DELETE_INITIAL_INTERVAL_SECS: u64 = 2;

/// Default ceiling of the interval between delete checks, in seconds.
const DEFAULT_DELETE_MAX_INTERVAL_SECS: u64 = 32;

/// Default number of concurrent submit calls.
const DEFAULT_WORKERS: usize = 2;

/// Default time to wait for in-flight submit calls on shutdown, in seconds.
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 60;

/// Default log group for job logs.
const DEFAULT_LOG_GROUP: &str = "/batch/job";

/// Default maximum number of log pages fetched per job.
const DEFAULT_MAX_LOG_PAGES: usize = 10_000;

/// Default name of the state journal file.
const DEFAULT_JOURNAL: &str = "jobstate.log";

/// Errors in engine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration value is out of range.
    #[error("configuration value `{name}` {reason}")]
    InvalidValue {
        /// The dotted name of the value.
        name: &'static str,
        /// Why the value is invalid.
        reason: &'static str,
    },

    /// A configuration file could not be read or written.
    #[error("failed to access configuration file `{}`: {source}", .path.display())]
    Io {
        /// The path of the file.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },

    /// A configuration file could not be parsed.
    #[error("failed to parse configuration file `{}`: {source}", .path.display())]
    Parse {
        /// The path of the file.
        path: PathBuf,
        /// The underlying error.
        source: toml::de::Error,
    },

    /// A configuration could not be serialized.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A resource spec file could not be read or parsed.
    #[error("invalid resource spec file `{}`: {message}", .path.display())]
    ResourceSpec {
        /// The path of the spec file.
        path: PathBuf,
        /// A description of the problem.
        message: String,
    },
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// How a provisioned resource is obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceSource {
    /// An existing resource is used as-is and never deleted.
    Existing(String),
    /// The resource is created, optionally from a JSON spec file.
    Create(Option<PathBuf>),
}

impl ResourceSource {
    /// Interprets a resource configuration value.
    ///
    /// A missing value or `NULL` requests creation without a spec; a value
    /// starting with `arn:` names an existing resource; anything else is the
    /// path of a JSON spec file.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            None | Some("") | Some(NO_SPEC) => Self::Create(None),
            Some(v) if v.starts_with(EXISTING_RESOURCE_PREFIX) => Self::Existing(v.to_string()),
            Some(v) => Self::Create(Some(PathBuf::from(v))),
        }
    }
}

/// How the storage bucket for job inputs is obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketSource {
    /// An existing bucket is used as-is and never deleted.
    Existing(String),
    /// A bucket is created and deleted on exit.
    Create,
}

impl BucketSource {
    /// Interprets a bucket configuration value.
    ///
    /// A missing value means no bucket is used; a value starting with
    /// `s3://` names an existing bucket; anything else (conventionally
    /// `NULL`) requests a new one.
    pub fn parse(value: Option<&str>) -> Option<Self> {
        match value.map(str::trim) {
            None | Some("") => None,
            Some(v) => match v.strip_prefix(EXISTING_BUCKET_PREFIX) {
                Some(name) => Some(Self::Existing(name.trim_end_matches('/').to_string())),
                None => Some(Self::Create),
            },
        }
    }
}

/// Which resources to create or reuse.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ResourcesConfig {
    /// The job definition: an existing handle, a JSON spec path, or `NULL`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_definition: Option<String>,
    /// The compute environment: an existing handle, a JSON spec path, or
    /// `NULL`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_environment: Option<String>,
    /// The job queue: an existing handle, a JSON spec path, or `NULL`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_queue: Option<String>,
    /// The bucket job input files are uploaded to: an existing `s3://`
    /// bucket, or `NULL` to create one. No bucket is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
}

/// Settings of the converge polls run against provisioned resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ConvergeConfig {
    /// The number of status checks after a create before giving up.
    #[serde(default = "default_create_attempts")]
    pub create_attempts: usize,
    /// The fixed interval between create and disable checks, in seconds.
    #[serde(default = "default_converge_interval_secs")]
    pub interval_secs: u64,
    /// The number of status checks after a disable before giving up.
    #[serde(default = "default_disable_attempts")]
    pub disable_attempts: usize,
    /// The first interval between delete checks, in seconds.
    #[serde(default = "default_delete_initial_interval_secs")]
    pub delete_initial_interval_secs: u64,
    /// The ceiling of the interval between delete checks, in seconds.
    #[serde(default = "default_delete_max_interval_secs")]
    pub delete_max_interval_secs: u64,
}

impl ConvergeConfig {
    /// Gets the fixed converge interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Gets the first delete check interval.
    pub fn delete_initial_interval(&self) -> Duration {
        Duration::from_secs(self.delete_initial_interval_secs)
    }

    /// Gets the ceiling of the delete check interval.
    pub fn delete_max_interval(&self) -> Duration {
        Duration::from_secs(self.delete_max_interval_secs)
    }
}

impl Default for ConvergeConfig {
    fn default() -> Self {
        Self {
            create_attempts: DEFAULT_CREATE_ATTEMPTS,
            interval_secs: DEFAULT_CONVERGE_INTERVAL_SECS,
            disable_attempts: DEFAULT_DISABLE_ATTEMPTS,
            delete_initial_interval_secs: DEFAULT_DELETE_INITIAL_INTERVAL_SECS,
            delete_max_interval_secs: DEFAULT_DELETE_MAX_INTERVAL_SECS,
        }
    }
}

/// Settings of the monitor loop and its outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct MonitorConfig {
    /// The interval between status queries, in seconds.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// The log group job logs are read from.
    #[serde(default = "default_log_group")]
    pub log_group: String,
    /// The maximum number of log pages fetched for a single job.
    #[serde(default = "default_max_log_pages")]
    pub max_log_pages: usize,
    /// The directory job logs and the journal are written to.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// The file name of the state journal, relative to `output_dir`.
    #[serde(default = "default_journal")]
    pub journal: String,
}

impl MonitorConfig {
    /// Gets the poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Gets the path of the state journal.
    pub fn journal_path(&self) -> PathBuf {
        self.output_dir.join(&self.journal)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            log_group: default_log_group(),
            max_log_pages: DEFAULT_MAX_LOG_PAGES,
            output_dir: default_output_dir(),
            journal: default_journal(),
        }
    }
}

/// Settings of the worker pool running submit calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct PoolConfig {
    /// The maximum number of concurrent submit calls.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// How long shutdown waits for in-flight submit calls before cancelling
    /// them, in seconds.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl PoolConfig {
    /// Gets the shutdown grace period.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
        }
    }
}

/// The configuration of an engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Config {
    /// The prefix of the names of created resources.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// The resources to create or reuse.
    #[serde(default)]
    pub resources: ResourcesConfig,
    /// Converge poll settings.
    #[serde(default)]
    pub converge: ConvergeConfig,
    /// Monitor settings.
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Worker pool settings.
    #[serde(default)]
    pub pool: PoolConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            resources: Default::default(),
            converge: Default::default(),
            monitor: Default::default(),
            pool: Default::default(),
        }
    }
}

impl Config {
    /// Validates the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.prefix.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "prefix",
                reason: "cannot be empty",
            });
        }

        if self.converge.create_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                name: "converge.create_attempts",
                reason: "cannot be zero",
            });
        }

        if self.converge.disable_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                name: "converge.disable_attempts",
                reason: "cannot be zero",
            });
        }

        if self.converge.delete_initial_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                name: "converge.delete_initial_interval_secs",
                reason: "cannot be zero",
            });
        }

        if self.converge.delete_max_interval_secs < self.converge.delete_initial_interval_secs {
            return Err(ConfigError::InvalidValue {
                name: "converge.delete_max_interval_secs",
                reason: "cannot be less than `converge.delete_initial_interval_secs`",
            });
        }

        if self.monitor.max_log_pages == 0 {
            return Err(ConfigError::InvalidValue {
                name: "monitor.max_log_pages",
                reason: "cannot be zero",
            });
        }

        if self.monitor.journal.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "monitor.journal",
                reason: "cannot be empty",
            });
        }

        if self.pool.workers == 0 {
            return Err(ConfigError::InvalidValue {
                name: "pool.workers",
                reason: "cannot be zero",
            });
        }

        Ok(())
    }

    /// Reads a configuration file from the specified path.
    pub fn read_config(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Writes the configuration to the specified path.
    pub fn write_config(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let path = path.as_ref();
        let data = toml::to_string(self)?;
        std::fs::write(path, data).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Default prefix function for serde.
fn default_prefix() -> String {
    String::from(DEFAULT_PREFIX)
}

/// Default create attempts function for serde.
fn default_create_attempts() -> usize {
    DEFAULT_CREATE_ATTEMPTS
}

/// Default converge interval function for serde.
fn default_converge_interval_secs() -> u64 {
    DEFAULT_CONVERGE_INTERVAL_SECS
}

/// Default disable attempts function for serde.
fn default_disable_attempts() -> usize {
    DEFAULT_DISABLE_ATTEMPTS
}

/// Default initial delete interval function for serde.
fn default_delete_initial_interval_secs() -> u64 {
    DEFAULT_DELETE_INITIAL_INTERVAL_SECS
}

/// Default delete interval ceiling function for serde.
fn default_delete_max_interval_secs() -> u64 {
    DEFAULT_DELETE_MAX_INTERVAL_SECS
}

/// Default poll interval function for serde.
fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

/// Default log group function for serde.
fn default_log_group() -> String {
    String::from(DEFAULT_LOG_GROUP)
}

/// Default max log pages function for serde.
fn default_max_log_pages() -> usize {
    DEFAULT_MAX_LOG_PAGES
}

/// Default output directory function for serde.
fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

/// Default journal function for serde.
fn default_journal() -> String {
    String::from(DEFAULT_JOURNAL)
}

/// Default workers function for serde.
fn default_workers() -> usize {
    DEFAULT_WORKERS
}

/// Default shutdown grace function for serde.
fn default_shutdown_grace_secs() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.prefix, "batchwright");
        assert_eq!(config.monitor.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.monitor.log_group, "/batch/job");
        assert_eq!(config.monitor.max_log_pages, 10_000);
        assert_eq!(config.monitor.journal_path(), PathBuf::from("./jobstate.log"));
        assert_eq!(config.converge.create_attempts, 3);
        assert_eq!(config.converge.interval(), Duration::from_secs(2));
        assert_eq!(config.converge.disable_attempts, 5);
        assert_eq!(config.converge.delete_max_interval(), Duration::from_secs(32));
        assert_eq!(config.pool.workers, 2);
        assert_eq!(config.pool.shutdown_grace(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_file_is_default() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_partial_sections() {
        let config: Config = toml::from_str(
            r#"
prefix = "run-42"

[resources]
job_queue = "NULL"
compute_environment = "arn:aws:batch:us-west-2:1:compute-environment/shared"

[monitor]
poll_interval_secs = 1
"#,
        )
        .unwrap();

        assert_eq!(config.prefix, "run-42");
        assert_eq!(config.monitor.poll_interval_secs, 1);
        assert_eq!(config.monitor.log_group, "/batch/job");
        assert_eq!(config.pool, PoolConfig::default());
        assert_eq!(
            ResourceSource::parse(config.resources.compute_environment.as_deref()),
            ResourceSource::Existing(
                "arn:aws:batch:us-west-2:1:compute-environment/shared".to_string()
            )
        );
        assert_eq!(
            ResourceSource::parse(config.resources.job_queue.as_deref()),
            ResourceSource::Create(None)
        );
        assert_eq!(
            ResourceSource::parse(config.resources.job_definition.as_deref()),
            ResourceSource::Create(None)
        );
        assert_eq!(
            ResourceSource::parse(Some("specs/definition.json")),
            ResourceSource::Create(Some(PathBuf::from("specs/definition.json")))
        );
    }

    #[test]
    fn test_bucket_sources() {
        let config: Config = toml::from_str("[resources]\nbucket = \"NULL\"\n").unwrap();
        assert_eq!(
            BucketSource::parse(config.resources.bucket.as_deref()),
            Some(BucketSource::Create)
        );
        assert_eq!(
            BucketSource::parse(Some("s3://shared-inputs/")),
            Some(BucketSource::Existing("shared-inputs".to_string()))
        );
        assert_eq!(BucketSource::parse(None), None);
        assert_eq!(
            BucketSource::parse(Config::default().resources.bucket.as_deref()),
            None
        );
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        assert!(toml::from_str::<Config>("[pool]\nthreads = 4\n").is_err());
    }

    #[test]
    fn test_validate_zero_workers() {
        let config = Config {
            pool: PoolConfig {
                workers: 0,
                ..Default::default()
            },
            ..Default::default()
        };

        assert_eq!(
            config.validate().unwrap_err().to_string(),
            "configuration value `pool.workers` cannot be zero"
        );
    }

    #[test]
    fn test_validate_delete_ceiling() {
        let config = Config {
            converge: ConvergeConfig {
                delete_initial_interval_secs: 8,
                delete_max_interval_secs: 4,
                ..Default::default()
            },
            ..Default::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batchwright.toml");
        let mut config = Config::default();
        config.prefix = "nightly".to_string();
        config.resources.job_definition = Some("definition.json".to_string());
        config.write_config(&path).unwrap();

        assert_eq!(Config::read_config(&path).unwrap(), config);
    }
}
