use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::core::exclusions::ExclusionSet;
use crate::core::models::RemotePath;
use crate::core::retry::RetryPolicy;

pub const DEFAULT_CONFIG_PATH: &str = "cloudmig.toml";
const ENV_PREFIX: &str = "CLOUDMIG_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to write configuration to '{}': {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory backing the source account
    pub source_account: PathBuf,
    /// Directory backing the destination account
    pub destination_account: PathBuf,
    /// Folder inside the source account to migrate; empty for the whole account
    pub source_root: String,
    /// Folder inside the destination account that receives the tree
    pub destination_root: String,
    /// Path prefixes, relative to `source_root`, that are never migrated
    pub excluded_paths: Vec<String>,
    pub batch_size: usize,
    pub retry_attempts: u32,
    pub verify_after_transfer: bool,
    /// Compare modification times too when a hash is unavailable
    pub verify_modified_time: bool,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub operation_timeout_secs: u64,
    /// Total retries allowed across the whole run; unlimited when absent
    pub retry_budget: Option<u32>,
    pub progress_file: PathBuf,
    pub report_dir: PathBuf,
    /// Where downloads are staged before upload; system temp dir when absent
    pub staging_dir: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            source_account: PathBuf::new(),
            destination_account: PathBuf::new(),
            source_root: String::new(),
            destination_root: String::new(),
            excluded_paths: Vec::new(),
            batch_size: 50,
            retry_attempts: 3,
            verify_after_transfer: true,
            verify_modified_time: false,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 30_000,
            operation_timeout_secs: 120,
            retry_budget: None,
            progress_file: PathBuf::from("migration_progress.json"),
            report_dir: PathBuf::from("."),
            staging_dir: None,
            log_file: None,
            verbose: false,
            json_logs: false,
        }
    }
}

impl AppConfig {
    /// Layer defaults, the TOML file, `CLOUDMIG_*` environment variables and
    /// finally any CLI overrides, then validate the result.
    ///
    /// A missing config file is not an error; every setting can come from the
    /// environment or the command line.
    pub fn new<T: Serialize>(config_path: &Path, cli_args: Option<&T>) -> Result<Self, ConfigError> {
        let config = Self::load_unchecked(config_path, cli_args)?;
        config.validate()?;
        Ok(config)
    }

    /// Load without validating, for commands such as `status` that only read
    /// the progress file and do not need the account directories.
    pub fn load_unchecked<T: Serialize>(
        config_path: &Path,
        cli_args: Option<&T>,
    ) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(args) = cli_args {
            figment = figment.merge(Serialized::defaults(args));
        }

        Ok(figment.extract().map_err(Box::new)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source_account.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("source_account must be set".into()));
        }
        if self.destination_account.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "destination_account must be set".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "batch_size must be a positive integer".into(),
            ));
        }
        if self.operation_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "operation_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "retry_max_delay_ms ({}) is smaller than retry_base_delay_ms ({})",
                self.retry_max_delay_ms, self.retry_base_delay_ms
            )));
        }
        for prefix in &self.excluded_paths {
            let parsed = RemotePath::parse(prefix.trim());
            if parsed.is_root() {
                return Err(ConfigError::Invalid(format!(
                    "excluded path '{}' would exclude everything",
                    prefix
                )));
            }
            if parsed.segments().iter().any(|s| s == "..") {
                return Err(ConfigError::Invalid(format!(
                    "excluded path '{}' must not contain '..'",
                    prefix
                )));
            }
        }
        for root in [&self.source_root, &self.destination_root] {
            if RemotePath::parse(root).segments().iter().any(|s| s == "..") {
                return Err(ConfigError::Invalid(format!(
                    "root '{}' must not contain '..'",
                    root
                )));
            }
        }
        Ok(())
    }

    pub fn source_root(&self) -> RemotePath {
        RemotePath::parse(self.source_root.trim())
    }

    pub fn destination_root(&self) -> RemotePath {
        RemotePath::parse(self.destination_root.trim())
    }

    pub fn exclusions(&self) -> ExclusionSet {
        ExclusionSet::new(&self.excluded_paths)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retry_attempts: self.retry_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Write this configuration as TOML, e.g. as a starting template.
    pub fn write_toml(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Invalid(format!("cannot serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}
