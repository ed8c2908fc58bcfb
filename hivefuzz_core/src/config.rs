use crate::corpus::DEFAULT_FIXED_FAILURE_GRACE_SECS;
use crate::executor::DEFAULT_MAX_CHOICES;
use crate::storage::{Database, DirectoryStore, InMemoryStore, StoreError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    #[serde(default = "default_random_target_probability")]
    pub random_target_probability: f64,
    #[serde(default = "default_shrink_budget_secs")]
    pub shrink_budget_secs: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_max_choices")]
    pub max_choices: usize,
    /// A target whose first this-many executions are all invalid or overrun is
    /// reported as a setup error.
    #[serde(default = "default_setup_error_threshold")]
    pub setup_error_threshold: u64,
    #[serde(default = "default_fixed_failure_grace_secs")]
    pub fixed_failure_grace_secs: u64,
}

pub fn default_batch_size() -> u64 {
    100
}
pub fn default_random_target_probability() -> f64 {
    0.01
}
pub fn default_shrink_budget_secs() -> u64 {
    60 * 60
}
pub fn default_heartbeat_secs() -> u64 {
    60
}
fn default_max_choices() -> usize {
    DEFAULT_MAX_CHOICES
}
pub fn default_setup_error_threshold() -> u64 {
    1000
}
fn default_fixed_failure_grace_secs() -> u64 {
    DEFAULT_FIXED_FAILURE_GRACE_SECS
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            random_target_probability: default_random_target_probability(),
            shrink_budget_secs: default_shrink_budget_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            max_choices: default_max_choices(),
            setup_error_threshold: default_setup_error_threshold(),
            fixed_failure_grace_secs: default_fixed_failure_grace_secs(),
        }
    }
}

impl FuzzerSettings {
    pub fn shrink_budget(&self) -> Duration {
        Duration::from_secs(self.shrink_budget_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct HubSettings {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_rebalance_secs")]
    pub rebalance_secs: u64,
}

pub fn default_workers() -> usize {
    1
}
pub fn default_rebalance_secs() -> u64 {
    60
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            rebalance_secs: default_rebalance_secs(),
        }
    }
}

impl HubSettings {
    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_secs(self.rebalance_secs)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StoreConfig {
    Directory { path: PathBuf },
    InMemory,
}

impl StoreConfig {
    pub fn open(&self) -> Result<Arc<dyn Database>, StoreError> {
        match self {
            StoreConfig::Directory { path } => Ok(Arc::new(DirectoryStore::new(path.clone())?)),
            StoreConfig::InMemory => Ok(Arc::new(InMemoryStore::new())),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct HivefuzzConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub hub: HubSettings,
    #[serde(default)]
    pub store: Option<StoreConfig>,
}

impl HivefuzzConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: HivefuzzConfig =
            toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = self.fuzzer.random_target_probability;
        if !(0.0..=1.0).contains(&p) {
            return Err(ConfigError::Invalid(format!(
                "random-target-probability must be within [0, 1], got {p}"
            )));
        }
        if self.fuzzer.batch_size == 0 {
            return Err(ConfigError::Invalid("batch-size must be positive".into()));
        }
        if self.hub.workers == 0 {
            return Err(ConfigError::Invalid("workers must be positive".into()));
        }
        Ok(())
    }

    /// Opens the configured store. Fuzzing cannot start without one.
    pub fn open_store(&self) -> Result<Arc<dyn Database>, StoreError> {
        self.store
            .as_ref()
            .ok_or(StoreError::NotConfigured)?
            .open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_a_full_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[fuzzer]
batch-size = 50
shrink-budget-secs = 5

[hub]
workers = 3

[store.directory]
path = "/tmp/hivefuzz-db"
"#
        )
        .unwrap();
        let config = HivefuzzConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.fuzzer.batch_size, 50);
        assert_eq!(config.fuzzer.shrink_budget(), Duration::from_secs(5));
        assert_eq!(config.fuzzer.heartbeat_secs, default_heartbeat_secs());
        assert_eq!(config.hub.workers, 3);
        assert_eq!(config.hub.rebalance_secs, 60);
        assert_eq!(
            config.store,
            Some(StoreConfig::Directory {
                path: PathBuf::from("/tmp/hivefuzz-db")
            })
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result: Result<HivefuzzConfig, _> = toml::from_str("[fuzzer]\nbatchsize = 1\n");
        assert!(result.is_err());
    }

    #[test]
    fn in_memory_store_and_missing_store() {
        let config: HivefuzzConfig = toml::from_str("store = \"in-memory\"\n").unwrap();
        assert_eq!(config.store, Some(StoreConfig::InMemory));
        assert!(config.open_store().is_ok());

        let config = HivefuzzConfig::default();
        assert!(matches!(
            config.open_store(),
            Err(StoreError::NotConfigured)
        ));
    }

    #[test]
    fn out_of_range_probability_is_invalid() {
        let mut config = HivefuzzConfig::default();
        config.fuzzer.random_target_probability = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
