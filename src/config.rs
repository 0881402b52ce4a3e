use crate::backoff::{BackoffError, BackoffPolicy};
use crate::client::{ClusterConfig, ClusterConfigError};
use crate::logging::{JournalLimits, LogLevel, LoggingError};
use crate::requeue::{RequeuePolicy, DEFAULT_REQUEUE_ANNOTATION_KEY};
use crate::status::STATUS_QUEUE_CAPACITY;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

type ConfigMap = Map<String, Value>;

/// Runtime settings of the sync binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    pub cluster: ClusterSettings,
    pub backoff: BackoffSettings,
    pub requeue_annotation_key: String,
    pub status_queue_capacity: usize,
    pub log: LogSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterSettings {
    pub server: Option<String>,
    pub token_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    pub kubeconfig: Option<PathBuf>,
    pub insecure: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffSettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub factor: f64,
    /// Upper bound of every delay; 0 is only valid with `initial_delay_ms: 0`.
    pub cap_ms: u64,
    pub jitter: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogSettings {
    pub level: String,
    pub journal_max_bytes: usize,
    pub journal_max_files: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cluster: ClusterSettings::default(),
            backoff: BackoffSettings::default(),
            requeue_annotation_key: DEFAULT_REQUEUE_ANNOTATION_KEY.to_string(),
            status_queue_capacity: STATUS_QUEUE_CAPACITY,
            log: LogSettings::default(),
        }
    }
}

impl Default for BackoffSettings {
    fn default() -> Self {
        let policy = BackoffPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_delay_ms: millis(policy.initial_delay),
            factor: policy.factor,
            cap_ms: millis(policy.cap),
            jitter: policy.jitter,
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        let limits = JournalLimits::default();
        Self {
            level: LogLevel::Info.as_filter().to_string(),
            journal_max_bytes: limits.file_bytes,
            journal_max_files: limits.files,
        }
    }
}

impl SyncConfig {
    /// Loads a YAML or JSON document and merges it over the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Parses a document (YAML, or JSON as its subset) and merges it over the defaults.
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        if contents.trim().is_empty() {
            return Self::from_overrides(&ConfigMap::new());
        }
        let document: serde_yaml::Value =
            serde_yaml::from_str(contents).map_err(|err| ConfigError::Parse(err.to_string()))?;
        let overrides = match serde_json::to_value(document)
            .map_err(|err| ConfigError::Parse(err.to_string()))?
        {
            Value::Null => ConfigMap::new(),
            Value::Object(map) => map,
            _ => return Err(ConfigError::Parse("config root must be a mapping".into())),
        };
        Self::from_overrides(&overrides)
    }

    /// Applies `overrides` key by key over the defaults and validates the result.
    pub fn from_overrides(overrides: &ConfigMap) -> Result<Self, ConfigError> {
        let mut merged = match serde_json::to_value(Self::default())
            .map_err(|err| ConfigError::Parse(err.to_string()))?
        {
            Value::Object(map) => map,
            _ => ConfigMap::new(),
        };
        let mut changed = Vec::new();
        merge_map(&mut merged, overrides, "", &mut changed);
        if !changed.is_empty() {
            tracing::debug!(keys = ?changed, "config overrides applied");
        }
        let config: Self = serde_json::from_value(Value::Object(merged))
            .map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.backoff_policy().validate()?;
        if self.requeue_annotation_key.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "requeue_annotation_key must not be empty".into(),
            ));
        }
        if self.status_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "status_queue_capacity must be positive".into(),
            ));
        }
        if self.log.journal_max_bytes == 0 {
            return Err(ConfigError::Invalid(
                "log.journal_max_bytes must be positive".into(),
            ));
        }
        if self.log.journal_max_files == 0 {
            return Err(ConfigError::Invalid(
                "log.journal_max_files must be positive".into(),
            ));
        }
        self.log_level()?;
        Ok(())
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.backoff.max_attempts,
            initial_delay: Duration::from_millis(self.backoff.initial_delay_ms),
            factor: self.backoff.factor,
            cap: Duration::from_millis(self.backoff.cap_ms),
            jitter: self.backoff.jitter,
        }
    }

    pub fn requeue_policy(&self) -> RequeuePolicy {
        RequeuePolicy::new(self.requeue_annotation_key.trim())
    }

    pub fn log_level(&self) -> Result<LogLevel, ConfigError> {
        Ok(self.log.level.parse()?)
    }

    pub fn journal_limits(&self) -> JournalLimits {
        JournalLimits {
            file_bytes: self.log.journal_max_bytes,
            files: self.log.journal_max_files,
        }
    }
}

impl ClusterSettings {
    /// Connection settings from the kubeconfig or explicit server, if any is configured.
    ///
    /// Returns `None` when neither is set so callers can fall back to the
    /// in-cluster service account.
    pub fn cluster_config(&self) -> Result<Option<ClusterConfig>, ConfigError> {
        if let Some(kubeconfig) = &self.kubeconfig {
            let mut config = ClusterConfig::from_kubeconfig(kubeconfig)?;
            if let Some(server) = &self.server {
                config.server = server.clone();
            }
            config.insecure_skip_tls_verify |= self.insecure;
            return Ok(Some(config));
        }
        let Some(server) = &self.server else {
            return Ok(None);
        };
        let mut config = ClusterConfig::new(server.clone());
        config.insecure_skip_tls_verify = self.insecure;
        if let Some(path) = &self.token_file {
            let token = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            config = config.with_bearer_token(token.trim());
        }
        if let Some(path) = &self.ca_file {
            let pem = fs::read(path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            config = config.with_ca_pem(pem);
        }
        Ok(Some(config))
    }
}

/// Recursively merges `patch` into `base`, recording the dotted keys that changed.
fn merge_map(base: &mut ConfigMap, patch: &ConfigMap, prefix: &str, changed: &mut Vec<String>) {
    for (key, value) in patch {
        // Null keeps the default, so empty sections like `cluster:` are accepted.
        if value.is_null() {
            continue;
        }
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        let entry = base.entry(key.clone()).or_insert(Value::Null);
        match (entry, value) {
            (Value::Object(nested), Value::Object(patch)) => {
                merge_map(nested, patch, &path, changed);
            }
            (entry, value) => {
                if entry != value {
                    *entry = value.clone();
                    changed.push(path);
                }
            }
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config document: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("invalid backoff settings: {0}")]
    Backoff(#[from] BackoffError),
    #[error(transparent)]
    Logging(#[from] LoggingError),
    #[error(transparent)]
    Cluster(#[from] ClusterConfigError),
}
