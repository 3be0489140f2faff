//! Engine configuration, loadable from TOML.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level intent engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentEngineConfig {
    /// Concurrent compile/install attempts per node.
    pub worker_threads: usize,
    /// Work partitioning.
    pub partitions: PartitionsConfig,
    /// Stuck-work recovery.
    pub cleanup: CleanupConfig,
    /// Installation coordinator tuning.
    pub install: InstallConfig,
    /// Compilation limits.
    pub compile: CompileConfig,
    /// Event channel sizing.
    pub events: EventsConfig,
}

impl Default for IntentEngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: 12,
            partitions: PartitionsConfig::default(),
            cleanup: CleanupConfig::default(),
            install: InstallConfig::default(),
            compile: CompileConfig::default(),
            events: EventsConfig::default(),
        }
    }
}

impl IntentEngineConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for malformed TOML and [`ConfigError::Invalid`]
    /// for values the engine cannot run with.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] when the file cannot be read, otherwise as
    /// [`from_toml`](Self::from_toml).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    /// Rejects values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(ConfigError::Invalid("worker_threads must be at least 1".to_string()));
        }
        if self.partitions.count == 0 {
            return Err(ConfigError::Invalid("partitions.count must be at least 1".to_string()));
        }
        if self.compile.max_depth == 0 {
            return Err(ConfigError::Invalid("compile.max_depth must be at least 1".to_string()));
        }
        if self.cleanup.period.is_zero() {
            return Err(ConfigError::Invalid("cleanup.period must be non-zero".to_string()));
        }
        if self.install.confirmation_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "install.confirmation_timeout must be non-zero".to_string(),
            ));
        }
        if self.cleanup.transient_timeout <= self.install.confirmation_timeout.saturating_mul(2) {
            return Err(ConfigError::Invalid(
                "cleanup.transient_timeout must exceed twice install.confirmation_timeout"
                    .to_string(),
            ));
        }
        if self.events.capacity == 0 {
            return Err(ConfigError::Invalid("events.capacity must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Work partitioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionsConfig {
    /// Number of partitions keys are spread over.
    pub count: u16,
}

impl Default for PartitionsConfig {
    fn default() -> Self {
        Self { count: 14 }
    }
}

/// Periodic recovery of stuck or corrupt work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Interval between sweeps.
    #[serde(with = "humantime_serde")]
    pub period: Duration,
    /// Age after which queued work is dispatched again.
    #[serde(with = "humantime_serde")]
    pub pending_timeout: Duration,
    /// Age after which a record stuck in a transient state is recovered. Must
    /// exceed both phases of a replacement, i.e. twice the confirmation timeout.
    #[serde(with = "humantime_serde")]
    pub transient_timeout: Duration,
    /// Corrupt records with fewer errors than this are retried.
    pub retry_threshold: u32,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(5),
            pending_timeout: Duration::from_secs(10),
            transient_timeout: Duration::from_secs(30),
            retry_threshold: 5,
        }
    }
}

/// Installation coordinator tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    /// Time an installer has to confirm an operation.
    #[serde(with = "humantime_serde")]
    pub confirmation_timeout: Duration,
    /// Pause between install and uninstall during make-before-break.
    #[serde(with = "humantime_serde")]
    pub non_disruptive_delay: Duration,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout: Duration::from_secs(10),
            non_disruptive_delay: Duration::ZERO,
        }
    }
}

/// Compilation limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileConfig {
    /// Maximum nesting of compilers producing non-installable intents.
    pub max_depth: usize,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            max_depth: crate::compile::DEFAULT_MAX_DEPTH,
        }
    }
}

/// Event channel sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Messages buffered per subscriber before it starts lagging.
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}
