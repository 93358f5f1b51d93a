//! Configuration system for the Courier pipeline.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/courier/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A value was parsed but is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    queue: QueueFileConfig,
    sync: SyncFileConfig,
    connectivity: ConnectivityFileConfig,
    lifecycle: LifecycleFileConfig,
    storage: StorageFileConfig,
    events: EventsFileConfig,
}

/// `[queue]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct QueueFileConfig {
    capacity: Option<usize>,
}

/// `[sync]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SyncFileConfig {
    max_retries: Option<u32>,
    backoff_base_ms: Option<u64>,
    backoff_cap_secs: Option<u64>,
    write_timeout_secs: Option<u64>,
}

/// `[connectivity]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConnectivityFileConfig {
    debounce_ms: Option<u64>,
    settle_ms: Option<u64>,
}

/// `[lifecycle]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct LifecycleFileConfig {
    resume_budget_ms: Option<u64>,
    suspend_budget_ms: Option<u64>,
    log_capacity: Option<usize>,
}

/// `[storage]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StorageFileConfig {
    data_dir: Option<PathBuf>,
}

/// `[events]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct EventsFileConfig {
    buffer: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Outbound queue settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Entries held per user before the oldest is evicted.
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 100 }
    }
}

/// Sync engine retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Failed attempts before a message is abandoned.
    pub max_retries: u32,
    /// Delay after the zeroth failure; doubles per attempt.
    pub backoff_base: Duration,
    /// Upper bound on any single backoff delay.
    pub backoff_cap: Duration,
    /// Timeout applied to every remote write.
    pub write_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Connectivity classification timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectivityConfig {
    /// Raw events inside this window collapse to the latest one.
    pub debounce: Duration,
    /// How long reachability must hold before `Connecting` becomes `Online`.
    pub settle: Duration,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(1),
            settle: Duration::from_secs(1),
        }
    }
}

/// Lifecycle hook budgets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleConfig {
    /// Target duration of `on_foreground`.
    pub resume_budget: Duration,
    /// Hard bound on `on_background` and `on_terminate`.
    pub suspend_budget: Duration,
    /// Transition records kept for diagnostics.
    pub log_capacity: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            resume_budget: Duration::from_millis(500),
            suspend_budget: Duration::from_secs(2),
            log_capacity: 32,
        }
    }
}

/// Fully resolved pipeline configuration.
#[derive(Debug, Clone)]
pub struct CourierConfig {
    /// Outbound queue settings.
    pub queue: QueueConfig,
    /// Retry policy.
    pub sync: SyncConfig,
    /// Connectivity timing.
    pub connectivity: ConnectivityConfig,
    /// Lifecycle budgets.
    pub lifecycle: LifecycleConfig,
    /// Directory for the persisted queue. `None` means the platform data
    /// directory.
    pub data_dir: Option<PathBuf>,
    /// Buffer size for status observers and inbound message events.
    pub event_buffer: usize,
}

/// Default event buffer size.
const DEFAULT_EVENT_BUFFER: usize = 64;

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            sync: SyncConfig::default(),
            connectivity: ConnectivityConfig::default(),
            lifecycle: LifecycleConfig::default(),
            data_dir: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl CourierConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path
    /// (`~/.config/courier/config.toml`) is tried and silently ignored if
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, or if the resolved values fail [`validate`](Self::validate).
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        let config = Self::resolve(cli, &file);
        config.validate()?;
        Ok(config)
    }

    /// Resolve a `CourierConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let queue = QueueConfig::default();
        let sync = SyncConfig::default();
        let connectivity = ConnectivityConfig::default();
        let lifecycle = LifecycleConfig::default();

        Self {
            queue: QueueConfig {
                capacity: cli
                    .queue_capacity
                    .or(file.queue.capacity)
                    .unwrap_or(queue.capacity),
            },
            sync: SyncConfig {
                max_retries: file.sync.max_retries.unwrap_or(sync.max_retries),
                backoff_base: file
                    .sync
                    .backoff_base_ms
                    .map_or(sync.backoff_base, Duration::from_millis),
                backoff_cap: file
                    .sync
                    .backoff_cap_secs
                    .map_or(sync.backoff_cap, Duration::from_secs),
                write_timeout: file
                    .sync
                    .write_timeout_secs
                    .map_or(sync.write_timeout, Duration::from_secs),
            },
            connectivity: ConnectivityConfig {
                debounce: file
                    .connectivity
                    .debounce_ms
                    .map_or(connectivity.debounce, Duration::from_millis),
                settle: file
                    .connectivity
                    .settle_ms
                    .map_or(connectivity.settle, Duration::from_millis),
            },
            lifecycle: LifecycleConfig {
                resume_budget: file
                    .lifecycle
                    .resume_budget_ms
                    .map_or(lifecycle.resume_budget, Duration::from_millis),
                suspend_budget: file
                    .lifecycle
                    .suspend_budget_ms
                    .map_or(lifecycle.suspend_budget, Duration::from_millis),
                log_capacity: file
                    .lifecycle
                    .log_capacity
                    .unwrap_or(lifecycle.log_capacity),
            },
            data_dir: cli
                .data_dir
                .clone()
                .or_else(|| file.storage.data_dir.clone()),
            event_buffer: file.events.buffer.unwrap_or(DEFAULT_EVENT_BUFFER),
        }
    }

    /// Reject values the pipeline cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.capacity == 0 {
            return Err(ConfigError::Invalid("queue.capacity must be at least 1".into()));
        }
        if self.sync.max_retries == 0 {
            return Err(ConfigError::Invalid("sync.max_retries must be at least 1".into()));
        }
        if self.sync.backoff_cap < self.sync.backoff_base {
            return Err(ConfigError::Invalid(
                "sync.backoff_cap_secs must not be below sync.backoff_base_ms".into(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::Invalid("events.buffer must be at least 1".into()));
        }
        Ok(())
    }

    /// Directory the persisted queue lives in.
    ///
    /// Falls back to `<platform data dir>/courier`, then to the system temp
    /// directory when no data directory is known.
    #[must_use]
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("courier")
        })
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Offline-resilient message delivery demo")]
pub struct CliArgs {
    /// Identity of the signed-in user.
    #[arg(long, default_value = "alice", env = "COURIER_USER")]
    pub user: String,

    /// Chat the demo sends into.
    #[arg(long, default_value = "general")]
    pub chat: String,

    /// Number of messages the demo composes while offline.
    #[arg(long, default_value_t = 3)]
    pub messages: usize,

    /// Directory for the persisted outbound queue.
    #[arg(long, env = "COURIER_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Outbound queue capacity.
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Path to config file (default: `~/.config/courier/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "COURIER_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/courier.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("courier").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
