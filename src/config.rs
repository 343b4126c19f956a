//! Process configuration
//!
//! Loaded from an optional YAML file; every field has a default so an empty
//! file (or no file) yields a working configuration. Command-line flags are
//! applied on top by the binary.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::kind::ResourceKind;
use crate::persister::ApplyStrategy;
use crate::retry::RetryConfig;
use crate::store::{MemoryStore, SledStore, Store};
use crate::supervisor::SupervisorConfig;
use crate::tags::{TagMapper, TagMapping};
use crate::{Error, Result};

/// Default coordinator poll interval in seconds
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Default interval between periodic full refreshes in seconds
pub const DEFAULT_FULL_REFRESH_INTERVAL_SECS: u64 = 3600;

/// Default per-task shutdown timeout in seconds
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;

/// Default number of consecutive rejections before reporting invalid credentials
pub const DEFAULT_REJECTED_THRESHOLD: u32 = 3;

/// Default number of consecutive transport failures before reporting unreachable
pub const DEFAULT_UNREACHABLE_THRESHOLD: u32 = 5;

/// Where entity rows are persisted
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "camelCase")]
pub enum StoreConfig {
    /// Process-local map; lost on exit
    #[default]
    Memory,
    /// Embedded sled database
    Sled {
        /// Database directory
        path: PathBuf,
    },
}

impl StoreConfig {
    /// Open the configured backend
    pub fn open(&self) -> Result<Arc<dyn Store>> {
        match self {
            Self::Memory => Ok(Arc::new(MemoryStore::new())),
            Self::Sled { path } => Ok(Arc::new(SledStore::open(path)?)),
        }
    }
}

fn default_kinds() -> Vec<String> {
    ResourceKind::ALL.iter().map(|k| k.plural().to_string()).collect()
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_full_refresh_interval() -> u64 {
    DEFAULT_FULL_REFRESH_INTERVAL_SECS
}

fn default_shutdown_timeout() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_SECS
}

fn default_rejected_threshold() -> u32 {
    DEFAULT_REJECTED_THRESHOLD
}

fn default_unreachable_threshold() -> u32 {
    DEFAULT_UNREACHABLE_THRESHOLD
}

fn default_fetch_retry() -> RetryConfig {
    RetryConfig::with_max_attempts(3)
}

fn default_page_size() -> u32 {
    crate::collector::DEFAULT_PAGE_SIZE
}

/// Top-level configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Watched kinds by plural or kind name (e.g. `pods` or `Pod`)
    #[serde(default = "default_kinds")]
    pub kinds: Vec<String>,
    /// Coordinator poll interval
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Interval between periodic full refreshes
    #[serde(default = "default_full_refresh_interval")]
    pub full_refresh_interval_secs: u64,
    /// Per-task shutdown timeout
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    /// Apply strategy
    #[serde(default)]
    pub strategy: ApplyStrategy,
    /// Consecutive rejections before reporting invalid credentials
    #[serde(default = "default_rejected_threshold")]
    pub rejected_threshold: u32,
    /// Consecutive transport failures before reporting unreachable
    #[serde(default = "default_unreachable_threshold")]
    pub unreachable_threshold: u32,
    /// Store backend
    #[serde(default)]
    pub store: StoreConfig,
    /// Bounded retry for list and correlated fetches
    #[serde(default = "default_fetch_retry")]
    pub fetch_retry: RetryConfig,
    /// Reconnect backoff for watch workers (normally unbounded)
    #[serde(default)]
    pub watch_backoff: RetryConfig,
    /// List page size
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Label to tag rules
    #[serde(default)]
    pub tag_mappings: Vec<TagMapping>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            kinds: default_kinds(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            full_refresh_interval_secs: DEFAULT_FULL_REFRESH_INTERVAL_SECS,
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            strategy: ApplyStrategy::default(),
            rejected_threshold: DEFAULT_REJECTED_THRESHOLD,
            unreachable_threshold: DEFAULT_UNREACHABLE_THRESHOLD,
            store: StoreConfig::default(),
            fetch_retry: default_fetch_retry(),
            watch_backoff: RetryConfig::default(),
            page_size: default_page_size(),
            tag_mappings: Vec::new(),
        }
    }
}

impl SyncConfig {
    /// Parse and validate YAML
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_yaml(&content)
    }

    /// Check every field that serde cannot
    pub fn validate(&self) -> Result<()> {
        self.watched_kinds()?;
        if self.poll_interval_secs == 0 {
            return Err(Error::config("pollIntervalSecs must be greater than zero"));
        }
        if self.full_refresh_interval_secs < self.poll_interval_secs {
            return Err(Error::config(
                "fullRefreshIntervalSecs must not be shorter than pollIntervalSecs",
            ));
        }
        if self.rejected_threshold == 0 || self.unreachable_threshold == 0 {
            return Err(Error::config("thresholds must be greater than zero"));
        }
        if self.page_size == 0 {
            return Err(Error::config("pageSize must be greater than zero"));
        }
        let retries = [
            ("fetchRetry", &self.fetch_retry),
            ("watchBackoff", &self.watch_backoff),
        ];
        for (name, retry) in retries {
            if retry.backoff_multiplier < 1.0 {
                return Err(Error::config(format!("{name}.backoffMultiplier must be at least 1.0")));
            }
            if retry.initial_delay_ms > retry.max_delay_ms {
                return Err(Error::config(format!(
                    "{name}.initialDelayMs must not exceed maxDelayMs"
                )));
            }
        }
        if let StoreConfig::Sled { path } = &self.store {
            if path.as_os_str().is_empty() {
                return Err(Error::config("sled store requires a path"));
            }
        }
        Ok(())
    }

    /// Watched kinds, deduplicated, in collection order
    pub fn watched_kinds(&self) -> Result<Vec<ResourceKind>> {
        if self.kinds.is_empty() {
            return Err(Error::config("at least one kind must be watched"));
        }
        let mut kinds = self
            .kinds
            .iter()
            .map(|name| name.parse::<ResourceKind>())
            .collect::<Result<Vec<_>>>()?;
        kinds.sort();
        kinds.dedup();
        Ok(kinds)
    }

    /// Tag registry built from the configured rules
    pub fn tag_mapper(&self) -> TagMapper {
        TagMapper::new(self.tag_mappings.clone())
    }

    /// Supervisor settings
    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            full_refresh_interval: Duration::from_secs(self.full_refresh_interval_secs),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            rejected_threshold: self.rejected_threshold,
            unreachable_threshold: self.unreachable_threshold,
            backoff: self.watch_backoff.clone(),
        }
    }
}
