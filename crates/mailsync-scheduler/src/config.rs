//! Configuration types for the sync scheduler.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{Result, SyncError};

/// Sync scheduler configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncServiceConfig {
    /// Time between reconciliation ticks.
    #[serde(with = "serde_duration_secs")]
    pub poll_interval: Duration,
    /// Minimum pause before the loop is re-entered after a panic. The poll
    /// interval applies when it is longer.
    #[serde(with = "serde_duration_secs")]
    pub restart_delay: Duration,
    /// Work acquisition settings.
    pub scheduling: SchedulingConfig,
    /// Feature flags.
    pub features: FeatureConfig,
    /// CPU admission settings.
    pub admission: AdmissionConfig,
    /// Valkey configuration.
    pub valkey: ValkeyConfig,
    /// Generic task monitor settings.
    pub monitor: MonitorConfig,
}

impl Default for SyncServiceConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            restart_delay: Duration::ZERO,
            scheduling: SchedulingConfig::default(),
            features: FeatureConfig::default(),
            admission: AdmissionConfig::default(),
            valkey: ValkeyConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl SyncServiceConfig {
    /// Load configuration from the default sources.
    ///
    /// Sources are merged in order, later ones winning:
    /// 1. Default values
    /// 2. `mailsync.toml` in the current directory (if present)
    /// 3. Environment variables with the `MAILSYNC_` prefix
    pub fn load() -> Result<Self> {
        Self::from_file("mailsync.toml")
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("MAILSYNC_").split("__"))
            .extract()
            .map_err(|e| SyncError::Config(e.to_string()))
    }

    /// Zone name used to partition the assignment service.
    #[must_use]
    pub fn zone(&self) -> &str {
        self.scheduling.zone.as_deref().unwrap_or("default")
    }
}

/// Work acquisition configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Whether to claim unassigned accounts each tick.
    pub stealing_enabled: bool,
    /// Partition of the assignment service this process talks to.
    pub zone: Option<String>,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            stealing_enabled: true,
            zone: None,
        }
    }
}

/// Feature flags.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Use push-capable event monitors where the provider supports them.
    pub push_notifications: bool,
}

/// CPU admission configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Per-core utilisation above which a core counts as saturated.
    pub cpu_threshold_percent: f32,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            cpu_threshold_percent: 90.0,
        }
    }
}

/// Valkey configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValkeyConfig {
    /// Connection URL.
    pub url: String,
    /// Prefix for every key written by this service.
    pub key_prefix: String,
    /// Maximum pool connections.
    pub max_connections: usize,
}

impl Default for ValkeyConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_owned(),
            key_prefix: "mailsync".to_owned(),
            max_connections: 10,
        }
    }
}

/// Generic task monitor configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Time between sync passes.
    #[serde(with = "serde_duration_secs")]
    pub sync_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(30),
        }
    }
}

/// Serde helper for Duration as seconds.
mod serde_duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
