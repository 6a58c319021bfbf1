// Configuration Management Module
// Handles session-gate.toml loading, defaults, and validation

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use anyhow::{Result, Context};
use tracing::{info, warn};

/// Main subsystem configuration
///
/// Consumed once at construction time; nothing re-reads it at runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub watchdog: WatchdogConfig,

    #[serde(default)]
    pub presence: PresenceConfig,

    #[serde(default)]
    pub access: AccessConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub admission: AdmissionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Idle-timeout feature flag (the absence check is always on)
    #[serde(default)]
    pub idle_timeout_enabled: bool,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_absence_threshold")]
    pub absence_threshold_hours: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    #[serde(default = "default_presence_topic")]
    pub topic: String,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_presence_status")]
    pub status: String,

    /// Records older than this are no longer reported online
    #[serde(default = "default_presence_expiry")]
    pub expiry_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessConfig {
    #[serde(default = "default_login_path")]
    pub login_path: String,

    #[serde(default = "default_free_tier_prefixes")]
    pub free_tier_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_session_record_key")]
    pub session_record_key: String,

    #[serde(default = "default_device_session_key")]
    pub device_session_key: String,

    #[serde(default = "default_remembered_identity_key")]
    pub remembered_identity_key: String,

    #[serde(default = "default_last_visit_key")]
    pub last_visit_key: String,

    /// Minimum spacing between last-visit marker writes driven by activity
    #[serde(default = "default_activity_write_interval")]
    pub activity_write_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Attempts for the idempotent operations (check, release)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_backoff")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

/// Upper bounds that keep chrono durations in range
const MAX_ABSENCE_THRESHOLD_HOURS: u64 = 24 * 365;
const MAX_PRESENCE_EXPIRY_SECS: u64 = 24 * 60 * 60;

// Default value functions
fn default_idle_timeout() -> u64 { 30 * 60 }
fn default_poll_interval() -> u64 { 60 }
fn default_absence_threshold() -> u64 { 48 }
fn default_presence_topic() -> String { "dashboard".to_string() }
fn default_heartbeat_interval() -> u64 { 30 }
fn default_presence_status() -> String { "online".to_string() }
fn default_presence_expiry() -> u64 { 90 }
fn default_login_path() -> String { "/login".to_string() }
fn default_session_record_key() -> String { "session".to_string() }
fn default_device_session_key() -> String { "device_session".to_string() }
fn default_remembered_identity_key() -> String { "remembered_email".to_string() }
fn default_last_visit_key() -> String { "last_visit".to_string() }
fn default_activity_write_interval() -> u64 { 60 }
fn default_max_attempts() -> u32 { 3 }
fn default_base_backoff() -> u64 { 200 }
fn default_max_backoff() -> u64 { 2000 }

fn default_free_tier_prefixes() -> Vec<String> {
    [
        "/",
        "/login",
        "/signup",
        "/dashboard",
        "/addition",
        "/subtraction",
        "/multiplication",
        "/division",
        "/profile",
        "/upgrade",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            idle_timeout_enabled: false,
            idle_timeout_secs: default_idle_timeout(),
            poll_interval_secs: default_poll_interval(),
            absence_threshold_hours: default_absence_threshold(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            topic: default_presence_topic(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            status: default_presence_status(),
            expiry_secs: default_presence_expiry(),
        }
    }
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            login_path: default_login_path(),
            free_tier_prefixes: default_free_tier_prefixes(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            session_record_key: default_session_record_key(),
            device_session_key: default_device_session_key(),
            remembered_identity_key: default_remembered_identity_key(),
            last_visit_key: default_last_visit_key(),
            activity_write_interval_secs: default_activity_write_interval(),
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl WatchdogConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn absence_threshold(&self) -> chrono::Duration {
        chrono::Duration::hours(self.absence_threshold_hours.min(MAX_ABSENCE_THRESHOLD_HOURS) as i64)
    }
}

impl PresenceConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn expiry(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.expiry_secs.min(MAX_PRESENCE_EXPIRY_SECS) as i64)
    }
}

impl StorageConfig {
    pub fn activity_write_interval(&self) -> Duration {
        Duration::from_secs(self.activity_write_interval_secs)
    }
}

impl SessionConfig {
    /// Load configuration from file or use defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            info!("Loading configuration from {}", path.display());
            let contents = std::fs::read_to_string(path)
                .context("Failed to read configuration file")?;

            let config: SessionConfig = toml::from_str(&contents)
                .context("Failed to parse configuration file")?;

            config.validate()?;
            Ok(config)
        } else {
            warn!("Configuration file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        // Validate watchdog timings
        if self.watchdog.idle_timeout_secs == 0 {
            anyhow::bail!("Idle timeout cannot be 0");
        }

        if self.watchdog.poll_interval_secs == 0 {
            anyhow::bail!("Poll interval cannot be 0");
        }

        if self.watchdog.poll_interval_secs >= self.watchdog.idle_timeout_secs {
            anyhow::bail!("Poll interval must be shorter than the idle timeout");
        }

        if self.watchdog.absence_threshold_hours == 0 {
            anyhow::bail!("Absence threshold cannot be 0");
        }

        if self.watchdog.absence_threshold_hours > MAX_ABSENCE_THRESHOLD_HOURS {
            anyhow::bail!(
                "Absence threshold cannot exceed {} hours",
                MAX_ABSENCE_THRESHOLD_HOURS
            );
        }

        // Validate presence
        if self.presence.topic.trim().is_empty() {
            anyhow::bail!("Presence topic cannot be empty");
        }

        if self.presence.heartbeat_interval_secs == 0 {
            anyhow::bail!("Heartbeat interval cannot be 0");
        }

        if self.presence.expiry_secs <= self.presence.heartbeat_interval_secs {
            anyhow::bail!("Presence expiry must be longer than the heartbeat interval");
        }

        if self.presence.expiry_secs > MAX_PRESENCE_EXPIRY_SECS {
            anyhow::bail!("Presence expiry cannot exceed {} seconds", MAX_PRESENCE_EXPIRY_SECS);
        }

        // Validate access policy
        if !self.access.login_path.starts_with('/') {
            anyhow::bail!("Login path must start with '/'");
        }

        if let Some(bad) = self.access.free_tier_prefixes.iter().find(|p| !p.starts_with('/')) {
            anyhow::bail!("Free tier prefix '{}' must start with '/'", bad);
        }

        // Validate storage keys
        let keys = [
            &self.storage.session_record_key,
            &self.storage.device_session_key,
            &self.storage.remembered_identity_key,
            &self.storage.last_visit_key,
        ];
        if keys.iter().any(|k| k.trim().is_empty()) {
            anyhow::bail!("Storage keys cannot be empty");
        }
        for (i, key) in keys.iter().enumerate() {
            if keys[i + 1..].contains(key) {
                anyhow::bail!("Storage key '{}' is used twice", key);
            }
        }

        if self.storage.activity_write_interval_secs == 0 {
            anyhow::bail!("Activity write interval cannot be 0");
        }

        // Validate admission retry
        if self.admission.max_attempts == 0 {
            anyhow::bail!("Admission max attempts must be at least 1");
        }

        if self.admission.base_backoff_ms > self.admission.max_backoff_ms {
            anyhow::bail!("Admission base backoff cannot exceed max backoff");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert!(!config.watchdog.idle_timeout_enabled);
        assert_eq!(config.watchdog.absence_threshold_hours, 48);
        assert_eq!(config.presence.topic, "dashboard");
        assert_eq!(config.access.login_path, "/login");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_poll_must_be_shorter_than_timeout() {
        let mut config = SessionConfig::default();
        config.watchdog.poll_interval_secs = config.watchdog.idle_timeout_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_huge_absence_threshold_rejected_and_clamped() {
        let mut config = SessionConfig::default();
        config.watchdog.absence_threshold_hours = u64::MAX;
        assert!(config.validate().is_err());
        assert_eq!(config.watchdog.absence_threshold(), chrono::Duration::days(365));

        config.watchdog.absence_threshold_hours = 48;
        config.presence.expiry_secs = u64::MAX;
        assert!(config.validate().is_err());
        assert_eq!(config.presence.expiry(), chrono::Duration::days(1));
    }

    #[test]
    fn test_relative_free_prefix_rejected() {
        let mut config = SessionConfig::default();
        config.access.free_tier_prefixes.push("money".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_storage_keys_rejected() {
        let mut config = SessionConfig::default();
        config.storage.last_visit_key = config.storage.session_record_key.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session-gate.toml");
        std::fs::write(
            &path,
            "[watchdog]\nidle_timeout_enabled = true\nidle_timeout_secs = 600\n\n[presence]\ntopic = \"classroom\"\n",
        )
        .unwrap();

        let config = SessionConfig::load(&path).unwrap();
        assert!(config.watchdog.idle_timeout_enabled);
        assert_eq!(config.watchdog.idle_timeout_secs, 600);
        assert_eq!(config.watchdog.poll_interval_secs, 60);
        assert_eq!(config.presence.topic, "classroom");
        assert_eq!(config.access.login_path, "/login");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.storage.session_record_key, "session");
    }
}
