use std::fs;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Connection details for the daemon's local REST API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DaemonConfig {
    pub host: String,
    pub port: u16,
    pub api_key: String,
}

impl DaemonConfig {
    /// Try to read the API key from the daemon's own config file.
    /// Supports both Linux/macOS and Windows config paths.
    fn read_api_key() -> Option<String> {
        let mut paths = Vec::new();

        if let Ok(home) = std::env::var("HOME") {
            paths.push(format!("{home}/.local/state/syncthing/config.xml"));
            paths.push(format!("{home}/.config/syncthing/config.xml"));
        }

        #[cfg(target_os = "windows")]
        {
            if let Ok(local_app_data) = std::env::var("LOCALAPPDATA") {
                paths.push(format!("{local_app_data}\\Syncthing\\config.xml"));
            }
            if let Ok(user_profile) = std::env::var("USERPROFILE") {
                paths.push(format!(
                    "{user_profile}\\AppData\\Local\\Syncthing\\config.xml"
                ));
            }
            if let Ok(app_data) = std::env::var("APPDATA") {
                paths.push(format!("{app_data}\\Syncthing\\config.xml"));
            }
        }

        for path in &paths {
            if let Ok(content) = fs::read_to_string(path) {
                if let Some(start) = content.find("<apikey>") {
                    if let Some(end) = content[start..].find("</apikey>") {
                        let key = &content[start + 8..start + end];
                        if !key.is_empty() {
                            return Some(key.to_string());
                        }
                    }
                }
            }
        }
        None
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            api_key: Self::read_api_key().unwrap_or_else(|| "no-api-key".to_string()),
            port: 8384,
            host: "127.0.0.1".to_string(),
        }
    }
}

/// Bounded-retry tunables for a single guarded operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit stays open before allowing a trial call.
    pub open_cooldown_secs: u64,
}

impl BreakerConfig {
    pub fn open_cooldown(&self) -> Duration {
        Duration::from_secs(self.open_cooldown_secs)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_cooldown_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HealthConfig {
    /// Hard deadline for a single probe run; exceeding it counts as a failure.
    pub probe_timeout_secs: u64,
    /// Consecutive failures at which a critical check raises its one alert.
    pub alert_threshold: u32,
    /// Interval used by checks registered without an explicit interval.
    pub default_interval_secs: u64,
}

impl HealthConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_timeout_secs: 10,
            alert_threshold: 3,
            default_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RecoveryConfig {
    /// How often the orchestrator inspects the health snapshot.
    pub tick_interval_secs: u64,
    /// Initial per-strategy cooldown between recovery attempts.
    pub base_cooldown_secs: u64,
    /// Upper bound for the doubled cooldown after repeated strategy failures.
    pub cooldown_cap_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 15,
            base_cooldown_secs: 60,
            cooldown_cap_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DispatchConfig {
    /// Max events requested per long-poll.
    pub poll_limit: u32,
    /// Server-side hold time for the long-poll request.
    pub poll_timeout_secs: u32,
    /// Wait between polls after an empty result or expected transport noise.
    pub idle_delay_ms: u64,
    /// Notification cooldown for device connect/disconnect, per device.
    pub device_cooldown_secs: u64,
    /// Notification cooldown for folder completion/error, per folder.
    pub folder_cooldown_secs: u64,
    /// Notification cooldown for config-saved notices.
    pub config_cooldown_secs: u64,
    /// Notification cooldown for pending device/folder requests.
    pub pending_cooldown_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_limit: 50,
            poll_timeout_secs: 60,
            idle_delay_ms: 1_000,
            device_cooldown_secs: 60,
            folder_cooldown_secs: 30,
            config_cooldown_secs: 30,
            pending_cooldown_secs: 300,
        }
    }
}

/// Full externally-supplied configuration for the resilience core.
/// Nothing in the engine hardcodes these values; the shell deserializes this
/// from its settings store and hands it to [`crate::engine::ResilienceEngine`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CoreConfig {
    pub daemon: DaemonConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub health: HealthConfig,
    pub recovery: RecoveryConfig,
    pub dispatch: DispatchConfig,
}
