use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::DispatchConfig;

/// One event from the daemon's event stream.
///
/// `id` is assigned by the daemon and is monotonically increasing; the
/// dispatcher only ever tracks the highest id it has consumed. `data` is an
/// opaque payload — this crate looks at it solely to extract a subject id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonEvent {
    pub id: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl DaemonEvent {
    pub fn class(&self) -> EventClass {
        EventClass::from_type(&self.event_type)
    }

    /// Opaque identifier for the entity the event is about, used as half of
    /// the notification-cooldown key. Falls back to the event type so
    /// subject-less events still cooldown as a group.
    pub fn subject_id(&self) -> String {
        for key in ["folder", "device", "id"] {
            if let Some(s) = self.data.get(key).and_then(|v| v.as_str()) {
                if !s.is_empty() {
                    return s.to_string();
                }
            }
        }
        self.event_type.clone()
    }
}

/// Cache tags the UI's read-state is keyed by. Every event maps to a fixed
/// set of tags; invalidation is unconditional (never suppressed by the
/// notification cooldown).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CacheTag {
    FolderStatus,
    Connections,
    Config,
    Pending,
    SystemStatus,
}

/// Sink for cache invalidation, implemented by the UI's query layer.
pub trait CacheSink: Send + Sync {
    fn invalidate(&self, tags: &[CacheTag]);
}

/// Broad classification of daemon event types. Unknown types land in
/// `Other` and still invalidate the system-status cache so a daemon upgrade
/// that adds event types cannot leave the UI stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    DeviceConnected,
    DeviceDisconnected,
    FolderCompletion,
    FolderErrors,
    ConfigSaved,
    StateChanged,
    PendingDevices,
    PendingFolders,
    Other,
}

impl EventClass {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "DeviceConnected" => EventClass::DeviceConnected,
            "DeviceDisconnected" => EventClass::DeviceDisconnected,
            "FolderCompletion" => EventClass::FolderCompletion,
            "FolderErrors" => EventClass::FolderErrors,
            "ConfigSaved" => EventClass::ConfigSaved,
            "StateChanged" => EventClass::StateChanged,
            "PendingDevicesChanged" => EventClass::PendingDevices,
            "PendingFoldersChanged" => EventClass::PendingFolders,
            _ => EventClass::Other,
        }
    }

    /// Static event → cache-tag mapping.
    pub fn cache_tags(&self) -> &'static [CacheTag] {
        match self {
            EventClass::DeviceConnected | EventClass::DeviceDisconnected => {
                &[CacheTag::Connections]
            }
            EventClass::FolderCompletion | EventClass::FolderErrors => &[CacheTag::FolderStatus],
            EventClass::ConfigSaved => &[CacheTag::Config],
            EventClass::StateChanged => &[CacheTag::FolderStatus, CacheTag::SystemStatus],
            EventClass::PendingDevices | EventClass::PendingFolders => &[CacheTag::Pending],
            EventClass::Other => &[CacheTag::SystemStatus],
        }
    }

    /// Whether this class produces a user-visible notification at all.
    /// `StateChanged` and unknown types are far too chatty to surface.
    pub fn notifies(&self) -> bool {
        !matches!(self, EventClass::StateChanged | EventClass::Other)
    }

    /// Per-class notification cooldown window.
    pub fn cooldown(&self, cfg: &DispatchConfig) -> Duration {
        let secs = match self {
            EventClass::DeviceConnected | EventClass::DeviceDisconnected => {
                cfg.device_cooldown_secs
            }
            EventClass::FolderCompletion | EventClass::FolderErrors => cfg.folder_cooldown_secs,
            EventClass::ConfigSaved => cfg.config_cooldown_secs,
            EventClass::PendingDevices | EventClass::PendingFolders => cfg.pending_cooldown_secs,
            EventClass::StateChanged | EventClass::Other => cfg.folder_cooldown_secs,
        };
        Duration::from_secs(secs)
    }
}
