//! Persistence for the single remembered device identifier.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

/// Storage key for the identifier of the last successfully connected device.
pub const LAST_DEVICE_KEY: &str = "last-device-identifier";

/// Where auto-connect remembers the preferred device between runs.
pub trait PreferenceStore: Send {
    fn load_last_device(&self) -> Option<String>;
    fn save_last_device(&mut self, identifier: &str);
}

/// JSON-file-backed store. Load/save failures are logged and swallowed;
/// losing the preference only costs the user one manual port pick.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_map(&self) -> HashMap<String, String> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                log::warn!("Ignoring malformed preference file {:?}: {}", self.path, e);
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        }
    }
}

impl PreferenceStore for JsonFileStore {
    fn load_last_device(&self) -> Option<String> {
        self.read_map().get(LAST_DEVICE_KEY).cloned()
    }

    fn save_last_device(&mut self, identifier: &str) {
        let mut map = self.read_map();
        map.insert(LAST_DEVICE_KEY.to_string(), identifier.to_string());
        match serde_json::to_string_pretty(&map) {
            Ok(json) => {
                if let Err(e) = fs::write(&self.path, json) {
                    log::warn!("Failed to write preference file {:?}: {}", self.path, e);
                }
            }
            Err(e) => log::warn!("Failed to serialize preferences: {}", e),
        }
    }
}

/// In-memory store for tests and sessions that should not persist anything.
#[derive(Debug, Default)]
pub struct MemoryStore {
    last_device: Option<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_last_device(identifier: &str) -> Self {
        Self {
            last_device: Some(identifier.to_string()),
        }
    }
}

impl PreferenceStore for MemoryStore {
    fn load_last_device(&self) -> Option<String> {
        self.last_device.clone()
    }

    fn save_last_device(&mut self, identifier: &str) {
        self.last_device = Some(identifier.to_string());
    }
}
