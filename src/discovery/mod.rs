pub mod preferences;

pub use preferences::{JsonFileStore, MemoryStore, PreferenceStore, LAST_DEVICE_KEY};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::transport::PortInfo;

/// One enumerated knob candidate, with stable identity across rescans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub id: Uuid,
    pub port: PortInfo,
    pub last_seen: DateTime<Utc>,
}

impl DiscoveredDevice {
    fn from_port(port: PortInfo) -> Self {
        Self {
            id: Uuid::new_v4(),
            port,
            last_seen: Utc::now(),
        }
    }
}

/// Registry of devices seen during port scans. Entries keep their `Uuid`
/// across rescans (keyed by port path) so the UI can track devices while
/// they come and go.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<DiscoveredDevice>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a fresh scan in: update known entries, add new ones, drop those
    /// no longer present.
    pub fn update(&mut self, ports: Vec<PortInfo>) {
        self.devices.retain(|d| ports.iter().any(|p| p.path == d.port.path));
        for port in ports {
            if let Some(existing) = self.devices.iter_mut().find(|d| d.port.path == port.path) {
                existing.port = port;
                existing.last_seen = Utc::now();
            } else {
                self.devices.push(DiscoveredDevice::from_port(port));
            }
        }
    }

    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.devices.clone()
    }
}

/// Auto-connect port selection.
///
/// Only ports exposing a device identifier are candidates. The port whose
/// identifier matches the remembered one wins; with no match the choice is
/// left to the user and `None` is returned.
pub fn select_port<'a>(ports: &'a [PortInfo], preferred: Option<&str>) -> Option<&'a PortInfo> {
    let preferred = preferred?;
    ports
        .iter()
        .filter(|p| p.device_identifier().is_some())
        .find(|p| p.device_identifier() == Some(preferred))
}
