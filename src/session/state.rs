use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::TelemetrySample;

/// Connection lifecycle phase.
///
/// `Connecting` always resolves to `Connected` or `Disconnected`; `Degraded`
/// (the device stopped answering, or never answered after the grace period)
/// is only reachable from an established connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
    Reconnecting,
}

/// Point-in-time view of the session, published over a watch channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub phase: Phase,
    /// True once a classified line has arrived and the liveness window has
    /// not since elapsed. Distinguishes the pre-probe `Connected` window
    /// from an actually responsive device.
    pub responding: bool,
    pub port: Option<String>,
    pub baud: Option<u32>,
    pub reconnect_attempts: u32,
    pub last_valid_response_at: Option<DateTime<Utc>>,
    /// Merged telemetry; partial inbound samples update fields in place.
    pub telemetry: TelemetrySample,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            phase: Phase::Disconnected,
            responding: false,
            port: None,
            baud: None,
            reconnect_attempts: 0,
            last_valid_response_at: None,
            telemetry: TelemetrySample::default(),
        }
    }
}
