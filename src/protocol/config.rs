use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ProtocolError;

/// Haptic behavior selected for the knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HapticMode {
    None,
    SoftDetents,
    MediumDetents,
    RoughDetents,
    Clockwise,
    Counterclockwise,
    IncreasedTorque,
    Lock,
    Endstops,
    CenterDetent,
    ProportionalControl,
    InertialControl,
    Latch,
}

impl FromStr for HapticMode {
    type Err = ProtocolError;

    /// Parse a kebab-case mode name arriving as free text from the UI
    /// layer. Unknown names fail fast instead of being guessed into a
    /// `set <name>` line the firmware would silently ignore.
    fn from_str(name: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(name.to_string()))
            .map_err(|_| ProtocolError::UnknownMode(name.to_string()))
    }
}

/// Feel applied between the virtual endstops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndstopStyle {
    None,
    Proportional,
    Soft,
    Medium,
    Rough,
    Center,
}

/// Desired device behavior, owned and mutated by the UI layer.
/// The protocol layer only ever serializes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HapticConfig {
    pub mode: HapticMode,
    /// Constant-torque magnitude, used by `IncreasedTorque` and `Lock`.
    pub torque: f64,
    /// Proportional gain or inertia factor.
    pub stiffness: f64,
    /// Setpoint in degrees for `ProportionalControl`.
    pub target_angle: f64,
    /// Lock-to-lock travel in revolutions.
    pub endstop_turns: f64,
    /// Derived: always `-180 * endstop_turns`.
    pub endstop_min_angle: f64,
    /// Derived: always `180 * endstop_turns`.
    pub endstop_max_angle: f64,
    pub endstop_style: EndstopStyle,
    /// Latch at the endstop boundary instead of springing back.
    pub is_sticky: bool,
}

impl HapticConfig {
    pub fn new(mode: HapticMode) -> Self {
        Self {
            mode,
            torque: 0.5,
            stiffness: 1.0,
            target_angle: 0.0,
            endstop_turns: 1.0,
            endstop_min_angle: -180.0,
            endstop_max_angle: 180.0,
            endstop_style: EndstopStyle::None,
            is_sticky: false,
        }
    }

    /// Build a config with default parameters from a free-text mode name.
    pub fn with_mode_name(name: &str) -> super::Result<Self> {
        Ok(Self::new(name.parse()?))
    }

    /// Update the lock-to-lock travel, re-deriving the symmetric angle bounds.
    pub fn set_endstop_turns(&mut self, turns: f64) {
        self.endstop_turns = turns;
        self.endstop_min_angle = -180.0 * turns;
        self.endstop_max_angle = 180.0 * turns;
    }
}

impl Default for HapticConfig {
    fn default() -> Self {
        Self::new(HapticMode::None)
    }
}
