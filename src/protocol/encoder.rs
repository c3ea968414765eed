use super::config::{EndstopStyle, HapticConfig, HapticMode};

/// Stateless telemetry queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    All,
    Angle,
    Velocity,
    Torque,
}

impl Query {
    pub fn line(self) -> &'static str {
        match self {
            Query::All => "get all\n",
            Query::Angle => "get angle\n",
            Query::Velocity => "get vel\n",
            Query::Torque => "get torque\n",
        }
    }
}

/// Zeroing, reset and calibrate all collapse to this single command.
pub const CMD_ZERO: &str = "set zero\n";

/// One-decimal wire formatting used for every numeric field.
///
/// The rule is nearest-rounding as produced by `{:.1}` on the f64 value
/// (ties, which only occur for exactly representable halves, go to even).
/// The firmware parses whatever single decimal it is given; the only hard
/// requirement is that every call site formats identically.
pub fn fmt1(value: f64) -> String {
    format!("{:.1}", value)
}

/// Map a full [`HapticConfig`] to the ordered command lines that realize it.
///
/// Re-encoding the whole config is idempotent on the device, so callers may
/// (and do) send the result on every change rather than diffing fields. The
/// primary mode command always comes first; `Endstops` appends the sticky
/// sub-parameter as an independent second line.
pub fn encode_config(config: &HapticConfig) -> Vec<String> {
    let primary = match config.mode {
        HapticMode::None => "set normal\n".to_string(),
        HapticMode::SoftDetents => "set detent:ultra\n".to_string(),
        HapticMode::MediumDetents => "set detent:fine\n".to_string(),
        HapticMode::RoughDetents => "set detent:coarse\n".to_string(),
        HapticMode::Clockwise => "set cw\n".to_string(),
        HapticMode::Counterclockwise => "set ccw\n".to_string(),
        HapticMode::IncreasedTorque => format!("set constant:{}\n", fmt1(config.torque)),
        HapticMode::Lock => "set constant:1.0\n".to_string(),
        HapticMode::CenterDetent => "set detent:center\n".to_string(),
        HapticMode::ProportionalControl => format!(
            "set proportional:{},{}\n",
            fmt1(config.target_angle),
            fmt1(config.stiffness)
        ),
        HapticMode::InertialControl => format!("set inertial:{}\n", fmt1(config.stiffness)),
        HapticMode::Latch => "set latch\n".to_string(),
        HapticMode::Endstops => encode_endstops(config),
    };

    let mut lines = vec![primary];
    if config.mode == HapticMode::Endstops {
        let sticky = if config.is_sticky { "on" } else { "off" };
        lines.push(format!("set sticky:{}\n", sticky));
    }
    lines
}

fn encode_endstops(config: &HapticConfig) -> String {
    let turns = fmt1(config.endstop_turns);
    match config.endstop_style {
        EndstopStyle::None => format!("set endstops:{}\n", turns),
        EndstopStyle::Proportional => format!("set endstops-proportional:{}\n", turns),
        EndstopStyle::Soft => format!("set endstops-ultra:{}\n", turns),
        EndstopStyle::Medium => format!("set endstops-fine:{}\n", turns),
        EndstopStyle::Rough => format!("set endstops-coarse:{}\n", turns),
        EndstopStyle::Center => format!("set endstops-center:{}\n", turns),
    }
}
