use serde::{Deserialize, Serialize};

/// Device-reported readings decoded from one inbound line.
///
/// Partial samples are the norm: `get vel` answers with only the velocity
/// field, and the session merges fields into its snapshot incrementally.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub angle: Option<f64>,
    pub velocity: Option<f64>,
    pub torque: Option<f64>,
}

impl TelemetrySample {
    pub fn is_empty(&self) -> bool {
        self.angle.is_none() && self.velocity.is_none() && self.torque.is_none()
    }

    /// Fold another sample in, keeping existing fields where the other is absent.
    pub fn merge(&mut self, other: &TelemetrySample) {
        if other.angle.is_some() {
            self.angle = other.angle;
        }
        if other.velocity.is_some() {
            self.velocity = other.velocity;
        }
        if other.torque.is_some() {
            self.torque = other.torque;
        }
    }
}

/// Classification of one trimmed inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedLine {
    /// A line matching a known telemetry shape. May carry fewer fields than
    /// the shape suggests when a numeric payload failed to parse; it still
    /// counts as proof the device is alive.
    Telemetry(TelemetrySample),
    /// The exact `OK` acknowledgement. Liveness heartbeat, no payload.
    Ack,
    /// Anything else. Never resets the liveness timer.
    Unrecognized,
}

impl DecodedLine {
    /// Whether this line counts as a liveness heartbeat.
    pub fn is_classified(&self) -> bool {
        !matches!(self, DecodedLine::Unrecognized)
    }
}

/// Parse a numeric payload, treating garbage as an absent field rather than
/// letting NaN or a decode failure propagate into session state.
fn parse_field(label: &str, raw: &str) -> Option<f64> {
    match raw.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Some(v),
        Ok(_) | Err(_) => {
            log::warn!("Malformed {} value in telemetry line: {:?}", label, raw);
            None
        }
    }
}

/// Classify one inbound line. Never panics; anything that does not match a
/// known shape degrades to [`DecodedLine::Unrecognized`].
pub fn classify_line(line: &str) -> DecodedLine {
    let line = line.trim();
    if line.is_empty() {
        return DecodedLine::Unrecognized;
    }
    if line == "OK" {
        return DecodedLine::Ack;
    }

    // Combined form: ANGLE:<f>,VEL:<f>,TORQUE:<f> with fields in fixed order.
    if line.starts_with("ANGLE:") && line.contains(',') {
        let parts: Vec<&str> = line.split(',').collect();
        if parts.len() == 3 {
            if let (Some(a), Some(v), Some(t)) = (
                parts[0].strip_prefix("ANGLE:"),
                parts[1].strip_prefix("VEL:"),
                parts[2].strip_prefix("TORQUE:"),
            ) {
                return DecodedLine::Telemetry(TelemetrySample {
                    angle: parse_field("ANGLE", a),
                    velocity: parse_field("VEL", v),
                    torque: parse_field("TORQUE", t),
                });
            }
        }
        return DecodedLine::Unrecognized;
    }

    if let Some(raw) = line.strip_prefix("ANGLE:") {
        return DecodedLine::Telemetry(TelemetrySample {
            angle: parse_field("ANGLE", raw),
            ..Default::default()
        });
    }
    if let Some(raw) = line.strip_prefix("VEL:") {
        return DecodedLine::Telemetry(TelemetrySample {
            velocity: parse_field("VEL", raw),
            ..Default::default()
        });
    }
    if let Some(raw) = line.strip_prefix("TORQUE:") {
        return DecodedLine::Telemetry(TelemetrySample {
            torque: parse_field("TORQUE", raw),
            ..Default::default()
        });
    }

    DecodedLine::Unrecognized
}
