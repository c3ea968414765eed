pub mod liveness;
pub mod poller;
pub mod runner;
pub mod state;

pub use runner::{DeviceSession, SessionConfig, SessionHandle};
pub use state::{Phase, SessionSnapshot};

use crate::protocol::TelemetrySample;
use serde::{Deserialize, Serialize};

/// Default line rate for the knob's CDC serial endpoint.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Classification attached to error events surfaced to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Transport,
    DeviceNotResponding,
    ReconnectExhausted,
    Configuration,
}

/// Everything the UI layer hears from the session, on one broadcast channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SessionEvent {
    Telemetry(TelemetrySample),
    PhaseChanged {
        phase: Phase,
        detail: Option<String>,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Another connect or reconnect is already in flight")]
    Busy,

    #[error("Not connected")]
    NotConnected,

    #[error("Session task has shut down")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::protocol::ProtocolError),
}

pub type Result<T> = std::result::Result<T, SessionError>;
