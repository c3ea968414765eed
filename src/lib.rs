//! Device session core for haptic rotary-knob controllers.
//!
//! The crate owns the serial line protocol (command encoding, response
//! classification), device liveness tracking, and the connection state
//! machine. The byte transport and the UI are collaborators behind narrow
//! interfaces: inject a [`transport::Transport`] implementation, drive the
//! session through a [`session::SessionHandle`], and observe it through its
//! event and snapshot channels.

pub mod discovery;
pub mod protocol;
pub mod session;
pub mod transport;

pub use protocol::{
    EndstopStyle, HapticConfig, HapticMode, ProtocolError, Query, TelemetrySample,
};
pub use session::{
    DeviceSession, ErrorKind, Phase, SessionConfig, SessionError, SessionEvent, SessionHandle,
    SessionSnapshot,
};
pub use transport::{PortInfo, Transport, TransportError, TransportEvent};
