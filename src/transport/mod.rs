pub mod mock;

pub use mock::{MockTransport, MockTransportHandle};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Identity of one enumerable serial endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub path: String,
    pub manufacturer: Option<String>,
    pub product_id: Option<u16>,
    pub vendor_id: Option<u16>,
    pub serial_number: Option<String>,
    pub friendly_name: Option<String>,
}

impl PortInfo {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            manufacturer: None,
            product_id: None,
            vendor_id: None,
            serial_number: None,
            friendly_name: None,
        }
    }

    /// The identifier persisted for auto-connect preference, when one exists.
    pub fn device_identifier(&self) -> Option<&str> {
        self.serial_number.as_deref()
    }
}

/// Unsolicited traffic pushed up from the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One complete inbound line, already stripped of its terminator.
    Line(String),
    /// Transport-level read/stream error.
    Error(String),
    /// The link dropped without a `close()` call (cable pull, driver fault).
    Disconnected,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Open failed: {0}")]
    OpenFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Byte-stream collaborator the session drives.
///
/// Implementations own the actual port handle; the session is the single
/// writer and consumes inbound events through the receiver handed out by
/// [`Transport::events`]. A hardware driver lives outside this crate; tests
/// use [`MockTransport`].
#[async_trait]
pub trait Transport: Send {
    /// Enumerate ports currently visible on the host.
    fn list_ports(&self) -> Result<Vec<PortInfo>>;

    /// Open `path` at `baud` (8N1 assumed). Must fail if already open.
    async fn open(&mut self, path: &str, baud: u32) -> Result<()>;

    /// Close the port. Idempotent.
    async fn close(&mut self) -> Result<()>;

    /// Write one command; `line` already carries its `\n` terminator.
    async fn write_line(&mut self, line: &str) -> Result<()>;

    /// Take the inbound event stream. Called once by the session at spawn.
    fn events(&mut self) -> mpsc::UnboundedReceiver<TransportEvent>;
}
