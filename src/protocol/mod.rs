pub mod config;
pub mod decoder;
pub mod encoder;

pub use config::{EndstopStyle, HapticConfig, HapticMode};
pub use decoder::{classify_line, DecodedLine, TelemetrySample};
pub use encoder::{encode_config, Query};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown haptic mode: {0}")]
    UnknownMode(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
