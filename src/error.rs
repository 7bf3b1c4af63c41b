//! Error types and handling.

use thiserror::Error;

use crate::pos::Command;

/// Errors that can occur while talking to the POS terminal.
#[derive(Error, Debug)]
pub enum PosError {
    /// IO error on the byte transport.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port could not be opened, configured or queried.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Terminal never acknowledged the request frame.
    #[error("{command} was not acknowledged after {attempts} attempts")]
    NoAcknowledgement { command: Command, attempts: u32 },

    /// Terminal acknowledged the request but no valid response arrived.
    #[error("No valid response to {command} after {attempts} attempts")]
    NoResponse { command: Command, attempts: u32 },

    /// Response bytes could not be decoded into a record.
    #[error("Decode error: {0}")]
    Decode(String),

    /// A request parameter does not fit its wire field.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Result type alias for PosError
pub type Result<T> = std::result::Result<T, PosError>;

impl PosError {
    /// Create a decode error with message
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create an invalid parameter error with message
    pub fn invalid_parameter(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    /// Whether the error came from the transport boundary rather than the protocol.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Serial(_))
    }
}
