//! Error types shared by the netBiDiB modules.

use thiserror::Error;

/// netBiDiB errors
#[derive(Debug, Error)]
pub enum NetBidibError {
    /// A required argument was not supplied
    #[error("Invalid argument: {0} is required")]
    InvalidArgument(&'static str),

    /// Frame too short to contain a valid header
    #[error("BiDiB message too short")]
    MessageTooShort,

    /// Length byte does not match the frame
    #[error("Invalid message length: {0}")]
    InvalidLength(usize),

    /// Transport has no open connection
    #[error("Not connected")]
    NotConnected,

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, NetBidibError>;
