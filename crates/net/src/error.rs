//! Network error types

use std::io;

/// Network result type
pub type Result<T> = std::result::Result<T, Error>;

/// Network errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Join rejected: {0}")]
    Rejected(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Room full")]
    RoomFull,

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl From<Error> for peercoord_core::Error {
    fn from(e: Error) -> Self {
        peercoord_core::Error::Transport(e.to_string())
    }
}
