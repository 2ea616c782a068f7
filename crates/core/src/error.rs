//! Error types for the coordination engine

use thiserror::Error;

use crate::models::PeerId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed {kind} message: {reason}")]
    MalformedMessage { kind: String, reason: String },

    #[error("Signaling error for peer {peer}: {reason}")]
    Signaling { peer: PeerId, reason: String },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Room already joined: {0}")]
    AlreadyJoined(String),

    #[error("Room loop stopped")]
    EngineStopped,

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn malformed(kind: &str, reason: impl Into<String>) -> Self {
        Error::MalformedMessage {
            kind: kind.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
