use std::path::PathBuf;
use thiserror::Error;

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, PenumbraError>;

/// Errors that can occur while running the bridge
#[derive(Error, Debug)]
pub enum PenumbraError {
    /// WebSocket handshake or transport error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Inbound datagram was not a valid MessagePack state packet
    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// The hub event loop is no longer running
    #[error("Hub closed")]
    HubClosed,

    /// Persisting the mapping file failed; the update was not applied
    #[error("Failed to save config to {}: {source}", path.display())]
    ConfigSave {
        /// Path the config was being written to
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// An environment setting could not be interpreted
    #[error("Invalid setting {key}={value}")]
    InvalidSetting {
        /// Environment variable name
        key: String,
        /// Raw value that failed to parse
        value: String,
    },
}
