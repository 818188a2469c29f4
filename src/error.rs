//! Error types for the backup agent

use thiserror::Error;

/// Main error type for backup agent operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("XML parsing error: {0}")]
    Xml(#[from] xmltree::ParseError),

    #[error("Invalid backup scheme: {reason}")]
    InvalidScheme { reason: String },

    #[error("Wire protocol error: {reason}")]
    Protocol { reason: String },

    #[error("Unable to produce payload for key '{key}': {reason}")]
    Payload { key: String, reason: String },

    #[error("Invalid configuration: {reason}")]
    Configuration { reason: String },
}

impl Error {
    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        Error::Protocol {
            reason: reason.into(),
        }
    }

    pub(crate) fn scheme(reason: impl Into<String>) -> Self {
        Error::InvalidScheme {
            reason: reason.into(),
        }
    }

    /// Whether this error must abort the whole backup or restore pass.
    ///
    /// Stream and state-file failures are fatal; a single producer failing to
    /// hand over a payload is not.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Protocol { .. })
    }
}

/// Result type alias for backup agent operations
pub type Result<T> = std::result::Result<T, Error>;
