//! Error types for the adapter.

use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AdapterError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{message}")]
    InvalidRequest { message: String },

    #[error("GigaChat returned status {status}: {message}")]
    Vendor { status: u16, message: String },

    #[error("GigaChat authentication failed: {message}")]
    Auth { message: String },

    #[error("Cache error: {message}")]
    Cache { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

impl AdapterError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: msg.into(),
        }
    }

    pub fn vendor(status: u16, msg: impl Into<String>) -> Self {
        Self::Vendor {
            status,
            message: msg.into(),
        }
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth {
            message: msg.into(),
        }
    }

    pub fn cache(msg: impl Into<String>) -> Self {
        Self::Cache {
            message: msg.into(),
        }
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// HTTP status the public API answers with for this error.
    /// Only caller mistakes are 400; vendor, cache and transport failures are 500.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest { .. } => 400,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, AdapterError>;
