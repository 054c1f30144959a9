//! Error types for the Marteau core library.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Unreadable or malformed settings file
    #[error("Configuration error: {0}")]
    Config(String),

    /// Environment override that does not parse
    #[error("Invalid value {value:?} for {key}")]
    InvalidSetting { key: &'static str, value: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
