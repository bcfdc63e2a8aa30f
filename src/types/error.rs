//! Unified error types for the synchronization engine
//!
//! This module defines error types that:
//! - Are serializable so a host application can surface them
//! - Carry enough context to be logged with the failing entry or message
//! - Map storage, parse and config failures onto a small set of variants

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for the engine, the store adapters and the manager
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum GabError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for GabError {
    fn from(err: std::io::Error) -> Self {
        GabError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for GabError {
    fn from(err: toml::de::Error) -> Self {
        GabError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for GabError {
    fn from(err: serde_json::Error) -> Self {
        GabError::Parse(err.to_string())
    }
}

impl From<base64::DecodeError> for GabError {
    fn from(err: base64::DecodeError) -> Self {
        GabError::Parse(format!("invalid base64: {}", err))
    }
}

impl From<rusqlite::Error> for GabError {
    fn from(err: rusqlite::Error) -> Self {
        GabError::Database(err.to_string())
    }
}

impl From<r2d2::Error> for GabError {
    fn from(err: r2d2::Error) -> Self {
        GabError::Database(err.to_string())
    }
}

impl From<String> for GabError {
    fn from(err: String) -> Self {
        GabError::Other(err)
    }
}

impl From<&str> for GabError {
    fn from(err: &str) -> Self {
        GabError::Other(err.to_string())
    }
}

/// Result type alias using GabError
pub type Result<T> = std::result::Result<T, GabError>;
