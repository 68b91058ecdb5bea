// src/errors.rs

//! Crate-wide error aliases and helpers.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FormicaryError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Cycle detected in DAG: {0}")]
    DagCycle(String),

    #[error("Template error: {0}")]
    Template(String),

    /// No registered ant matches the requested method/tags right now.
    /// Ants may still be scaling up, so callers should back off and retry.
    #[error("No ants available: {0}")]
    AntsUnavailable(String),

    #[error("Task already allocated: {0}")]
    AlreadyAllocated(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("YAML parsing error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FormicaryError {
    /// Whether the condition is transient and the operation may be retried
    /// later without any change to the request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FormicaryError::AntsUnavailable(_))
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, FormicaryError>;
