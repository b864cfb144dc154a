//! Error types for mcp-toolpipe.
//!
//! Protocol-layer errors live in [`crate::mcp::error`]; this module holds
//! configuration errors and the top-level [`Error`] the binary reports.

use std::path::PathBuf;

use thiserror::Error;

use crate::mcp::error::{CallError, RegistryError, TransportError};

/// Errors that can occur during configuration operations.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read configuration file: {path}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed.
    #[error("failed to parse configuration file: {path}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Configuration file not found.
    #[error("configuration file not found: {path}")]
    NotFound {
        /// Path where the configuration file was expected.
        path: PathBuf,
    },

    /// Configuration validation failed.
    #[error("configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation failure.
        message: String,
    },
}

/// Any failure a command can end with.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad configuration file.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The tool set could not be assembled.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Serving failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A client operation failed.
    #[error(transparent)]
    Call(#[from] CallError),

    /// A command-line value could not be used.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result alias for command-level operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
