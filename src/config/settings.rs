//! Configuration structures for deserialisation.
//!
//! These structures map directly to the JSON configuration file format.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::mcp::protocol::SERVER_NAME;
use crate::tools;

/// Root configuration structure.
///
/// This is the top-level structure that matches the JSON config file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Optional JSON schema reference (ignored during parsing).
    #[serde(rename = "$schema", default)]
    _schema: Option<String>,

    /// Optional comment field (ignored during parsing).
    #[serde(rename = "_comment", default)]
    _comment: Option<String>,

    /// Settings for `serve`.
    #[serde(default)]
    pub server: ServerConfig,

    /// Settings for client sessions (`list`, `call`).
    #[serde(default)]
    pub session: SessionConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation checks fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.name.trim().is_empty() {
            return Err(ConfigError::ValidationError {
                message: "server.name must not be empty".to_string(),
            });
        }

        if let Some(unknown) = self
            .server
            .tools
            .iter()
            .find(|name| !tools::is_builtin(name))
        {
            return Err(ConfigError::ValidationError {
                message: format!(
                    "Unknown tool '{unknown}' in server.tools. Must be one of: {}",
                    tools::BUILTIN_TOOLS.join(", ")
                ),
            });
        }

        if self.session.handshake_timeout_ms == 0 {
            return Err(ConfigError::ValidationError {
                message: "session.handshake_timeout_ms must be greater than zero".to_string(),
            });
        }

        if self.session.call_timeout_ms == Some(0) {
            return Err(ConfigError::ValidationError {
                message: "session.call_timeout_ms must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Name reported in the handshake.
    #[serde(default = "default_server_name")]
    pub name: String,

    /// Built-in tools to expose. Empty means all of them.
    #[serde(default)]
    pub tools: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            tools: Vec::new(),
        }
    }
}

fn default_server_name() -> String {
    SERVER_NAME.to_string()
}

/// Client session configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Bound on the handshake, in milliseconds.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Default bound on each call, in milliseconds. Absent means no bound.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: Option<u64>,
}

impl SessionConfig {
    /// Handshake bound as a [`Duration`].
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Call bound as a [`Duration`].
    #[must_use]
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

const fn default_handshake_timeout_ms() -> u64 {
    10_000
}

#[allow(clippy::unnecessary_wraps)]
const fn default_call_timeout_ms() -> Option<u64> {
    Some(30_000)
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}
