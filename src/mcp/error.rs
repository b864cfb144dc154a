//! Error types for transport, codec, registry and session operations.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::mcp::session::SessionState;

/// Errors raised by a [`Transport`](crate::mcp::transport::Transport).
#[derive(Debug, Error)]
pub enum TransportError {
    /// The child process could not be started.
    #[error("failed to spawn '{command}'")]
    Spawn {
        /// Command that was being started.
        command: String,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// `open` was called on a transport that is already bound.
    #[error("transport is already open")]
    AlreadyOpen,

    /// An operation was attempted before the transport was bound.
    #[error("transport is not open")]
    NotOpen,

    /// The peer's side of the pipe is gone.
    #[error("transport closed")]
    Closed,

    /// Any other I/O failure on the stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A frame could not be turned into a protocol message.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The frame is not valid JSON or does not match the expected shape.
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame is valid JSON-RPC but not a message this protocol knows.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

/// Errors raised while building a [`ToolRegistry`](crate::mcp::registry::ToolRegistry).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A tool with this name already exists.
    #[error("tool '{0}' is already registered")]
    DuplicateName(String),

    /// No built-in tool has this name.
    #[error("unknown built-in tool '{0}'")]
    UnknownBuiltin(String),
}

/// Errors a tool handler may return.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ToolError {
    /// The arguments passed schema validation but are still unusable.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The tool ran and failed.
    #[error("{0}")]
    Failed(String),
}

/// Classification of every failure a caller can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The server process could not be started.
    Spawn,
    /// Writing to the peer failed because the pipe is gone.
    TransportClosed,
    /// The peer closed the stream.
    ConnectionClosed,
    /// A frame could not be decoded.
    Decode,
    /// The arguments did not match the tool's schema.
    InvalidArguments,
    /// No tool with the requested name exists.
    UnknownTool,
    /// The tool handler failed.
    HandlerError,
    /// The caller's time bound expired.
    Timeout,
    /// The session was torn down while the call was pending.
    Cancelled,
    /// The handshake has not completed.
    NotEstablished,
    /// The peer violated the protocol or answered with a JSON-RPC error.
    Protocol,
}

impl ErrorKind {
    /// Returns the wire name of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Spawn => "spawn",
            Self::TransportClosed => "transport_closed",
            Self::ConnectionClosed => "connection_closed",
            Self::Decode => "decode",
            Self::InvalidArguments => "invalid_arguments",
            Self::UnknownTool => "unknown_tool",
            Self::HandlerError => "handler_error",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::NotEstablished => "not_established",
            Self::Protocol => "protocol",
        }
    }

    /// Parses a wire name produced by [`ErrorKind::as_str`].
    #[must_use]
    pub fn from_wire(name: &str) -> Option<Self> {
        let kind = match name {
            "spawn" => Self::Spawn,
            "transport_closed" => Self::TransportClosed,
            "connection_closed" => Self::ConnectionClosed,
            "decode" => Self::Decode,
            "invalid_arguments" => Self::InvalidArguments,
            "unknown_tool" => Self::UnknownTool,
            "handler_error" => Self::HandlerError,
            "timeout" => Self::Timeout,
            "cancelled" => Self::Cancelled,
            "not_established" => Self::NotEstablished,
            "protocol" => Self::Protocol,
            _ => return None,
        };
        Some(kind)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by [`ClientSession`](crate::mcp::session::ClientSession) operations.
#[derive(Debug, Error)]
pub enum CallError {
    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A frame for this call could not be decoded or encoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The tool call completed with a failure outcome.
    #[error("{kind}: {message}")]
    Tool {
        /// Failure classification.
        kind: ErrorKind,
        /// Human-readable description from the server.
        message: String,
    },

    /// The peer answered with a JSON-RPC error object.
    #[error("server error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i32,
        /// Error message.
        message: String,
    },

    /// No response arrived within the caller's time bound.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The session closed while the call was pending.
    #[error("call cancelled: session closed")]
    Cancelled,

    /// The session is already closed; nothing can be sent.
    #[error("connection closed")]
    ConnectionClosed,

    /// Calls are only permitted once the handshake has completed.
    #[error("session not established (state: {0:?})")]
    NotEstablished(SessionState),

    /// `initialize` was called more than once.
    #[error("session already initialised")]
    AlreadyInitialized,

    /// The handshake response was rejected.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The peer answered with a message of the wrong type.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl CallError {
    /// Classifies this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(TransportError::Spawn { .. }) => ErrorKind::Spawn,
            Self::Transport(_) => ErrorKind::TransportClosed,
            Self::Decode(_) => ErrorKind::Decode,
            Self::Tool { kind, .. } => *kind,
            Self::Rpc { .. }
            | Self::AlreadyInitialized
            | Self::HandshakeFailed(_)
            | Self::UnexpectedResponse(_) => ErrorKind::Protocol,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::ConnectionClosed => ErrorKind::ConnectionClosed,
            Self::NotEstablished(_) => ErrorKind::NotEstablished,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_error_display() {
        let error = TransportError::Spawn {
            command: "/no/such/server".to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "missing"),
        };
        assert!(error.to_string().contains("/no/such/server"));
    }

    #[test]
    fn call_error_kinds() {
        assert_eq!(CallError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            CallError::Timeout(Duration::from_millis(5)).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            CallError::Transport(TransportError::Closed).kind(),
            ErrorKind::TransportClosed
        );
        assert_eq!(
            CallError::Tool {
                kind: ErrorKind::HandlerError,
                message: "boom".to_string(),
            }
            .kind(),
            ErrorKind::HandlerError
        );
    }

    #[test]
    fn error_kind_wire_names() {
        for kind in [
            ErrorKind::InvalidArguments,
            ErrorKind::UnknownTool,
            ErrorKind::HandlerError,
        ] {
            assert_eq!(ErrorKind::from_wire(kind.as_str()), Some(kind));
        }
        assert_eq!(ErrorKind::from_wire("bogus"), None);
    }
}
