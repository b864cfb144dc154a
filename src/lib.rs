//! mcp-toolpipe: tool invocation between processes over MCP
//!
//! A client spawns a tool server as a child process and calls its tools over
//! the child's stdin/stdout. Both ends are provided:
//!
//! - **Client**: [`mcp::ClientSession`] performs the handshake, discovers
//!   tools and runs any number of concurrent calls with timeouts and
//!   cancellation
//! - **Server**: [`mcp::McpServer`] exposes a [`mcp::ToolRegistry`] to one
//!   client
//!
//! # Modules
//!
//! - [`config`] — Configuration loading and validation
//! - [`error`] — Error types
//! - [`mcp`] — MCP protocol implementation
//! - [`tools`] — Built-in tools for the `serve` command

pub mod config;
pub mod error;
pub mod mcp;
pub mod tools;
