//! Model Context Protocol (MCP) tool invocation, client and server side.
//!
//! One process (the client) spawns another (the server) and talks to it
//! over the child's stdin/stdout using newline-delimited JSON-RPC 2.0.
//! After a handshake the client can discover the server's tools and call
//! them, many at once; responses are matched to requests by id.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐            ┌──────────────────────────┐
//! │          Client          │            │          Server          │
//! │                          │            │                          │
//! │  ClientSession           │  frames    │  McpServer               │
//! │   (handshake, pending    │◀──────────▶│   (lifecycle, one task   │
//! │    map, receive loop)    │  (stdio)   │    per tool call)        │
//! │          │               │            │          │               │
//! │          ▼               │            │          ▼               │
//! │  codec ─ Transport       │            │  Dispatcher ─ Registry   │
//! └──────────────────────────┘            └──────────────────────────┘
//! ```
//!
//! - [`transport`]: byte framing over pipes or any async stream
//! - [`codec`]: typed [`Message`]s to and from single-line JSON
//! - [`protocol`]: JSON-RPC envelopes and MCP payload types
//! - [`registry`] and [`dispatcher`]: tool descriptors, validation, execution
//! - [`session`]: the client session
//! - [`server`]: the server session
//!
//! # Protocol Version
//!
//! This implementation targets MCP protocol version 2024-11-05.

pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;

pub use codec::Message;
pub use dispatcher::Dispatcher;
pub use error::{CallError, ErrorKind};
pub use protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, MCP_PROTOCOL_VERSION};
pub use registry::{Arguments, Outcome, Payload, ToolDescriptor, ToolRegistry};
pub use server::McpServer;
pub use session::{ClientSession, SessionOptions, SessionState};
pub use transport::{ProcessConfig, Transport};
