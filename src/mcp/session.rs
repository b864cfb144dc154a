//! Client side of a session: handshake, correlation and multiplexing.
//!
//! A [`ClientSession`] owns one [`Transport`] and one background receive
//! loop. Each request gets a fresh numeric id and a single-use slot in the
//! pending map; the receive loop fills the slot whose id matches the
//! incoming response, so responses may arrive in any order and any number
//! of calls can be in flight at once.
//!
//! # Lifecycle
//!
//! ```text
//! NotStarted ──initialize()──▶ InProgress ──ack──▶ Established
//!                                   │
//!                                   └──timeout / rejection──▶ Failed
//!
//! any state ──close() / end of stream──▶ Closed
//! ```
//!
//! When the session closes, every pending call resolves with
//! [`CallError::Cancelled`].

use std::collections::HashMap;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::mcp::codec::{self, Message};
use crate::mcp::error::{CallError, ErrorKind};
use crate::mcp::protocol::{
    ErrorCode, Implementation, InitializeParams, InitializeResult, JsonRpcErrorData, RequestId,
    CLIENT_NAME, MCP_PROTOCOL_VERSION,
};
use crate::mcp::registry::{Arguments, Outcome, Payload, ToolDescriptor};
use crate::mcp::transport::{ProcessConfig, Received, Transport};

/// Default bound on the handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// `initialize` has not been called.
    NotStarted,
    /// The handshake request is in flight.
    InProgress,
    /// The handshake completed; calls are permitted.
    Established,
    /// The handshake was rejected or timed out.
    Failed,
    /// The transport is gone. Terminal.
    Closed,
}

/// Tunables for a [`ClientSession`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Sent to the server in the handshake.
    pub client_info: Implementation,
    /// Bound on the handshake round trip.
    pub handshake_timeout: Duration,
    /// Default bound on each call; `None` waits indefinitely.
    pub call_timeout: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            client_info: Implementation::new(CLIENT_NAME),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            call_timeout: None,
        }
    }
}

type Reply = Result<Message, CallError>;

struct Inner {
    state: SessionState,
    pending: HashMap<RequestId, oneshot::Sender<Reply>>,
}

/// State shared between the session handle and its receive loop.
///
/// The lifecycle state and the pending map live under one lock so a call
/// can never register a slot after the session has drained them.
struct Shared {
    inner: Mutex<Inner>,
}

impl Shared {
    fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: SessionState::NotStarted,
                pending: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> SessionState {
        self.lock().state
    }

    fn begin_handshake(&self) -> Result<(), CallError> {
        let mut inner = self.lock();
        match inner.state {
            SessionState::NotStarted => {
                inner.state = SessionState::InProgress;
                Ok(())
            }
            SessionState::Closed => Err(CallError::ConnectionClosed),
            _ => Err(CallError::AlreadyInitialized),
        }
    }

    fn finish_handshake(&self, state: SessionState) {
        let mut inner = self.lock();
        if inner.state == SessionState::InProgress {
            inner.state = state;
        }
    }

    fn ensure_established(&self) -> Result<(), CallError> {
        match self.state() {
            SessionState::Established => Ok(()),
            SessionState::Closed => Err(CallError::ConnectionClosed),
            state => Err(CallError::NotEstablished(state)),
        }
    }

    fn register(&self, id: RequestId, slot: oneshot::Sender<Reply>) -> Result<(), CallError> {
        let mut inner = self.lock();
        if inner.state == SessionState::Closed {
            return Err(CallError::ConnectionClosed);
        }
        inner.pending.insert(id, slot);
        Ok(())
    }

    /// Fills the slot for `id`. Returns `false` if nobody is waiting on it.
    fn resolve(&self, id: &RequestId, reply: Reply) -> bool {
        let slot = self.lock().pending.remove(id);
        slot.is_some_and(|slot| slot.send(reply).is_ok())
    }

    fn forget(&self, id: &RequestId) {
        self.lock().pending.remove(id);
    }

    /// Marks the session closed and cancels every pending call.
    fn shutdown(&self) -> usize {
        let drained: Vec<_> = {
            let mut inner = self.lock();
            inner.state = SessionState::Closed;
            inner.pending.drain().collect()
        };
        let count = drained.len();
        for (_, slot) in drained {
            let _ = slot.send(Err(CallError::Cancelled));
        }
        count
    }
}

/// Removes a pending slot when its caller stops waiting, whether the call
/// finished, timed out or the caller's future was dropped.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.forget(&self.id);
    }
}

/// A client connection to one tool server.
///
/// All methods take `&self`; share the session behind an `Arc` to issue
/// calls from several tasks at once.
pub struct ClientSession {
    transport: Arc<Transport>,
    shared: Arc<Shared>,
    next_id: AtomicI64,
    options: SessionOptions,
    receive_loop: Mutex<Option<JoinHandle<()>>>,
    server: OnceLock<InitializeResult>,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("state", &self.state())
            .field("transport", &self.transport)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ClientSession {
    /// Wraps a bound transport and starts the receive loop.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(transport: Transport, options: SessionOptions) -> Self {
        let transport = Arc::new(transport);
        let shared = Arc::new(Shared::new());
        let receive_loop = tokio::spawn(receive_loop(Arc::clone(&transport), Arc::clone(&shared)));

        Self {
            transport,
            shared,
            next_id: AtomicI64::new(1),
            options,
            receive_loop: Mutex::new(Some(receive_loop)),
            server: OnceLock::new(),
        }
    }

    /// Spawns a server process and wraps its pipes in a session.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`ErrorKind::Spawn`] if the server cannot be
    /// started.
    pub fn spawn(config: &ProcessConfig, options: SessionOptions) -> Result<Self, CallError> {
        let transport = Transport::spawn(config)?;
        Ok(Self::new(transport, options))
    }

    /// Spawns a server process and completes the handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot be started or the handshake
    /// fails; the child is terminated in the latter case.
    pub async fn connect(
        config: &ProcessConfig,
        options: SessionOptions,
    ) -> Result<Self, CallError> {
        let session = Self::spawn(config, options)?;
        if let Err(e) = session.initialize().await {
            session.close().await;
            return Err(e);
        }
        Ok(session)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// The server's handshake response, once established.
    #[must_use]
    pub fn server_info(&self) -> Option<&InitializeResult> {
        self.server.get()
    }

    /// Performs the handshake. Must be called exactly once, before any call.
    ///
    /// # Errors
    ///
    /// Fails if called twice, if the server rejects the handshake or speaks a
    /// different protocol version, or if no answer arrives within the
    /// handshake timeout. The session is `Failed` afterwards.
    pub async fn initialize(&self) -> Result<InitializeResult, CallError> {
        self.shared.begin_handshake()?;

        let params = InitializeParams {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: json!({}),
            client_info: self.options.client_info.clone(),
        };

        let reply = self
            .request(
                |id| Message::Handshake { id, params },
                Some(self.options.handshake_timeout),
            )
            .await;

        let result = match reply {
            Ok(Message::HandshakeAck { result, .. }) => result,
            Ok(Message::Error { error, .. }) => {
                return self.fail_handshake(CallError::HandshakeFailed(error.message));
            }
            Ok(other) => {
                return self.fail_handshake(CallError::UnexpectedResponse(format!("{other:?}")));
            }
            Err(e) => return self.fail_handshake(e),
        };

        if result.protocol_version != MCP_PROTOCOL_VERSION {
            return self.fail_handshake(CallError::HandshakeFailed(format!(
                "server speaks protocol version {}, expected {MCP_PROTOCOL_VERSION}",
                result.protocol_version
            )));
        }

        if let Err(e) = self.send(&Message::Initialized).await {
            return self.fail_handshake(e);
        }

        self.shared.finish_handshake(SessionState::Established);
        let _ = self.server.set(result.clone());

        tracing::info!(
            server = %result.server_info.name,
            version = ?result.server_info.version,
            "Session established"
        );
        Ok(result)
    }

    fn fail_handshake<T>(&self, error: CallError) -> Result<T, CallError> {
        tracing::warn!(error = %error, "Handshake failed");
        self.shared.finish_handshake(SessionState::Failed);
        Err(error)
    }

    /// Fetches the server's tool descriptors.
    ///
    /// # Errors
    ///
    /// Fails if the session is not established or the request fails.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, CallError> {
        self.shared.ensure_established()?;

        match self
            .request(|id| Message::ListToolsRequest { id }, self.options.call_timeout)
            .await?
        {
            Message::ListToolsResponse { tools, .. } => {
                tracing::debug!(count = tools.len(), "Tool discovery complete");
                Ok(tools)
            }
            Message::Error { error, .. } => Err(rpc_error(error)),
            other => Err(CallError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    /// Invokes a tool, bounded by the session's default call timeout.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Tool`] for failure outcomes (unknown tool,
    /// invalid arguments, handler error), or a session-level error.
    pub async fn call_tool(&self, name: &str, arguments: Arguments) -> Result<Payload, CallError> {
        self.call_tool_with_timeout(name, arguments, self.options.call_timeout)
            .await
    }

    /// Invokes a tool with an explicit time bound.
    ///
    /// On expiry the call resolves with [`CallError::Timeout`], the id is
    /// retired and the server is told to abandon the request; a response
    /// arriving later is discarded.
    ///
    /// # Errors
    ///
    /// See [`ClientSession::call_tool`].
    pub async fn call_tool_with_timeout(
        &self,
        name: &str,
        arguments: Arguments,
        timeout: Option<Duration>,
    ) -> Result<Payload, CallError> {
        self.shared.ensure_established()?;

        let reply = self
            .request(
                |id| Message::CallToolRequest {
                    id,
                    name: name.to_string(),
                    arguments,
                },
                timeout,
            )
            .await?;

        match reply {
            Message::CallToolResponse {
                outcome: Outcome::Success(payload),
                ..
            } => Ok(payload),
            Message::CallToolResponse {
                outcome: Outcome::Failure(failure),
                ..
            } => Err(CallError::Tool {
                kind: failure.kind,
                message: failure.message,
            }),
            Message::Error { error, .. } => Err(rpc_error(error)),
            other => Err(CallError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    /// Round-trips a ping.
    ///
    /// # Errors
    ///
    /// Fails if the session is not established or the server does not answer.
    pub async fn ping(&self) -> Result<(), CallError> {
        self.shared.ensure_established()?;

        match self
            .request(|id| Message::Ping { id }, self.options.call_timeout)
            .await?
        {
            Message::Pong { .. } => Ok(()),
            Message::Error { error, .. } => Err(rpc_error(error)),
            other => Err(CallError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    /// Tears the session down.
    ///
    /// Pending calls resolve with [`CallError::Cancelled`], the receive loop
    /// stops and the transport is closed. Returns the server process's exit
    /// status when there is one. Idempotent.
    pub async fn close(&self) -> Option<ExitStatus> {
        let cancelled = self.shared.shutdown();
        if cancelled > 0 {
            tracing::debug!(cancelled, "Cancelled pending calls");
        }

        let handle = self
            .receive_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }

        self.transport.close().await
    }

    async fn send(&self, message: &Message) -> Result<(), CallError> {
        let frame = codec::encode(message)?;
        self.transport.send(&frame).await?;
        Ok(())
    }

    async fn request<F>(&self, build: F, timeout: Option<Duration>) -> Result<Message, CallError>
    where
        F: FnOnce(RequestId) -> Message,
    {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let message = build(id.clone());
        let frame = codec::encode(&message)?;

        let (slot, reply) = oneshot::channel();
        self.shared.register(id.clone(), slot)?;
        let _guard = PendingGuard {
            shared: &self.shared,
            id: id.clone(),
        };

        tracing::debug!(%id, "Sending request");
        self.transport.send(&frame).await?;

        let reply = match timeout {
            None => reply.await,
            Some(limit) => {
                if let Ok(reply) = tokio::time::timeout(limit, reply).await {
                    reply
                } else {
                    tracing::warn!(%id, ?limit, "Request timed out");
                    let notice = Message::Cancelled {
                        request_id: id,
                        reason: Some("timeout".to_string()),
                    };
                    if let Err(e) = self.send(&notice).await {
                        tracing::debug!(error = %e, "Could not send cancellation");
                    }
                    return Err(CallError::Timeout(limit));
                }
            }
        };

        reply.unwrap_or(Err(CallError::Cancelled))
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if let Some(handle) = self
            .receive_loop
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

fn rpc_error(error: JsonRpcErrorData) -> CallError {
    if ErrorCode::from_code(error.code) == ErrorCode::InvalidParams {
        return CallError::Tool {
            kind: ErrorKind::InvalidArguments,
            message: error.message,
        };
    }
    CallError::Rpc {
        code: error.code,
        message: error.message,
    }
}

/// Reads frames until the stream ends, routing responses to pending calls.
async fn receive_loop(transport: Arc<Transport>, shared: Arc<Shared>) {
    loop {
        let frame = match transport.receive().await {
            Ok(Received::Frame(frame)) => frame,
            Ok(Received::Closed) => {
                tracing::info!("Server closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read from server");
                break;
            }
        };

        match codec::decode(&frame) {
            Ok(Message::Ping { id }) => {
                let pong = codec::encode(&Message::Pong { id });
                match pong {
                    Ok(pong) => {
                        if let Err(e) = transport.send(&pong).await {
                            tracing::debug!(error = %e, "Could not answer ping");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Could not encode pong"),
                }
            }
            Ok(message) if message.is_response() => match message.id().cloned() {
                Some(id) => {
                    if !shared.resolve(&id, Ok(message)) {
                        tracing::debug!(%id, "Discarding response for unknown or retired id");
                    }
                }
                None => {
                    tracing::warn!(message = ?message, "Server reported an error without an id");
                }
            },
            Ok(message) => {
                tracing::debug!(message = ?message, "Ignoring message from server");
            }
            Err(e) => match codec::salvage_id(&frame) {
                Some(id) => {
                    tracing::warn!(%id, error = %e, "Malformed response");
                    shared.resolve(&id, Err(CallError::Decode(e)));
                }
                None => tracing::warn!(error = %e, "Discarding malformed frame"),
            },
        }
    }

    let cancelled = shared.shutdown();
    if let Some(status) = transport.exit_status().await {
        tracing::info!(%status, cancelled, "Session closed");
    } else {
        tracing::info!(cancelled, "Session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_pair() -> (ClientSession, Transport) {
        let (client, server) = tokio::io::duplex(4096);
        (
            ClientSession::new(Transport::from_stream(client), SessionOptions::default()),
            Transport::from_stream(server),
        )
    }

    async fn next_message(peer: &Transport) -> Message {
        let Received::Frame(frame) = peer.receive().await.unwrap() else {
            panic!("peer closed");
        };
        codec::decode(&frame).unwrap()
    }

    #[tokio::test]
    async fn calls_before_handshake_are_rejected() {
        let (session, _peer) = session_pair();
        let err = session
            .call_tool("echo", Arguments::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotEstablished);
        assert!(matches!(
            err,
            CallError::NotEstablished(SessionState::NotStarted)
        ));
    }

    #[tokio::test]
    async fn handshake_timeout_marks_session_failed() {
        let (client, _server) = tokio::io::duplex(4096);
        let options = SessionOptions {
            handshake_timeout: Duration::from_millis(50),
            ..SessionOptions::default()
        };
        let session = ClientSession::new(Transport::from_stream(client), options);

        let err = session.initialize().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(session.state(), SessionState::Failed);

        let err = session.initialize().await.unwrap_err();
        assert!(matches!(err, CallError::AlreadyInitialized));
    }

    #[tokio::test]
    async fn version_mismatch_fails_handshake() {
        let (session, peer) = session_pair();
        let server = tokio::spawn(async move {
            let Message::Handshake { id, .. } = next_message(&peer).await else {
                panic!("expected handshake");
            };
            let ack = Message::HandshakeAck {
                id,
                result: InitializeResult {
                    protocol_version: "1999-01-01".to_string(),
                    capabilities: crate::mcp::protocol::ServerCapabilities::default(),
                    server_info: Implementation::new("old-server"),
                },
            };
            peer.send(&codec::encode(&ack).unwrap()).await.unwrap();
            peer
        });

        let err = session.initialize().await.unwrap_err();
        assert!(matches!(err, CallError::HandshakeFailed(_)));
        assert_eq!(session.state(), SessionState::Failed);
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn end_of_stream_closes_session() {
        let (session, peer) = session_pair();
        drop(peer);
        // Give the receive loop a chance to observe EOF.
        for _ in 0..100 {
            if session.state() == SessionState::Closed {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(session.state(), SessionState::Closed);
        let err = session.initialize().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionClosed);
    }
}
