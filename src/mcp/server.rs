//! Server side of a session.
//!
//! This module implements the server lifecycle:
//!
//! 1. **Initialisation**: Capability negotiation and version agreement
//! 2. **Operation**: Tool discovery and tool calls, several in flight at once
//! 3. **Shutdown**: End of input drains in-flight calls; a signal aborts them
//!
//! Each `tools/call` runs on its own task and writes its response when it
//! finishes, so responses may leave in a different order than the requests
//! arrived. The client correlates them by id.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::{AbortHandle, JoinSet};

use crate::mcp::codec::{self, Message};
use crate::mcp::dispatcher::Dispatcher;
use crate::mcp::error::TransportError;
use crate::mcp::protocol::{
    methods, parse_message, ErrorCode, Implementation, IncomingMessage, InitializeParams,
    InitializeResult, JsonRpcError, JsonRpcErrorData, JsonRpcNotification, JsonRpcRequest,
    RequestId, ServerCapabilities, MCP_PROTOCOL_VERSION, SERVER_NAME,
};
use crate::mcp::registry::{Arguments, ToolRegistry};
use crate::mcp::transport::{Received, Transport};

/// Server state in the MCP lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Waiting for initialize request.
    AwaitingInit,
    /// Initialize received, waiting for initialized notification.
    Initialising,
    /// Ready for normal operation.
    Running,
    /// Shutdown in progress.
    ShuttingDown,
}

type InFlight = Arc<Mutex<HashMap<RequestId, AbortHandle>>>;

/// A tool server bound to one client.
pub struct McpServer {
    /// Current server state.
    state: ServerState,
    /// Resolves and runs tool calls.
    dispatcher: Dispatcher,
    /// Reported to the client in the handshake response.
    info: Implementation,
    /// Negotiated protocol version (set after initialisation).
    protocol_version: Option<String>,
    /// Tool call tasks.
    tasks: JoinSet<()>,
    /// Abort handles of running calls, by request id.
    in_flight: InFlight,
}

impl std::fmt::Debug for McpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpServer")
            .field("state", &self.state)
            .field("info", &self.info)
            .field("protocol_version", &self.protocol_version)
            .field("tools", &self.dispatcher.registry().len())
            .finish_non_exhaustive()
    }
}

impl McpServer {
    /// Creates a server exposing the tools in `registry`.
    #[must_use]
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self::with_info(registry, Implementation::new(SERVER_NAME))
    }

    /// Creates a server that introduces itself as `info`.
    #[must_use]
    pub fn with_info(registry: Arc<ToolRegistry>, info: Implementation) -> Self {
        Self {
            state: ServerState::AwaitingInit,
            dispatcher: Dispatcher::new(registry),
            info,
            protocol_version: None,
            tasks: JoinSet::new(),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the current server state.
    #[must_use]
    pub const fn state(&self) -> ServerState {
        self.state
    }

    /// Serves `transport` until end of input or SIGINT/SIGTERM
    /// (Ctrl+C on Windows).
    ///
    /// # Errors
    ///
    /// Returns an error if signal handlers cannot be installed or transport
    /// I/O fails.
    pub async fn run(&mut self, transport: Transport) -> Result<(), TransportError> {
        let signal = shutdown_signal()?;
        self.run_until(transport, signal).await
    }

    /// Serves `transport` until end of input or until `shutdown` completes.
    ///
    /// At end of input every in-flight call is allowed to finish and send
    /// its response. On `shutdown` in-flight calls are aborted.
    ///
    /// # Errors
    ///
    /// Returns an error if transport I/O fails.
    pub async fn run_until<F>(
        &mut self,
        transport: Transport,
        shutdown: F,
    ) -> Result<(), TransportError>
    where
        F: Future<Output = ()>,
    {
        let transport = Arc::new(transport);
        tokio::pin!(shutdown);

        tracing::info!(
            server = %self.info.name,
            tools = self.dispatcher.registry().len(),
            "Server ready"
        );

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    self.state = ServerState::ShuttingDown;
                    let aborted = self.in_flight_count();
                    self.tasks.shutdown().await;
                    tracing::info!(aborted, "Server stopped");
                    return Ok(());
                }

                received = transport.receive() => {
                    match received? {
                        Received::Frame(frame) => {
                            if let Err(e) = self.handle_frame(&transport, &frame).await {
                                if matches!(e, TransportError::Closed) {
                                    tracing::info!("Client stopped reading, shutting down");
                                    self.state = ServerState::ShuttingDown;
                                    self.tasks.shutdown().await;
                                    return Ok(());
                                }
                                return Err(e);
                            }
                            self.reap_finished();
                        }
                        Received::Closed => break,
                    }
                }
            }
        }

        self.state = ServerState::ShuttingDown;
        let pending = self.in_flight_count();
        if pending > 0 {
            tracing::info!(pending, "End of input, waiting for in-flight calls");
        }
        while let Some(joined) = self.tasks.join_next().await {
            log_join(joined);
        }
        tracing::info!("Server stopped");
        Ok(())
    }

    fn in_flight_count(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn reap_finished(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            log_join(joined);
        }
    }

    /// Handles a single frame of input.
    async fn handle_frame(
        &mut self,
        transport: &Arc<Transport>,
        frame: &[u8],
    ) -> Result<(), TransportError> {
        let parsed = parse_message(frame);
        if let Ok(message) = &parsed {
            tracing::trace!(method = ?message.method(), id = ?message.id(), "Frame");
        }

        match parsed {
            Ok(IncomingMessage::Request(req)) => self.handle_request(transport, req).await,
            Ok(IncomingMessage::Notification(notif)) => {
                self.handle_notification(notif);
                Ok(())
            }
            Ok(IncomingMessage::Response(resp)) => {
                tracing::debug!(id = %resp.id, "Ignoring response from client");
                Ok(())
            }
            Ok(IncomingMessage::Error(err)) => {
                tracing::warn!(
                    id = ?err.id,
                    code = err.error.code,
                    message = %err.error.message,
                    "Client reported an error"
                );
                Ok(())
            }
            Err(error) => {
                tracing::warn!(code = error.error.code, "Rejected malformed frame");
                write(transport, &error.into()).await
            }
        }
    }

    /// Handles an incoming request.
    async fn handle_request(
        &mut self,
        transport: &Arc<Transport>,
        req: JsonRpcRequest,
    ) -> Result<(), TransportError> {
        tracing::debug!(id = %req.id, method = %req.method, "Request");

        if let Some(problem) = req.validate() {
            tracing::warn!(id = %req.id, problem, "Invalid request");
            return write(transport, &JsonRpcError::invalid_request(Some(req.id)).into()).await;
        }

        let id = req.id.clone();
        let method = req.method.clone();
        let response = match method.as_str() {
            methods::INITIALIZE => self.handle_initialize(req),
            methods::PING => Ok(Message::Pong { id }),
            methods::TOOLS_LIST => self.handle_tools_list(&id),
            methods::TOOLS_CALL => match self.handle_tools_call(transport, req) {
                // The spawned task writes the response.
                Ok(()) => return Ok(()),
                Err(error) => Err(error),
            },
            _ => Err(JsonRpcError::method_not_found(id, &method)),
        };

        match response {
            Ok(message) => write(transport, &message).await,
            Err(error) => write(transport, &error.into()).await,
        }
    }

    /// Handles an incoming notification.
    fn handle_notification(&mut self, notif: JsonRpcNotification) {
        let method = notif.method.clone();
        match codec::decode_notification(notif) {
            Ok(Message::Initialized) => {
                if self.state == ServerState::Initialising {
                    self.state = ServerState::Running;
                    tracing::info!("Session established");
                }
            }
            Ok(Message::Cancelled { request_id, reason }) => {
                let handle = self
                    .in_flight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&request_id);
                if let Some(handle) = handle {
                    handle.abort();
                    tracing::info!(id = %request_id, reason = ?reason, "Cancelled tool call");
                } else {
                    tracing::debug!(
                        id = %request_id,
                        "Cancellation for a call that is not running"
                    );
                }
            }
            Ok(other) => tracing::debug!(message = ?other, "Ignoring notification"),
            Err(e) => tracing::debug!(%method, error = %e, "Ignoring unknown notification"),
        }
    }

    /// Handles the initialize request.
    fn handle_initialize(&mut self, req: JsonRpcRequest) -> Result<Message, JsonRpcError> {
        if self.state != ServerState::AwaitingInit {
            return Err(JsonRpcError::new(
                Some(req.id),
                JsonRpcErrorData::with_message(
                    ErrorCode::InvalidRequest,
                    "Server already initialised",
                ),
            ));
        }

        let params: InitializeParams = req
            .params
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| {
                JsonRpcError::invalid_params(
                    req.id.clone(),
                    format!("Invalid initialize params: {e}"),
                )
            })?
            .ok_or_else(|| {
                JsonRpcError::invalid_params(req.id.clone(), "Missing initialize params")
            })?;

        if params.protocol_version != MCP_PROTOCOL_VERSION {
            tracing::warn!(
                requested = %params.protocol_version,
                offered = MCP_PROTOCOL_VERSION,
                "Client requested a different protocol version"
            );
        }
        tracing::info!(
            client = %params.client_info.name,
            version = ?params.client_info.version,
            "Initialize"
        );

        let negotiated_version = MCP_PROTOCOL_VERSION.to_string();
        self.protocol_version = Some(negotiated_version.clone());
        self.state = ServerState::Initialising;

        Ok(Message::HandshakeAck {
            id: req.id,
            result: InitializeResult {
                protocol_version: negotiated_version,
                capabilities: ServerCapabilities::default(),
                server_info: self.info.clone(),
            },
        })
    }

    /// Handles the tools/list request.
    fn handle_tools_list(&self, id: &RequestId) -> Result<Message, JsonRpcError> {
        self.require_running(id)?;

        Ok(Message::ListToolsResponse {
            id: id.clone(),
            tools: self
                .dispatcher
                .registry()
                .list()
                .into_iter()
                .cloned()
                .collect(),
        })
    }

    /// Starts a tools/call on its own task.
    fn handle_tools_call(
        &mut self,
        transport: &Arc<Transport>,
        req: JsonRpcRequest,
    ) -> Result<(), JsonRpcError> {
        self.require_running(&req.id)?;

        let request_id = req.id.clone();
        let (id, name, arguments) = match codec::decode_request(req) {
            Ok(Message::CallToolRequest {
                id,
                name,
                arguments,
            }) => (id, name, arguments),
            Ok(_) => return Err(JsonRpcError::internal_error(request_id, "Mismatched request")),
            Err(e) => {
                return Err(JsonRpcError::invalid_params(
                    request_id,
                    format!("Invalid tool call params: {e}"),
                ))
            }
        };

        let dispatcher = self.dispatcher.clone();
        let transport = Arc::clone(transport);
        let in_flight = Arc::clone(&self.in_flight);

        // Held across spawn so the task cannot remove its entry before it exists.
        let mut running = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let handle = self.tasks.spawn(run_call(
            dispatcher,
            transport,
            in_flight,
            id.clone(),
            name,
            arguments,
        ));
        if running.insert(id.clone(), handle).is_some() {
            tracing::warn!(%id, "Request id reused while a call with that id is running");
        }
        Ok(())
    }

    /// Ensures the server is in the Running state.
    fn require_running(&self, id: &RequestId) -> Result<(), JsonRpcError> {
        if self.state != ServerState::Running {
            return Err(JsonRpcError::new(
                Some(id.clone()),
                JsonRpcErrorData::with_message(ErrorCode::InvalidRequest, "Server not initialised"),
            ));
        }
        Ok(())
    }
}

async fn run_call(
    dispatcher: Dispatcher,
    transport: Arc<Transport>,
    in_flight: InFlight,
    id: RequestId,
    name: String,
    arguments: Arguments,
) {
    tracing::debug!(%id, tool = %name, "Tool call started");
    let outcome = dispatcher.dispatch(&name, arguments).await;

    in_flight
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id);

    let response = Message::CallToolResponse {
        id: id.clone(),
        outcome,
    };
    if let Err(e) = write(&transport, &response).await {
        tracing::warn!(%id, tool = %name, error = %e, "Failed to send tool result");
    } else {
        tracing::debug!(%id, tool = %name, "Tool call finished");
    }
}

async fn write(transport: &Transport, message: &Message) -> Result<(), TransportError> {
    let frame = match codec::encode(message) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialise response");
            let Some(id) = message.id().cloned() else {
                return Ok(());
            };
            let fallback: Message =
                JsonRpcError::internal_error(id, "Internal error: failed to serialise result")
                    .into();
            match codec::encode(&fallback) {
                Ok(frame) => frame,
                Err(_) => return Ok(()),
            }
        }
    };
    transport.send(&frame).await
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            tracing::error!(error = %e, "Tool call task panicked");
        }
    }
}

#[cfg(unix)]
fn shutdown_signal() -> io::Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    Ok(async move {
        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
        }
    })
}

#[cfg(windows)]
#[allow(clippy::unnecessary_wraps)]
fn shutdown_signal() -> io::Result<impl Future<Output = ()>> {
    Ok(async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received Ctrl+C, initiating graceful shutdown"),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::error::ToolError;
    use crate::mcp::registry::{ParamSpec, ParamType, Payload, ToolDescriptor};
    use serde_json::{json, Value};
    use std::time::Duration;

    fn registry() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                ToolDescriptor::new("echo", "Echo text")
                    .param(ParamSpec::required("text", ParamType::String)),
                |args| Ok(Payload::from(args["text"].as_str().unwrap_or_default())),
            )
            .unwrap();
        registry
            .register(ToolDescriptor::new("slow", "Sleeps"), |_| {
                std::thread::sleep(Duration::from_millis(200));
                Ok(Payload::from("done"))
            })
            .unwrap();
        registry
            .register(ToolDescriptor::new("fail", "Fails"), |_| {
                Err(ToolError::Failed("nope".to_string()))
            })
            .unwrap();
        Arc::new(registry)
    }

    struct Client {
        transport: Transport,
    }

    impl Client {
        async fn send(&self, value: Value) {
            self.transport.send(&value.to_string()).await.unwrap();
        }

        async fn send_raw(&self, line: &str) {
            self.transport.send(line).await.unwrap();
        }

        async fn recv(&self) -> Value {
            let Received::Frame(frame) = self.transport.receive().await.unwrap() else {
                panic!("server closed");
            };
            serde_json::from_slice(&frame).unwrap()
        }

        async fn handshake(&self) {
            self.send(json!({
                "jsonrpc": "2.0", "id": 0, "method": "initialize",
                "params": {
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {"name": "test", "version": "0"}
                }
            }))
            .await;
            let ack = self.recv().await;
            assert_eq!(ack["result"]["protocolVersion"], MCP_PROTOCOL_VERSION);
            self.send(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
                .await;
        }
    }

    fn start() -> (Client, tokio::task::JoinHandle<McpServer>) {
        let (client, server_side) = tokio::io::duplex(8192);
        let handle = tokio::spawn(async move {
            let mut server = McpServer::new(registry());
            server
                .run_until(Transport::from_stream(server_side), std::future::pending())
                .await
                .unwrap();
            server
        });
        (
            Client {
                transport: Transport::from_stream(client),
            },
            handle,
        )
    }

    #[test]
    fn server_initial_state() {
        let server = McpServer::new(registry());
        assert_eq!(server.state(), ServerState::AwaitingInit);
    }

    #[tokio::test]
    async fn tools_require_initialisation() {
        let (client, _server) = start();
        client
            .send(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
            .await;
        let reply = client.recv().await;
        assert_eq!(reply["id"], 1);
        assert_eq!(reply["error"]["code"], ErrorCode::InvalidRequest.code());
        assert_eq!(reply["error"]["message"], "Server not initialised");
    }

    #[tokio::test]
    async fn second_initialize_is_rejected() {
        let (client, _server) = start();
        client.handshake().await;
        client
            .send(json!({
                "jsonrpc": "2.0", "id": 2, "method": "initialize",
                "params": {"protocolVersion": MCP_PROTOCOL_VERSION, "capabilities": {},
                           "clientInfo": {"name": "again", "version": "0"}}
            }))
            .await;
        let reply = client.recv().await;
        assert_eq!(reply["error"]["message"], "Server already initialised");
    }

    #[tokio::test]
    async fn malformed_frame_and_unknown_method() {
        let (client, _server) = start();
        client.send_raw("{this is not json").await;
        let reply = client.recv().await;
        assert_eq!(reply["error"]["code"], ErrorCode::ParseError.code());
        assert!(reply["id"].is_null());

        client
            .send(json!({"jsonrpc": "2.0", "id": 9, "method": "songs/delete"}))
            .await;
        let reply = client.recv().await;
        assert_eq!(reply["id"], 9);
        assert_eq!(reply["error"]["code"], ErrorCode::MethodNotFound.code());

        client
            .send(json!({"jsonrpc": "2.0", "id": 10, "method": "ping"}))
            .await;
        assert_eq!(client.recv().await["result"], json!({}));
    }

    #[tokio::test]
    async fn calls_complete_out_of_order() {
        let (client, _server) = start();
        client.handshake().await;

        client
            .send(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call",
                         "params": {"name": "slow", "arguments": {}}}))
            .await;
        client
            .send(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call",
                         "params": {"name": "echo", "arguments": {"text": "fast"}}}))
            .await;

        let first = client.recv().await;
        let second = client.recv().await;
        assert_eq!(first["id"], 2);
        assert_eq!(first["result"]["content"][0]["text"], "fast");
        assert_eq!(second["id"], 1);
        assert_eq!(second["result"]["content"][0]["text"], "done");
    }

    #[tokio::test]
    async fn handler_failure_is_reported_in_result() {
        let (client, _server) = start();
        client.handshake().await;
        client
            .send(json!({"jsonrpc": "2.0", "id": 3, "method": "tools/call",
                         "params": {"name": "fail", "arguments": {}}}))
            .await;
        let reply = client.recv().await;
        assert_eq!(reply["result"]["isError"], true);
        assert_eq!(reply["result"]["errorKind"], "handler_error");
    }

    #[tokio::test]
    async fn end_of_input_drains_in_flight_calls() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let (client, server_side) = tokio::io::duplex(8192);
        let server = tokio::spawn(async move {
            let mut server = McpServer::new(registry());
            server
                .run_until(Transport::from_stream(server_side), std::future::pending())
                .await
                .unwrap();
            server
        });

        let (read_half, mut write_half) = tokio::io::split(client);
        let init = json!({
            "jsonrpc": "2.0", "id": 0, "method": "initialize",
            "params": {"protocolVersion": MCP_PROTOCOL_VERSION, "capabilities": {},
                       "clientInfo": {"name": "test", "version": "0"}}
        });
        let initialized = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        let call = json!({"jsonrpc": "2.0", "id": 4, "method": "tools/call",
                          "params": {"name": "slow", "arguments": {}}});
        for message in [init, initialized, call] {
            write_half
                .write_all(format!("{message}\n").as_bytes())
                .await
                .unwrap();
        }
        write_half.shutdown().await.unwrap();

        let mut lines = BufReader::new(read_half).lines();
        let ack: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(ack["id"], 0);
        let reply: Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["id"], 4);
        assert_eq!(reply["result"]["content"][0]["text"], "done");

        let server = server.await.unwrap();
        assert_eq!(server.state(), ServerState::ShuttingDown);
    }
}
