//! Typed protocol messages and their line encoding.
//!
//! Every message is one JSON-RPC 2.0 object serialised on a single line.
//! [`encode`] never emits embedded newlines, so the transport can frame on
//! `\n`. [`decode`] accepts one frame (without its terminator) and produces
//! a [`Message`]; responses carry no method name, so they are classified by
//! the shape of their `result`.

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::mcp::error::DecodeError;
use crate::mcp::protocol::{
    methods, parse_message, CancelledParams, IncomingMessage, InitializeParams, InitializeResult,
    JsonRpcError, JsonRpcErrorData, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    ListToolsResult, RequestId, ToolCallParams, ToolCallResult, ToolInfo,
};
use crate::mcp::registry::{Arguments, Outcome, ToolDescriptor};

/// Every message the protocol exchanges.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Client → server: open the session.
    Handshake {
        /// Correlation id.
        id: RequestId,
        /// Client information and requested version.
        params: InitializeParams,
    },
    /// Server → client: handshake accepted.
    HandshakeAck {
        /// Correlation id.
        id: RequestId,
        /// Server information and capabilities.
        result: InitializeResult,
    },
    /// Client → server: the handshake response was accepted.
    Initialized,
    /// Either direction: abandon an in-flight request.
    Cancelled {
        /// The request being abandoned.
        request_id: RequestId,
        /// Why it was abandoned.
        reason: Option<String>,
    },
    /// Liveness check.
    Ping {
        /// Correlation id.
        id: RequestId,
    },
    /// Reply to [`Message::Ping`].
    Pong {
        /// Correlation id.
        id: RequestId,
    },
    /// Client → server: discover tools.
    ListToolsRequest {
        /// Correlation id.
        id: RequestId,
    },
    /// Server → client: every exposed tool.
    ListToolsResponse {
        /// Correlation id.
        id: RequestId,
        /// Tool descriptors in registration order.
        tools: Vec<ToolDescriptor>,
    },
    /// Client → server: invoke a tool.
    CallToolRequest {
        /// Correlation id.
        id: RequestId,
        /// Tool name.
        name: String,
        /// Tool arguments.
        arguments: Arguments,
    },
    /// Server → client: the tool's outcome.
    CallToolResponse {
        /// Correlation id.
        id: RequestId,
        /// Success payload or failure.
        outcome: Outcome,
    },
    /// Protocol-level failure (unparsable frame, unknown method, bad state).
    Error {
        /// Correlation id, when the failing request's id is known.
        id: Option<RequestId>,
        /// JSON-RPC error object.
        error: JsonRpcErrorData,
    },
}

impl Message {
    /// The correlation id this message carries, if any.
    #[must_use]
    pub const fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Handshake { id, .. }
            | Self::HandshakeAck { id, .. }
            | Self::Ping { id }
            | Self::Pong { id }
            | Self::ListToolsRequest { id }
            | Self::ListToolsResponse { id, .. }
            | Self::CallToolRequest { id, .. }
            | Self::CallToolResponse { id, .. } => Some(id),
            Self::Error { id, .. } => id.as_ref(),
            Self::Initialized | Self::Cancelled { .. } => None,
        }
    }

    /// Whether this message answers an earlier request.
    #[must_use]
    pub const fn is_response(&self) -> bool {
        matches!(
            self,
            Self::HandshakeAck { .. }
                | Self::Pong { .. }
                | Self::ListToolsResponse { .. }
                | Self::CallToolResponse { .. }
                | Self::Error { .. }
        )
    }

    /// Converts this message into its JSON-RPC value.
    ///
    /// # Errors
    ///
    /// Returns an error if a payload cannot be serialised.
    pub fn to_value(&self) -> Result<Value, DecodeError> {
        let value = match self {
            Self::Handshake { id, params } => serde_json::to_value(JsonRpcRequest::new(
                id.clone(),
                methods::INITIALIZE,
                Some(serde_json::to_value(params)?),
            ))?,
            Self::HandshakeAck { id, result } => serde_json::to_value(JsonRpcResponse::success(
                id.clone(),
                serde_json::to_value(result)?,
            ))?,
            Self::Initialized => {
                serde_json::to_value(JsonRpcNotification::new(methods::INITIALIZED, None))?
            }
            Self::Cancelled { request_id, reason } => {
                let params = CancelledParams {
                    request_id: request_id.clone(),
                    reason: reason.clone(),
                };
                serde_json::to_value(JsonRpcNotification::new(
                    methods::CANCELLED,
                    Some(serde_json::to_value(params)?),
                ))?
            }
            Self::Ping { id } => {
                serde_json::to_value(JsonRpcRequest::new(id.clone(), methods::PING, None))?
            }
            Self::Pong { id } => {
                serde_json::to_value(JsonRpcResponse::success(id.clone(), json!({})))?
            }
            Self::ListToolsRequest { id } => serde_json::to_value(JsonRpcRequest::new(
                id.clone(),
                methods::TOOLS_LIST,
                None,
            ))?,
            Self::ListToolsResponse { id, tools } => {
                let result = ListToolsResult {
                    tools: tools.iter().map(ToolInfo::from).collect(),
                };
                serde_json::to_value(JsonRpcResponse::success(
                    id.clone(),
                    serde_json::to_value(result)?,
                ))?
            }
            Self::CallToolRequest {
                id,
                name,
                arguments,
            } => {
                let params = ToolCallParams {
                    name: name.clone(),
                    arguments: arguments.clone(),
                };
                serde_json::to_value(JsonRpcRequest::new(
                    id.clone(),
                    methods::TOOLS_CALL,
                    Some(serde_json::to_value(params)?),
                ))?
            }
            Self::CallToolResponse { id, outcome } => {
                let result = ToolCallResult::from(outcome);
                serde_json::to_value(JsonRpcResponse::success(
                    id.clone(),
                    serde_json::to_value(result)?,
                ))?
            }
            Self::Error { id, error } => {
                serde_json::to_value(JsonRpcError::new(id.clone(), error.clone()))?
            }
        };
        Ok(value)
    }
}

impl From<JsonRpcError> for Message {
    fn from(error: JsonRpcError) -> Self {
        Self::Error {
            id: error.id,
            error: error.error,
        }
    }
}

/// Encodes a message as a single line of JSON (without the trailing newline).
///
/// # Errors
///
/// Returns an error if a payload cannot be serialised.
pub fn encode(message: &Message) -> Result<String, DecodeError> {
    let line = serde_json::to_string(&message.to_value()?)?;
    debug_assert!(
        !line.contains('\n'),
        "JSON message must not contain embedded newlines"
    );
    Ok(line)
}

/// Decodes one frame into a message.
///
/// # Errors
///
/// Returns [`DecodeError`] if the frame is not JSON, not JSON-RPC, or not a
/// message this protocol knows.
pub fn decode(frame: &[u8]) -> Result<Message, DecodeError> {
    let incoming = parse_message(frame).map_err(|e| {
        DecodeError::InvalidMessage(format!("{} ({})", e.error.message, e.error.code))
    })?;

    match incoming {
        IncomingMessage::Request(req) => decode_request(req),
        IncomingMessage::Notification(notif) => decode_notification(notif),
        IncomingMessage::Response(resp) => decode_response(resp),
        IncomingMessage::Error(err) => Ok(err.into()),
    }
}

/// Decodes a request already split out by [`parse_message`].
///
/// # Errors
///
/// Returns [`DecodeError`] for unknown methods or malformed params.
pub fn decode_request(req: JsonRpcRequest) -> Result<Message, DecodeError> {
    let id = req.id;
    match req.method.as_str() {
        methods::INITIALIZE => Ok(Message::Handshake {
            id,
            params: params_of(req.params)?,
        }),
        methods::PING => Ok(Message::Ping { id }),
        methods::TOOLS_LIST => Ok(Message::ListToolsRequest { id }),
        methods::TOOLS_CALL => {
            let params: ToolCallParams = params_of(req.params)?;
            Ok(Message::CallToolRequest {
                id,
                name: params.name,
                arguments: params.arguments,
            })
        }
        other => Err(DecodeError::InvalidMessage(format!(
            "unknown method '{other}'"
        ))),
    }
}

/// Decodes a notification already split out by [`parse_message`].
///
/// # Errors
///
/// Returns [`DecodeError`] for unknown notifications or malformed params.
pub fn decode_notification(notif: JsonRpcNotification) -> Result<Message, DecodeError> {
    match notif.method.as_str() {
        methods::INITIALIZED => Ok(Message::Initialized),
        methods::CANCELLED => {
            let params: CancelledParams = params_of(notif.params)?;
            Ok(Message::Cancelled {
                request_id: params.request_id,
                reason: params.reason,
            })
        }
        other => Err(DecodeError::InvalidMessage(format!(
            "unknown notification '{other}'"
        ))),
    }
}

fn decode_response(resp: JsonRpcResponse) -> Result<Message, DecodeError> {
    let id = resp.id;
    let Some(result) = resp.result.as_object() else {
        return Err(DecodeError::InvalidMessage(format!(
            "result of response {id} is not an object"
        )));
    };

    if result.contains_key("serverInfo") {
        return Ok(Message::HandshakeAck {
            id,
            result: serde_json::from_value(resp.result)?,
        });
    }
    if result.contains_key("tools") {
        let listed: ListToolsResult = serde_json::from_value(resp.result)?;
        let tools = listed
            .tools
            .into_iter()
            .map(ToolDescriptor::try_from)
            .collect::<Result<_, _>>()?;
        return Ok(Message::ListToolsResponse { id, tools });
    }
    if result.contains_key("content") {
        let result: ToolCallResult = serde_json::from_value(resp.result)?;
        return Ok(Message::CallToolResponse {
            id,
            outcome: result.into(),
        });
    }
    if result.is_empty() {
        return Ok(Message::Pong { id });
    }

    Err(DecodeError::InvalidMessage(format!(
        "unrecognised result shape for response {id}"
    )))
}

fn params_of<T: DeserializeOwned>(params: Option<Value>) -> Result<T, DecodeError> {
    Ok(serde_json::from_value(params.unwrap_or_else(|| json!({})))?)
}

/// Best-effort extraction of the response `id` from a frame that failed to
/// decode.
///
/// Lets the session route a decode failure to the caller that is waiting on
/// it instead of leaving the call pending. Frames with a `method` are
/// requests from the peer and never match a pending call.
#[must_use]
pub fn salvage_id(frame: &[u8]) -> Option<RequestId> {
    let value: Value = serde_json::from_slice(frame).ok()?;
    if value.get("method").is_some() {
        return None;
    }
    serde_json::from_value(value.get("id")?.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::error::ErrorKind;
    use crate::mcp::protocol::{ErrorCode, Implementation, ServerCapabilities};
    use crate::mcp::registry::{ParamSpec, ParamType, Payload, ToolFailure};

    fn round_trip(message: &Message) -> Message {
        let line = encode(message).unwrap();
        assert!(!line.contains('\n'));
        decode(line.as_bytes()).unwrap()
    }

    #[test]
    fn handshake_round_trip() {
        let handshake = Message::Handshake {
            id: RequestId::Number(1),
            params: InitializeParams {
                protocol_version: "2024-11-05".to_string(),
                capabilities: json!({}),
                client_info: Implementation::new("test-client"),
            },
        };
        assert_eq!(round_trip(&handshake), handshake);

        let ack = Message::HandshakeAck {
            id: RequestId::Number(1),
            result: InitializeResult {
                protocol_version: "2024-11-05".to_string(),
                capabilities: ServerCapabilities::default(),
                server_info: Implementation::new("Song Manager"),
            },
        };
        assert_eq!(round_trip(&ack), ack);
    }

    #[test]
    fn call_tool_round_trip_with_empty_and_nested_arguments() {
        let empty = Message::CallToolRequest {
            id: RequestId::Number(2),
            name: "list_songs".to_string(),
            arguments: Arguments::new(),
        };
        assert_eq!(round_trip(&empty), empty);

        let nested = Message::CallToolRequest {
            id: RequestId::String("req-9".to_string()),
            name: "add_song".to_string(),
            arguments: json!({"title": "T", "meta": {"bpm": 120, "live": false}})
                .as_object()
                .cloned()
                .unwrap(),
        };
        assert_eq!(round_trip(&nested), nested);
    }

    #[test]
    fn list_tools_round_trip() {
        let request = Message::ListToolsRequest {
            id: RequestId::Number(3),
        };
        assert_eq!(round_trip(&request), request);

        let response = Message::ListToolsResponse {
            id: RequestId::Number(3),
            tools: vec![ToolDescriptor::new("echo", "Echo")
                .param(ParamSpec::required("text", ParamType::String))],
        };
        assert_eq!(round_trip(&response), response);
    }

    #[test]
    fn call_tool_response_round_trip() {
        for outcome in [
            Outcome::Success(Payload::Text("hi".to_string())),
            Outcome::Success(Payload::Structured(json!({"a": 1, "b": [true]}))),
            Outcome::Success(Payload::Structured(Value::Null)),
            Outcome::Failure(ToolFailure::new(ErrorKind::HandlerError, "division by zero")),
        ] {
            let response = Message::CallToolResponse {
                id: RequestId::Number(4),
                outcome,
            };
            assert_eq!(round_trip(&response), response);
        }
    }

    #[test]
    fn control_messages_round_trip() {
        for message in [
            Message::Initialized,
            Message::Ping {
                id: RequestId::Number(5),
            },
            Message::Pong {
                id: RequestId::Number(5),
            },
            Message::Cancelled {
                request_id: RequestId::Number(6),
                reason: Some("timeout".to_string()),
            },
            Message::Error {
                id: Some(RequestId::Number(7)),
                error: JsonRpcErrorData::from_code(ErrorCode::MethodNotFound),
            },
            Message::Error {
                id: None,
                error: JsonRpcErrorData::from_code(ErrorCode::ParseError),
            },
        ] {
            assert_eq!(round_trip(&message), message);
        }
    }

    #[test]
    fn decode_rejects_garbage_and_unknown_methods() {
        assert!(decode(b"{not json").is_err());
        assert!(decode(br#"{"jsonrpc":"2.0","id":1,"method":"songs/delete"}"#).is_err());
        assert!(decode(br#"{"jsonrpc":"2.0","id":1,"result":{"weird":1}}"#).is_err());
    }

    #[test]
    fn structured_null_is_not_text() {
        let frame = json!({
            "jsonrpc": "2.0",
            "id": 9,
            "result": {
                "content": [{"type": "text", "text": "null"}],
                "structuredContent": null
            }
        })
        .to_string();
        assert_eq!(
            decode(frame.as_bytes()).unwrap(),
            Message::CallToolResponse {
                id: RequestId::Number(9),
                outcome: Outcome::Success(Payload::Structured(Value::Null)),
            }
        );

        let frame =
            br#"{"jsonrpc":"2.0","id":9,"result":{"content":[{"type":"text","text":"null"}]}}"#;
        assert_eq!(
            decode(frame).unwrap(),
            Message::CallToolResponse {
                id: RequestId::Number(9),
                outcome: Outcome::Success(Payload::Text("null".to_string())),
            }
        );
    }

    #[test]
    fn salvage_id_from_malformed_result() {
        let frame = br#"{"jsonrpc":"2.0","id":12,"result":{"content":"not-a-list"}}"#;
        assert!(decode(frame).is_err());
        assert_eq!(salvage_id(frame), Some(RequestId::Number(12)));
        assert_eq!(salvage_id(b"garbage"), None);
        assert_eq!(
            salvage_id(br#"{"jsonrpc":"2.0","id":12,"method":"sampling/create"}"#),
            None
        );
    }
}
