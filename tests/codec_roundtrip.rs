//! Wire-level checks for the message codec.

use serde_json::{json, Value};

use mcp_toolpipe::mcp::codec::{decode, encode, Message};
use mcp_toolpipe::mcp::error::ErrorKind;
use mcp_toolpipe::mcp::protocol::RequestId;
use mcp_toolpipe::mcp::registry::{Arguments, Outcome, ParamSpec, ParamType, Payload, ToolFailure};
use mcp_toolpipe::mcp::ToolDescriptor;

#[test]
fn embedded_newlines_stay_on_one_line() {
    let message = Message::CallToolRequest {
        id: RequestId::Number(1),
        name: "echo".to_string(),
        arguments: json!({"text": "line one\nline two\r\n\ttabbed"})
            .as_object()
            .cloned()
            .unwrap(),
    };

    let line = encode(&message).unwrap();
    assert!(!line.contains('\n'));
    assert!(!line.contains('\r'));
    assert_eq!(decode(line.as_bytes()).unwrap(), message);
}

#[test]
fn call_request_wire_shape() {
    let message = Message::CallToolRequest {
        id: RequestId::Number(42),
        name: "echo".to_string(),
        arguments: Arguments::new(),
    };
    let value: Value = serde_json::from_str(&encode(&message).unwrap()).unwrap();
    assert_eq!(
        value,
        json!({
            "jsonrpc": "2.0",
            "id": 42,
            "method": "tools/call",
            "params": {"name": "echo", "arguments": {}}
        })
    );
}

#[test]
fn failure_outcome_wire_shape() {
    let message = Message::CallToolResponse {
        id: RequestId::String("abc".to_string()),
        outcome: Outcome::Failure(ToolFailure::new(ErrorKind::UnknownTool, "Unknown tool: x")),
    };
    let value: Value = serde_json::from_str(&encode(&message).unwrap()).unwrap();
    assert_eq!(value["id"], "abc");
    assert_eq!(value["result"]["isError"], true);
    assert_eq!(value["result"]["errorKind"], "unknown_tool");
    assert_eq!(value["result"]["content"][0]["type"], "text");
    assert_eq!(value["result"]["content"][0]["text"], "Unknown tool: x");

    assert_eq!(decode(encode(&message).unwrap().as_bytes()).unwrap(), message);
}

#[test]
fn structured_payload_survives() {
    let message = Message::CallToolResponse {
        id: RequestId::Number(2),
        outcome: Outcome::Success(Payload::Structured(json!({
            "songs": [{"title": "A", "bpm": 120.5}, {"title": "B", "tags": []}],
            "total": 2,
            "empty": null
        }))),
    };
    assert_eq!(decode(encode(&message).unwrap().as_bytes()).unwrap(), message);
}

#[test]
fn tool_schema_keeps_parameter_order_and_defaults() {
    let descriptor = ToolDescriptor::new("add_song", "Add a song")
        .param(ParamSpec::required("title", ParamType::String))
        .param(ParamSpec::required("artist", ParamType::String))
        .param(ParamSpec::optional("genre", ParamType::String).with_default(json!("Unknown")))
        .param(ParamSpec::optional("live", ParamType::Boolean));

    let message = Message::ListToolsResponse {
        id: RequestId::Number(3),
        tools: vec![descriptor],
    };
    let line = encode(&message).unwrap();

    let value: Value = serde_json::from_str(&line).unwrap();
    let schema = &value["result"]["tools"][0]["inputSchema"];
    let keys: Vec<_> = schema["properties"]
        .as_object()
        .unwrap()
        .keys()
        .cloned()
        .collect();
    assert_eq!(keys, ["title", "artist", "genre", "live"]);
    assert_eq!(schema["required"], json!(["title", "artist"]));

    assert_eq!(decode(line.as_bytes()).unwrap(), message);
}

#[test]
fn garbage_is_rejected() {
    for frame in [
        &b""[..],
        b"[]",
        b"42",
        br#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#,
        br#"{"jsonrpc":"2.0","id":1}"#,
        br#"{"jsonrpc":"2.0","method":"notifications/unknown"}"#,
    ] {
        assert!(decode(frame).is_err(), "{}", String::from_utf8_lossy(frame));
    }
}
