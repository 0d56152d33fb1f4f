//! The hangar's view of the JSON-RPC 2.0 wire.
//!
//! Providers speak full JSON-RPC 2.0; the hangar needs far less of it.
//! Outbound it writes numeric-id requests for a handful of methods
//! (`initialize`, `tools/list`, `tools/call`), and inbound it cares about
//! exactly one question: which pending call does this frame settle, and
//! did it succeed. This module models that view instead of the whole
//! protocol, plus the thin serving surface the hangar exposes downward.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::{ErrorKind, HangarError, HangarResult};

pub const JSONRPC_VERSION: &str = "2.0";

/// Build an outbound request frame.
///
/// The hangar always assigns numeric ids; they are allocated monotonically
/// by the transport and never reused within a connection.
pub fn request(id: u64, method: &str, params: Option<Value>) -> Value {
    let mut frame = json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "method": method,
    });
    if let Some(params) = params {
        frame["params"] = params;
    }
    frame
}

/// Error object carried in a failed reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcFailure {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Settled outcome of one call.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcOutcome {
    /// The `result` member. An explicit `"result": null` settles as
    /// `Success(Value::Null)`; it is a valid outcome, not a missing one.
    Success(Value),
    /// The `error` object from the remote side.
    Failure(RpcFailure),
}

/// One inbound frame, classified the way the reader task needs it.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A reply that settles the pending call with this id.
    Reply { id: u64, outcome: RpcOutcome },
    /// A reply whose id is absent or not numeric; there is nothing to
    /// settle, so it can only be discarded.
    Unroutable,
    /// Traffic the server started on its own: a notification, or a
    /// reverse request (`has_id`) that would expect an answer.
    ServerInitiated { method: String, has_id: bool },
}

impl Inbound {
    /// Parse one wire line.
    pub fn parse(line: &str) -> HangarResult<Inbound> {
        let frame: Value = serde_json::from_str(line)
            .map_err(|e| HangarError::Protocol(format!("malformed frame: {e}")))?;
        Self::classify(frame)
    }

    /// Classify a decoded frame.
    ///
    /// Anything carrying a `result` or `error` member settles a call;
    /// anything else with a `method` is server-initiated. A frame with
    /// neither is a protocol violation and kills the channel.
    pub fn classify(frame: Value) -> HangarResult<Inbound> {
        let Value::Object(mut frame) = frame else {
            return Err(HangarError::Protocol("frame is not a JSON object".into()));
        };

        let result = frame.remove("result");
        let error = frame.remove("error");
        if result.is_some() || error.is_some() {
            let Some(id) = frame.get("id").and_then(numeric_id) else {
                return Ok(Inbound::Unroutable);
            };
            let outcome = match error {
                Some(error) => {
                    let failure = serde_json::from_value(error).map_err(|e| {
                        HangarError::Protocol(format!("malformed error object: {e}"))
                    })?;
                    RpcOutcome::Failure(failure)
                }
                None => RpcOutcome::Success(result.unwrap_or(Value::Null)),
            };
            return Ok(Inbound::Reply { id, outcome });
        }

        match frame.get("method").and_then(Value::as_str) {
            Some(method) => Ok(Inbound::ServerInitiated {
                method: method.to_string(),
                has_id: frame.contains_key("id"),
            }),
            None => Err(HangarError::Protocol(
                "frame has neither result, error nor method".into(),
            )),
        }
    }
}

/// Accept a reply id as a number or a numeric string; some servers echo
/// numeric ids back stringified.
fn numeric_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

// ---- the hangar's own serving surface ----

/// A call arriving on the hangar's serving surface.
///
/// Clients may use any id shape here; it is echoed back verbatim.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcCall {
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcCall {
    pub fn parse(line: &str) -> HangarResult<RpcCall> {
        serde_json::from_str(line)
            .map_err(|e| HangarError::Protocol(format!("malformed request: {e}")))
    }

    /// Notifications carry no id and get no reply.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Id to echo in the reply; `null` when the client sent none.
    pub fn reply_id(&self) -> Value {
        self.id.clone().unwrap_or(Value::Null)
    }
}

/// Build a success reply on the serving surface.
pub fn reply(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result,
    })
}

/// Build an error reply carrying a hangar error kind.
///
/// Kinds map onto the `-320xx` application band (see
/// [`ErrorKind::jsonrpc_code`]); standard codes are used where JSON-RPC
/// defines one.
pub fn reply_error(id: Value, kind: ErrorKind, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": {
            "code": kind.jsonrpc_code(),
            "message": message.into(),
        },
    })
}

/// Protocol-level rejections the hangar's dispatcher issues itself,
/// before any tool runs.
#[derive(Debug, Clone)]
pub enum RpcRejection {
    /// The frame was not parseable as a request.
    Unparsable(String),
    /// No such JSON-RPC method on this surface.
    UnknownMethod(String),
    /// `tools/call` named a tool this surface does not expose.
    UnknownTool(String),
    /// The process is draining and takes no new work.
    Draining,
}

impl RpcRejection {
    fn code_and_message(&self) -> (i64, String) {
        match self {
            RpcRejection::Unparsable(detail) => (-32700, format!("parse error: {detail}")),
            RpcRejection::UnknownMethod(method) => {
                (-32601, format!("method not found: {method}"))
            }
            RpcRejection::UnknownTool(tool) => (
                ErrorKind::NotFound.jsonrpc_code(),
                format!("unknown_tool: {tool}"),
            ),
            RpcRejection::Draining => (
                ErrorKind::Cancelled.jsonrpc_code(),
                "hangar is shutting down".to_string(),
            ),
        }
    }

    pub fn into_reply(self, id: Value) -> Value {
        let (code, message) = self.code_and_message();
        json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "error": { "code": code, "message": message },
        })
    }
}

/// MCP tool descriptor as exchanged over `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct McpTool {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(rename = "inputSchema")]
    pub input_schema: Value,

    #[serde(rename = "outputSchema", skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_frame_shape() {
        let frame = request(7, "tools/call", Some(json!({"name": "add"})));
        assert_eq!(frame["jsonrpc"], "2.0");
        assert_eq!(frame["id"], 7);
        assert_eq!(frame["method"], "tools/call");
        assert_eq!(frame["params"]["name"], "add");

        let bare = request(1, "tools/list", None);
        assert!(bare.get("params").is_none());
    }

    #[test]
    fn test_classify_success_reply() {
        let inbound = Inbound::parse(r#"{"jsonrpc":"2.0","id":3,"result":{"ok":true}}"#).unwrap();
        assert_eq!(
            inbound,
            Inbound::Reply {
                id: 3,
                outcome: RpcOutcome::Success(json!({"ok": true})),
            }
        );
    }

    #[test]
    fn test_classify_preserves_explicit_null_result() {
        let inbound = Inbound::parse(r#"{"jsonrpc":"2.0","id":1,"result":null}"#).unwrap();
        assert_eq!(
            inbound,
            Inbound::Reply {
                id: 1,
                outcome: RpcOutcome::Success(Value::Null),
            }
        );
    }

    #[test]
    fn test_classify_failure_reply() {
        let inbound = Inbound::parse(
            r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32000,"message":"boom"}}"#,
        )
        .unwrap();
        match inbound {
            Inbound::Reply {
                id: 2,
                outcome: RpcOutcome::Failure(failure),
            } => {
                assert_eq!(failure.code, -32000);
                assert_eq!(failure.message, "boom");
                assert_eq!(failure.data, None);
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn test_classify_accepts_stringified_numeric_id() {
        let inbound = Inbound::parse(r#"{"jsonrpc":"2.0","id":"17","result":{}}"#).unwrap();
        assert!(matches!(inbound, Inbound::Reply { id: 17, .. }));
    }

    #[test]
    fn test_reply_without_routable_id_is_unroutable() {
        let null_id = Inbound::parse(r#"{"jsonrpc":"2.0","id":null,"result":{}}"#).unwrap();
        assert_eq!(null_id, Inbound::Unroutable);

        let name_id = Inbound::parse(r#"{"jsonrpc":"2.0","id":"abc","result":{}}"#).unwrap();
        assert_eq!(name_id, Inbound::Unroutable);
    }

    #[test]
    fn test_classify_server_initiated() {
        let notification =
            Inbound::parse(r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#).unwrap();
        assert_eq!(
            notification,
            Inbound::ServerInitiated {
                method: "notifications/progress".into(),
                has_id: false,
            }
        );

        let reverse =
            Inbound::parse(r#"{"jsonrpc":"2.0","id":9,"method":"sampling/createMessage"}"#)
                .unwrap();
        assert_eq!(
            reverse,
            Inbound::ServerInitiated {
                method: "sampling/createMessage".into(),
                has_id: true,
            }
        );
    }

    #[test]
    fn test_malformed_frames_are_protocol_errors() {
        assert!(Inbound::parse("not json").is_err());
        assert!(Inbound::parse(r#"[1,2,3]"#).is_err());
        assert!(Inbound::parse(r#"{"jsonrpc":"2.0","id":1}"#).is_err());
    }

    #[test]
    fn test_rpc_call_parse_and_notification() {
        let call = RpcCall::parse(r#"{"jsonrpc":"2.0","id":"abc","method":"tools/list"}"#).unwrap();
        assert!(!call.is_notification());
        assert_eq!(call.reply_id(), json!("abc"));
        assert_eq!(call.params, Value::Null);

        let notification =
            RpcCall::parse(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).unwrap();
        assert!(notification.is_notification());
        assert_eq!(notification.reply_id(), Value::Null);
    }

    #[test]
    fn test_reply_builders() {
        let ok = reply(json!(1), json!({"tools": []}));
        assert_eq!(ok["result"]["tools"], json!([]));
        assert!(ok.get("error").is_none());

        let err = reply_error(json!(1), ErrorKind::RateLimited, "slow down");
        assert_eq!(err["error"]["code"], ErrorKind::RateLimited.jsonrpc_code());
        assert_eq!(err["error"]["message"], "slow down");
    }

    #[test]
    fn test_rejection_codes() {
        let parse = RpcRejection::Unparsable("eof".into()).into_reply(Value::Null);
        assert_eq!(parse["error"]["code"], -32700);

        let method = RpcRejection::UnknownMethod("resources/list".into()).into_reply(json!(4));
        assert_eq!(method["error"]["code"], -32601);
        assert_eq!(method["id"], 4);

        let tool = RpcRejection::UnknownTool("hangar_nope".into()).into_reply(json!(5));
        assert_eq!(
            tool["error"]["code"],
            ErrorKind::NotFound.jsonrpc_code()
        );
    }

    #[test]
    fn test_tool_descriptor_field_names() {
        let tool = McpTool {
            name: "add".into(),
            description: Some("Add two numbers".into()),
            input_schema: json!({"type": "object"}),
            output_schema: None,
        };
        let json = serde_json::to_string(&tool).unwrap();
        assert!(json.contains("inputSchema"));
        assert!(!json.contains("outputSchema"));
    }
}
