//! MCP front-end: JSON-RPC dispatch and the stdio serving loop.
//!
//! The hangar speaks the same protocol downward as it consumes upward:
//! clients send `initialize` / `tools/list` / `tools/call` and the
//! management tools are dispatched from `tools/call` by name. Logging goes
//! to stderr; stdout carries only JSON-RPC replies.

use hangar_types::wire::{self, RpcCall, RpcRejection};
use hangar_types::HangarError;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::state::AppState;
use crate::tools;

/// Tool descriptors returned by `tools/list`.
pub fn tool_definitions() -> Value {
    json!([
        {
            "name": "hangar_list",
            "description": "List all managed providers and groups with lifecycle state",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "state_filter": {"type": "string", "enum": ["cold", "initializing", "ready", "degraded", "dead"]}
                }
            }
        },
        {
            "name": "hangar_start",
            "description": "Start a provider or all members of a group",
            "inputSchema": {
                "type": "object",
                "properties": {"provider": {"type": "string"}},
                "required": ["provider"]
            }
        },
        {
            "name": "hangar_stop",
            "description": "Stop a provider or all members of a group",
            "inputSchema": {
                "type": "object",
                "properties": {"provider": {"type": "string"}},
                "required": ["provider"]
            }
        },
        {
            "name": "hangar_call",
            "description": "Execute a batch of tool calls with bounded parallelism",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "calls": {
                        "type": "array",
                        "maxItems": 100,
                        "items": {
                            "type": "object",
                            "properties": {
                                "provider": {"type": "string"},
                                "tool": {"type": "string"},
                                "arguments": {"type": "object"},
                                "timeout": {"type": "number"}
                            },
                            "required": ["provider", "tool"]
                        }
                    },
                    "max_concurrency": {"type": "integer", "minimum": 1, "maximum": 20},
                    "timeout": {"type": "integer", "minimum": 1, "maximum": 300},
                    "fail_fast": {"type": "boolean"},
                    "max_retries": {"type": "integer", "minimum": 1, "maximum": 10}
                },
                "required": ["calls"]
            }
        },
        {
            "name": "hangar_tools",
            "description": "Get tool schemas for a provider (starts it if discovery is required)",
            "inputSchema": {
                "type": "object",
                "properties": {"provider": {"type": "string"}},
                "required": ["provider"]
            }
        },
        {
            "name": "hangar_details",
            "description": "Detailed snapshot of a provider or group",
            "inputSchema": {
                "type": "object",
                "properties": {"provider": {"type": "string"}},
                "required": ["provider"]
            }
        },
        {
            "name": "hangar_health",
            "description": "Health counters for one provider or all providers",
            "inputSchema": {
                "type": "object",
                "properties": {"provider": {"type": "string"}}
            }
        },
        {
            "name": "hangar_status",
            "description": "Human-readable status dashboard",
            "inputSchema": {"type": "object", "properties": {}}
        },
        {
            "name": "hangar_warm",
            "description": "Pre-start a comma-separated list of providers",
            "inputSchema": {
                "type": "object",
                "properties": {"providers": {"type": "string"}},
                "required": ["providers"]
            }
        },
        {
            "name": "hangar_group_list",
            "description": "List groups with member-level rotation detail",
            "inputSchema": {"type": "object", "properties": {}}
        },
        {
            "name": "hangar_group_rebalance",
            "description": "Re-derive a group's rotation from member states",
            "inputSchema": {
                "type": "object",
                "properties": {"group": {"type": "string"}},
                "required": ["group"]
            }
        },
        {
            "name": "hangar_reload_config",
            "description": "Reload configuration from file and apply changes",
            "inputSchema": {
                "type": "object",
                "properties": {"graceful": {"type": "boolean"}}
            }
        }
    ])
}

/// Dispatch one call against the control plane, producing the reply value.
pub async fn dispatch(state: &Arc<AppState>, call: RpcCall) -> Value {
    let id = call.reply_id();

    if state.shutting_down.is_cancelled() {
        return RpcRejection::Draining.into_reply(id);
    }

    match call.method.as_str() {
        "initialize" => wire::reply(
            id,
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {
                    "name": "mcp-hangar",
                    "version": env!("CARGO_PKG_VERSION"),
                }
            }),
        ),
        "ping" => wire::reply(id, json!({})),
        "tools/list" => wire::reply(id, json!({ "tools": tool_definitions() })),
        "tools/call" => {
            let name = call
                .params
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            let arguments = call
                .params
                .get("arguments")
                .cloned()
                .unwrap_or(json!({}));
            call_tool(state, id, &name, arguments).await
        }
        other => RpcRejection::UnknownMethod(other.to_string()).into_reply(id),
    }
}

async fn call_tool(state: &Arc<AppState>, id: Value, name: &str, args: Value) -> Value {
    if !state.limiter.check(name) {
        state.metrics.record_rate_limit_hit();
        let envelope = HangarError::RateLimited(name.to_string()).to_envelope(None, Some(name));
        return tool_error_reply(id, &envelope);
    }

    let _guard = state.begin_call();
    let outcome = match name {
        "hangar_list" => tools::list(state, &args),
        "hangar_start" => tools::start(state, &args).await,
        "hangar_stop" => tools::stop(state, &args).await,
        "hangar_call" => tools::call(state, args.clone()).await,
        "hangar_tools" => tools::tools(state, &args).await,
        "hangar_details" => tools::details(state, &args),
        "hangar_health" => tools::health(state, &args),
        "hangar_status" => tools::status(state),
        "hangar_warm" => tools::warm(state, &args).await,
        "hangar_group_list" => tools::group_list(state),
        "hangar_group_rebalance" => tools::group_rebalance(state, &args),
        "hangar_reload_config" => tools::reload_config(state, &args).await,
        other => {
            return RpcRejection::UnknownTool(other.to_string()).into_reply(id);
        }
    };

    match outcome {
        Ok(value) => {
            let text = serde_json::to_string(&value).unwrap_or_else(|_| "{}".to_string());
            wire::reply(
                id,
                json!({
                    "content": [{"type": "text", "text": text}],
                    "isError": false,
                }),
            )
        }
        Err(e) => {
            let provider = args.get("provider").and_then(Value::as_str);
            let envelope = e.to_envelope(provider, Some(name));
            tool_error_reply(id, &envelope)
        }
    }
}

fn tool_error_reply(id: Value, envelope: &hangar_types::ErrorEnvelope) -> Value {
    let text = serde_json::to_string(envelope).unwrap_or_else(|_| "{}".to_string());
    wire::reply(
        id,
        json!({
            "content": [{"type": "text", "text": text}],
            "isError": true,
        }),
    )
}

/// Serve MCP over stdio until EOF or shutdown.
///
/// One request per line in, one reply per line out.
pub async fn serve_stdio(state: Arc<AppState>) -> std::io::Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut line = String::new();

    tracing::info!("serving MCP over stdio");

    loop {
        line.clear();
        let read = tokio::select! {
            read = stdin.read_line(&mut line) => read?,
            _ = state.shutting_down.cancelled() => break,
        };
        if read == 0 {
            tracing::info!("stdin closed, exiting");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let reply = match RpcCall::parse(trimmed) {
            Ok(call) => {
                // Notifications get no reply.
                if call.is_notification() {
                    tracing::debug!(method = %call.method, "notification ignored");
                    continue;
                }
                dispatch(&state, call).await
            }
            Err(e) => RpcRejection::Unparsable(e.to_string()).into_reply(Value::Null),
        };

        let mut frame = reply.to_string();
        frame.push('\n');
        stdout.write_all(frame.as_bytes()).await?;
        stdout.flush().await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_definitions_shape() {
        let defs = tool_definitions();
        let defs = defs.as_array().unwrap();
        assert!(defs.iter().any(|d| d["name"] == "hangar_call"));
        assert!(defs.iter().any(|d| d["name"] == "hangar_reload_config"));
        for def in defs {
            assert!(def["inputSchema"]["type"] == "object");
        }
    }
}
