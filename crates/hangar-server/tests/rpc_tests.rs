//! Front-end dispatch tests against an empty registry.

use hangar_config::HangarConfig;
use hangar_server::rpc;
use hangar_server::state::AppState;
use hangar_types::wire::RpcCall;
use serde_json::{json, Value};

fn empty_state() -> std::sync::Arc<AppState> {
    AppState::build(&HangarConfig::default(), None).unwrap()
}

fn request(method: &str, params: Value) -> RpcCall {
    RpcCall {
        id: Some(json!(1)),
        method: method.to_string(),
        params,
    }
}

fn tool_call(name: &str, arguments: Value) -> RpcCall {
    request("tools/call", json!({ "name": name, "arguments": arguments }))
}

/// Unpack the JSON payload out of an MCP text content reply.
fn content_json(reply: &Value) -> Value {
    let text = reply["result"]["content"][0]["text"].as_str().unwrap();
    serde_json::from_str(text).unwrap()
}

#[tokio::test]
async fn initialize_reports_server_info() {
    let state = empty_state();
    let reply = rpc::dispatch(&state, request("initialize", json!({}))).await;
    assert_eq!(reply["result"]["serverInfo"]["name"], "mcp-hangar");
    assert_eq!(reply["result"]["protocolVersion"], "2024-11-05");
    assert_eq!(reply["id"], 1);
}

#[tokio::test]
async fn tools_list_exposes_management_tools() {
    let state = empty_state();
    let reply = rpc::dispatch(&state, request("tools/list", json!({}))).await;
    let names: Vec<&str> = reply["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"hangar_list"));
    assert!(names.contains(&"hangar_call"));
    assert!(names.contains(&"hangar_warm"));
}

#[tokio::test]
async fn list_on_empty_registry() {
    let state = empty_state();
    let reply = rpc::dispatch(&state, tool_call("hangar_list", json!({}))).await;
    let payload = content_json(&reply);
    assert_eq!(payload["providers"], json!([]));
    assert_eq!(payload["groups"], json!([]));
}

#[tokio::test]
async fn status_has_summary_and_dashboard() {
    let state = empty_state();
    let reply = rpc::dispatch(&state, tool_call("hangar_status", json!({}))).await;
    let payload = content_json(&reply);
    assert_eq!(payload["summary"]["total_providers"], 0);
    assert!(payload["formatted"]
        .as_str()
        .unwrap()
        .contains("MCP-Hangar Status"));
}

#[tokio::test]
async fn unknown_provider_yields_error_envelope() {
    let state = empty_state();
    let reply = rpc::dispatch(
        &state,
        tool_call("hangar_start", json!({"provider": "ghost"})),
    )
    .await;
    assert_eq!(reply["result"]["isError"], true);
    let envelope: Value =
        serde_json::from_str(reply["result"]["content"][0]["text"].as_str().unwrap()).unwrap();
    assert_eq!(envelope["kind"], "not_found");
    assert_eq!(envelope["provider_id"], "ghost");
}

#[tokio::test]
async fn unknown_method_is_rejected() {
    let state = empty_state();
    let reply = rpc::dispatch(&state, request("resources/list", json!({}))).await;
    assert_eq!(reply["error"]["code"], -32601);
    assert!(reply.get("result").is_none());
}

#[tokio::test]
async fn unknown_tool_is_rejected() {
    let state = empty_state();
    let reply = rpc::dispatch(&state, tool_call("hangar_nonsense", json!({}))).await;
    assert_eq!(
        reply["error"]["code"],
        hangar_types::ErrorKind::NotFound.jsonrpc_code()
    );
}

#[tokio::test]
async fn batch_validation_error_reaches_client() {
    let state = empty_state();
    let reply = rpc::dispatch(
        &state,
        tool_call(
            "hangar_call",
            json!({"calls": [{"provider": "ghost", "tool": "add"}]}),
        ),
    )
    .await;
    assert_eq!(reply["result"]["isError"], true);
    let envelope: Value =
        serde_json::from_str(reply["result"]["content"][0]["text"].as_str().unwrap()).unwrap();
    assert_eq!(envelope["kind"], "validation");
}

#[tokio::test]
async fn shutting_down_refuses_new_calls() {
    let state = empty_state();
    state.shutting_down.cancel();
    let reply = rpc::dispatch(&state, tool_call("hangar_list", json!({}))).await;
    assert!(reply.get("error").is_some());
    assert!(reply["error"]["message"]
        .as_str()
        .unwrap()
        .contains("shutting down"));
}
