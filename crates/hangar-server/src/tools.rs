//! Control-plane tool implementations.
//!
//! These are the operations the hangar exposes as MCP tools: lifecycle
//! commands (start/stop/warm/reload_config), the batched `call`, and
//! read-only queries (list/tools/details/health/status/group_list).

use hangar_core::batch::BatchRequest;
use hangar_core::provider::ProviderState;
use hangar_types::{HangarError, HangarResult};
use serde_json::{json, Value};

use crate::state::AppState;

fn arg_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

fn require_str<'a>(args: &'a Value, key: &str) -> HangarResult<&'a str> {
    arg_str(args, key)
        .ok_or_else(|| HangarError::Validation(format!("missing required argument {key:?}")))
}

/// `list`: all providers and groups with state and metadata.
pub fn list(state: &AppState, args: &Value) -> HangarResult<Value> {
    let filter = match arg_str(args, "state_filter") {
        Some(raw) => Some(ProviderState::parse(raw).ok_or_else(|| {
            HangarError::Validation(format!("unknown state filter {raw:?}"))
        })?),
        None => None,
    };

    let providers: Vec<Value> = state
        .registry
        .list_providers(filter)
        .into_iter()
        .map(|d| serde_json::to_value(d).unwrap_or(Value::Null))
        .collect();
    let groups: Vec<Value> = if filter.is_none() {
        state
            .registry
            .list_groups()
            .into_iter()
            .map(|d| serde_json::to_value(d).unwrap_or(Value::Null))
            .collect()
    } else {
        Vec::new()
    };

    Ok(json!({ "providers": providers, "groups": groups }))
}

/// `start`: bring a provider (or every member of a group) to READY.
pub async fn start(state: &AppState, args: &Value) -> HangarResult<Value> {
    let target = require_str(args, "provider")?;

    if let Some(group) = state.registry.group(target) {
        let started = group.start_all().await;
        let details = group.details();
        return Ok(json!({
            "group": target,
            "state": details.state,
            "members_started": started,
            "healthy_count": details.healthy_count,
            "total_members": details.total_members,
        }));
    }

    let provider = state
        .registry
        .provider(target)
        .ok_or_else(|| HangarError::ProviderNotFound(target.to_string()))?;
    provider.ensure_ready().await?;
    Ok(json!({
        "provider": target,
        "state": provider.state(),
        "tools": provider.tool_names(),
    }))
}

/// `stop`: shut a provider (or every member of a group) down to COLD.
pub async fn stop(state: &AppState, args: &Value) -> HangarResult<Value> {
    let target = require_str(args, "provider")?;

    if let Some(group) = state.registry.group(target) {
        group.stop_all("manual").await;
        return Ok(json!({
            "group": target,
            "state": group.details().state,
            "stopped": true,
        }));
    }

    let provider = state
        .registry
        .provider(target)
        .ok_or_else(|| HangarError::ProviderNotFound(target.to_string()))?;
    provider.shutdown("manual").await;
    Ok(json!({ "stopped": target, "reason": "manual" }))
}

/// `call`: execute a batch of tool invocations.
pub async fn call(state: &AppState, args: Value) -> HangarResult<Value> {
    let request: BatchRequest = serde_json::from_value(args)
        .map_err(|e| HangarError::Validation(format!("invalid batch request: {e}")))?;
    let outcome = state.batch.execute(request).await?;
    Ok(serde_json::to_value(outcome)?)
}

/// `tools`: tool schemas for a provider, starting it if discovery is needed.
pub async fn tools(state: &AppState, args: &Value) -> HangarResult<Value> {
    let target = require_str(args, "provider")?;

    if let Some(group) = state.registry.group(target) {
        // Tools of a group are the tools of any healthy member.
        let member_ids = group.member_ids();
        let first = member_ids
            .first()
            .ok_or_else(|| HangarError::NoHealthyMember(target.to_string()))?;
        let provider = state
            .registry
            .provider(first)
            .ok_or_else(|| HangarError::ProviderNotFound(first.clone()))?;
        if !provider.tools_predefined() {
            provider.ensure_ready().await?;
        }
        return Ok(json!({
            "provider": target,
            "group": true,
            "tools": provider.tools(),
        }));
    }

    let provider = state
        .registry
        .provider(target)
        .ok_or_else(|| HangarError::ProviderNotFound(target.to_string()))?;

    // Predefined schemas are served without starting anything.
    if !provider.tools_predefined() {
        provider.ensure_ready().await?;
    }
    Ok(json!({
        "provider": target,
        "state": provider.state(),
        "predefined": provider.tools_predefined(),
        "tools": provider.tools(),
    }))
}

/// `details`: full snapshot of one provider or group.
pub fn details(state: &AppState, args: &Value) -> HangarResult<Value> {
    let target = require_str(args, "provider")?;

    if let Some(group) = state.registry.group(target) {
        return Ok(serde_json::to_value(group.details())?);
    }
    let provider = state
        .registry
        .provider(target)
        .ok_or_else(|| HangarError::ProviderNotFound(target.to_string()))?;
    Ok(serde_json::to_value(provider.details())?)
}

/// `health`: health counters for one provider or all of them.
pub fn health(state: &AppState, args: &Value) -> HangarResult<Value> {
    if let Some(target) = arg_str(args, "provider") {
        let provider = state
            .registry
            .provider(target)
            .ok_or_else(|| HangarError::ProviderNotFound(target.to_string()))?;
        return Ok(json!({
            "provider": target,
            "state": provider.state(),
            "alive": provider.is_alive(),
            "health": provider.health_snapshot(),
        }));
    }

    let all: Vec<Value> = state
        .registry
        .list_providers(None)
        .into_iter()
        .map(|d| {
            json!({
                "provider": d.provider,
                "state": d.state,
                "alive": d.alive,
                "health": d.health,
            })
        })
        .collect();
    Ok(json!({ "providers": all }))
}

/// `status`: human-readable dashboard.
pub fn status(state: &AppState) -> HangarResult<Value> {
    let providers = state.registry.list_providers(None);
    let groups = state.registry.list_groups();

    let mut providers_status = Vec::with_capacity(providers.len());
    let mut healthy = 0usize;
    for d in &providers {
        let indicator = state_indicator(d.state);
        let mut entry = json!({
            "id": d.provider,
            "indicator": indicator,
            "state": d.state,
            "mode": d.mode,
        });
        match d.state {
            ProviderState::Ready => {
                healthy += 1;
                if let Some(ago) = d.last_used_ago_s {
                    entry["last_used"] = json!(format_time_ago(ago));
                }
            }
            ProviderState::Cold => {
                entry["note"] = json!("Will start on first request");
            }
            ProviderState::Degraded => {
                entry["consecutive_failures"] = json!(d.health.consecutive_failures);
            }
            _ => {}
        }
        providers_status.push(entry);
    }

    let groups_status: Vec<Value> = groups
        .iter()
        .map(|g| {
            json!({
                "id": g.group_id,
                "state": g.state,
                "healthy_members": g.healthy_count,
                "total_members": g.total_members,
            })
        })
        .collect();

    let uptime_s = state.uptime_seconds();
    let formatted = format_dashboard(&providers_status, &groups_status, healthy, providers.len(), &format_uptime(uptime_s));

    Ok(json!({
        "providers": providers_status,
        "groups": groups_status,
        "summary": {
            "healthy_providers": healthy,
            "total_providers": providers.len(),
            "uptime": format_uptime(uptime_s),
            "uptime_seconds": (uptime_s * 10.0).round() / 10.0,
        },
        "formatted": formatted,
    }))
}

/// `warm`: pre-start a comma-separated list of providers.
pub async fn warm(state: &AppState, args: &Value) -> HangarResult<Value> {
    let ids = require_str(args, "providers")?;
    let mut results = serde_json::Map::new();

    for id in ids.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let outcome = match state.registry.provider(id) {
            None => json!({ "ok": false, "error": format!("unknown_provider: {id}") }),
            Some(provider) => match provider.ensure_ready().await {
                Ok(()) => json!({ "ok": true, "state": provider.state() }),
                Err(e) => json!({ "ok": false, "error": e.to_string(), "kind": e.kind() }),
            },
        };
        results.insert(id.to_string(), outcome);
    }

    Ok(Value::Object(results))
}

/// `group_list`: member-level rotation detail for every group.
pub fn group_list(state: &AppState) -> HangarResult<Value> {
    let groups: Vec<Value> = state
        .registry
        .list_groups()
        .into_iter()
        .map(|g| serde_json::to_value(g).unwrap_or(Value::Null))
        .collect();
    Ok(json!({ "groups": groups }))
}

/// `group_rebalance`: re-derive rotation from member states.
pub fn group_rebalance(state: &AppState, args: &Value) -> HangarResult<Value> {
    let target = require_str(args, "group")?;
    let group = state
        .registry
        .group(target)
        .ok_or_else(|| HangarError::GroupNotFound(target.to_string()))?;
    group.rebalance();
    let details = group.details();
    Ok(json!({
        "group_id": target,
        "state": details.state,
        "healthy_count": details.healthy_count,
        "total_members": details.total_members,
        "members_in_rotation": details
            .members
            .iter()
            .filter(|m| m.in_rotation)
            .map(|m| m.provider.clone())
            .collect::<Vec<_>>(),
    }))
}

/// `reload_config`: re-read the config file and apply the diff.
pub async fn reload_config(state: &AppState, args: &Value) -> HangarResult<Value> {
    let graceful = args
        .get("graceful")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let handler = state.reload.as_ref().ok_or_else(|| {
        HangarError::Configuration("no configuration file path; reload unavailable".into())
    })?;

    match handler.reload(graceful, "tool").await {
        Ok(outcome) => Ok(json!({
            "status": "success",
            "providers_added": outcome.diff.added,
            "providers_removed": outcome.diff.removed,
            "providers_updated": outcome.diff.updated,
            "providers_unchanged": outcome.diff.unchanged,
            "duration_ms": outcome.duration_ms,
        })),
        Err(e) => Ok(json!({
            "status": "failed",
            "message": e.to_string(),
        })),
    }
}

// ---- formatting helpers ----

fn state_indicator(state: ProviderState) -> &'static str {
    match state {
        ProviderState::Ready => "[READY]",
        ProviderState::Cold => "[COLD]",
        ProviderState::Initializing => "[STARTING]",
        ProviderState::Degraded => "[DEGRADED]",
        ProviderState::Dead => "[DEAD]",
    }
}

fn format_time_ago(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{}s ago", seconds as u64)
    } else if seconds < 3600.0 {
        format!("{}m ago", (seconds / 60.0) as u64)
    } else {
        format!("{}h ago", (seconds / 3600.0) as u64)
    }
}

fn format_uptime(seconds: f64) -> String {
    let hours = (seconds / 3600.0) as u64;
    let minutes = ((seconds % 3600.0) / 60.0) as u64;
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

fn format_dashboard(
    providers: &[Value],
    groups: &[Value],
    healthy: usize,
    total: usize,
    uptime: &str,
) -> String {
    let mut lines = vec![
        "+-------------------------------------------------+".to_string(),
        "| MCP-Hangar Status                               |".to_string(),
        "+-------------------------------------------------+".to_string(),
    ];

    for p in providers {
        let indicator = p["indicator"].as_str().unwrap_or("[?]");
        let id = p["id"].as_str().unwrap_or("?");
        let state = p["state"].as_str().unwrap_or("?");
        let extra = p["last_used"]
            .as_str()
            .map(|s| format!("last: {s}"))
            .or_else(|| p["note"].as_str().map(str::to_string))
            .unwrap_or_default();
        lines.push(format!(
            "| {indicator:<10} {:<15} {:<9} {:<10}|",
            truncate(id, 15),
            truncate(state, 9),
            truncate(&extra, 10)
        ));
    }
    for g in groups {
        let id = g["id"].as_str().unwrap_or("?");
        let state = g["state"].as_str().unwrap_or("?");
        let extra = format!(
            "{}/{} healthy",
            g["healthy_members"].as_u64().unwrap_or(0),
            g["total_members"].as_u64().unwrap_or(0)
        );
        lines.push(format!(
            "| {:<10} {:<15} {:<9} {:<10}|",
            "[GROUP]",
            truncate(id, 15),
            truncate(state, 9),
            truncate(&extra, 10)
        ));
    }

    lines.push("+-------------------------------------------------+".to_string());
    lines.push(format!("| Health: {healthy}/{total} providers healthy"));
    lines.push(format!("| Uptime: {uptime}"));
    lines.push("+-------------------------------------------------+".to_string());
    lines.join("\n")
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        s[..max].to_string()
    }
}
