//! Batch execution of tool calls.
//!
//! Validates every call upfront (all-or-nothing), runs them with bounded
//! concurrency under a shared global deadline, deduplicates cold starts per
//! provider, retries retryable failures within budget, cancels siblings on
//! fail-fast, and truncates oversized payloads.

use dashmap::DashMap;
use hangar_config::{BatchLimits, TruncationConfig};
use hangar_types::events::EventMeta;
use hangar_types::{ErrorKind, HangarError, HangarEvent, HangarResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::bus::EventBus;
use crate::cancel::CancelToken;
use crate::continuation::ContinuationStore;
use crate::metrics::HangarMetrics;
use crate::provider::ProviderSupervisor;
use crate::registry::Registry;
use crate::singleflight::SingleFlight;

const MAX_ARGUMENT_BYTES: usize = 1024 * 1024;
const MAX_ARGUMENT_DEPTH: usize = 10;
const MIN_CALL_TIMEOUT_S: f64 = 0.1;
const MAX_CALL_TIMEOUT_S: f64 = 3600.0;
const DEFAULT_CALL_TIMEOUT_S: f64 = 30.0;
const DEFAULT_BATCH_TIMEOUT_S: u64 = 60;
const DEFAULT_MAX_CONCURRENCY: usize = 5;
const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(10);

/// One call inside a batch. `provider` may name a provider or a group.
#[derive(Debug, Clone, Deserialize)]
pub struct CallSpec {
    pub provider: String,
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default)]
    pub timeout: Option<f64>,
}

/// A batch request as accepted by the `call` tool.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    pub calls: Vec<CallSpec>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// Outcome of a single call, ordered by original index in the response.
#[derive(Debug, Clone, Serialize)]
pub struct CallResult {
    pub index: usize,
    pub call_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub retries: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_size_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation_id: Option<String>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub batch_id: String,
    pub success: bool,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
    pub results: Vec<CallResult>,
}

/// Shared per-batch execution state.
struct BatchContext {
    batch_id: String,
    deadline: Instant,
    cancel: CancelToken,
    semaphore: Semaphore,
    max_retries: u32,
    fail_fast: bool,
    /// Single-flight plus memo: `ensure_ready` runs at most once per
    /// provider per batch, even across sequential calls.
    ready_flight: SingleFlight<String, Result<(), Arc<HangarError>>>,
    ready_memo: DashMap<String, Result<(), Arc<HangarError>>>,
    payload_bytes: AtomicUsize,
}

pub struct BatchExecutor {
    registry: Arc<Registry>,
    limits: BatchLimits,
    truncation: TruncationConfig,
    continuations: Arc<ContinuationStore>,
    bus: Arc<EventBus>,
    metrics: Arc<HangarMetrics>,
}

impl BatchExecutor {
    pub fn new(
        registry: Arc<Registry>,
        limits: BatchLimits,
        truncation: TruncationConfig,
        bus: Arc<EventBus>,
        metrics: Arc<HangarMetrics>,
    ) -> Self {
        let continuations = Arc::new(ContinuationStore::new(
            Duration::from_secs(truncation.cache_ttl_s),
            truncation.max_cache_entries,
        ));
        Self {
            registry,
            limits,
            truncation,
            continuations,
            bus,
            metrics,
        }
    }

    pub fn continuations(&self) -> Arc<ContinuationStore> {
        self.continuations.clone()
    }

    /// Execute a batch. Validation failures reject the whole batch before
    /// any call runs.
    pub async fn execute(&self, request: BatchRequest) -> HangarResult<BatchOutcome> {
        self.validate(&request)?;

        let total = request.calls.len();
        let max_concurrency = request
            .max_concurrency
            .unwrap_or(DEFAULT_MAX_CONCURRENCY)
            .clamp(1, self.limits.max_concurrency);
        let timeout_s = request
            .timeout
            .unwrap_or(DEFAULT_BATCH_TIMEOUT_S)
            .clamp(1, self.limits.max_timeout_s);
        let max_retries = request.max_retries.unwrap_or(1).clamp(1, self.limits.max_retries);

        let ctx = BatchContext {
            batch_id: Uuid::new_v4().simple().to_string(),
            deadline: Instant::now() + Duration::from_secs(timeout_s),
            cancel: CancelToken::new(),
            semaphore: Semaphore::new(max_concurrency),
            max_retries,
            fail_fast: request.fail_fast,
            ready_flight: SingleFlight::new(),
            ready_memo: DashMap::new(),
            payload_bytes: AtomicUsize::new(0),
        };

        tracing::info!(
            batch_id = %ctx.batch_id,
            total,
            max_concurrency,
            timeout_s,
            fail_fast = ctx.fail_fast,
            "executing batch"
        );

        let started = Instant::now();
        let futures: Vec<_> = request
            .calls
            .iter()
            .enumerate()
            .map(|(index, call)| self.run_call(index, call, &ctx))
            .collect();
        let results = futures::future::join_all(futures).await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let succeeded = results.iter().filter(|r| r.success).count();
        let failed = total - succeeded;

        self.metrics.record_batch(total, elapsed_ms);
        self.bus.publish(HangarEvent::BatchCompleted {
            meta: EventMeta::now(),
            batch_id: ctx.batch_id.clone(),
            total,
            succeeded,
            failed,
            duration_ms: elapsed_ms,
        });

        Ok(BatchOutcome {
            batch_id: ctx.batch_id,
            success: failed == 0,
            total,
            succeeded,
            failed,
            elapsed_ms,
            results,
        })
    }

    // ---- validation ----

    fn validate(&self, request: &BatchRequest) -> HangarResult<()> {
        if request.calls.is_empty() {
            return Err(HangarError::Validation(
                "batch must contain at least one call".into(),
            ));
        }
        if request.calls.len() > self.limits.max_calls {
            return Err(HangarError::Validation(format!(
                "batch size {} exceeds limit {}",
                request.calls.len(),
                self.limits.max_calls
            )));
        }

        let mut errors: Vec<String> = Vec::new();
        for (index, call) in request.calls.iter().enumerate() {
            if let Err(e) = self.validate_call(call) {
                errors.push(format!("call[{index}]: {e}"));
            }
        }
        if !errors.is_empty() {
            return Err(HangarError::Validation(errors.join("; ")));
        }
        Ok(())
    }

    fn validate_call(&self, call: &CallSpec) -> HangarResult<()> {
        let is_group = self.registry.group_exists(&call.provider);
        if !is_group && !self.registry.provider_exists(&call.provider) {
            return Err(HangarError::Validation(format!(
                "unknown_provider: {}",
                call.provider
            )));
        }

        hangar_types::ids::validate_tool_name(&call.tool)?;

        if !is_group {
            let provider = self
                .registry
                .provider(&call.provider)
                .expect("existence checked above");
            if provider.tools_predefined() && !provider.has_tool(&call.tool) {
                return Err(HangarError::Validation(format!(
                    "unknown_tool: {} (provider: {})",
                    call.tool, call.provider
                )));
            }
        }

        match &call.arguments {
            Value::Object(_) | Value::Null => {}
            other => {
                return Err(HangarError::Validation(format!(
                    "arguments must be an object, got {}",
                    json_type_name(other)
                )));
            }
        }

        let size = serde_json::to_vec(&call.arguments)?.len();
        if size > MAX_ARGUMENT_BYTES {
            return Err(HangarError::Validation(format!(
                "arguments too large: {size} bytes (max {MAX_ARGUMENT_BYTES})"
            )));
        }
        if json_depth(&call.arguments) > MAX_ARGUMENT_DEPTH {
            return Err(HangarError::Validation(format!(
                "arguments nesting exceeds {MAX_ARGUMENT_DEPTH} levels"
            )));
        }

        if let Some(timeout) = call.timeout {
            if !(MIN_CALL_TIMEOUT_S..=MAX_CALL_TIMEOUT_S).contains(&timeout) {
                return Err(HangarError::Validation(format!(
                    "timeout {timeout}s out of range ({MIN_CALL_TIMEOUT_S}-{MAX_CALL_TIMEOUT_S})"
                )));
            }
        }

        Ok(())
    }

    // ---- execution ----

    async fn run_call(&self, index: usize, call: &CallSpec, ctx: &BatchContext) -> CallResult {
        let call_id = format!("{}_{index}", ctx.batch_id);

        // Fail-fast skip: never started.
        if ctx.cancel.is_cancelled() {
            return cancelled_result(index, call_id, 0);
        }

        // Wait for a concurrency slot, but never past cancellation or the
        // global deadline.
        let _permit = tokio::select! {
            permit = ctx.semaphore.acquire() => permit.expect("semaphore is never closed"),
            _ = ctx.cancel.cancelled() => return cancelled_result(index, call_id, 0),
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(ctx.deadline)) => {
                return timeout_result(index, call_id, 0);
            }
        };
        if ctx.cancel.is_cancelled() {
            return cancelled_result(index, call_id, 0);
        }

        let started = Instant::now();
        let (outcome, retries) = self.attempt_call(call, ctx).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(value) => self.success_result(index, call_id, value, elapsed_ms, retries, ctx),
            Err(e) => {
                if ctx.fail_fast {
                    ctx.cancel.cancel();
                }
                CallResult {
                    index,
                    call_id,
                    success: false,
                    value: None,
                    error: Some(e.to_string()),
                    error_kind: Some(e.kind()),
                    elapsed_ms,
                    retries,
                    truncated: false,
                    original_size_bytes: None,
                    continuation_id: None,
                }
            }
        }
    }

    /// One call with retry-on-retryable, bounded by both timeouts.
    async fn attempt_call(
        &self,
        call: &CallSpec,
        ctx: &BatchContext,
    ) -> (HangarResult<Value>, u32) {
        let per_call =
            Duration::from_secs_f64(call.timeout.unwrap_or(DEFAULT_CALL_TIMEOUT_S));
        let mut attempt: u32 = 0;

        loop {
            let remaining = ctx.deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return (
                    Err(HangarError::Timeout {
                        operation: format!("{}/{}", call.provider, call.tool),
                        elapsed_ms: 0,
                    }),
                    attempt,
                );
            }
            let effective = per_call.min(remaining);

            let result = self.invoke_target(call, effective, ctx).await;
            match result {
                Err(e)
                    if e.is_retryable()
                        && attempt + 1 < ctx.max_retries
                        && !ctx.cancel.is_cancelled() =>
                {
                    attempt += 1;
                    let backoff =
                        Duration::from_millis(100u64 << attempt.min(7)).min(RETRY_BACKOFF_CAP);
                    if Instant::now() + backoff >= ctx.deadline {
                        return (Err(e), attempt);
                    }
                    tracing::debug!(
                        provider = %call.provider,
                        tool = %call.tool,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "retrying after failure"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = ctx.cancel.cancelled() => {
                            return (Err(HangarError::Cancelled("retry abandoned".into())), attempt);
                        }
                    }
                }
                other => return (other, attempt),
            }
        }
    }

    async fn invoke_target(
        &self,
        call: &CallSpec,
        timeout: Duration,
        ctx: &BatchContext,
    ) -> HangarResult<Value> {
        if let Some(group) = self.registry.group(&call.provider) {
            // The group gates on its circuit and handles member cold
            // starts through each supervisor's own single-flight.
            return group
                .invoke(&call.tool, call.arguments.clone(), timeout, &ctx.cancel)
                .await;
        }

        let provider = self
            .registry
            .provider(&call.provider)
            .ok_or_else(|| HangarError::ProviderNotFound(call.provider.clone()))?;

        self.ensure_ready_once(&provider, ctx).await?;
        provider
            .invoke(&call.tool, call.arguments.clone(), timeout, &ctx.cancel)
            .await
    }

    /// Batch-scoped cold-start deduplication: `ensure_ready` runs at most
    /// once per provider per batch; all callers share the outcome.
    async fn ensure_ready_once(
        &self,
        provider: &Arc<ProviderSupervisor>,
        ctx: &BatchContext,
    ) -> HangarResult<()> {
        let key = provider.id().to_string();
        if let Some(memo) = ctx.ready_memo.get(&key) {
            return memo.value().clone().map_err(|e| e.duplicate());
        }

        let provider = provider.clone();
        let memo_key = key.clone();
        let result = ctx
            .ready_flight
            .run(key, || async {
                let result = provider.ensure_ready().await.map_err(Arc::new);
                ctx.ready_memo.insert(memo_key, result.clone());
                result
            })
            .await;
        result.map_err(|e| e.duplicate())
    }

    /// Build a success result, truncating oversized payloads.
    fn success_result(
        &self,
        index: usize,
        call_id: String,
        value: Value,
        elapsed_ms: u64,
        retries: u32,
        ctx: &BatchContext,
    ) -> CallResult {
        let size = serde_json::to_vec(&value).map(|v| v.len()).unwrap_or(0);

        let over_call_cap = self.truncation.enabled && size > self.truncation.max_result_bytes;
        let over_batch_cap = self.truncation.enabled && {
            let total_after = ctx.payload_bytes.fetch_add(size, Ordering::SeqCst) + size;
            if total_after > self.truncation.max_batch_bytes {
                // A dropped payload does not consume budget.
                ctx.payload_bytes.fetch_sub(size, Ordering::SeqCst);
                true
            } else {
                false
            }
        };

        if over_call_cap || over_batch_cap {
            if over_call_cap {
                // Already added to the budget above unless the batch cap
                // check gave it back; reclaim for the per-call case too.
                if !over_batch_cap {
                    ctx.payload_bytes.fetch_sub(size, Ordering::SeqCst);
                }
            }
            let continuation_id = self.continuations.put(&ctx.batch_id, index, value);
            tracing::info!(
                batch_id = %ctx.batch_id,
                index,
                size,
                continuation_id = %continuation_id,
                "payload truncated"
            );
            return CallResult {
                index,
                call_id,
                success: true,
                value: None,
                error: None,
                error_kind: None,
                elapsed_ms,
                retries,
                truncated: true,
                original_size_bytes: Some(size),
                continuation_id: Some(continuation_id),
            };
        }

        CallResult {
            index,
            call_id,
            success: true,
            value: Some(value),
            error: None,
            error_kind: None,
            elapsed_ms,
            retries,
            truncated: false,
            original_size_bytes: None,
            continuation_id: None,
        }
    }
}

fn cancelled_result(index: usize, call_id: String, elapsed_ms: u64) -> CallResult {
    CallResult {
        index,
        call_id,
        success: false,
        value: None,
        error: Some("cancelled".into()),
        error_kind: Some(ErrorKind::Cancelled),
        elapsed_ms,
        retries: 0,
        truncated: false,
        original_size_bytes: None,
        continuation_id: None,
    }
}

fn timeout_result(index: usize, call_id: String, elapsed_ms: u64) -> CallResult {
    CallResult {
        index,
        call_id,
        success: false,
        value: None,
        error: Some("batch deadline exceeded".into()),
        error_kind: Some(ErrorKind::Timeout),
        elapsed_ms,
        retries: 0,
        truncated: false,
        original_size_bytes: None,
        continuation_id: None,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn json_depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(json_depth).max().unwrap_or(0),
        Value::Array(items) => 1 + items.iter().map(json_depth).max().unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_depth() {
        assert_eq!(json_depth(&json!(1)), 0);
        assert_eq!(json_depth(&json!({})), 1);
        assert_eq!(json_depth(&json!({"a": 1})), 1);
        assert_eq!(json_depth(&json!({"a": {"b": {"c": 1}}})), 3);
        assert_eq!(json_depth(&json!([[[1]]])), 3);
    }

    #[test]
    fn test_call_result_serialization_omits_empty_fields() {
        let result = CallResult {
            index: 0,
            call_id: "b_0".into(),
            success: true,
            value: Some(json!({"sum": 5})),
            error: None,
            error_kind: None,
            elapsed_ms: 12,
            retries: 0,
            truncated: false,
            original_size_bytes: None,
            continuation_id: None,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("error").is_none());
        assert!(json.get("truncated").is_none());
        assert!(json.get("retries").is_none());
        assert_eq!(json["value"]["sum"], 5);
    }

    #[test]
    fn test_call_result_serialization_keeps_failure_fields() {
        let result = cancelled_result(4, "b_4".into(), 0);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["error_kind"], "cancelled");
        assert_eq!(json["success"], false);
    }
}
