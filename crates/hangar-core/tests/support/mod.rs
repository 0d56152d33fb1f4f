//! Shared test doubles: a scriptable transport and launcher.

#![allow(dead_code)]

use async_trait::async_trait;
use hangar_config::ProviderConfig;
use hangar_core::cancel::CancelToken;
use hangar_core::launcher::{Launched, TransportLauncher};
use hangar_core::transport::Transport;
use hangar_types::wire::RpcFailure;
use hangar_types::{HangarError, HangarResult, RpcOutcome};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Scripted behaviour for one `tools/call`.
#[derive(Debug, Clone)]
pub enum CallScript {
    /// Respond with this value.
    Ok(Value),
    /// Respond with a JSON-RPC error object (a tool-domain failure).
    ToolError(String),
    /// Fail with a transport error.
    Transport,
    /// Park until the per-call timeout or cancellation fires.
    Hang,
    /// Respond with the value after a delay.
    Delay(Duration, Value),
}

/// In-memory transport with scripted `tools/call` outcomes.
///
/// `initialize` and `tools/list` always succeed; the tool list is fixed at
/// construction.
pub struct MockTransport {
    tools: Value,
    script: Mutex<VecDeque<CallScript>>,
    default: CallScript,
    closed: AtomicBool,
    pub tools_call_count: AtomicU32,
}

impl MockTransport {
    pub fn ok(result: Value) -> Arc<Self> {
        Arc::new(Self {
            tools: default_tools(),
            script: Mutex::new(VecDeque::new()),
            default: CallScript::Ok(result),
            closed: AtomicBool::new(false),
            tools_call_count: AtomicU32::new(0),
        })
    }

    pub fn scripted(script: Vec<CallScript>, default: CallScript) -> Arc<Self> {
        Arc::new(Self {
            tools: default_tools(),
            script: Mutex::new(script.into()),
            default,
            closed: AtomicBool::new(false),
            tools_call_count: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.tools_call_count.load(Ordering::SeqCst)
    }
}

pub fn default_tools() -> Value {
    json!({
        "tools": [
            {"name": "add", "description": "Add numbers", "inputSchema": {"type": "object"}},
            {"name": "echo", "inputSchema": {"type": "object"}}
        ]
    })
}

#[async_trait]
impl Transport for MockTransport {
    async fn call(
        &self,
        method: &str,
        _params: Option<Value>,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> HangarResult<RpcOutcome> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HangarError::Transport("transport closed".into()));
        }

        match method {
            "initialize" => Ok(RpcOutcome::Success(
                json!({"protocolVersion": "2024-11-05", "capabilities": {}}),
            )),
            "tools/list" => Ok(RpcOutcome::Success(self.tools.clone())),
            "tools/call" => {
                self.tools_call_count.fetch_add(1, Ordering::SeqCst);
                let step = self
                    .script
                    .lock()
                    .pop_front()
                    .unwrap_or_else(|| self.default.clone());
                match step {
                    CallScript::Ok(value) => Ok(RpcOutcome::Success(value)),
                    CallScript::ToolError(message) => {
                        Ok(RpcOutcome::Failure(RpcFailure {
                            code: -32000,
                            message,
                            data: None,
                        }))
                    }
                    CallScript::Transport => {
                        Err(HangarError::Transport("connection reset".into()))
                    }
                    CallScript::Hang => {
                        tokio::select! {
                            _ = tokio::time::sleep(timeout) => Err(HangarError::Timeout {
                                operation: "tools/call".into(),
                                elapsed_ms: timeout.as_millis() as u64,
                            }),
                            _ = cancel.cancelled() => {
                                Err(HangarError::Cancelled("tools/call".into()))
                            }
                        }
                    }
                    CallScript::Delay(delay, value) => {
                        if delay >= timeout {
                            tokio::time::sleep(timeout).await;
                            return Err(HangarError::Timeout {
                                operation: "tools/call".into(),
                                elapsed_ms: timeout.as_millis() as u64,
                            });
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => Ok(RpcOutcome::Success(value)),
                            _ = cancel.cancelled() => {
                                Err(HangarError::Cancelled("tools/call".into()))
                            }
                        }
                    }
                }
            }
            other => Ok(RpcOutcome::Failure(RpcFailure {
                code: -32601,
                message: format!("method not found: {other}"),
                data: None,
            })),
        }
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Launcher handing out queued mock transports, counting launches.
pub struct MockLauncher {
    pub launches: AtomicU32,
    fail_next: AtomicU32,
    queue: Mutex<VecDeque<Arc<MockTransport>>>,
    default_result: Value,
}

impl MockLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            launches: AtomicU32::new(0),
            fail_next: AtomicU32::new(0),
            queue: Mutex::new(VecDeque::new()),
            default_result: json!({"sum": 5}),
        })
    }

    /// Queue a specific transport for the next launch.
    pub fn push(&self, transport: Arc<MockTransport>) {
        self.queue.lock().push_back(transport);
    }

    /// Fail the next `n` launches with a transport error.
    pub fn fail_launches(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn launch_count(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportLauncher for MockLauncher {
    async fn launch(&self, _config: &ProviderConfig) -> HangarResult<Launched> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.load(Ordering::SeqCst) > 0 {
            self.fail_next.fetch_sub(1, Ordering::SeqCst);
            return Err(HangarError::Transport("spawn failed: exec error".into()));
        }
        let transport = self
            .queue
            .lock()
            .pop_front()
            .unwrap_or_else(|| MockTransport::ok(self.default_result.clone()));
        Ok(Launched {
            transport,
            stdio: None,
        })
    }
}

/// A provider config suitable for supervisor tests.
pub fn test_provider_config() -> ProviderConfig {
    ProviderConfig::subprocess(vec!["mock-server".into()])
}
