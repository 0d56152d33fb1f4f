//! Transports to upstream MCP providers.
//!
//! A transport multiplexes concurrent JSON-RPC calls over one underlying
//! channel: a child process's stdio, or an HTTP(S) endpoint.

mod http;
mod stdio;

pub use http::HttpTransport;
pub use stdio::StdioTransport;

use async_trait::async_trait;
use hangar_types::{HangarResult, RpcOutcome};
use serde_json::Value;
use std::time::Duration;

use crate::cancel::CancelToken;

/// One multiplexed JSON-RPC channel to a provider.
///
/// `call` may be invoked concurrently from many tasks; the transport
/// assigns monotonically unique request ids and correlates replies by id
/// regardless of wire arrival order. A remote *error object* settles the
/// call as `Ok(RpcOutcome::Failure)` — interpreting it is the supervisor's
/// job; `Err` is reserved for infrastructure failures (timeout, channel
/// death, malformed frames, cancellation).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue one JSON-RPC request and wait for its settled outcome.
    async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> HangarResult<RpcOutcome>;

    /// Whether the underlying channel is believed usable.
    fn is_alive(&self) -> bool;

    /// Release the channel and fail all pending callers with `transport`.
    async fn close(&self);
}
