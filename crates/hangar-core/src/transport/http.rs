//! HTTP(S) transport for remote MCP providers.
//!
//! Each call is one POST of a JSON-RPC request to the provider endpoint.
//! Servers may answer with a plain JSON body or with `text/event-stream`,
//! in which case events are consumed until one settles the matching
//! request id.

use async_trait::async_trait;
use hangar_config::{RemoteAuth, TlsOptions};
use hangar_types::wire::{self, Inbound};
use hangar_types::{HangarError, HangarResult, RpcOutcome};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::transport::Transport;

/// HTTP transport over a pooled reqwest client.
pub struct HttpTransport {
    endpoint: String,
    client: reqwest::Client,
    auth: Option<RemoteAuth>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl HttpTransport {
    /// Build a transport for a remote endpoint.
    ///
    /// No request is made here; the supervisor performs the `initialize`
    /// handshake on first use.
    pub fn connect(
        endpoint: String,
        auth: Option<RemoteAuth>,
        tls: Option<&TlsOptions>,
    ) -> HangarResult<Self> {
        let mut builder = reqwest::Client::builder();

        if let Some(tls) = tls {
            if !tls.verify {
                builder = builder.danger_accept_invalid_certs(true);
            }
            if let Some(ca_path) = &tls.ca_cert {
                let pem = std::fs::read(ca_path).map_err(|e| {
                    HangarError::Configuration(format!("Failed to read CA cert {ca_path:?}: {e}"))
                })?;
                let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                    HangarError::Configuration(format!("Invalid CA cert {ca_path:?}: {e}"))
                })?;
                builder = builder.add_root_certificate(cert);
            }
        }

        let client = builder
            .build()
            .map_err(|e| HangarError::Transport(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            endpoint,
            client,
            auth,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            Some(RemoteAuth::ApiKey { header, key }) => request.header(header, key),
            Some(RemoteAuth::Bearer { token }) => request.bearer_auth(token),
            Some(RemoteAuth::Basic { username, password }) => {
                request.basic_auth(username, Some(password))
            }
            None => request,
        }
    }

    /// Consume an SSE body until an event settles the expected id.
    ///
    /// ```text
    /// event: message
    /// data: {"jsonrpc":"2.0","id":1,...}
    /// ```
    fn settle_from_sse(body: &str, expect_id: u64) -> HangarResult<RpcOutcome> {
        for line in body.lines() {
            let Some(data) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() {
                continue;
            }
            if let Ok(Inbound::Reply { id, outcome }) = Inbound::parse(data) {
                if id == expect_id {
                    return Ok(outcome);
                }
            }
        }
        Err(HangarError::Protocol(format!(
            "No event settled request id {expect_id} in SSE response"
        )))
    }

    /// Settle from a plain JSON body.
    fn settle_from_json(body: &str, expect_id: u64) -> HangarResult<RpcOutcome> {
        match Inbound::parse(body)? {
            Inbound::Reply { id, outcome } if id == expect_id => Ok(outcome),
            Inbound::Reply { id, .. } => Err(HangarError::Protocol(format!(
                "reply id {id} does not match request id {expect_id}"
            ))),
            other => Err(HangarError::Protocol(format!(
                "expected a reply, got {other:?}"
            ))),
        }
    }

    async fn call_inner(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> HangarResult<RpcOutcome> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = wire::request(id, method, params);

        let http_request = self
            .apply_auth(self.client.post(&self.endpoint))
            .header("Accept", "application/json, text/event-stream")
            .timeout(timeout)
            .json(&frame);

        let started = std::time::Instant::now();
        let response = http_request.send().await.map_err(|e| {
            if e.is_timeout() {
                HangarError::Timeout {
                    operation: method.to_string(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                }
            } else {
                HangarError::Transport(format!("HTTP request failed: {e}"))
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(HangarError::Transport(format!(
                "HTTP status {status}: {}",
                &body[..body.len().min(500)]
            )));
        }

        let is_sse = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false);

        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                HangarError::Timeout {
                    operation: method.to_string(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                }
            } else {
                HangarError::Transport(format!("Failed to read response body: {e}"))
            }
        })?;

        if is_sse {
            Self::settle_from_sse(&body, id)
        } else {
            Self::settle_from_json(&body, id)
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> HangarResult<RpcOutcome> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HangarError::Transport("transport closed".into()));
        }
        if cancel.is_cancelled() {
            return Err(HangarError::Cancelled(format!("{method} not sent")));
        }

        tokio::select! {
            result = self.call_inner(method, params, timeout) => result,
            _ = cancel.cancelled() => Err(HangarError::Cancelled(method.to_string())),
        }
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
