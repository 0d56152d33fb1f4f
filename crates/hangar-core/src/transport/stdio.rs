//! STDIO transport
//!
//! Spawns a child process and speaks JSON-RPC 2.0 over newline-delimited
//! JSON on its stdin/stdout. Supports concurrent requests with id
//! correlation; stderr is captured into a bounded ring buffer so launch
//! failures can surface diagnostic text.

use async_trait::async_trait;
use hangar_types::wire::{self, Inbound};
use hangar_types::{HangarError, HangarResult, RpcOutcome};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::cancel::CancelToken;
use crate::transport::Transport;

/// Lines of stderr retained for diagnostics.
const STDERR_RING_CAPACITY: usize = 50;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<RpcOutcome>>>>;

/// STDIO transport over a spawned child process.
pub struct StdioTransport {
    /// Child process handle, kept for liveness checks and kill.
    child: Mutex<Option<Child>>,

    /// Observed exit status, recorded on `try_wait` / kill.
    exit_code: Mutex<Option<i32>>,

    pid: Option<u32>,

    /// Stdin handle; an async mutex serialises outbound frames.
    stdin: AsyncMutex<Option<ChildStdin>>,

    /// Pending requests waiting for replies, keyed by request id.
    /// Held only across table operations, never across I/O.
    pending: PendingMap,

    /// Monotonic request id allocator. Timed-out ids are never reused.
    next_id: AtomicU64,

    closed: Arc<AtomicBool>,

    /// Last stderr lines from the child.
    stderr_ring: Arc<Mutex<VecDeque<String>>>,

    reader_task: Mutex<Option<JoinHandle<()>>>,
    stderr_task: Mutex<Option<JoinHandle<()>>>,
}

impl StdioTransport {
    /// Spawn a child process and attach a transport to it.
    ///
    /// The command is executed directly, never through a shell. `env` is the
    /// complete child environment (the caller has already sandboxed it).
    pub async fn spawn(
        command: &[String],
        env: HashMap<String, String>,
    ) -> HangarResult<Self> {
        let program = command
            .first()
            .ok_or_else(|| HangarError::Validation("empty command".into()))?;

        tracing::info!(command = ?command, "Spawning provider process");

        let mut child = Command::new(program)
            .args(&command[1..])
            .env_clear()
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HangarError::Transport(format!("Failed to spawn {program:?}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HangarError::Transport("Failed to capture child stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HangarError::Transport("Failed to capture child stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| HangarError::Transport("Failed to capture child stderr".into()))?;

        let pid = child.id();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let stderr_ring = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_RING_CAPACITY)));

        let reader_task = Self::start_stdout_reader(stdout, pending.clone(), closed.clone());
        let stderr_task = Self::start_stderr_reader(stderr, stderr_ring.clone());

        Ok(Self {
            child: Mutex::new(Some(child)),
            exit_code: Mutex::new(None),
            pid,
            stdin: AsyncMutex::new(Some(stdin)),
            pending,
            next_id: AtomicU64::new(1),
            closed,
            stderr_ring,
            reader_task: Mutex::new(Some(reader_task)),
            stderr_task: Mutex::new(Some(stderr_task)),
        })
    }

    /// Reader task: consume stdout lines and settle pending calls.
    ///
    /// Any channel failure (EOF, read error, malformed frame) closes the
    /// transport and drains every pending caller.
    fn start_stdout_reader(
        stdout: ChildStdout,
        pending: PendingMap,
        closed: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        tracing::info!("Provider stdout closed (EOF)");
                        break;
                    }
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }

                        match Inbound::parse(trimmed) {
                            Ok(Inbound::Reply { id, outcome }) => {
                                match pending.lock().remove(&id) {
                                    Some(slot) => {
                                        // The caller may have timed out or
                                        // been cancelled in the meantime;
                                        // the orphan outcome is discarded.
                                        let _ = slot.send(outcome);
                                    }
                                    None => {
                                        tracing::warn!(
                                            id,
                                            "Discarding reply for released request id"
                                        );
                                    }
                                }
                            }
                            Ok(Inbound::Unroutable) => {
                                tracing::warn!("Discarding reply without routable id");
                            }
                            Ok(Inbound::ServerInitiated { method, has_id }) => {
                                if has_id {
                                    tracing::warn!(
                                        method = %method,
                                        "Ignoring reverse request from server"
                                    );
                                } else {
                                    tracing::debug!(
                                        method = %method,
                                        "Ignoring server notification"
                                    );
                                }
                            }
                            Err(e) => {
                                tracing::error!(
                                    error = %e,
                                    line = %&trimmed[..trimmed.len().min(200)],
                                    "Bad frame on provider stdout, closing transport"
                                );
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Error reading provider stdout");
                        break;
                    }
                }
            }

            // Channel is dead: refuse new calls and fail everyone pending.
            // Dropping the senders surfaces as a transport error to callers.
            closed.store(true, Ordering::SeqCst);
            let drained: Vec<_> = pending.lock().drain().collect();
            if !drained.is_empty() {
                tracing::warn!(
                    count = drained.len(),
                    "Failing pending requests after channel death"
                );
            }
        })
    }

    fn start_stderr_reader(
        stderr: ChildStderr,
        ring: Arc<Mutex<VecDeque<String>>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let mut ring = ring.lock();
                        if ring.len() == STDERR_RING_CAPACITY {
                            ring.pop_front();
                        }
                        ring.push_back(line.trim_end().to_string());
                    }
                    Err(_) => break,
                }
            }
        })
    }

    /// Last captured stderr lines, newline-joined.
    pub fn stderr_tail(&self) -> String {
        let ring = self.stderr_ring.lock();
        ring.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit code, if the process has been observed to exit.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock()
    }

    /// Check if the child process is still running.
    pub fn process_alive(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let mut child = self.child.lock();
        match child.as_mut() {
            Some(process) => match process.try_wait() {
                Ok(Some(status)) => {
                    *self.exit_code.lock() = status.code();
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    tracing::error!(error = %e, "Error checking child status");
                    false
                }
            },
            None => false,
        }
    }

    async fn kill(&self) {
        self.closed.store(true, Ordering::SeqCst);

        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.stderr_task.lock().take() {
            task.abort();
        }

        // Take the child out of the lock before the await point.
        let process = self.child.lock().take();
        if let Some(mut process) = process {
            if let Err(e) = process.kill().await {
                tracing::warn!(error = %e, "Failed to kill provider process");
            }
            if let Ok(Some(status)) = process.try_wait() {
                *self.exit_code.lock() = status.code();
            }
        }

        // Fail anyone still parked on a response slot.
        self.pending.lock().clear();
        *self.stdin.lock().await = None;
    }
}

#[async_trait]
impl Transport for StdioTransport {
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

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let mut frame = wire::request(id, method, params).to_string();
        frame.push('\n');

        // Write the frame while holding the stdin lock; table lock is not
        // held across I/O.
        {
            let mut stdin = self.stdin.lock().await;
            let stdin = match stdin.as_mut() {
                Some(stdin) => stdin,
                None => {
                    self.pending.lock().remove(&id);
                    return Err(HangarError::Transport("stdin unavailable".into()));
                }
            };
            if let Err(e) = stdin.write_all(frame.as_bytes()).await {
                self.pending.lock().remove(&id);
                return Err(HangarError::Transport(format!("write failed: {e}")));
            }
            if let Err(e) = stdin.flush().await {
                self.pending.lock().remove(&id);
                return Err(HangarError::Transport(format!("flush failed: {e}")));
            }
        }

        let started = std::time::Instant::now();
        tokio::select! {
            outcome = rx => outcome.map_err(|_| {
                HangarError::Transport("channel closed before reply".into())
            }),
            _ = tokio::time::sleep(timeout) => {
                // Release the slot; a late reply for this id is discarded
                // by the reader as an orphan.
                self.pending.lock().remove(&id);
                Err(HangarError::Timeout {
                    operation: method.to_string(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
            _ = cancel.cancelled() => {
                self.pending.lock().remove(&id);
                Err(HangarError::Cancelled(method.to_string()))
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.process_alive()
    }

    async fn close(&self) {
        tracing::info!("Closing STDIO transport");
        self.kill().await;
    }
}
