//! Provider groups: load-balanced routing over several providers.
//!
//! A group selects an in-rotation member per call, reports success or
//! infrastructure failure back into per-member health, and retries exactly
//! one alternate member on infrastructure failure. A group-level circuit
//! breaker short-circuits calls after too many aggregated failures, with a
//! single half-open probe after the reset timeout.

use hangar_config::{GroupConfig, GroupStrategy};
use hangar_types::events::EventMeta;
use hangar_types::{GroupId, HangarError, HangarEvent, HangarResult};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bus::EventBus;
use crate::cancel::CancelToken;
use crate::metrics::HangarMetrics;
use crate::provider::{ProviderState, ProviderSupervisor};

/// Group availability states. DEGRADED means the circuit is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupState {
    Inactive,
    Partial,
    Healthy,
    Degraded,
}

impl GroupState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupState::Inactive => "inactive",
            GroupState::Partial => "partial",
            GroupState::Healthy => "healthy",
            GroupState::Degraded => "degraded",
        }
    }
}

/// Per-member routing state, guarded by the group routing lock.
struct Member {
    provider: Arc<ProviderSupervisor>,
    weight: u32,
    priority: u32,
    in_rotation: bool,
    consecutive_failures: u32,
    consecutive_successes: u32,
    /// In-flight calls routed to this member (least_connections).
    pending: Arc<AtomicU32>,
    /// Smooth weighted round-robin running weight.
    current_weight: i64,
    last_used: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Circuit {
    state: CircuitState,
    failure_count: u32,
    open_until: Option<Instant>,
    /// True while the single half-open probe is in flight.
    probe_in_flight: bool,
}

struct Routing {
    members: Vec<Member>,
    cursor: usize,
}

/// Member-level view for `group_list`.
#[derive(Debug, Clone, Serialize)]
pub struct GroupMemberDetails {
    pub provider: String,
    pub state: ProviderState,
    pub in_rotation: bool,
    pub weight: u32,
    pub priority: u32,
    pub pending: u32,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupDetails {
    pub group_id: String,
    pub state: GroupState,
    pub strategy: &'static str,
    pub healthy_count: usize,
    pub total_members: usize,
    pub members: Vec<GroupMemberDetails>,
}

pub struct ProviderGroup {
    id: GroupId,
    config: GroupConfig,
    routing: Mutex<Routing>,
    circuit: Mutex<Circuit>,
    bus: Arc<EventBus>,
    metrics: Arc<HangarMetrics>,
}

/// Decrements a member's pending counter when the call completes or is
/// abandoned.
struct PendingGuard {
    pending: Arc<AtomicU32>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ProviderGroup {
    pub fn new(
        id: GroupId,
        config: GroupConfig,
        members: Vec<(Arc<ProviderSupervisor>, Option<u32>, Option<u32>)>,
        bus: Arc<EventBus>,
        metrics: Arc<HangarMetrics>,
    ) -> Arc<Self> {
        let members = members
            .into_iter()
            .map(|(provider, weight, priority)| Member {
                provider,
                weight: weight.unwrap_or(1),
                priority: priority.unwrap_or(0),
                in_rotation: true,
                consecutive_failures: 0,
                consecutive_successes: 0,
                pending: Arc::new(AtomicU32::new(0)),
                current_weight: 0,
                last_used: None,
            })
            .collect();

        Arc::new(Self {
            id,
            config,
            routing: Mutex::new(Routing {
                members,
                cursor: 0,
            }),
            circuit: Mutex::new(Circuit {
                state: CircuitState::Closed,
                failure_count: 0,
                open_until: None,
                probe_in_flight: false,
            }),
            bus,
            metrics,
        })
    }

    pub fn id(&self) -> &GroupId {
        &self.id
    }

    pub fn strategy(&self) -> GroupStrategy {
        self.config.strategy
    }

    pub fn member_ids(&self) -> Vec<String> {
        self.routing
            .lock()
            .members
            .iter()
            .map(|m| m.provider.id().to_string())
            .collect()
    }

    pub fn in_rotation_count(&self) -> usize {
        self.routing
            .lock()
            .members
            .iter()
            .filter(|m| m.in_rotation)
            .count()
    }

    pub fn total_count(&self) -> usize {
        self.routing.lock().members.len()
    }

    pub fn state(&self) -> GroupState {
        if self.circuit.lock().state == CircuitState::Open {
            return GroupState::Degraded;
        }
        let in_rotation = self.in_rotation_count();
        if in_rotation == 0 {
            GroupState::Inactive
        } else if in_rotation < self.config.min_healthy {
            GroupState::Partial
        } else {
            GroupState::Healthy
        }
    }

    // ---- selection ----

    /// Pick an in-rotation member by the configured strategy, excluding
    /// `excluded` provider ids (used for the one failover retry).
    fn select_member(
        &self,
        excluded: &[String],
    ) -> Option<(Arc<ProviderSupervisor>, PendingGuard)> {
        let mut routing = self.routing.lock();
        let candidates: Vec<usize> = routing
            .members
            .iter()
            .enumerate()
            .filter(|(_, m)| {
                m.in_rotation && !excluded.iter().any(|id| id == m.provider.id().as_str())
            })
            .map(|(idx, _)| idx)
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let chosen = match self.config.strategy {
            GroupStrategy::RoundRobin => {
                let pick = candidates[routing.cursor % candidates.len()];
                routing.cursor = routing.cursor.wrapping_add(1);
                pick
            }
            GroupStrategy::WeightedRoundRobin => {
                // Smooth weighted selection: every candidate gains its
                // static weight, the current leader is picked and pays the
                // total back. Long-run pick ratio equals the weight ratio.
                let total: i64 = candidates
                    .iter()
                    .map(|&i| routing.members[i].weight as i64)
                    .sum();
                for &i in &candidates {
                    routing.members[i].current_weight += routing.members[i].weight as i64;
                }
                let pick = *candidates
                    .iter()
                    .max_by_key(|&&i| routing.members[i].current_weight)
                    .expect("candidates is non-empty");
                routing.members[pick].current_weight -= total;
                pick
            }
            // Ties on pending go to the longest-unused member.
            GroupStrategy::LeastConnections => *candidates
                .iter()
                .min_by_key(|&&i| {
                    let m = &routing.members[i];
                    (
                        m.pending.load(Ordering::SeqCst),
                        std::cmp::Reverse(
                            m.last_used.map(|t| t.elapsed()).unwrap_or(Duration::MAX),
                        ),
                    )
                })
                .expect("candidates is non-empty"),
            GroupStrategy::Random => {
                let weighted = candidates
                    .iter()
                    .any(|&i| routing.members[i].weight != 1);
                if weighted {
                    let total: u64 = candidates
                        .iter()
                        .map(|&i| routing.members[i].weight as u64)
                        .sum();
                    let mut roll = rand::thread_rng().gen_range(0..total);
                    let mut pick = candidates[0];
                    for &i in &candidates {
                        let w = routing.members[i].weight as u64;
                        if roll < w {
                            pick = i;
                            break;
                        }
                        roll -= w;
                    }
                    pick
                } else {
                    candidates[rand::thread_rng().gen_range(0..candidates.len())]
                }
            }
            GroupStrategy::Priority => {
                let best = candidates
                    .iter()
                    .map(|&i| routing.members[i].priority)
                    .min()
                    .expect("candidates is non-empty");
                let tier: Vec<usize> = candidates
                    .iter()
                    .copied()
                    .filter(|&i| routing.members[i].priority == best)
                    .collect();
                let pick = tier[routing.cursor % tier.len()];
                routing.cursor = routing.cursor.wrapping_add(1);
                pick
            }
        };

        let member = &mut routing.members[chosen];
        member.last_used = Some(Instant::now());
        member.pending.fetch_add(1, Ordering::SeqCst);
        Some((
            member.provider.clone(),
            PendingGuard {
                pending: member.pending.clone(),
            },
        ))
    }

    // ---- health feedback ----

    fn report_success(&self, provider_id: &str) {
        let mut routing = self.routing.lock();
        let Some(member) = routing
            .members
            .iter_mut()
            .find(|m| m.provider.id().as_str() == provider_id)
        else {
            return;
        };
        member.consecutive_failures = 0;
        member.consecutive_successes += 1;
        if !member.in_rotation && member.consecutive_successes >= self.config.healthy_threshold {
            member.in_rotation = true;
            tracing::info!(group = %self.id, provider = provider_id, "member returned to rotation");
            self.bus.publish(HangarEvent::GroupMemberReturnedToRotation {
                meta: EventMeta::now(),
                group_id: self.id.to_string(),
                provider_id: provider_id.to_string(),
            });
        }
    }

    fn report_failure(&self, provider_id: &str) {
        let mut routing = self.routing.lock();
        let Some(member) = routing
            .members
            .iter_mut()
            .find(|m| m.provider.id().as_str() == provider_id)
        else {
            return;
        };
        member.consecutive_successes = 0;
        member.consecutive_failures += 1;
        if member.in_rotation && member.consecutive_failures >= self.config.unhealthy_threshold {
            member.in_rotation = false;
            let failures = member.consecutive_failures;
            tracing::warn!(group = %self.id, provider = provider_id, failures, "member removed from rotation");
            self.bus
                .publish(HangarEvent::GroupMemberRemovedFromRotation {
                    meta: EventMeta::now(),
                    group_id: self.id.to_string(),
                    provider_id: provider_id.to_string(),
                    consecutive_failures: failures,
                });
        }
    }

    // ---- circuit breaker ----

    /// Gate a call on the circuit. `Ok(true)` marks the caller as the
    /// half-open probe.
    fn circuit_admit(&self) -> HangarResult<bool> {
        let mut circuit = self.circuit.lock();
        match circuit.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let until = circuit.open_until.expect("open circuit has a deadline");
                if Instant::now() < until {
                    return Err(HangarError::CircuitOpen(self.id.to_string()));
                }
                // Reset timeout elapsed: admit exactly one probe.
                circuit.state = CircuitState::HalfOpen;
                circuit.probe_in_flight = true;
                self.metrics
                    .record_circuit_transition(self.id.as_str(), "half_open");
                Ok(true)
            }
            CircuitState::HalfOpen => {
                if circuit.probe_in_flight {
                    Err(HangarError::CircuitOpen(self.id.to_string()))
                } else {
                    circuit.probe_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    fn circuit_record_success(&self, was_probe: bool) {
        let mut circuit = self.circuit.lock();
        circuit.failure_count = 0;
        if was_probe || circuit.state != CircuitState::Closed {
            circuit.state = CircuitState::Closed;
            circuit.open_until = None;
            circuit.probe_in_flight = false;
            tracing::info!(group = %self.id, "circuit closed");
            self.metrics
                .record_circuit_transition(self.id.as_str(), "closed");
            self.bus.publish(HangarEvent::GroupCircuitClosed {
                meta: EventMeta::now(),
                group_id: self.id.to_string(),
            });
        }
    }

    /// Give the half-open slot back when a probe call ends without a
    /// success/failure verdict (validation error, empty rotation).
    fn circuit_release_probe(&self) {
        let mut circuit = self.circuit.lock();
        if circuit.state == CircuitState::HalfOpen {
            circuit.probe_in_flight = false;
        }
    }

    fn circuit_record_failure(&self, was_probe: bool) {
        let mut circuit = self.circuit.lock();
        circuit.failure_count += 1;
        let reopen = was_probe && circuit.state == CircuitState::HalfOpen;
        let trip = circuit.state == CircuitState::Closed
            && circuit.failure_count >= self.config.circuit_breaker.failure_threshold;
        if reopen || trip {
            circuit.state = CircuitState::Open;
            circuit.open_until = Some(
                Instant::now() + Duration::from_secs(self.config.circuit_breaker.reset_timeout_s),
            );
            circuit.probe_in_flight = false;
            let failure_count = circuit.failure_count;
            tracing::warn!(group = %self.id, failures = failure_count, "circuit opened");
            self.metrics
                .record_circuit_transition(self.id.as_str(), "opened");
            self.bus.publish(HangarEvent::GroupCircuitOpened {
                meta: EventMeta::now(),
                group_id: self.id.to_string(),
                failure_count,
            });
        }
    }

    // ---- invocation ----

    /// Invoke a tool through the group: pick a member, call it, and on
    /// infrastructure failure try exactly one alternate.
    pub async fn invoke(
        &self,
        tool: &str,
        arguments: Value,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> HangarResult<Value> {
        let was_probe = self.circuit_admit()?;

        let mut tried: Vec<String> = Vec::with_capacity(2);
        let mut last_error: Option<HangarError> = None;

        for attempt in 0..2 {
            let Some((provider, guard)) = self.select_member(&tried) else {
                break;
            };
            let provider_id = provider.id().to_string();
            tried.push(provider_id.clone());

            if attempt > 0 {
                self.metrics.record_group_failover(self.id.as_str());
            }

            let result = provider
                .invoke(tool, arguments.clone(), timeout, cancel)
                .await;
            drop(guard);

            match result {
                Ok(value) => {
                    self.report_success(&provider_id);
                    self.circuit_record_success(was_probe);
                    return Ok(value);
                }
                // The member answered; the tool itself failed. That is
                // healthy routing-wise and is never retried elsewhere.
                Err(e @ HangarError::ToolError { .. }) => {
                    self.report_success(&provider_id);
                    self.circuit_record_success(was_probe);
                    return Err(e);
                }
                Err(e) if is_infrastructure(&e) => {
                    tracing::warn!(
                        group = %self.id,
                        provider = %provider_id,
                        error = %e,
                        "member failed, considering failover"
                    );
                    self.report_failure(&provider_id);
                    self.circuit_record_failure(was_probe);
                    last_error = Some(e);
                    if was_probe {
                        // The half-open probe failed and re-opened the
                        // circuit; no failover.
                        break;
                    }
                }
                // Validation-class errors pass through without feedback.
                Err(e) => {
                    if was_probe {
                        self.circuit_release_probe();
                    }
                    return Err(e);
                }
            }
        }

        if was_probe && last_error.is_none() {
            self.circuit_release_probe();
        }
        Err(last_error.unwrap_or_else(|| HangarError::NoHealthyMember(self.id.to_string())))
    }

    /// Start every member. Returns how many reached READY.
    pub async fn start_all(&self) -> usize {
        let providers: Vec<_> = {
            let routing = self.routing.lock();
            routing.members.iter().map(|m| m.provider.clone()).collect()
        };
        let mut started = 0;
        for provider in providers {
            match provider.ensure_ready().await {
                Ok(()) => started += 1,
                Err(e) => {
                    tracing::warn!(group = %self.id, provider = %provider.id(), error = %e, "member failed to start")
                }
            }
        }
        started
    }

    /// Stop every member.
    pub async fn stop_all(&self, reason: &str) {
        let providers: Vec<_> = {
            let routing = self.routing.lock();
            routing.members.iter().map(|m| m.provider.clone()).collect()
        };
        for provider in providers {
            provider.shutdown(reason).await;
        }
    }

    /// Re-derive rotation from current member states: recovered members
    /// rejoin, degraded and dead members are removed.
    pub fn rebalance(&self) {
        let mut routing = self.routing.lock();
        for member in routing.members.iter_mut() {
            let state = member.provider.state();
            let healthy = matches!(state, ProviderState::Ready | ProviderState::Cold);
            if healthy && !member.in_rotation {
                member.in_rotation = true;
                member.consecutive_failures = 0;
                member.consecutive_successes = 0;
            } else if !healthy && member.in_rotation {
                member.in_rotation = false;
            }
        }
    }

    pub fn details(&self) -> GroupDetails {
        let routing = self.routing.lock();
        let members: Vec<GroupMemberDetails> = routing
            .members
            .iter()
            .map(|m| GroupMemberDetails {
                provider: m.provider.id().to_string(),
                state: m.provider.state(),
                in_rotation: m.in_rotation,
                weight: m.weight,
                priority: m.priority,
                pending: m.pending.load(Ordering::SeqCst),
                consecutive_failures: m.consecutive_failures,
            })
            .collect();
        let healthy_count = members.iter().filter(|m| m.in_rotation).count();
        let total_members = members.len();
        drop(routing);

        GroupDetails {
            group_id: self.id.to_string(),
            state: self.state(),
            strategy: self.config.strategy.as_str(),
            healthy_count,
            total_members,
            members,
        }
    }
}

/// Whether an error counts as an infrastructure failure for routing.
fn is_infrastructure(error: &HangarError) -> bool {
    use hangar_types::ErrorKind;
    matches!(
        error.kind(),
        ErrorKind::Timeout | ErrorKind::Transport | ErrorKind::Protocol | ErrorKind::LaunchFailed
    )
}
