//! Metrics collection and Prometheus text exposition.
//!
//! Counters and histograms keyed by the contractual label dimensions
//! (`provider_id`, `group_id`, `tool`, `result`). Recording is lock-light
//! (dashmap + atomics); rendering walks the maps and produces the text
//! format served by the pull endpoint.

use dashmap::DashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

/// Histogram bucket upper bounds, in milliseconds.
const LATENCY_BUCKETS_MS: &[u64] = &[5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000, 30000];

struct Histogram {
    /// Cumulative count per bucket in `LATENCY_BUCKETS_MS` order, plus +Inf.
    buckets: Vec<AtomicU64>,
    sum_ms: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: (0..=LATENCY_BUCKETS_MS.len())
                .map(|_| AtomicU64::new(0))
                .collect(),
            sum_ms: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, value_ms: u64) {
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|&bound| value_ms <= bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(value_ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Process-wide metrics collector.
pub struct HangarMetrics {
    /// (provider_id, tool, result) -> count
    invocations: DashMap<(String, String, &'static str), AtomicU64>,
    /// provider_id -> latency histogram
    invocation_latency: DashMap<String, Histogram>,
    /// provider_id -> cold start count
    cold_starts: DashMap<String, AtomicU64>,
    /// (group_id, transition) -> count
    circuit_transitions: DashMap<(String, &'static str), AtomicU64>,
    /// group_id -> failover count
    group_failovers: DashMap<String, AtomicU64>,
    rate_limit_hits: AtomicU64,
    batches: AtomicU64,
    batch_calls: AtomicU64,
    batch_duration: Histogram,
}

impl HangarMetrics {
    pub fn new() -> Self {
        Self {
            invocations: DashMap::new(),
            invocation_latency: DashMap::new(),
            cold_starts: DashMap::new(),
            circuit_transitions: DashMap::new(),
            group_failovers: DashMap::new(),
            rate_limit_hits: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            batch_calls: AtomicU64::new(0),
            batch_duration: Histogram::new(),
        }
    }

    /// Record one tool invocation outcome. `result` is "ok" or an error kind.
    pub fn record_invocation(
        &self,
        provider_id: &str,
        tool: &str,
        result: &'static str,
        latency_ms: u64,
    ) {
        self.invocations
            .entry((provider_id.to_string(), tool.to_string(), result))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
        self.invocation_latency
            .entry(provider_id.to_string())
            .or_insert_with(Histogram::new)
            .observe(latency_ms);
    }

    pub fn record_cold_start(&self, provider_id: &str) {
        self.cold_starts
            .entry(provider_id.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// `transition` is "opened", "half_open" or "closed".
    pub fn record_circuit_transition(&self, group_id: &str, transition: &'static str) {
        self.circuit_transitions
            .entry((group_id.to_string(), transition))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_group_failover(&self, group_id: &str) {
        self.group_failovers
            .entry(group_id.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limit_hit(&self) {
        self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch(&self, calls: usize, duration_ms: u64) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.batch_calls.fetch_add(calls as u64, Ordering::Relaxed);
        self.batch_duration.observe(duration_ms);
    }

    /// Render the Prometheus text exposition format.
    ///
    /// `provider_states` is the current `(provider_id, state)` snapshot,
    /// supplied by the caller so the collector stays registry-agnostic.
    pub fn render_prometheus(&self, provider_states: &[(String, String)]) -> String {
        let mut out = String::with_capacity(4096);

        out.push_str("# TYPE hangar_provider_state gauge\n");
        for (provider_id, state) in provider_states {
            let _ = writeln!(
                out,
                "hangar_provider_state{{provider_id=\"{provider_id}\",state=\"{state}\"}} 1"
            );
        }

        out.push_str("# TYPE hangar_invocations_total counter\n");
        for entry in self.invocations.iter() {
            let (provider_id, tool, result) = entry.key();
            let _ = writeln!(
                out,
                "hangar_invocations_total{{provider_id=\"{provider_id}\",tool=\"{tool}\",result=\"{result}\"}} {}",
                entry.value().load(Ordering::Relaxed)
            );
        }

        out.push_str("# TYPE hangar_invocation_latency_ms histogram\n");
        for entry in self.invocation_latency.iter() {
            let provider_id = entry.key();
            render_histogram(
                &mut out,
                "hangar_invocation_latency_ms",
                &format!("provider_id=\"{provider_id}\""),
                entry.value(),
            );
        }

        out.push_str("# TYPE hangar_cold_starts_total counter\n");
        for entry in self.cold_starts.iter() {
            let _ = writeln!(
                out,
                "hangar_cold_starts_total{{provider_id=\"{}\"}} {}",
                entry.key(),
                entry.value().load(Ordering::Relaxed)
            );
        }

        out.push_str("# TYPE hangar_circuit_transitions_total counter\n");
        for entry in self.circuit_transitions.iter() {
            let (group_id, transition) = entry.key();
            let _ = writeln!(
                out,
                "hangar_circuit_transitions_total{{group_id=\"{group_id}\",transition=\"{transition}\"}} {}",
                entry.value().load(Ordering::Relaxed)
            );
        }

        out.push_str("# TYPE hangar_group_failovers_total counter\n");
        for entry in self.group_failovers.iter() {
            let _ = writeln!(
                out,
                "hangar_group_failovers_total{{group_id=\"{}\"}} {}",
                entry.key(),
                entry.value().load(Ordering::Relaxed)
            );
        }

        let _ = writeln!(
            out,
            "# TYPE hangar_rate_limit_hits_total counter\nhangar_rate_limit_hits_total {}",
            self.rate_limit_hits.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "# TYPE hangar_batches_total counter\nhangar_batches_total {}",
            self.batches.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "# TYPE hangar_batch_calls_total counter\nhangar_batch_calls_total {}",
            self.batch_calls.load(Ordering::Relaxed)
        );
        out.push_str("# TYPE hangar_batch_duration_ms histogram\n");
        render_histogram(&mut out, "hangar_batch_duration_ms", "", &self.batch_duration);

        out
    }
}

impl Default for HangarMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn render_histogram(out: &mut String, name: &str, labels: &str, histogram: &Histogram) {
    let sep = if labels.is_empty() { "" } else { "," };
    let mut cumulative = 0u64;
    for (idx, bound) in LATENCY_BUCKETS_MS.iter().enumerate() {
        cumulative += histogram.buckets[idx].load(Ordering::Relaxed);
        let _ = writeln!(
            out,
            "{name}_bucket{{{labels}{sep}le=\"{bound}\"}} {cumulative}"
        );
    }
    cumulative += histogram.buckets[LATENCY_BUCKETS_MS.len()].load(Ordering::Relaxed);
    let _ = writeln!(out, "{name}_bucket{{{labels}{sep}le=\"+Inf\"}} {cumulative}");
    // Empty label sets must omit the braces in the exposition format.
    let suffix = if labels.is_empty() {
        String::new()
    } else {
        format!("{{{labels}}}")
    };
    let _ = writeln!(
        out,
        "{name}_sum{suffix} {}",
        histogram.sum_ms.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        out,
        "{name}_count{suffix} {}",
        histogram.count.load(Ordering::Relaxed)
    );
}
