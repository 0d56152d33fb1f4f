//! In-memory store for truncated batch payloads.
//!
//! When the batch executor drops an oversized payload it records the full
//! value here under a continuation id (`cont_{batch}_{index}_{8hex}`) so a
//! later retrieval can recover it. Entries expire after a TTL and the
//! store is capped; eviction drops the oldest entries first.

use dashmap::DashMap;
use serde_json::Value;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub struct ContinuationStore {
    entries: DashMap<String, (Value, Instant)>,
    ttl: Duration,
    max_entries: usize,
}

impl ContinuationStore {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries,
        }
    }

    /// Store a payload, returning its continuation id.
    pub fn put(&self, batch_id: &str, call_index: usize, value: Value) -> String {
        self.sweep();
        let suffix = &Uuid::new_v4().simple().to_string()[..8];
        let id = format!("cont_{batch_id}_{call_index}_{suffix}");
        self.entries.insert(id.clone(), (value, Instant::now()));
        id
    }

    /// Fetch a payload if it has not expired.
    pub fn get(&self, id: &str) -> Option<Value> {
        let entry = self.entries.get(id)?;
        let (value, stored_at) = entry.value();
        if stored_at.elapsed() > self.ttl {
            drop(entry);
            self.entries.remove(id);
            return None;
        }
        Some(value.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired entries; if still over capacity, drop oldest first.
    fn sweep(&self) {
        self.entries
            .retain(|_, (_, stored_at)| stored_at.elapsed() <= self.ttl);

        if self.entries.len() >= self.max_entries {
            let mut by_age: Vec<(String, Instant)> = self
                .entries
                .iter()
                .map(|e| (e.key().clone(), e.value().1))
                .collect();
            by_age.sort_by_key(|(_, at)| *at);
            let excess = self.entries.len() + 1 - self.max_entries;
            for (key, _) in by_age.into_iter().take(excess) {
                self.entries.remove(&key);
            }
        }
    }
}
