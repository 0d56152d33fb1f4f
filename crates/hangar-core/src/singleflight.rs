//! Single-flight execution keyed by an arbitrary id.
//!
//! Guarantees that for a given key at most one execution of the supplied
//! future is in progress; every concurrent caller for that key receives a
//! clone of the one outcome. Used by the supervisor's `ensure_ready` and by
//! the batch executor's cold-start deduplication.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use tokio::sync::broadcast;

pub struct SingleFlight<K, T> {
    in_flight: Mutex<HashMap<K, broadcast::Sender<T>>>,
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` for `key`, deduplicating concurrent callers.
    ///
    /// The first caller for a key becomes the leader and executes `f`;
    /// callers arriving while the leader is running wait for the leader's
    /// outcome instead of executing. Once the outcome is delivered the key
    /// is clear and the next caller executes again.
    ///
    /// If a leader is dropped mid-flight (its caller was cancelled), the
    /// waiters elect a new leader and the work runs again.
    pub async fn run<F, Fut>(&self, key: K, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut f = Some(f);
        loop {
            let role = {
                let mut guard = self.in_flight.lock();
                match guard.get(&key) {
                    Some(tx) => Role::Follower(tx.subscribe()),
                    None => {
                        let (tx, _) = broadcast::channel(1);
                        guard.insert(key.clone(), tx.clone());
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Leader(tx) => {
                    // Remove the entry if this future is dropped before
                    // completion, so waiters can elect a new leader.
                    let guard = CleanupGuard {
                        flight: self,
                        key: Some(key.clone()),
                    };
                    let f = f.take().expect("leader runs at most once");
                    let result = f().await;
                    drop(guard);
                    let _ = tx.send(result.clone());
                    return result;
                }
                Role::Follower(mut rx) => match rx.recv().await {
                    Ok(result) => return result,
                    // Leader vanished without an outcome; try again.
                    Err(_) => continue,
                },
            }
        }
    }

    /// Number of keys currently executing. Exposed for tests.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.lock().len()
    }
}

impl<K, T> Default for SingleFlight<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

enum Role<T> {
    Leader(broadcast::Sender<T>),
    Follower(broadcast::Receiver<T>),
}

struct CleanupGuard<'a, K, T>
where
    K: Eq + Hash + Clone,
{
    flight: &'a SingleFlight<K, T>,
    key: Option<K>,
}

impl<K, T> Drop for CleanupGuard<'_, K, T>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.flight.in_flight.lock().remove(&key);
        }
    }
}
