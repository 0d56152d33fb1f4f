//! Domain event bus.
//!
//! A broadcast channel with bounded per-subscriber queues. Publishing never
//! blocks the lifecycle path: a subscriber that falls behind lags and the
//! overwritten events are counted as dropped on its side.

use hangar_types::HangarEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

pub struct EventBus {
    tx: broadcast::Sender<HangarEvent>,
    published: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            published: AtomicU64::new(0),
        }
    }

    /// Publish an event to all current subscribers. Non-blocking.
    pub fn publish(&self, event: HangarEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(event = event.name(), "publishing event");
        // Send only fails when there are no subscribers, which is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HangarEvent> {
        self.tx.subscribe()
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hangar_types::events::EventMeta;

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(HangarEvent::ProviderStopped {
            meta: EventMeta::now(),
            provider_id: "math".into(),
            reason: "idle".into(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "provider_stopped");
        assert_eq!(bus.published_count(), 1);
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(HangarEvent::GroupCircuitClosed {
            meta: EventMeta::now(),
            group_id: "pool".into(),
        });
        assert_eq!(bus.published_count(), 1);
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::with_capacity(2);
        let mut rx = bus.subscribe();

        for i in 0..5 {
            bus.publish(HangarEvent::ProviderStopped {
                meta: EventMeta::now(),
                provider_id: format!("p{i}"),
                reason: "idle".into(),
            });
        }

        // The first recv reports how many events were overwritten.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert_eq!(n, 3),
            other => panic!("expected lag, got {other:?}"),
        }
    }
}
