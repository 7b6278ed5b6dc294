//! Lifecycle event fan-out.
//!
//! Events are published on a tokio broadcast channel. Publishing never
//! blocks the scheduler loop; slow subscribers lag and lose the oldest
//! events, which they observe as `RecvError::Lagged`.

use std::sync::atomic::{AtomicU64, Ordering};

use berth_events::{LifecycleEvent, TaskEventType, TaskInfoEvent};
use tokio::sync::broadcast;
use tracing::trace;

/// Default number of events buffered per subscriber.
pub const DEFAULT_EVENT_BUS_CAPACITY: usize = 1024;

pub struct EventBus {
    sender: broadcast::Sender<LifecycleEvent>,
    sequence: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    /// Sender half, for handing out subscriptions after the bus moved into
    /// the scheduler loop.
    pub fn sender(&self) -> broadcast::Sender<LifecycleEvent> {
        self.sender.clone()
    }

    /// Number of events stamped so far.
    pub fn emitted(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }

    /// Builds an event with the next sequence number without publishing it.
    pub fn stamp(&self, event_type: TaskEventType, payload: TaskInfoEvent) -> LifecycleEvent {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        LifecycleEvent::new(sequence, event_type, payload)
    }

    pub fn publish(&self, event_type: TaskEventType, payload: TaskInfoEvent) {
        let event = self.stamp(event_type, payload);
        trace!(
            sequence = event.sequence,
            event_type = %event.event_type,
            slot_id = %event.payload.slot_id,
            "Publishing lifecycle event"
        );
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUS_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_events::{Endpoint, SlotState};
    use berth_id::{AppId, SlotId};

    fn payload() -> TaskInfoEvent {
        let app_id = AppId::parse("web").unwrap();
        TaskInfoEvent {
            slot_id: SlotId::new(app_id.clone(), 0),
            task_id: None,
            app_id,
            state: SlotState::PendingOffer,
            healthy: false,
            cluster_id: "dc1".to_string(),
            run_as: "root".to_string(),
            endpoint: Endpoint::Replicated {
                host: None,
                port: None,
                port_name: None,
            },
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers_in_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(SlotState::PendingOffer.event_type(), payload());
        bus.publish(TaskEventType::Unhealthy, payload());

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(second.event_type, TaskEventType::Unhealthy);
        assert_eq!(bus.emitted(), 2);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(SlotState::Running.event_type(), payload());
        assert_eq!(bus.emitted(), 1);
    }
}
