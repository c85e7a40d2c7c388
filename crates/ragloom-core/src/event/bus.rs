//! Broadcast bridge for workflow progress events.
//!
//! Built on `tokio::sync::broadcast`, the `EventBus` fans `WorkflowEvent`s
//! out to any number of subscribers. Publishing with no active subscribers
//! is a no-op. `BusSink` adapts the bus to the runner's `ProgressSink`, so
//! front-ends can stream run progress (e.g. as server-sent events) without
//! bespoke plumbing.

use ragloom_types::event::WorkflowEvent;
use tokio::sync::broadcast;

use crate::workflow::runner::ProgressSink;

/// Multi-consumer bus for workflow progress events.
///
/// Wraps a `tokio::sync::broadcast` channel. Cloning the bus clones the
/// sender, allowing multiple producers and consumers.
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    ///
    /// A capacity of 1024 comfortably covers bursts from large plans.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no subscribers, the event is silently dropped.
    pub fn publish(&self, event: WorkflowEvent) {
        let _ = self.sender.send(event);
    }

    /// Access the underlying broadcast sender.
    pub fn sender(&self) -> &broadcast::Sender<WorkflowEvent> {
        &self.sender
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

/// Progress sink that republishes every runner callback onto an `EventBus`.
#[derive(Clone, Debug)]
pub struct BusSink {
    bus: EventBus,
}

impl BusSink {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

impl ProgressSink for BusSink {
    fn on_step_start(&self, event: &WorkflowEvent) {
        self.bus.publish(event.clone());
    }

    fn on_step_complete(&self, event: &WorkflowEvent) {
        self.bus.publish(event.clone());
    }

    fn on_step_skip(&self, event: &WorkflowEvent) {
        self.bus.publish(event.clone());
    }

    fn on_step_error(&self, event: &WorkflowEvent) {
        self.bus.publish(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ragloom_types::workflow::ToolKind;
    use uuid::Uuid;

    fn sample_event() -> WorkflowEvent {
        WorkflowEvent::StepStarted {
            run_id: Uuid::now_v7(),
            workflow: "research-brief".to_string(),
            step_id: "find".to_string(),
            tool: ToolKind::Search,
            layer: 0,
        }
    }

    #[tokio::test]
    async fn publish_and_subscribe_delivers_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(sample_event());

        let received = rx.recv().await.unwrap();
        assert!(matches!(received, WorkflowEvent::StepStarted { layer: 0, .. }));
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive_event() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(sample_event());

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert_eq!(e1.step_id(), "find");
        assert_eq!(e2.step_id(), "find");
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        bus.publish(sample_event());
        bus.publish(sample_event());
    }

    #[tokio::test]
    async fn lagged_receiver_handles_gracefully() {
        let bus = EventBus::new(4); // Small capacity to trigger lag
        let mut rx = bus.subscribe();

        // Publish more events than the channel capacity
        for i in 0..10 {
            bus.publish(WorkflowEvent::StepSkipped {
                run_id: Uuid::now_v7(),
                workflow: "wf".to_string(),
                step_id: format!("step-{i}"),
                reason: "condition evaluated false".to_string(),
            });
        }

        // Receiver may get a Lagged error -- should not panic
        let result = rx.try_recv();
        match result {
            Ok(_) => {}
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn clone_shares_channel() {
        let bus = EventBus::new(16);
        let bus2 = bus.clone();
        let mut rx = bus.subscribe();

        // Publish via clone, receive via original's subscriber
        bus2.publish(sample_event());

        let result = rx.try_recv();
        assert!(result.is_ok());
    }

    #[test]
    fn bus_sink_forwards_all_callbacks() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let sink = BusSink::new(bus.clone());

        let event = sample_event();
        sink.on_step_start(&event);
        sink.on_step_complete(&event);
        sink.on_step_skip(&event);
        sink.on_step_error(&event);

        for _ in 0..4 {
            assert_eq!(rx.try_recv().unwrap().step_id(), "find");
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn debug_impl() {
        let bus = EventBus::new(16);
        let _rx = bus.subscribe();
        let debug = format!("{bus:?}");
        assert!(debug.contains("EventBus"));
        assert!(debug.contains("receiver_count"));
    }
}
