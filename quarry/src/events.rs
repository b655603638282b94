use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::job::{CancelReason, JobId};

/// Event payload emitted for job lifecycle transitions.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum JobEventKind {
    /// Job was accepted into the engine.
    Added { priority: i32 },
    /// Job was handed to a consumer for an attempt.
    Started { run_count: u32 },
    /// Job finished successfully and left the engine.
    Completed { run_count: u32 },
    /// Job failed and was put back for another attempt.
    Requeued { run_count: u32 },
    /// Job left the engine without succeeding.
    Cancelled { reason: CancelReason },
}

#[derive(Clone, Debug)]
pub struct JobEvent {
    pub job_id: JobId,
    pub kind: JobEventKind,
    /// Engine time of the transition.
    pub at_ns: u64,
}

/// Generic event publisher trait for publishing events of type `E`.
#[async_trait]
pub trait EventPublisher<E>: Send + Sync
where
    E: Clone + Send + Sync + 'static,
{
    /// Publish an event to all subscribers.
    async fn publish(&self, event: E) -> anyhow::Result<()>;
}

/// Generic event subscriber trait for receiving events of type `E`.
pub trait EventSubscriber<E>: Send + Sync
where
    E: Clone + Send + Sync + 'static,
{
    /// Subscribe to events, returning a broadcast receiver.
    ///
    /// Multiple subscribers can receive the same events (fan-out).
    fn subscribe(&self) -> broadcast::Receiver<E>;
}

/// In-process fan-out bus for job lifecycle events.
///
/// Publishing never blocks: a subscriber that falls behind sees
/// `RecvError::Lagged` instead of stalling the control loop, and events
/// published with no subscribers at all are simply dropped.
pub struct InProcEventBus {
    sender: broadcast::Sender<JobEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcEventBus {
    /// Create a bus buffering at most `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl EventPublisher<JobEvent> for InProcEventBus {
    async fn publish(&self, event: JobEvent) -> anyhow::Result<()> {
        // An empty subscriber list is not an error.
        let _ = self.sender.send(event);
        Ok(())
    }
}

impl EventSubscriber<JobEvent> for InProcEventBus {
    fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: JobEventKind) -> JobEvent {
        JobEvent {
            job_id: JobId::new(),
            kind,
            at_ns: 0,
        }
    }

    #[tokio::test]
    async fn test_fan_out_to_multiple_subscribers() {
        let bus = InProcEventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(event(JobEventKind::Added { priority: 1 }))
            .await
            .unwrap();

        assert!(matches!(
            rx1.recv().await.unwrap().kind,
            JobEventKind::Added { priority: 1 }
        ));
        assert!(matches!(
            rx2.recv().await.unwrap().kind,
            JobEventKind::Added { priority: 1 }
        ));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = InProcEventBus::new(4);
        bus.publish(event(JobEventKind::Completed { run_count: 1 }))
            .await
            .unwrap();
        assert_eq!(bus.subscriber_count(), 0);
    }
}
