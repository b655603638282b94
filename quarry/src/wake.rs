use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::clock::Clock;
use crate::constraint::NetworkStatus;

/// Ask the host platform to wake the process when blocked work becomes
/// runnable.
///
/// When every queued job is waiting on a delay or on connectivity, the
/// engine files a request here and goes quiet. The platform is expected
/// to deliver the wake-up by calling back into the engine with the
/// request id, at which point the engine reports whether another wake-up
/// is still needed.
#[derive(Clone, Debug, PartialEq)]
pub struct WakeRequest {
    pub id: Uuid,
    /// Connectivity the blocked work needs.
    pub network: NetworkStatus,
    /// Earliest useful wake-up, relative to the request.
    pub delay_ms: u64,
    /// Latest acceptable wake-up, when the blocked work has a hard
    /// readiness time.
    pub deadline_ms: Option<u64>,
}

impl WakeRequest {
    pub fn new(network: NetworkStatus, delay_ms: u64, deadline_ms: Option<u64>) -> Self {
        Self {
            id: Uuid::now_v7(),
            network,
            delay_ms,
            deadline_ms,
        }
    }
}

#[async_trait]
pub trait WakeScheduler: Send + Sync {
    async fn request(&self, request: WakeRequest) -> anyhow::Result<()>;

    /// Drop every outstanding request, typically because the engine is
    /// shutting down or has no blocked work left.
    async fn cancel_all(&self) -> anyhow::Result<()>;
}

#[async_trait]
impl<S: WakeScheduler + ?Sized> WakeScheduler for Arc<S> {
    async fn request(&self, request: WakeRequest) -> anyhow::Result<()> {
        (**self).request(request).await
    }

    async fn cancel_all(&self) -> anyhow::Result<()> {
        (**self).cancel_all().await
    }
}

/// Scheduler for hosts with no wake-up facility; requests are dropped.
#[derive(Debug, Default)]
pub struct NoopWakeScheduler;

#[async_trait]
impl WakeScheduler for NoopWakeScheduler {
    async fn request(&self, request: WakeRequest) -> anyhow::Result<()> {
        debug!(request_id = %request.id, "no wake facility, request dropped");
        Ok(())
    }

    async fn cancel_all(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Decorator that coalesces near-duplicate wake requests.
///
/// Platform alarms are often expensive to file, and dispatch churn can
/// produce bursts of requests for the same connectivity class with wake
/// times a few milliseconds apart. A request whose target time lands
/// within `window_ms` of one already forwarded for the same class is
/// absorbed.
pub struct BatchingWakeScheduler<S> {
    inner: S,
    clock: Arc<dyn Clock>,
    window_ms: u64,
    /// Per connectivity class: engine time the last forwarded request
    /// aimed at.
    forwarded: Mutex<HashMap<NetworkStatus, u64>>,
}

impl<S: WakeScheduler> BatchingWakeScheduler<S> {
    pub fn new(inner: S, clock: Arc<dyn Clock>, window_ms: u64) -> Self {
        Self {
            inner,
            clock,
            window_ms,
            forwarded: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<S: WakeScheduler> WakeScheduler for BatchingWakeScheduler<S> {
    async fn request(&self, request: WakeRequest) -> anyhow::Result<()> {
        let target_ns = self
            .clock
            .now_ns()
            .saturating_add(request.delay_ms.saturating_mul(1_000_000));
        let window_ns = self.window_ms.saturating_mul(1_000_000);

        {
            let mut forwarded = self.forwarded.lock();
            if let Some(previous) = forwarded.get(&request.network) {
                if target_ns.abs_diff(*previous) <= window_ns {
                    debug!(request_id = %request.id, "wake request absorbed by batch window");
                    return Ok(());
                }
            }
            forwarded.insert(request.network, target_ns);
        }
        self.inner.request(request).await
    }

    async fn cancel_all(&self) -> anyhow::Result<()> {
        self.forwarded.lock().clear();
        self.inner.cancel_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingScheduler {
        requests: Mutex<Vec<WakeRequest>>,
        cancels: Mutex<usize>,
    }

    #[async_trait]
    impl WakeScheduler for RecordingScheduler {
        async fn request(&self, request: WakeRequest) -> anyhow::Result<()> {
            self.requests.lock().push(request);
            Ok(())
        }

        async fn cancel_all(&self) -> anyhow::Result<()> {
            *self.cancels.lock() += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_near_duplicate_requests_are_absorbed() {
        let clock = ManualClock::new();
        let recorder = Arc::new(RecordingScheduler::default());
        let batching =
            BatchingWakeScheduler::new(Arc::clone(&recorder), clock.clone(), 1_000);

        batching
            .request(WakeRequest::new(NetworkStatus::Metered, 5_000, None))
            .await
            .unwrap();
        batching
            .request(WakeRequest::new(NetworkStatus::Metered, 5_500, None))
            .await
            .unwrap();
        assert_eq!(recorder.requests.lock().len(), 1);

        // Different connectivity class is never absorbed.
        batching
            .request(WakeRequest::new(NetworkStatus::Unmetered, 5_000, None))
            .await
            .unwrap();
        assert_eq!(recorder.requests.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_request_outside_window_forwards() {
        let clock = ManualClock::new();
        let recorder = Arc::new(RecordingScheduler::default());
        let batching =
            BatchingWakeScheduler::new(Arc::clone(&recorder), clock.clone(), 1_000);

        batching
            .request(WakeRequest::new(NetworkStatus::Metered, 5_000, None))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(10));
        batching
            .request(WakeRequest::new(NetworkStatus::Metered, 5_000, None))
            .await
            .unwrap();
        assert_eq!(recorder.requests.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_all_resets_window() {
        let clock = ManualClock::new();
        let recorder = Arc::new(RecordingScheduler::default());
        let batching =
            BatchingWakeScheduler::new(Arc::clone(&recorder), clock, 1_000);

        batching
            .request(WakeRequest::new(NetworkStatus::Metered, 5_000, None))
            .await
            .unwrap();
        batching.cancel_all().await.unwrap();
        assert_eq!(*recorder.cancels.lock(), 1);

        batching
            .request(WakeRequest::new(NetworkStatus::Metered, 5_000, None))
            .await
            .unwrap();
        assert_eq!(recorder.requests.lock().len(), 2);
    }
}
