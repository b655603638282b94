use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use quarry::{JobEvent, WakeRequest, WakeScheduler};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Wake scheduler that records everything instead of talking to a
/// platform.
#[derive(Clone, Default)]
pub struct RecordingWakeScheduler {
    requests: Arc<Mutex<Vec<WakeRequest>>>,
    cancels: Arc<Mutex<usize>>,
}

impl RecordingWakeScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<WakeRequest> {
        self.requests.lock().clone()
    }

    pub fn cancel_count(&self) -> usize {
        *self.cancels.lock()
    }

    pub fn assert_request_count_eq(&self, expected: usize) {
        let got = self.requests.lock().len();
        assert_eq!(got, expected, "expected {expected} wake requests, got {got}");
    }

    pub fn clear(&self) {
        self.requests.lock().clear();
        *self.cancels.lock() = 0;
    }
}

#[async_trait]
impl WakeScheduler for RecordingWakeScheduler {
    async fn request(&self, request: WakeRequest) -> anyhow::Result<()> {
        self.requests.lock().push(request);
        Ok(())
    }

    async fn cancel_all(&self) -> anyhow::Result<()> {
        *self.cancels.lock() += 1;
        Ok(())
    }
}

/// Drains a lifecycle event subscription into a vector.
///
/// The background task stops when the engine drops its sender side;
/// [`EventRecorder::events`] can be called at any point before that.
pub struct EventRecorder {
    events: Arc<Mutex<Vec<JobEvent>>>,
    task: JoinHandle<()>,
}

impl EventRecorder {
    pub fn spawn(mut receiver: broadcast::Receiver<JobEvent>) -> Self {
        let events: Arc<Mutex<Vec<JobEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => sink.lock().push(event),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Self { events, task }
    }

    pub fn events(&self) -> Vec<JobEvent> {
        self.events.lock().clone()
    }
}

impl Drop for EventRecorder {
    fn drop(&mut self) {
        self.task.abort();
    }
}
