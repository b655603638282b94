use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use quarry::{CancelReason, JobHandler, RetryDecision};
use serde::{Deserialize, Serialize};

/// How a [`TestHandler`] behaves when run.
#[derive(Clone, Debug)]
pub enum TestBehavior {
    /// Every attempt succeeds.
    Succeed,
    /// Fail the first `failures` attempts, then succeed.
    SucceedAfter { failures: u32 },
    /// Every attempt fails and asks for a retry.
    AlwaysFail,
    /// Fail once and decline to retry.
    FailNoRetry,
    /// Succeed after spending this much (real) time in the attempt.
    SucceedSlowly { duration: Duration },
    /// Fail after spending this much (real) time in the attempt.
    FailSlowly { duration: Duration },
}

#[derive(Default)]
struct TestHandlerState {
    added: u32,
    runs: u32,
    cancelled: Option<CancelReason>,
}

/// Handler whose lifecycle is fully observable from the test.
///
/// Clones share state, so a test keeps one clone and hands the other to
/// the engine.
#[derive(Clone)]
pub struct TestHandler {
    behavior: TestBehavior,
    retry_delay: Option<Duration>,
    state: Arc<Mutex<TestHandlerState>>,
}

impl TestHandler {
    pub fn new(behavior: TestBehavior) -> Self {
        Self {
            behavior,
            retry_delay: None,
            state: Arc::new(Mutex::new(TestHandlerState::default())),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(TestBehavior::Succeed)
    }

    pub fn failing() -> Self {
        Self::new(TestBehavior::AlwaysFail)
    }

    /// Ask for this delay before every retry.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn run_count(&self) -> u32 {
        self.state.lock().runs
    }

    pub fn added_count(&self) -> u32 {
        self.state.lock().added
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.state.lock().cancelled
    }

    pub fn assert_run_count_eq(&self, expected: u32) {
        let runs = self.run_count();
        assert_eq!(runs, expected, "expected {expected} runs, got {runs}");
    }
}

#[async_trait]
impl JobHandler for TestHandler {
    fn kind(&self) -> &'static str {
        "test"
    }

    async fn on_added(&self) {
        self.state.lock().added += 1;
    }

    async fn on_run(&self) -> anyhow::Result<()> {
        let runs = {
            let mut state = self.state.lock();
            state.runs += 1;
            state.runs
        };
        match &self.behavior {
            TestBehavior::Succeed => Ok(()),
            TestBehavior::SucceedAfter { failures } => {
                if runs <= *failures {
                    anyhow::bail!("planned failure {runs}")
                }
                Ok(())
            }
            TestBehavior::AlwaysFail => anyhow::bail!("planned failure {runs}"),
            TestBehavior::FailNoRetry => anyhow::bail!("unrecoverable failure"),
            TestBehavior::SucceedSlowly { duration } => {
                tokio::time::sleep(*duration).await;
                Ok(())
            }
            TestBehavior::FailSlowly { duration } => {
                tokio::time::sleep(*duration).await;
                anyhow::bail!("planned slow failure {runs}")
            }
        }
    }

    async fn on_cancel(&self, reason: CancelReason) {
        self.state.lock().cancelled = Some(reason);
    }

    fn should_retry(&self, _error: &anyhow::Error, _run_count: u32) -> RetryDecision {
        match self.behavior {
            TestBehavior::FailNoRetry => RetryDecision::cancel(),
            _ => match self.retry_delay {
                Some(delay) => RetryDecision::retry_after(delay),
                None => RetryDecision::retry(),
            },
        }
    }
}

/// Handler kind used by [`PersistentTestHandler`].
pub const PERSISTENT_TEST_KIND: &str = "testkit-persistent";

/// Serializable handler for durable-queue tests.
///
/// Carries only its label; register it with
/// [`PersistentTestHandler::register`] before opening the queue.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PersistentTestHandler {
    pub label: String,
}

impl PersistentTestHandler {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }

    #[cfg(feature = "sqlite")]
    pub fn register(registry: &mut quarry::JobRegistry) {
        registry.register(PERSISTENT_TEST_KIND, |payload| {
            let handler: PersistentTestHandler = serde_json::from_slice(payload)?;
            Ok(Arc::new(handler) as Arc<dyn JobHandler>)
        });
    }
}

#[async_trait]
impl JobHandler for PersistentTestHandler {
    fn kind(&self) -> &'static str {
        PERSISTENT_TEST_KIND
    }

    async fn on_run(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn serialize_payload(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
