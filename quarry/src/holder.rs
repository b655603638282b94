use std::sync::Arc;

use uuid::Uuid;

use crate::constraint::NetworkStatus;
use crate::job::{CancelReason, Job, JobHandler, RetryConstraint};

/// Queue-side wrapper around a [`Job`] and its handler.
///
/// The holder owns the mutable scheduling state the engine tracks across
/// attempts: run count, readiness time, the session that is currently
/// running it, and a pending cancel flag.
#[derive(Clone)]
pub struct JobHolder {
    pub job: Job,
    pub handler: Arc<dyn JobHandler>,
    /// Completed attempts. Incremented when a run is handed out, so the
    /// handler sees the attempt it is part of.
    pub run_count: u32,
    /// Monotonic submission counter; the final FIFO tie-breaker.
    pub insertion_order: u64,
    /// Absolute engine time before which the job must not run.
    pub delay_until_ns: u64,
    pub created_ns: u64,
    /// Session that handed this job to a consumer, if it is running.
    pub running_session_id: Option<Uuid>,
    /// Set while a cancel is in flight; the next run result is coerced.
    pub cancel_reason: Option<CancelReason>,
}

impl JobHolder {
    pub fn new(job: Job, handler: Arc<dyn JobHandler>, insertion_order: u64, now_ns: u64) -> Self {
        let delay_until_ns = now_ns.saturating_add(job.delay_ms.saturating_mul(1_000_000));
        Self {
            job,
            handler,
            run_count: 0,
            insertion_order,
            delay_until_ns,
            created_ns: now_ns,
            running_session_id: None,
            cancel_reason: None,
        }
    }

    pub fn required_network(&self) -> NetworkStatus {
        if self.job.requires_unmetered_network {
            NetworkStatus::Unmetered
        } else if self.job.requires_network {
            NetworkStatus::Metered
        } else {
            NetworkStatus::Disconnected
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_reason.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.running_session_id.is_some()
    }

    /// Translate the handler outcome of one attempt into a [`RunResult`].
    ///
    /// The retry limit is checked before the handler is consulted, so a
    /// handler cannot extend the attempt budget.
    pub fn resolve_run(&self, outcome: anyhow::Result<()>) -> RunResult {
        match outcome {
            Ok(()) => RunResult::Success,
            Err(error) => {
                if self.run_count > self.job.retry_limit {
                    return RunResult::FailRunLimit;
                }
                let decision = self.handler.should_retry(&error, self.run_count);
                if decision.retry {
                    RunResult::TryAgain {
                        constraint: decision.constraint,
                    }
                } else {
                    RunResult::FailShouldReRun
                }
            }
        }
    }

    /// Apply the overrides a retrying handler asked for.
    pub fn apply_retry_constraint(&mut self, constraint: &RetryConstraint, now_ns: u64) {
        self.delay_until_ns = match constraint.delay_ms {
            Some(delay_ms) => now_ns.saturating_add(delay_ms.saturating_mul(1_000_000)),
            None => now_ns,
        };
        if let Some(priority) = constraint.priority {
            self.job.priority = priority;
        }
    }
}

impl std::fmt::Debug for JobHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHolder")
            .field("id", &self.job.id)
            .field("kind", &self.handler.kind())
            .field("priority", &self.job.priority)
            .field("run_count", &self.run_count)
            .field("delay_until_ns", &self.delay_until_ns)
            .field("running", &self.is_running())
            .field("cancel_reason", &self.cancel_reason)
            .finish()
    }
}

/// Final verdict for one job attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum RunResult {
    Success,
    /// Failed but will be requeued with the given overrides.
    TryAgain { constraint: RetryConstraint },
    /// Failed with the attempt budget spent.
    FailRunLimit,
    /// A cancel request caught the job while it was running.
    FailForCancel,
    /// Superseded by a newer job with the same single-instance id.
    FailSingleId,
    /// The handler declined to retry.
    FailShouldReRun,
}

impl RunResult {
    /// Reason reported to [`JobHandler::on_cancel`] for terminal failures.
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        match self {
            RunResult::Success | RunResult::TryAgain { .. } => None,
            RunResult::FailRunLimit => Some(CancelReason::ReachedRetryLimit),
            RunResult::FailForCancel => Some(CancelReason::CancelledByRequest),
            RunResult::FailSingleId => Some(CancelReason::SingleInstanceWhileRunning),
            RunResult::FailShouldReRun => Some(CancelReason::ShouldNotReRun),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::job::RetryDecision;
    use async_trait::async_trait;
    use std::time::Duration;

    pub(crate) struct NoopHandler;

    #[async_trait]
    impl JobHandler for NoopHandler {
        async fn on_run(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct GiveUpHandler;

    #[async_trait]
    impl JobHandler for GiveUpHandler {
        async fn on_run(&self) -> anyhow::Result<()> {
            anyhow::bail!("always fails")
        }

        fn should_retry(&self, _error: &anyhow::Error, _run_count: u32) -> RetryDecision {
            RetryDecision::cancel()
        }
    }

    fn holder_with(handler: Arc<dyn JobHandler>, retry_limit: u32) -> JobHolder {
        JobHolder::new(Job::new().with_retry_limit(retry_limit), handler, 0, 0)
    }

    #[test]
    fn test_delay_sets_readiness_time() {
        let job = Job::new().with_delay(Duration::from_secs(3));
        let h = JobHolder::new(job, Arc::new(NoopHandler), 7, 1_000_000_000);
        assert_eq!(h.delay_until_ns, 4_000_000_000);
        assert_eq!(h.insertion_order, 7);
    }

    #[test]
    fn test_resolve_run_success() {
        let h = holder_with(Arc::new(NoopHandler), 3);
        assert_eq!(h.resolve_run(Ok(())), RunResult::Success);
    }

    #[test]
    fn test_resolve_run_retries_within_budget() {
        let mut h = holder_with(Arc::new(NoopHandler), 3);
        h.run_count = 3;
        // Fourth attempt failed; the budget of retry_limit retries allows
        // one more run.
        assert!(matches!(
            h.resolve_run(Err(anyhow::anyhow!("boom"))),
            RunResult::TryAgain { .. }
        ));
    }

    #[test]
    fn test_resolve_run_exhausted_budget() {
        let mut h = holder_with(Arc::new(NoopHandler), 3);
        h.run_count = 4;
        assert_eq!(
            h.resolve_run(Err(anyhow::anyhow!("boom"))),
            RunResult::FailRunLimit
        );
    }

    #[test]
    fn test_resolve_run_handler_declines() {
        let mut h = holder_with(Arc::new(GiveUpHandler), 3);
        h.run_count = 1;
        assert_eq!(
            h.resolve_run(Err(anyhow::anyhow!("boom"))),
            RunResult::FailShouldReRun
        );
    }

    #[test]
    fn test_apply_retry_constraint() {
        let mut h = holder_with(Arc::new(NoopHandler), 3);
        h.apply_retry_constraint(
            &RetryConstraint {
                delay_ms: Some(500),
                priority: Some(9),
            },
            2_000_000_000,
        );
        assert_eq!(h.delay_until_ns, 2_500_000_000);
        assert_eq!(h.job.priority, 9);

        h.apply_retry_constraint(&RetryConstraint::default(), 3_000_000_000);
        assert_eq!(h.delay_until_ns, 3_000_000_000);
        assert_eq!(h.job.priority, 9);
    }
}
