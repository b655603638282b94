use std::collections::HashSet;
use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Declarative description of one unit of work.
///
/// A `Job` carries the scheduling inputs the engine needs: priority,
/// execution delay, network requirements, grouping and dedup keys. The
/// actual behavior lives in the [`JobHandler`] paired with it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Higher runs first. Ties break on readiness time, then FIFO.
    pub priority: i32,
    /// Minimum time the job must wait before its first run.
    pub delay_ms: u64,
    pub requires_network: bool,
    pub requires_unmetered_network: bool,
    /// Jobs sharing a group run serially in submission order.
    pub group_id: Option<String>,
    /// At most one queued job may carry a given single-instance id.
    pub single_instance_id: Option<String>,
    pub tags: HashSet<String>,
    /// Persistent jobs survive restarts when a durable queue is configured.
    pub persistent: bool,
    /// Number of retries after the first run; `3` allows four runs total.
    pub retry_limit: u32,
}

impl Job {
    pub fn new() -> Self {
        Self {
            id: JobId::new(),
            priority: 0,
            delay_ms: 0,
            requires_network: false,
            requires_unmetered_network: false,
            group_id: None,
            single_instance_id: None,
            tags: HashSet::new(),
            persistent: false,
            retry_limit: DEFAULT_RETRY_LIMIT,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn requiring_network(mut self) -> Self {
        self.requires_network = true;
        self
    }

    pub fn requiring_unmetered_network(mut self) -> Self {
        self.requires_network = true;
        self.requires_unmetered_network = true;
        self
    }

    pub fn in_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Mark this job single-instance; see [`Job::single_instance_id`].
    ///
    /// A single-instance job is implicitly tagged so duplicates can be
    /// located through the tag index.
    pub fn single_instance(mut self, instance_id: impl Into<String>) -> Self {
        let instance_id = instance_id.into();
        self.tags.insert(single_instance_tag(&instance_id));
        self.single_instance_id = Some(instance_id);
        self
    }

    pub fn tagged(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn persisted(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }
}

impl Default for Job {
    fn default() -> Self {
        Self::new()
    }
}

pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// Reserved tag prefix backing the single-instance index.
pub(crate) fn single_instance_tag(instance_id: &str) -> String {
    format!("quarry:single:{instance_id}")
}

/// Behavior attached to a [`Job`].
///
/// Lifecycle callbacks run in this order: `on_added` once at submission,
/// `on_run` once per attempt, and `on_cancel` exactly once if the job
/// leaves the engine without succeeding.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Stable type name used to rehydrate persistent jobs.
    fn kind(&self) -> &'static str {
        "adhoc"
    }

    /// Invoked once when the engine accepts the job, before any run.
    async fn on_added(&self) {}

    /// Perform the work. An `Err` triggers the retry path.
    async fn on_run(&self) -> anyhow::Result<()>;

    /// Invoked exactly once when the job is cancelled or gives up.
    async fn on_cancel(&self, _reason: CancelReason) {}

    /// Decide what to do after a failed run.
    ///
    /// `run_count` is the number of completed attempts, the failed one
    /// included. The engine ignores the decision once the retry limit is
    /// exhausted.
    fn should_retry(&self, _error: &anyhow::Error, _run_count: u32) -> RetryDecision {
        RetryDecision::retry()
    }

    /// Serialize the handler state for a durable queue.
    ///
    /// Only called for persistent jobs; the default refuses, which keeps
    /// ad-hoc closures out of the durable path by construction.
    fn serialize_payload(&self) -> anyhow::Result<Vec<u8>> {
        anyhow::bail!("handler kind {:?} is not serializable", self.kind())
    }
}

/// Outcome of [`JobHandler::should_retry`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RetryDecision {
    pub retry: bool,
    /// Adjustments applied to the job before it is requeued.
    pub constraint: RetryConstraint,
}

impl RetryDecision {
    pub fn retry() -> Self {
        Self {
            retry: true,
            constraint: RetryConstraint::default(),
        }
    }

    pub fn cancel() -> Self {
        Self {
            retry: false,
            constraint: RetryConstraint::default(),
        }
    }

    pub fn retry_after(delay: Duration) -> Self {
        Self {
            retry: true,
            constraint: RetryConstraint {
                delay_ms: Some(delay.as_millis() as u64),
                priority: None,
            },
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.constraint.priority = Some(priority);
        self
    }
}

/// Overrides a retrying handler may apply to its next attempt.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RetryConstraint {
    pub delay_ms: Option<u64>,
    pub priority: Option<i32>,
}

/// Why a job left the engine without succeeding.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CancelReason {
    /// A cancel request matched this job.
    CancelledByRequest,
    /// The job failed and its retry budget is spent.
    ReachedRetryLimit,
    /// A newer job with the same single-instance id arrived while this
    /// one was running.
    SingleInstanceWhileRunning,
    /// A job with the same single-instance id was already queued, so this
    /// submission was dropped.
    DroppedForDuplicate,
    /// The handler declined to retry after a failed run.
    ShouldNotReRun,
}

impl Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            CancelReason::CancelledByRequest => "cancelled_by_request",
            CancelReason::ReachedRetryLimit => "reached_retry_limit",
            CancelReason::SingleInstanceWhileRunning => "single_instance_while_running",
            CancelReason::DroppedForDuplicate => "dropped_for_duplicate",
            CancelReason::ShouldNotReRun => "should_not_re_run",
        };
        write!(f, "{label}")
    }
}

/// Where a job currently sits in the engine.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Not present: never submitted, finished, or cancelled.
    Unknown,
    /// Queued but blocked on delay or network.
    WaitingNotReady,
    /// Queued and eligible to run now.
    WaitingReady,
    Running,
}

/// Receipt returned by a submission.
#[derive(Clone, Debug)]
pub struct JobHandle {
    pub id: JobId,
    pub priority: i32,
    /// `false` when the job was dropped as a single-instance duplicate.
    pub accepted: bool,
}

/// Aggregate result of a cancel request.
#[derive(Clone, Debug, Default)]
pub struct CancelResult {
    /// Jobs removed from the queue or coerced out of a running session.
    pub cancelled: Vec<JobId>,
    /// Jobs that finished successfully before the cancel reached them.
    pub failed_to_cancel: Vec<JobId>,
}
