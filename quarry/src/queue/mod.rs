//! Job storage behind the control loop.
//!
//! The control loop owns its queues exclusively, so implementations take
//! `&mut self` and skip interior locking. [`MemoryJobQueue`] backs volatile
//! jobs, [`SqliteJobQueue`] durable ones, and [`CachedJobQueue`] wraps
//! either to memoize the counts the dispatch path hits on every message.

mod cached;
mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use cached::CachedJobQueue;
pub use memory::MemoryJobQueue;
#[cfg(feature = "sqlite")]
pub use sqlite::{JobRegistry, SqliteJobQueue};

use async_trait::async_trait;
use uuid::Uuid;

use crate::constraint::{Constraint, TagQuery};
use crate::holder::JobHolder;
use crate::job::{Job, JobId};

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Store a new holder. The id must not already be present.
    async fn insert(&mut self, holder: JobHolder) -> anyhow::Result<()>;

    /// Re-store a holder that is coming back from a run, replacing any
    /// previous row and clearing its running session.
    async fn insert_or_replace(&mut self, holder: JobHolder) -> anyhow::Result<()>;

    async fn remove(&mut self, id: JobId) -> anyhow::Result<Option<JobHolder>>;

    async fn count(&mut self) -> anyhow::Result<usize>;

    /// Jobs eligible under `constraint`, counting at most one per group.
    async fn count_ready(&mut self, constraint: &Constraint) -> anyhow::Result<usize>;

    /// Hand out the best eligible job: remove it, increment its run count
    /// and stamp it with `session_id`.
    async fn next_job(
        &mut self,
        constraint: &Constraint,
        session_id: Uuid,
    ) -> anyhow::Result<Option<JobHolder>>;

    /// Earliest future readiness time among jobs that satisfy `constraint`
    /// in every respect except its time limit.
    async fn next_delay_until_ns(&mut self, constraint: &Constraint)
        -> anyhow::Result<Option<u64>>;

    async fn find_by_tags(&mut self, query: &TagQuery) -> anyhow::Result<Vec<JobId>>;

    async fn find_by_id(&mut self, id: JobId) -> anyhow::Result<Option<JobHolder>>;

    /// Ids of every stored job matching `constraint`, in no particular
    /// order.
    async fn find_jobs(&mut self, constraint: &Constraint) -> anyhow::Result<Vec<JobId>>;

    /// Store `holder` and remove the job it supersedes, returning the
    /// displaced holder if it was still present.
    async fn substitute(
        &mut self,
        holder: JobHolder,
        displaced: JobId,
    ) -> anyhow::Result<Option<JobHolder>> {
        let old = self.remove(displaced).await?;
        self.insert_or_replace(holder).await?;
        Ok(old)
    }

    /// Jobs coupled to `job` through its group or single-instance id,
    /// excluding `job` itself.
    async fn find_dependent_jobs(&mut self, job: &Job) -> anyhow::Result<Vec<JobId>>;

    async fn clear(&mut self) -> anyhow::Result<()>;
}
