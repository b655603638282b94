use async_trait::async_trait;
use uuid::Uuid;

use crate::constraint::{Constraint, TagQuery};
use crate::holder::JobHolder;
use crate::job::{Job, JobId};
use crate::queue::JobQueue;

/// Stable identity of a constraint, for memoizing ready counts.
#[derive(Clone, Debug, PartialEq)]
struct ConstraintKey {
    time_limit_ns: Option<u64>,
    network: crate::constraint::NetworkStatus,
    exclude_groups: Vec<String>,
    exclude_job_ids: Vec<JobId>,
}

impl ConstraintKey {
    fn of(constraint: &Constraint) -> Option<Self> {
        // Tagged queries are rare and not worth caching.
        if constraint.tags.is_some() {
            return None;
        }
        let mut exclude_groups: Vec<String> =
            constraint.exclude_groups.iter().cloned().collect();
        exclude_groups.sort();
        let mut exclude_job_ids: Vec<JobId> =
            constraint.exclude_job_ids.iter().copied().collect();
        exclude_job_ids.sort();
        Some(Self {
            time_limit_ns: constraint.time_limit_ns,
            network: constraint.network,
            exclude_groups,
            exclude_job_ids,
        })
    }
}

/// Count-memoizing decorator.
///
/// The dispatch path asks for totals and ready counts on nearly every
/// control message; this wrapper answers repeats from cache and drops the
/// cache on any mutation. An empty queue short-circuits ready counts
/// entirely.
pub struct CachedJobQueue<Q> {
    inner: Q,
    count: Option<usize>,
    ready: Option<(ConstraintKey, usize)>,
}

impl<Q: JobQueue> CachedJobQueue<Q> {
    pub fn new(inner: Q) -> Self {
        Self {
            inner,
            count: None,
            ready: None,
        }
    }

    fn invalidate(&mut self) {
        self.count = None;
        self.ready = None;
    }
}

#[async_trait]
impl<Q: JobQueue> JobQueue for CachedJobQueue<Q> {
    async fn insert(&mut self, holder: JobHolder) -> anyhow::Result<()> {
        self.invalidate();
        self.inner.insert(holder).await
    }

    async fn insert_or_replace(&mut self, holder: JobHolder) -> anyhow::Result<()> {
        self.invalidate();
        self.inner.insert_or_replace(holder).await
    }

    async fn remove(&mut self, id: JobId) -> anyhow::Result<Option<JobHolder>> {
        self.invalidate();
        self.inner.remove(id).await
    }

    async fn count(&mut self) -> anyhow::Result<usize> {
        if let Some(count) = self.count {
            return Ok(count);
        }
        let count = self.inner.count().await?;
        self.count = Some(count);
        Ok(count)
    }

    async fn count_ready(&mut self, constraint: &Constraint) -> anyhow::Result<usize> {
        if self.count().await? == 0 {
            return Ok(0);
        }
        let key = ConstraintKey::of(constraint);
        if let (Some(key), Some((cached_key, cached))) = (&key, &self.ready) {
            if key == cached_key {
                return Ok(*cached);
            }
        }
        let ready = self.inner.count_ready(constraint).await?;
        if let Some(key) = key {
            self.ready = Some((key, ready));
        }
        Ok(ready)
    }

    async fn next_job(
        &mut self,
        constraint: &Constraint,
        session_id: Uuid,
    ) -> anyhow::Result<Option<JobHolder>> {
        if self.count == Some(0) {
            return Ok(None);
        }
        let job = self.inner.next_job(constraint, session_id).await?;
        if job.is_some() {
            self.invalidate();
        }
        Ok(job)
    }

    async fn next_delay_until_ns(
        &mut self,
        constraint: &Constraint,
    ) -> anyhow::Result<Option<u64>> {
        self.inner.next_delay_until_ns(constraint).await
    }

    async fn find_by_tags(&mut self, query: &TagQuery) -> anyhow::Result<Vec<JobId>> {
        self.inner.find_by_tags(query).await
    }

    async fn find_by_id(&mut self, id: JobId) -> anyhow::Result<Option<JobHolder>> {
        self.inner.find_by_id(id).await
    }

    async fn find_jobs(&mut self, constraint: &Constraint) -> anyhow::Result<Vec<JobId>> {
        self.inner.find_jobs(constraint).await
    }

    async fn substitute(
        &mut self,
        holder: JobHolder,
        displaced: JobId,
    ) -> anyhow::Result<Option<JobHolder>> {
        self.invalidate();
        self.inner.substitute(holder, displaced).await
    }

    async fn find_dependent_jobs(&mut self, job: &Job) -> anyhow::Result<Vec<JobId>> {
        self.inner.find_dependent_jobs(job).await
    }

    async fn clear(&mut self) -> anyhow::Result<()> {
        self.invalidate();
        self.inner.clear().await
    }
}
