use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use uuid::Uuid;

use crate::constraint::{Constraint, TagQuery};
use crate::holder::JobHolder;
use crate::job::{Job, JobId};
use crate::queue::JobQueue;

/// Dispatch order: priority descending, then readiness time, then FIFO.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    priority: Reverse<i32>,
    delay_until_ns: u64,
    insertion_order: u64,
    id: JobId,
}

impl OrderKey {
    fn of(holder: &JobHolder) -> Self {
        Self {
            priority: Reverse(holder.job.priority),
            delay_until_ns: holder.delay_until_ns,
            insertion_order: holder.insertion_order,
            id: holder.job.id,
        }
    }
}

/// In-memory queue for volatile jobs.
///
/// Holders live in one map; two sorted views split them into jobs eligible
/// under the last constraint seen and jobs still blocked on delay or
/// network. Eligibility is revalidated against the incoming constraint at
/// the top of every read, so a clock advance or a network change never
/// leaves a stale placement behind.
#[derive(Default)]
pub struct MemoryJobQueue {
    jobs: HashMap<JobId, JobHolder>,
    eligible: BTreeSet<OrderKey>,
    blocked: BTreeSet<OrderKey>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_eligible(holder: &JobHolder, constraint: &Constraint) -> bool {
        let time_ok = match constraint.time_limit_ns {
            Some(limit) => holder.delay_until_ns <= limit,
            None => true,
        };
        time_ok && constraint.network.satisfies(holder.required_network())
    }

    fn revalidate(&mut self, constraint: &Constraint) {
        let promote: Vec<OrderKey> = self
            .blocked
            .iter()
            .filter(|key| Self::is_eligible(&self.jobs[&key.id], constraint))
            .cloned()
            .collect();
        for key in promote {
            self.blocked.remove(&key);
            self.eligible.insert(key);
        }

        let demote: Vec<OrderKey> = self
            .eligible
            .iter()
            .filter(|key| !Self::is_eligible(&self.jobs[&key.id], constraint))
            .cloned()
            .collect();
        for key in demote {
            self.eligible.remove(&key);
            self.blocked.insert(key);
        }
    }

    fn detach(&mut self, id: JobId) -> Option<JobHolder> {
        let holder = self.jobs.remove(&id)?;
        let key = OrderKey::of(&holder);
        self.eligible.remove(&key);
        self.blocked.remove(&key);
        Some(holder)
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn insert(&mut self, holder: JobHolder) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.jobs.contains_key(&holder.job.id),
            "job {} already queued",
            holder.job.id
        );
        // Lands in the blocked view; the next read promotes it if ready.
        self.blocked.insert(OrderKey::of(&holder));
        self.jobs.insert(holder.job.id, holder);
        Ok(())
    }

    async fn insert_or_replace(&mut self, mut holder: JobHolder) -> anyhow::Result<()> {
        self.detach(holder.job.id);
        holder.running_session_id = None;
        self.blocked.insert(OrderKey::of(&holder));
        self.jobs.insert(holder.job.id, holder);
        Ok(())
    }

    async fn remove(&mut self, id: JobId) -> anyhow::Result<Option<JobHolder>> {
        Ok(self.detach(id))
    }

    async fn count(&mut self) -> anyhow::Result<usize> {
        Ok(self.jobs.len())
    }

    async fn count_ready(&mut self, constraint: &Constraint) -> anyhow::Result<usize> {
        self.revalidate(constraint);
        let mut seen_groups: HashSet<&str> = HashSet::new();
        let mut ready = 0;
        for key in &self.eligible {
            let holder = &self.jobs[&key.id];
            if !constraint.matches(holder) {
                continue;
            }
            match holder.job.group_id.as_deref() {
                Some(group) => {
                    if seen_groups.insert(group) {
                        ready += 1;
                    }
                }
                None => ready += 1,
            }
        }
        Ok(ready)
    }

    async fn next_job(
        &mut self,
        constraint: &Constraint,
        session_id: Uuid,
    ) -> anyhow::Result<Option<JobHolder>> {
        self.revalidate(constraint);
        let picked = self
            .eligible
            .iter()
            .find(|key| constraint.matches(&self.jobs[&key.id]))
            .map(|key| key.id);
        let Some(id) = picked else {
            return Ok(None);
        };
        let mut holder = self.detach(id).ok_or_else(|| {
            anyhow::anyhow!("eligible view referenced missing job {id}")
        })?;
        holder.run_count += 1;
        holder.running_session_id = Some(session_id);
        Ok(Some(holder))
    }

    async fn next_delay_until_ns(
        &mut self,
        constraint: &Constraint,
    ) -> anyhow::Result<Option<u64>> {
        let now_ns = constraint.time_limit_ns.unwrap_or(0);
        let mut relaxed = constraint.clone();
        relaxed.time_limit_ns = None;
        Ok(self
            .jobs
            .values()
            .filter(|h| h.delay_until_ns > now_ns && relaxed.matches(h))
            .map(|h| h.delay_until_ns)
            .min())
    }

    async fn find_by_tags(&mut self, query: &TagQuery) -> anyhow::Result<Vec<JobId>> {
        Ok(self
            .jobs
            .values()
            .filter(|h| query.matches(&h.job.tags))
            .map(|h| h.job.id)
            .collect())
    }

    async fn find_by_id(&mut self, id: JobId) -> anyhow::Result<Option<JobHolder>> {
        Ok(self.jobs.get(&id).cloned())
    }

    async fn find_jobs(&mut self, constraint: &Constraint) -> anyhow::Result<Vec<JobId>> {
        Ok(self
            .jobs
            .values()
            .filter(|h| constraint.matches(h))
            .map(|h| h.job.id)
            .collect())
    }

    async fn find_dependent_jobs(&mut self, job: &Job) -> anyhow::Result<Vec<JobId>> {
        Ok(self
            .jobs
            .values()
            .filter(|h| h.job.id != job.id)
            .filter(|h| {
                (job.group_id.is_some() && h.job.group_id == job.group_id)
                    || (job.single_instance_id.is_some()
                        && h.job.single_instance_id == job.single_instance_id)
            })
            .map(|h| h.job.id)
            .collect())
    }

    async fn clear(&mut self) -> anyhow::Result<()> {
        self.jobs.clear();
        self.eligible.clear();
        self.blocked.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::NetworkStatus;
    use crate::job::{Job, JobHandler};
    use std::sync::Arc;
    use std::time::Duration;

    struct Noop;

    #[async_trait]
    impl JobHandler for Noop {
        async fn on_run(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn holder(job: Job, order: u64) -> JobHolder {
        JobHolder::new(job, Arc::new(Noop), order, 0)
    }

    fn now(now_ns: u64) -> Constraint {
        Constraint::new(NetworkStatus::Unmetered).ready_by(now_ns)
    }

    #[tokio::test]
    async fn test_dispatch_order_priority_then_fifo() {
        let mut q = MemoryJobQueue::new();
        let priorities = [2, 1, 2, 3];
        for (i, p) in priorities.iter().enumerate() {
            q.insert(holder(Job::new().with_priority(*p), i as u64))
                .await
                .unwrap();
        }

        let session = Uuid::now_v7();
        let mut served = Vec::new();
        while let Some(h) = q.next_job(&now(0), session).await.unwrap() {
            served.push((h.job.priority, h.insertion_order));
        }
        assert_eq!(served, vec![(3, 3), (2, 0), (2, 2), (1, 1)]);
    }

    #[tokio::test]
    async fn test_delayed_job_blocked_until_time_limit() {
        let mut q = MemoryJobQueue::new();
        q.insert(holder(Job::new().with_delay(Duration::from_secs(10)), 0))
            .await
            .unwrap();

        let session = Uuid::now_v7();
        assert!(q.next_job(&now(0), session).await.unwrap().is_none());
        assert_eq!(q.count_ready(&now(0)).await.unwrap(), 0);
        assert_eq!(
            q.next_delay_until_ns(&now(0)).await.unwrap(),
            Some(10_000_000_000)
        );

        let h = q.next_job(&now(10_000_000_000), session).await.unwrap();
        assert!(h.is_some());
    }

    #[tokio::test]
    async fn test_network_floor_blocks_and_unblocks() {
        let mut q = MemoryJobQueue::new();
        q.insert(holder(Job::new().requiring_network(), 0))
            .await
            .unwrap();

        let session = Uuid::now_v7();
        let offline = Constraint::new(NetworkStatus::Disconnected).ready_by(0);
        assert!(q.next_job(&offline, session).await.unwrap().is_none());

        let metered = Constraint::new(NetworkStatus::Metered).ready_by(0);
        assert!(q.next_job(&metered, session).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_next_job_stamps_session_and_run_count() {
        let mut q = MemoryJobQueue::new();
        q.insert(holder(Job::new(), 0)).await.unwrap();

        let session = Uuid::now_v7();
        let h = q.next_job(&now(0), session).await.unwrap().unwrap();
        assert_eq!(h.run_count, 1);
        assert_eq!(h.running_session_id, Some(session));
        assert_eq!(q.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_insert_or_replace_clears_session() {
        let mut q = MemoryJobQueue::new();
        q.insert(holder(Job::new(), 0)).await.unwrap();
        let session = Uuid::now_v7();
        let h = q.next_job(&now(0), session).await.unwrap().unwrap();

        q.insert_or_replace(h).await.unwrap();
        let again = q.next_job(&now(0), session).await.unwrap().unwrap();
        assert_eq!(again.run_count, 2);
    }

    #[tokio::test]
    async fn test_count_ready_counts_one_per_group() {
        let mut q = MemoryJobQueue::new();
        q.insert(holder(Job::new().in_group("g"), 0)).await.unwrap();
        q.insert(holder(Job::new().in_group("g"), 1)).await.unwrap();
        q.insert(holder(Job::new(), 2)).await.unwrap();

        assert_eq!(q.count_ready(&now(0)).await.unwrap(), 2);
        assert_eq!(q.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_excluded_group_skipped_in_dispatch() {
        let mut q = MemoryJobQueue::new();
        q.insert(holder(Job::new().with_priority(9).in_group("g"), 0))
            .await
            .unwrap();
        q.insert(holder(Job::new().with_priority(1), 1)).await.unwrap();

        let c = now(0).excluding_groups(["g".to_string()]);
        let h = q.next_job(&c, Uuid::now_v7()).await.unwrap().unwrap();
        assert_eq!(h.job.priority, 1);
    }

    #[tokio::test]
    async fn test_find_by_tags() {
        let mut q = MemoryJobQueue::new();
        let tagged = holder(Job::new().tagged("media"), 0);
        let tagged_id = tagged.job.id;
        q.insert(tagged).await.unwrap();
        q.insert(holder(Job::new().tagged("other"), 1)).await.unwrap();

        let found = q.find_by_tags(&TagQuery::any(["media"])).await.unwrap();
        assert_eq!(found, vec![tagged_id]);
    }

    #[tokio::test]
    async fn test_find_jobs_filters_on_constraint() {
        let mut q = MemoryJobQueue::new();
        let plain = holder(Job::new(), 0);
        let plain_id = plain.job.id;
        q.insert(plain).await.unwrap();
        q.insert(holder(Job::new().with_delay(Duration::from_secs(5)), 1))
            .await
            .unwrap();
        let network = holder(Job::new().requiring_network(), 2);
        let network_id = network.job.id;
        q.insert(network).await.unwrap();

        let offline_now = Constraint::new(NetworkStatus::Disconnected).ready_by(0);
        assert_eq!(q.find_jobs(&offline_now).await.unwrap(), vec![plain_id]);

        let online_now = Constraint::new(NetworkStatus::Metered).ready_by(0);
        let mut found = q.find_jobs(&online_now).await.unwrap();
        found.sort();
        let mut expected = vec![plain_id, network_id];
        expected.sort();
        assert_eq!(found, expected);

        // No time limit admits the delayed job too.
        let any_time = Constraint::new(NetworkStatus::Unmetered);
        assert_eq!(q.find_jobs(&any_time).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_find_dependent_jobs_by_group_and_instance() {
        let mut q = MemoryJobQueue::new();
        let anchor = Job::new().in_group("g").single_instance("si");
        let group_mate = holder(Job::new().in_group("g"), 0);
        let twin = holder(Job::new().single_instance("si"), 1);
        let unrelated = holder(Job::new(), 2);
        let group_mate_id = group_mate.job.id;
        let twin_id = twin.job.id;
        q.insert(group_mate).await.unwrap();
        q.insert(twin).await.unwrap();
        q.insert(unrelated).await.unwrap();

        let mut found = q.find_dependent_jobs(&anchor).await.unwrap();
        found.sort();
        let mut expected = vec![group_mate_id, twin_id];
        expected.sort();
        assert_eq!(found, expected);

        // A job with no group and no instance id depends on nothing.
        assert!(q
            .find_dependent_jobs(&Job::new())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_substitute_swaps_holders() {
        let mut q = MemoryJobQueue::new();
        let old = holder(Job::new().with_priority(1), 0);
        let old_id = old.job.id;
        q.insert(old).await.unwrap();

        let replacement = holder(Job::new().with_priority(8), 1);
        let new_id = replacement.job.id;
        let displaced = q.substitute(replacement, old_id).await.unwrap();
        assert_eq!(displaced.map(|h| h.job.id), Some(old_id));

        assert_eq!(q.count().await.unwrap(), 1);
        let h = q.next_job(&now(0), Uuid::now_v7()).await.unwrap().unwrap();
        assert_eq!(h.job.id, new_id);
    }
}
