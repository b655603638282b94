use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use tracing::Instrument;

use crate::clock::Clock;
use crate::holder::JobHolder;
use crate::messaging::{MessageQueue, QueueMessage};
use crate::runtime::control::EngineMessage;

pub(crate) type WorkerId = usize;

/// Message delivered to one consumer's inbox.
pub(crate) enum WorkerMessage {
    Run(JobHolder),
}

impl QueueMessage for WorkerMessage {
    fn lane(&self) -> usize {
        0
    }
}

struct WorkerEntry {
    inbox: Arc<MessageQueue<WorkerMessage>>,
    busy: bool,
}

#[derive(Default)]
struct PoolState {
    workers: HashMap<WorkerId, WorkerEntry>,
    next_id: WorkerId,
}

/// Adaptive pool of consumer tasks.
///
/// The control loop grows the pool while demand outpaces what the active
/// consumers can absorb; each consumer retires itself after sitting idle
/// past the keep-alive, provided the pool stays above its minimum and the
/// remaining consumers still cover the demand last seen.
pub(crate) struct ConsumerPool {
    state: Arc<Mutex<PoolState>>,
    /// Ready-plus-running jobs as of the last dispatch pass. Shared with
    /// the workers so retirement sees current demand.
    demand: Arc<AtomicUsize>,
    engine_queue: Arc<MessageQueue<EngineMessage>>,
    clock: Arc<dyn Clock>,
    min: usize,
    max: usize,
    load_factor: usize,
    keep_alive_ms: u64,
}

impl ConsumerPool {
    pub(crate) fn new(
        engine_queue: Arc<MessageQueue<EngineMessage>>,
        clock: Arc<dyn Clock>,
        min: usize,
        max: usize,
        load_factor: usize,
        keep_alive_ms: u64,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(PoolState::default())),
            demand: Arc::new(AtomicUsize::new(0)),
            engine_queue,
            clock,
            min,
            max,
            load_factor: load_factor.max(1),
            keep_alive_ms,
        }
    }

    pub(crate) fn active(&self) -> usize {
        self.state.lock().workers.len()
    }

    pub(crate) fn set_demand(&self, demand: usize) {
        self.demand.store(demand, Ordering::SeqCst);
    }

    /// Reserve a consumer for one job: an idle one if present, a freshly
    /// spawned one if the pool formula allows more.
    pub(crate) fn acquire(&self, demand: usize) -> Option<WorkerId> {
        self.set_demand(demand);
        let mut state = self.state.lock();

        if let Some((id, entry)) = state.workers.iter_mut().find(|(_, e)| !e.busy) {
            entry.busy = true;
            return Some(*id);
        }

        let active = state.workers.len();
        let wanted = active < self.max
            && (active < self.min || active * self.load_factor < demand);
        if !wanted {
            return None;
        }

        let id = state.next_id;
        state.next_id += 1;
        let inbox = MessageQueue::new(1, Arc::clone(&self.clock));
        state.workers.insert(
            id,
            WorkerEntry {
                inbox: Arc::clone(&inbox),
                busy: true,
            },
        );
        debug!(worker_id = id, active = active + 1, "consumer spawned");

        tokio::spawn(worker_loop(
            id,
            inbox,
            Arc::clone(&self.state),
            Arc::clone(&self.demand),
            Arc::clone(&self.engine_queue),
            Arc::clone(&self.clock),
            self.min,
            self.load_factor,
            self.keep_alive_ms,
        ));
        Some(id)
    }

    /// Hand a reserved consumer its job.
    pub(crate) fn assign(&self, id: WorkerId, holder: JobHolder) {
        let state = self.state.lock();
        if let Some(entry) = state.workers.get(&id) {
            entry.inbox.post(WorkerMessage::Run(holder));
        }
    }

    /// Return a reserved consumer unused.
    pub(crate) fn release(&self, id: WorkerId) {
        let mut state = self.state.lock();
        if let Some(entry) = state.workers.get_mut(&id) {
            entry.busy = false;
        }
    }

    /// Stop every consumer. Idempotent.
    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock();
        for entry in state.workers.values() {
            entry.inbox.stop();
        }
        state.workers.clear();
    }
}

impl std::fmt::Debug for ConsumerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerPool")
            .field("active", &self.active())
            .field("min", &self.min)
            .field("max", &self.max)
            .field("load_factor", &self.load_factor)
            .finish()
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    id: WorkerId,
    inbox: Arc<MessageQueue<WorkerMessage>>,
    state: Arc<Mutex<PoolState>>,
    demand: Arc<AtomicUsize>,
    engine_queue: Arc<MessageQueue<EngineMessage>>,
    clock: Arc<dyn Clock>,
    min: usize,
    load_factor: usize,
    keep_alive_ms: u64,
) {
    loop {
        let deadline_ns = clock
            .now_ns()
            .saturating_add(keep_alive_ms.saturating_mul(1_000_000));
        match inbox.poll(deadline_ns).await {
            Some(WorkerMessage::Run(holder)) => {
                let span = crate::telemetry::job_run_span(
                    holder.job.id.to_string(),
                    holder.handler.kind(),
                    holder.run_count,
                );
                let started_ns = clock.now_ns();
                let outcome = holder.handler.on_run().instrument(span).await;
                let result = holder.resolve_run(outcome);
                let elapsed = clock.now_ns().saturating_sub(started_ns) as f64 / 1e9;
                crate::telemetry::record_job_finished(holder.handler.kind(), &result, elapsed);
                {
                    let mut state = state.lock();
                    if let Some(entry) = state.workers.get_mut(&id) {
                        entry.busy = false;
                    }
                }
                engine_queue.post(EngineMessage::JobFinished { holder, result });
            }
            None => {
                if !inbox.is_running() {
                    break;
                }
                let retire = {
                    let mut state = state.lock();
                    let active = state.workers.len();
                    let busy = state.workers.get(&id).map(|e| e.busy).unwrap_or(false);
                    let surplus = !busy
                        && active > min
                        && (active - 1) * load_factor >= demand.load(Ordering::SeqCst);
                    if surplus {
                        state.workers.remove(&id);
                    }
                    surplus
                };
                if retire {
                    debug!(worker_id = id, "consumer retired after keep-alive");
                    break;
                }
                engine_queue.post(EngineMessage::ConsumerIdle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::job::Job;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Noop;

    #[async_trait]
    impl crate::job::JobHandler for Noop {
        async fn on_run(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn pool(clock: Arc<ManualClock>, min: usize, max: usize) -> ConsumerPool {
        let engine_queue = MessageQueue::new(6, clock.clone() as Arc<dyn Clock>);
        ConsumerPool::new(engine_queue, clock, min, max, 2, 1_000)
    }

    #[tokio::test]
    async fn test_acquire_respects_max() {
        let clock = ManualClock::new();
        let p = pool(clock, 0, 2);

        assert!(p.acquire(10).is_some());
        assert!(p.acquire(10).is_some());
        assert!(p.acquire(10).is_none(), "pool is at max");
        assert_eq!(p.active(), 2);
        p.shutdown();
    }

    #[tokio::test]
    async fn test_no_spawn_when_load_is_covered() {
        let clock = ManualClock::new();
        let p = pool(clock, 0, 5);

        let first = p.acquire(1).expect("first consumer");
        p.release(first);
        // One idle consumer covers a demand of 2 at load factor 2: the
        // idle one is reused, no second spawn.
        let again = p.acquire(2).expect("reuse idle consumer");
        assert_eq!(again, first);
        assert_eq!(p.active(), 1);
        p.shutdown();
    }

    #[tokio::test]
    async fn test_min_consumers_spawn_even_without_load() {
        let clock = ManualClock::new();
        let p = pool(clock, 1, 5);
        assert!(p.acquire(0).is_some(), "below min always spawns");
        p.shutdown();
    }

    #[tokio::test]
    async fn test_assigned_job_runs_and_reports() {
        let clock = ManualClock::new();
        let engine_queue = MessageQueue::new(6, clock.clone() as Arc<dyn Clock>);
        let p = ConsumerPool::new(Arc::clone(&engine_queue), clock, 0, 2, 2, 1_000);

        let id = p.acquire(1).expect("consumer");
        p.assign(
            id,
            JobHolder::new(Job::new(), Arc::new(Noop), 0, 0),
        );

        let finished = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(EngineMessage::JobFinished { result, .. }) =
                    engine_queue.poll(crate::clock::NEVER_NS).await
                {
                    break result;
                }
            }
        })
        .await
        .expect("worker never reported");
        assert_eq!(finished, crate::holder::RunResult::Success);
        p.shutdown();
    }

    #[tokio::test]
    async fn test_idle_worker_retires_after_keep_alive() {
        let clock = ManualClock::new();
        let p = pool(Arc::clone(&clock), 0, 2);

        let id = p.acquire(5).expect("consumer");
        p.release(id);
        p.set_demand(0);

        // Let the spawned worker enter its poll before the clock moves, so
        // the keep-alive deadline is computed from the pre-advance time.
        tokio::task::yield_now().await;
        clock.advance(Duration::from_secs(2));
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if p.active() == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("worker never retired");
    }
}
