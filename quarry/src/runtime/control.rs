use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::constraint::{Constraint, NetworkStatus, TagQuery};
use crate::events::{EventPublisher, InProcEventBus, JobEvent, JobEventKind};
use crate::holder::{JobHolder, RunResult};
use crate::job::{
    single_instance_tag, CancelReason, CancelResult, Job, JobHandle, JobHandler, JobId,
    JobStatus,
};
use crate::messaging::{MessageConsumer, MessageQueue, QueueMessage};
use crate::queue::{CachedJobQueue, JobQueue, MemoryJobQueue};
use crate::running::RunningJobSet;
use crate::runtime::consumer::ConsumerPool;
use crate::wake::{WakeRequest, WakeScheduler};

/// Control messages, ordered by lane: results beat cancels, cancels beat
/// submissions, queries and commands drain last.
pub(crate) enum EngineMessage {
    JobFinished {
        holder: JobHolder,
        result: RunResult,
    },
    Cancel {
        query: TagQuery,
        ack: oneshot::Sender<CancelResult>,
    },
    NetworkChange(NetworkStatus),
    AddJob {
        job: Job,
        handler: Arc<dyn JobHandler>,
        ack: Option<oneshot::Sender<JobHandle>>,
    },
    PlatformWake {
        request_id: Uuid,
        ack: oneshot::Sender<bool>,
    },
    /// Self-message armed for the next readiness time.
    Poke,
    ConsumerIdle,
    Query(EngineQuery),
    Command(EngineCommand),
}

pub(crate) const ENGINE_LANES: usize = 6;

impl QueueMessage for EngineMessage {
    fn lane(&self) -> usize {
        match self {
            EngineMessage::JobFinished { .. } => 0,
            EngineMessage::Cancel { .. } | EngineMessage::NetworkChange(_) => 1,
            EngineMessage::AddJob { .. } | EngineMessage::PlatformWake { .. } => 2,
            EngineMessage::Poke | EngineMessage::ConsumerIdle => 3,
            EngineMessage::Query(_) => 4,
            EngineMessage::Command(_) => 5,
        }
    }
}

pub(crate) enum EngineQuery {
    Count(oneshot::Sender<usize>),
    CountReady(oneshot::Sender<usize>),
    Status(JobId, oneshot::Sender<JobStatus>),
}

pub(crate) enum EngineCommand {
    Stop,
    Start,
    Destroy(oneshot::Sender<()>),
}

/// What the control loop remembers about a job it handed to a consumer.
struct RunningMeta {
    group_id: Option<String>,
    single_instance_id: Option<String>,
    tags: HashSet<String>,
    persistent: bool,
    /// When set, the job's non-success result is coerced to this reason.
    coerce: Option<CancelReason>,
}

struct PendingCancel {
    remaining: HashSet<JobId>,
    result: CancelResult,
    ack: Option<oneshot::Sender<CancelResult>>,
}

/// Single-threaded owner of all engine state.
///
/// Everything mutable lives here and is only touched from the message
/// loop: the queues, the running set, cancel bookkeeping, and the
/// consumer pool's growth decisions. Producers talk to it exclusively
/// through [`EngineMessage`]s.
pub(crate) struct ControlLoop {
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    engine_queue: Arc<MessageQueue<EngineMessage>>,
    non_persistent: CachedJobQueue<MemoryJobQueue>,
    persistent: Option<Box<dyn JobQueue>>,
    events: Arc<InProcEventBus>,
    wake: Arc<dyn WakeScheduler>,
    pool: ConsumerPool,
    network_status: NetworkStatus,
    running: RunningJobSet,
    running_meta: HashMap<JobId, RunningMeta>,
    pending_cancels: Vec<PendingCancel>,
    pending_wakes: HashSet<Uuid>,
    /// Deadline of the delayed poke currently in flight, if any.
    armed_poke_ns: Option<u64>,
    /// Network and absolute readiness time the filed wake request covers.
    armed_wake: Option<(NetworkStatus, u64)>,
    insertion_counter: u64,
    session_id: Uuid,
    paused: bool,
}

impl ControlLoop {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        clock: Arc<dyn Clock>,
        config: EngineConfig,
        engine_queue: Arc<MessageQueue<EngineMessage>>,
        persistent: Option<Box<dyn JobQueue>>,
        events: Arc<InProcEventBus>,
        wake: Arc<dyn WakeScheduler>,
        initial_network: NetworkStatus,
    ) -> Self {
        let pool = ConsumerPool::new(
            Arc::clone(&engine_queue),
            Arc::clone(&clock),
            config.min_consumers,
            config.max_consumers,
            config.consumer_load_factor,
            config.consumer_keep_alive_ms,
        );
        Self {
            clock,
            config,
            engine_queue,
            non_persistent: CachedJobQueue::new(MemoryJobQueue::new()),
            persistent,
            events,
            wake,
            pool,
            network_status: initial_network,
            running: RunningJobSet::default(),
            running_meta: HashMap::new(),
            pending_cancels: Vec::new(),
            pending_wakes: HashSet::new(),
            armed_poke_ns: None,
            armed_wake: None,
            insertion_counter: 0,
            session_id: Uuid::now_v7(),
            paused: false,
        }
    }

    fn queues_mut(&mut self) -> Vec<&mut dyn JobQueue> {
        let mut queues: Vec<&mut dyn JobQueue> = vec![&mut self.non_persistent];
        if let Some(persistent) = self.persistent.as_mut() {
            queues.push(persistent.as_mut());
        }
        queues
    }

    fn dispatch_constraint(&mut self) -> Constraint {
        let now = self.clock.now_ns();
        let blocked = self.running.blocked_groups(now);
        let running_ids: Vec<JobId> = self.running_meta.keys().copied().collect();
        Constraint::new(self.network_status)
            .ready_by(now)
            .excluding_groups(blocked)
            .excluding_jobs(running_ids)
    }

    async fn count_ready(&mut self, constraint: &Constraint) -> anyhow::Result<usize> {
        let mut total = 0;
        for queue in self.queues_mut() {
            total += queue.count_ready(constraint).await?;
        }
        Ok(total)
    }

    async fn take_next(&mut self, constraint: &Constraint) -> anyhow::Result<Option<JobHolder>> {
        let session = self.session_id;
        for queue in self.queues_mut() {
            if let Some(holder) = queue.next_job(constraint, session).await? {
                return Ok(Some(holder));
            }
        }
        Ok(None)
    }

    async fn publish(&self, job_id: JobId, kind: JobEventKind) {
        let event = JobEvent {
            job_id,
            kind,
            at_ns: self.clock.now_ns(),
        };
        if let Err(error) = self.events.publish(event).await {
            warn!(%error, "failed to publish job event");
        }
    }

    /// Hand out eligible jobs until consumers or work run out, then arm
    /// the timers for whatever stays blocked.
    async fn dispatch(&mut self) -> anyhow::Result<()> {
        if self.paused {
            return Ok(());
        }
        let mut assigned_any = false;
        loop {
            let constraint = self.dispatch_constraint();
            let ready = self.count_ready(&constraint).await?;
            self.pool
                .set_demand(ready + self.running_meta.len());
            if ready == 0 {
                break;
            }
            let Some(worker) = self.pool.acquire(ready + self.running_meta.len()) else {
                break;
            };
            match self.take_next(&constraint).await? {
                Some(holder) => {
                    let id = holder.job.id;
                    self.running.add(id, holder.job.group_id.as_deref());
                    self.running_meta.insert(
                        id,
                        RunningMeta {
                            group_id: holder.job.group_id.clone(),
                            single_instance_id: holder.job.single_instance_id.clone(),
                            tags: holder.job.tags.clone(),
                            persistent: holder.job.persistent,
                            coerce: None,
                        },
                    );
                    self.publish(
                        id,
                        JobEventKind::Started {
                            run_count: holder.run_count,
                        },
                    )
                    .await;
                    self.pool.assign(worker, holder);
                    assigned_any = true;
                }
                None => {
                    self.pool.release(worker);
                    break;
                }
            }
        }
        if assigned_any {
            self.pending_wakes.clear();
            self.armed_wake = None;
            if let Err(error) = self.wake.cancel_all().await {
                warn!(%error, "failed to cancel platform wake-ups");
            }
        }
        self.arm_timers().await
    }

    /// Earliest readiness among jobs blocked only on time, given the
    /// network floor in `constraint`.
    async fn earliest_delay(&mut self, constraint: &Constraint) -> anyhow::Result<Option<u64>> {
        let mut next: Option<u64> = None;
        for queue in self.queues_mut() {
            if let Some(t) = queue.next_delay_until_ns(constraint).await? {
                next = Some(next.map_or(t, |n| n.min(t)));
            }
        }
        Ok(next)
    }

    /// Re-arm the delayed poke and, when the engine is about to go quiet,
    /// file a platform wake-up for the blocked work.
    async fn arm_timers(&mut self) -> anyhow::Result<()> {
        let now = self.clock.now_ns();
        let constraint = self.dispatch_constraint();

        let mut next = self.earliest_delay(&constraint).await?;
        if let Some(expiry) = self.running.next_cool_down_expiry_ns() {
            next = Some(next.map_or(expiry, |n| n.min(expiry)));
        }
        // Only touch the queue when the deadline moved: a cancel/re-post
        // counts as new work to the idle check and would spin the loop.
        if next != self.armed_poke_ns {
            self.engine_queue
                .cancel_messages(|m| matches!(m, EngineMessage::Poke));
            if let Some(at) = next {
                self.engine_queue.post_at(EngineMessage::Poke, at);
            }
            self.armed_poke_ns = next;
        }

        if self.count_ready(&constraint).await? > 0 {
            return Ok(());
        }
        if let Some((request, until_ns)) =
            self.blocked_work_request(&constraint, now).await?
        {
            let signature = (request.network, until_ns);
            if self.armed_wake != Some(signature) {
                self.armed_wake = Some(signature);
                self.pending_wakes.insert(request.id);
                if let Err(error) = self.wake.request(request).await {
                    warn!(%error, "failed to file platform wake-up");
                }
            }
        }
        Ok(())
    }

    /// Describe the wake-up the blocked work needs, if any, paired with
    /// the absolute readiness time it covers (zero for network-only
    /// waits) so callers can tell a re-ask from new blocked work.
    async fn blocked_work_request(
        &mut self,
        constraint: &Constraint,
        now: u64,
    ) -> anyhow::Result<Option<(WakeRequest, u64)>> {
        for network in [NetworkStatus::Metered, NetworkStatus::Unmetered] {
            if network <= self.network_status {
                continue;
            }
            let mut relaxed = constraint.clone();
            relaxed.network = network;
            if self.count_ready(&relaxed).await? > 0 {
                return Ok(Some((WakeRequest::new(network, 0, None), 0)));
            }
        }

        let mut relaxed = constraint.clone();
        relaxed.network = NetworkStatus::Unmetered;
        if let Some(at) = self.earliest_delay(&relaxed).await? {
            let delay_ms = at.saturating_sub(now) / 1_000_000;
            return Ok(Some((
                WakeRequest::new(NetworkStatus::Disconnected, delay_ms, Some(delay_ms)),
                at,
            )));
        }
        Ok(None)
    }

    async fn handle_add_job(
        &mut self,
        job: Job,
        handler: Arc<dyn JobHandler>,
        ack: Option<oneshot::Sender<JobHandle>>,
    ) -> anyhow::Result<()> {
        handler.on_added().await;

        if let Some(instance) = job.single_instance_id.clone() {
            let query = TagQuery::any([single_instance_tag(&instance)]);
            let mut queued_duplicate = false;
            for queue in self.queues_mut() {
                if !queue.find_by_tags(&query).await?.is_empty() {
                    queued_duplicate = true;
                    break;
                }
            }
            if queued_duplicate {
                debug!(job_id = %job.id, instance, "dropping single-instance duplicate");
                handler.on_cancel(CancelReason::DroppedForDuplicate).await;
                self.publish(
                    job.id,
                    JobEventKind::Cancelled {
                        reason: CancelReason::DroppedForDuplicate,
                    },
                )
                .await;
                if let Some(ack) = ack {
                    let _ = ack.send(JobHandle {
                        id: job.id,
                        priority: job.priority,
                        accepted: false,
                    });
                }
                return Ok(());
            }
            // A running twin is allowed to finish its attempt but not to
            // retry; the newcomer takes its place in the queue.
            for meta in self.running_meta.values_mut() {
                if meta.single_instance_id.as_deref() == Some(instance.as_str()) {
                    meta.coerce.get_or_insert(CancelReason::SingleInstanceWhileRunning);
                }
            }
        }

        let now = self.clock.now_ns();
        self.insertion_counter += 1;
        let holder = JobHolder::new(job, handler, self.insertion_counter, now);
        let id = holder.job.id;
        let priority = holder.job.priority;

        let durable = holder.job.persistent && self.persistent.is_some();
        if holder.job.persistent && self.persistent.is_none() {
            warn!(job_id = %id, "no durable queue configured, keeping persistent job in memory");
        }
        let queue: &mut dyn JobQueue = if durable {
            self.persistent
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!("durable queue vanished"))?
                .as_mut()
        } else {
            &mut self.non_persistent
        };
        let kind = holder.handler.kind();
        queue.insert(holder).await?;
        crate::telemetry::record_job_added(kind);

        self.publish(id, JobEventKind::Added { priority }).await;
        if let Some(ack) = ack {
            let _ = ack.send(JobHandle {
                id,
                priority,
                accepted: true,
            });
        }
        self.dispatch().await
    }

    async fn handle_job_finished(
        &mut self,
        mut holder: JobHolder,
        mut result: RunResult,
    ) -> anyhow::Result<()> {
        let id = holder.job.id;
        let meta = self.running_meta.remove(&id);
        self.running.remove(id, holder.job.group_id.as_deref());

        if let Some(reason) = meta.as_ref().and_then(|m| m.coerce) {
            // Success stands; anything else takes the coerced reason.
            if !matches!(result, RunResult::Success) {
                result = match reason {
                    CancelReason::CancelledByRequest => RunResult::FailForCancel,
                    CancelReason::SingleInstanceWhileRunning => RunResult::FailSingleId,
                    _ => result,
                };
            }
        }

        let durable = meta.as_ref().map(|m| m.persistent).unwrap_or(false);
        match result {
            RunResult::Success => {
                if durable {
                    if let Some(persistent) = self.persistent.as_mut() {
                        persistent.remove(id).await?;
                    }
                }
                self.publish(
                    id,
                    JobEventKind::Completed {
                        run_count: holder.run_count,
                    },
                )
                .await;
                self.resolve_pending_cancels(id, true);
            }
            RunResult::TryAgain { constraint } => {
                let now = self.clock.now_ns();
                holder.apply_retry_constraint(&constraint, now);
                if let Some(group) = holder.job.group_id.clone() {
                    if holder.delay_until_ns > now {
                        self.running.cool_down_group(&group, holder.delay_until_ns);
                    }
                }
                self.publish(
                    id,
                    JobEventKind::Requeued {
                        run_count: holder.run_count,
                    },
                )
                .await;
                let queue: &mut dyn JobQueue = if durable {
                    self.persistent
                        .as_mut()
                        .ok_or_else(|| anyhow::anyhow!("durable queue vanished"))?
                        .as_mut()
                } else {
                    &mut self.non_persistent
                };
                queue.insert_or_replace(holder).await?;
            }
            _ => {
                let reason = result
                    .cancel_reason()
                    .unwrap_or(CancelReason::ShouldNotReRun);
                if durable {
                    if let Some(persistent) = self.persistent.as_mut() {
                        persistent.remove(id).await?;
                    }
                }
                holder.handler.on_cancel(reason).await;
                self.publish(id, JobEventKind::Cancelled { reason }).await;
                self.resolve_pending_cancels(id, false);
            }
        }
        self.dispatch().await
    }

    fn resolve_pending_cancels(&mut self, id: JobId, succeeded: bool) {
        for pending in &mut self.pending_cancels {
            if pending.remaining.remove(&id) {
                if succeeded {
                    pending.result.failed_to_cancel.push(id);
                } else {
                    pending.result.cancelled.push(id);
                }
                if pending.remaining.is_empty() {
                    if let Some(ack) = pending.ack.take() {
                        let _ = ack.send(std::mem::take(&mut pending.result));
                    }
                }
            }
        }
        self.pending_cancels.retain(|p| p.ack.is_some());
    }

    async fn handle_cancel(
        &mut self,
        query: TagQuery,
        ack: oneshot::Sender<CancelResult>,
    ) -> anyhow::Result<()> {
        let mut result = CancelResult::default();

        // Queued matches come out immediately.
        let mut removed: Vec<JobHolder> = Vec::new();
        for queue in self.queues_mut() {
            for id in queue.find_by_tags(&query).await? {
                if let Some(holder) = queue.remove(id).await? {
                    removed.push(holder);
                }
            }
        }
        for holder in removed {
            holder
                .handler
                .on_cancel(CancelReason::CancelledByRequest)
                .await;
            self.publish(
                holder.job.id,
                JobEventKind::Cancelled {
                    reason: CancelReason::CancelledByRequest,
                },
            )
            .await;
            result.cancelled.push(holder.job.id);
        }

        // Running matches finish their attempt first; the response waits.
        let mut remaining = HashSet::new();
        for (id, meta) in self.running_meta.iter_mut() {
            if query.matches(&meta.tags) {
                meta.coerce.get_or_insert(CancelReason::CancelledByRequest);
                remaining.insert(*id);
            }
        }

        if remaining.is_empty() {
            let _ = ack.send(result);
        } else {
            self.pending_cancels.push(PendingCancel {
                remaining,
                result,
                ack: Some(ack),
            });
        }
        self.arm_timers().await
    }

    async fn handle_query(&mut self, query: EngineQuery) -> anyhow::Result<()> {
        match query {
            EngineQuery::Count(ack) => {
                let mut total = self.running_meta.len();
                for queue in self.queues_mut() {
                    total += queue.count().await?;
                }
                let _ = ack.send(total);
            }
            EngineQuery::CountReady(ack) => {
                let constraint = self.dispatch_constraint();
                let count = self.count_ready(&constraint).await?;
                let _ = ack.send(count);
            }
            EngineQuery::Status(id, ack) => {
                let status = if self.running_meta.contains_key(&id) {
                    JobStatus::Running
                } else {
                    let constraint = self.dispatch_constraint();
                    let mut found = None;
                    for queue in self.queues_mut() {
                        if let Some(holder) = queue.find_by_id(id).await? {
                            found = Some(holder);
                            break;
                        }
                    }
                    match found {
                        Some(holder) if constraint.matches(&holder) => JobStatus::WaitingReady,
                        Some(_) => JobStatus::WaitingNotReady,
                        None => JobStatus::Unknown,
                    }
                };
                let _ = ack.send(status);
            }
        }
        Ok(())
    }

    async fn handle_platform_wake(
        &mut self,
        request_id: Uuid,
        ack: oneshot::Sender<bool>,
    ) -> anyhow::Result<()> {
        self.pending_wakes.remove(&request_id);
        // The platform consumed the request; blocked work left after the
        // dispatch pass needs a fresh one.
        self.armed_wake = None;
        self.dispatch().await?;
        // Reply exactly once: does the blocked work still need the
        // platform's help after this wake-up?
        let constraint = self.dispatch_constraint();
        let now = self.clock.now_ns();
        let reschedule = self.blocked_work_request(&constraint, now).await?.is_some();
        let _ = ack.send(reschedule);
        Ok(())
    }

    async fn handle_command(&mut self, command: EngineCommand) -> anyhow::Result<()> {
        match command {
            EngineCommand::Stop => {
                debug!("engine paused");
                self.paused = true;
            }
            EngineCommand::Start => {
                debug!("engine resumed");
                self.paused = false;
                self.dispatch().await?;
            }
            EngineCommand::Destroy(ack) => {
                debug!("engine destroyed");
                self.non_persistent.clear().await?;
                self.pool.shutdown();
                if let Err(error) = self.wake.cancel_all().await {
                    warn!(%error, "failed to cancel platform wake-ups");
                }
                self.engine_queue.stop();
                let _ = ack.send(());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MessageConsumer<EngineMessage> for ControlLoop {
    async fn on_message(&mut self, message: EngineMessage) {
        let outcome = match message {
            EngineMessage::JobFinished { holder, result } => {
                self.handle_job_finished(holder, result).await
            }
            EngineMessage::Cancel { query, ack } => self.handle_cancel(query, ack).await,
            EngineMessage::NetworkChange(status) => {
                if status != self.network_status {
                    debug!(?status, "network changed");
                    self.network_status = status;
                    self.dispatch().await
                } else {
                    Ok(())
                }
            }
            EngineMessage::AddJob { job, handler, ack } => {
                self.handle_add_job(job, handler, ack).await
            }
            EngineMessage::PlatformWake { request_id, ack } => {
                self.handle_platform_wake(request_id, ack).await
            }
            EngineMessage::Poke => {
                // The armed poke was just consumed; dispatch re-arms it.
                self.armed_poke_ns = None;
                self.dispatch().await
            }
            EngineMessage::ConsumerIdle => self.dispatch().await,
            EngineMessage::Query(query) => self.handle_query(query).await,
            EngineMessage::Command(command) => self.handle_command(command).await,
        };
        if let Err(error) = outcome {
            warn!(%error, "control message failed");
        }
    }

    async fn on_idle(&mut self) {
        if let Err(error) = self.dispatch().await {
            warn!(%error, "idle dispatch failed");
        }
    }
}
