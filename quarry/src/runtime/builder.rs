use std::fmt;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::constraint::TagQuery;
use crate::events::{EventSubscriber, InProcEventBus, JobEvent};
use crate::job::{CancelResult, Job, JobHandle, JobHandler, JobId, JobStatus};
use crate::messaging::MessageQueue;
use crate::network::{NetworkMonitor, StaticNetworkMonitor};
use crate::queue::JobQueue;
#[cfg(feature = "sqlite")]
use crate::queue::{JobRegistry, SqliteJobQueue};
use crate::runtime::control::{
    ControlLoop, EngineCommand, EngineMessage, EngineQuery, ENGINE_LANES,
};
use crate::wake::{BatchingWakeScheduler, NoopWakeScheduler, WakeScheduler};

/// Builder for a [`JobEngine`] with explicit dependencies.
///
/// Every dependency has a sensible default: wall-clock time, an
/// always-online network monitor, no platform wake-ups, and no durable
/// queue. Tests swap in a virtual clock and recording doubles through the
/// same `with_*` methods the host application uses.
///
/// # Example
///
/// ```ignore
/// use quarry::{JobEngineBuilder, EngineConfig};
///
/// let engine = JobEngineBuilder::new(EngineConfig::default())
///     .with_network_monitor(monitor)
///     .build()
///     .await?;
/// ```
pub struct JobEngineBuilder {
    config: EngineConfig,
    clock: Option<Arc<dyn Clock>>,
    network: Option<Arc<dyn NetworkMonitor>>,
    wake: Option<Arc<dyn WakeScheduler>>,
    persistent: Option<Box<dyn JobQueue>>,
    #[cfg(feature = "sqlite")]
    sqlite: Option<(sqlx::sqlite::SqlitePool, Arc<JobRegistry>)>,
}

impl fmt::Debug for JobEngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("JobEngineBuilder");
        debug.field("config", &self.config);
        debug.field("clock_set", &self.clock.is_some());
        debug.field("network_set", &self.network.is_some());
        debug.field("wake_set", &self.wake.is_some());
        debug.field("persistent_set", &self.persistent.is_some());
        #[cfg(feature = "sqlite")]
        debug.field("sqlite_set", &self.sqlite.is_some());
        debug.finish()
    }
}

impl JobEngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            clock: None,
            network: None,
            wake: None,
            persistent: None,
            #[cfg(feature = "sqlite")]
            sqlite: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_network_monitor(mut self, monitor: Arc<dyn NetworkMonitor>) -> Self {
        self.network = Some(monitor);
        self
    }

    pub fn with_wake_scheduler(mut self, scheduler: Arc<dyn WakeScheduler>) -> Self {
        self.wake = Some(scheduler);
        self
    }

    /// Use a custom durable queue for persistent jobs.
    pub fn with_persistent_queue(mut self, queue: Box<dyn JobQueue>) -> Self {
        self.persistent = Some(queue);
        self
    }

    /// Persist jobs to SQLite; `registry` must know every persistent
    /// handler kind.
    #[cfg(feature = "sqlite")]
    pub fn with_sqlite(
        mut self,
        pool: sqlx::sqlite::SqlitePool,
        registry: Arc<JobRegistry>,
    ) -> Self {
        self.sqlite = Some((pool, registry));
        self
    }

    pub async fn build(self) -> anyhow::Result<JobEngine> {
        let clock = self
            .clock
            .unwrap_or_else(|| SystemClock::new() as Arc<dyn Clock>);
        let monitor = self
            .network
            .unwrap_or_else(|| Arc::new(StaticNetworkMonitor::default()));
        let wake_inner = self
            .wake
            .unwrap_or_else(|| Arc::new(NoopWakeScheduler));
        let wake: Arc<dyn WakeScheduler> = if self.config.wake_batch_window_ms > 0 {
            Arc::new(BatchingWakeScheduler::new(
                wake_inner,
                Arc::clone(&clock),
                self.config.wake_batch_window_ms,
            ))
        } else {
            wake_inner
        };

        #[allow(unused_mut)]
        let mut persistent = self.persistent;
        #[cfg(feature = "sqlite")]
        if let Some((pool, registry)) = self.sqlite {
            anyhow::ensure!(
                persistent.is_none(),
                "configure either a sqlite pool or a custom durable queue, not both"
            );
            persistent = Some(Box::new(SqliteJobQueue::open(pool, registry).await?));
        }

        let engine_queue = MessageQueue::new(ENGINE_LANES, Arc::clone(&clock));
        let events = Arc::new(InProcEventBus::new(self.config.event_capacity));
        let initial_network = monitor.status();

        let mut control = ControlLoop::new(
            Arc::clone(&clock),
            self.config.clone(),
            Arc::clone(&engine_queue),
            persistent,
            Arc::clone(&events),
            wake,
            initial_network,
        );
        let control_task = {
            let engine_queue = Arc::clone(&engine_queue);
            tokio::spawn(async move { engine_queue.consume(&mut control).await })
        };

        let network_task = spawn_network_task(
            Arc::clone(&engine_queue),
            Arc::clone(&clock),
            monitor,
            self.config.network_poll_interval_ms,
        );

        debug!("job engine started");
        Ok(JobEngine {
            handle: EngineHandle {
                queue: engine_queue,
            },
            events,
            control_task,
            network_task,
        })
    }
}

impl Default for JobEngineBuilder {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

/// Forward connectivity changes into the control loop, by subscription
/// when the monitor supports it and by polling otherwise.
fn spawn_network_task(
    engine_queue: Arc<MessageQueue<EngineMessage>>,
    clock: Arc<dyn Clock>,
    monitor: Arc<dyn NetworkMonitor>,
    poll_interval_ms: u64,
) -> JoinHandle<()> {
    match monitor.subscribe() {
        Some(mut rx) => tokio::spawn(async move {
            while engine_queue.is_running() {
                match rx.recv().await {
                    Ok(status) => engine_queue.post(EngineMessage::NetworkChange(status)),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        engine_queue.post(EngineMessage::NetworkChange(monitor.status()));
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }),
        None => tokio::spawn(async move {
            let interval_ns = poll_interval_ms.saturating_mul(1_000_000);
            loop {
                let deadline = clock.now_ns().saturating_add(interval_ns);
                clock.sleep_until(deadline).await;
                if !engine_queue.is_running() {
                    break;
                }
                engine_queue.post(EngineMessage::NetworkChange(monitor.status()));
            }
        }),
    }
}

/// Cheap, cloneable front door to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    queue: Arc<MessageQueue<EngineMessage>>,
}

impl EngineHandle {
    /// Submit a job and wait for its acceptance receipt.
    pub async fn add_job(
        &self,
        job: Job,
        handler: Arc<dyn JobHandler>,
    ) -> anyhow::Result<JobHandle> {
        let (tx, rx) = oneshot::channel();
        self.queue.post(EngineMessage::AddJob {
            job,
            handler,
            ack: Some(tx),
        });
        rx.await
            .map_err(|_| anyhow::anyhow!("engine is not running"))
    }

    /// Submit a job without waiting for the receipt.
    pub fn add_job_in_background(&self, job: Job, handler: Arc<dyn JobHandler>) {
        self.queue.post(EngineMessage::AddJob {
            job,
            handler,
            ack: None,
        });
    }

    /// Cancel every job matching `query`.
    ///
    /// The response waits for matching running jobs to finish their
    /// current attempt; a job that succeeds before the cancel reaches it
    /// is reported in `failed_to_cancel`.
    pub async fn cancel_jobs(&self, query: TagQuery) -> anyhow::Result<CancelResult> {
        let (tx, rx) = oneshot::channel();
        self.queue.post(EngineMessage::Cancel { query, ack: tx });
        rx.await
            .map_err(|_| anyhow::anyhow!("engine is not running"))
    }

    /// Jobs known to the engine: queued plus running.
    pub async fn count(&self) -> anyhow::Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.queue
            .post(EngineMessage::Query(EngineQuery::Count(tx)));
        rx.await
            .map_err(|_| anyhow::anyhow!("engine is not running"))
    }

    /// Jobs that could be dispatched right now.
    pub async fn count_ready(&self) -> anyhow::Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.queue
            .post(EngineMessage::Query(EngineQuery::CountReady(tx)));
        rx.await
            .map_err(|_| anyhow::anyhow!("engine is not running"))
    }

    pub async fn job_status(&self, id: JobId) -> anyhow::Result<JobStatus> {
        let (tx, rx) = oneshot::channel();
        self.queue
            .post(EngineMessage::Query(EngineQuery::Status(id, tx)));
        rx.await
            .map_err(|_| anyhow::anyhow!("engine is not running"))
    }

    /// Deliver a platform wake-up filed earlier through the wake
    /// scheduler. Returns whether the engine still wants a future
    /// wake-up.
    pub async fn wake(&self, request_id: Uuid) -> anyhow::Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.queue
            .post(EngineMessage::PlatformWake { request_id, ack: tx });
        rx.await
            .map_err(|_| anyhow::anyhow!("engine is not running"))
    }

    /// Pause dispatching. Queued jobs are kept; running attempts finish.
    pub fn stop(&self) {
        self.queue.post(EngineMessage::Command(EngineCommand::Stop));
    }

    /// Resume dispatching after [`EngineHandle::stop`].
    pub fn start(&self) {
        self.queue
            .post(EngineMessage::Command(EngineCommand::Start));
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("running", &self.queue.is_running())
            .field("pending_messages", &self.queue.len())
            .finish()
    }
}

/// A running job engine.
///
/// Owns the control loop task; drop order does not matter because
/// [`JobEngine::destroy`] tears everything down explicitly.
pub struct JobEngine {
    handle: EngineHandle,
    events: Arc<InProcEventBus>,
    control_task: JoinHandle<()>,
    network_task: JoinHandle<()>,
}

impl JobEngine {
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Subscribe to job lifecycle events.
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Shut the engine down: consumers stop, outstanding wake-ups are
    /// cancelled, and the control loop exits.
    pub async fn destroy(self) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.handle
            .queue
            .post(EngineMessage::Command(EngineCommand::Destroy(tx)));
        rx.await
            .map_err(|_| anyhow::anyhow!("engine already stopped"))?;
        self.network_task.abort();
        if let Err(error) = self.control_task.await {
            warn!(%error, "control loop ended abnormally");
        }
        Ok(())
    }
}

impl fmt::Debug for JobEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobEngine")
            .field("handle", &self.handle)
            .field("subscribers", &self.events.subscriber_count())
            .finish()
    }
}
