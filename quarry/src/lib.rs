//! Quarry - an embedded job-execution engine.
//!
//! A single-process engine for background work: jobs carry priorities,
//! delays, network requirements, groups and dedup keys, and run on an
//! adaptive pool of consumers fed by one message-driven control loop.
//!
//! # Core Concepts
//!
//! - **Job**: A declarative description of one unit of work ([`Job`]),
//!   paired with a [`JobHandler`] that performs it and decides retries.
//!
//! - **Queues**: The [`JobQueue`] trait abstracts job storage. Volatile
//!   jobs live in [`MemoryJobQueue`], persistent ones in
//!   [`SqliteJobQueue`] and survive restarts.
//!
//! - **Constraints**: Dispatch is filtered through [`Constraint`]
//!   queries: readiness time, network floor, excluded groups and running
//!   jobs.
//!
//! - **Control loop**: All engine state is owned by one actor fed by a
//!   priority message queue; producers interact through the
//!   [`EngineHandle`].
//!
//! - **Clock**: Every time read and timed wait goes through [`Clock`],
//!   so tests drive the whole engine with a [`ManualClock`].
//!
//! - **Events**: Lifecycle transitions are broadcast as [`JobEvent`]s
//!   through an [`InProcEventBus`].
//!
//! # Feature Flags
//!
//! - `sqlite` - SQLite persistence for durable jobs via sqlx (default)
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use quarry::*;
//! use std::sync::Arc;
//!
//! struct SyncInbox;
//!
//! #[async_trait::async_trait]
//! impl JobHandler for SyncInbox {
//!     async fn on_run(&self) -> anyhow::Result<()> {
//!         // talk to the server
//!         Ok(())
//!     }
//! }
//!
//! let engine = JobEngineBuilder::default().build().await?;
//! let job = Job::new().with_priority(5).requiring_network();
//! engine.handle().add_job(job, Arc::new(SyncInbox)).await?;
//! ```

/// Time abstraction for the whole engine.
///
/// The `clock` module provides the [`Clock`] trait plus the wall-clock
/// [`SystemClock`] and the test-only [`ManualClock`].
pub mod clock;

/// Engine tuning knobs.
pub mod config;

/// Constraint queries used to filter dispatch and cancellation.
///
/// The `constraint` module defines [`Constraint`], the [`NetworkStatus`]
/// ordering, and [`TagQuery`] matching.
pub mod constraint;

/// Event publishing and subscription system.
///
/// The `events` module provides [`EventPublisher`] and
/// [`EventSubscriber`] for pub/sub patterns, [`JobEvent`] and
/// [`JobEventKind`] for event data, and [`InProcEventBus`] for
/// in-process broadcasting.
pub mod events;

/// Queue-side scheduling state for one job.
pub mod holder;

/// Core job definitions:
/// - [`Job`] - the declarative job description and its builder
/// - [`JobHandler`] - the behavior and retry policy
/// - [`JobId`], [`JobHandle`], [`JobStatus`]
/// - [`CancelReason`], [`CancelResult`], [`RetryDecision`]
pub mod job;

/// Priority message transport feeding the control loop.
pub mod messaging;

/// Connectivity monitoring.
pub mod network;

/// Job storage: the [`JobQueue`] trait, [`MemoryJobQueue`],
/// [`CachedJobQueue`], and the SQLite durable queue.
pub mod queue;

/// Bookkeeping for running jobs and busy groups.
pub mod running;

/// Engine runtime: the control loop, the consumer pool, and the
/// [`JobEngineBuilder`] / [`EngineHandle`] surface.
pub mod runtime;

/// Platform wake-up scheduling for delayed and network-blocked work.
pub mod wake;

/// Tracing spans and metric recording helpers.
pub mod telemetry;

#[cfg(feature = "metrics")]
/// Prometheus metrics, enabled with the `metrics` feature.
pub mod metrics;

pub use clock::{Clock, ManualClock, SystemClock, NEVER_NS};
pub use config::EngineConfig;
pub use constraint::{Constraint, NetworkStatus, TagMatch, TagQuery};
pub use events::{EventPublisher, EventSubscriber, InProcEventBus, JobEvent, JobEventKind};
pub use holder::{JobHolder, RunResult};
pub use job::{
    CancelReason, CancelResult, Job, JobHandle, JobHandler, JobId, JobStatus, RetryConstraint,
    RetryDecision, DEFAULT_RETRY_LIMIT,
};
pub use network::{NetworkMonitor, StaticNetworkMonitor};
pub use queue::{CachedJobQueue, JobQueue, MemoryJobQueue};
#[cfg(feature = "sqlite")]
pub use queue::{JobRegistry, SqliteJobQueue};
pub use runtime::{EngineHandle, JobEngine, JobEngineBuilder};
pub use wake::{BatchingWakeScheduler, NoopWakeScheduler, WakeRequest, WakeScheduler};
