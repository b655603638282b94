//! Basic engine example with the in-memory queue.
//!
//! Demonstrates job priorities, groups, retries, and the lifecycle
//! event stream, all without any persistence.
//!
//! For a durable setup with SQLite, see `sqlite_engine.rs`.

use std::sync::Arc;

use async_trait::async_trait;
use quarry::*;

/// Uploads one photo; serialized through the "media" group.
struct UploadPhoto {
    name: String,
}

#[async_trait]
impl JobHandler for UploadPhoto {
    fn kind(&self) -> &'static str {
        "upload-photo"
    }

    async fn on_run(&self) -> anyhow::Result<()> {
        println!("[UPLOAD] uploading {}", self.name);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        println!("[UPLOAD] done {}", self.name);
        Ok(())
    }
}

/// High-priority send that succeeds immediately.
struct SendMessage {
    body: String,
}

#[async_trait]
impl JobHandler for SendMessage {
    fn kind(&self) -> &'static str {
        "send-message"
    }

    async fn on_run(&self) -> anyhow::Result<()> {
        println!("[SEND] {}", self.body);
        Ok(())
    }
}

/// Fails twice before succeeding, to show the retry path.
struct FlakySync {
    attempts: std::sync::atomic::AtomicU32,
}

#[async_trait]
impl JobHandler for FlakySync {
    fn kind(&self) -> &'static str {
        "flaky-sync"
    }

    async fn on_run(&self) -> anyhow::Result<()> {
        let attempt = self
            .attempts
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        if attempt <= 2 {
            println!("[SYNC] attempt {} failed", attempt);
            anyhow::bail!("transient network error");
        }
        println!("[SYNC] attempt {} succeeded", attempt);
        Ok(())
    }

    async fn on_cancel(&self, reason: CancelReason) {
        println!("[SYNC] cancelled: {}", reason);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("=== Quarry Basic Example ===\n");

    let engine = JobEngineBuilder::default().build().await?;
    let handle = engine.handle();

    // Print the lifecycle stream while jobs run.
    let mut events = engine.subscribe_events();
    let event_printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("[EVENT] {:?} -> {:?}", event.job_id, event.kind);
        }
    });

    println!("1. Adding grouped uploads (run one at a time)...");
    for i in 0..3 {
        handle
            .add_job(
                Job::new().in_group("media"),
                Arc::new(UploadPhoto {
                    name: format!("photo-{i}.jpg"),
                }),
            )
            .await?;
    }

    println!("2. Adding a high-priority message...");
    handle
        .add_job(
            Job::new().with_priority(10),
            Arc::new(SendMessage {
                body: "hello from quarry".into(),
            }),
        )
        .await?;

    println!("3. Adding a flaky sync (fails twice, then succeeds)...");
    handle
        .add_job(
            Job::new().with_retry_limit(5).single_instance("inbox-sync"),
            Arc::new(FlakySync {
                attempts: std::sync::atomic::AtomicU32::new(0),
            }),
        )
        .await?;

    // Wait for the engine to drain.
    while handle.count().await? > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    println!("\n4. All jobs finished; shutting down.");
    engine.destroy().await?;
    event_printer.abort();

    println!("\n=== Example Complete ===");
    Ok(())
}
