//! Durable engine example backed by SQLite.
//!
//! A persistent job is accepted by one engine, the engine is torn down,
//! and a second engine rehydrates the job from the database and runs it.
//!
//! Requires the `sqlite` feature (enabled by default).

use std::sync::Arc;

use async_trait::async_trait;
use quarry::*;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePoolOptions;

/// Persistent handler: everything it needs to run again after a restart
/// is in its serialized payload.
#[derive(Serialize, Deserialize)]
struct ExportReport {
    report_id: u64,
}

#[async_trait]
impl JobHandler for ExportReport {
    fn kind(&self) -> &'static str {
        "export-report"
    }

    async fn on_run(&self) -> anyhow::Result<()> {
        println!("[EXPORT] exporting report {}", self.report_id);
        Ok(())
    }

    fn serialize_payload(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

fn registry() -> Arc<JobRegistry> {
    let mut registry = JobRegistry::new();
    registry.register("export-report", |payload| {
        let handler: ExportReport = serde_json::from_slice(payload)?;
        Ok(Arc::new(handler) as Arc<dyn JobHandler>)
    });
    Arc::new(registry)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quarry=debug".into()),
        )
        .init();

    println!("=== Quarry SQLite Example ===\n");

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;

    println!("1. First engine accepts a persistent job but never runs it...");
    let first = JobEngineBuilder::default()
        .with_sqlite(pool.clone(), registry())
        .build()
        .await?;
    let handle = first.handle();
    handle.stop();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let added = handle
        .add_job(
            Job::new().persisted().requiring_network(),
            Arc::new(ExportReport { report_id: 42 }),
        )
        .await?;
    println!("   accepted job {:?}", added.id);
    println!("   jobs known to the engine: {}", handle.count().await?);

    println!("2. Tearing the first engine down (simulated restart)...");
    first.destroy().await?;

    println!("3. Second engine rehydrates the job from SQLite and runs it...");
    let second = JobEngineBuilder::default()
        .with_sqlite(pool, registry())
        .build()
        .await?;
    let handle = second.handle();

    while handle.count().await? > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    println!("\n4. Job ran after the restart; shutting down.");
    second.destroy().await?;

    println!("\n=== Example Complete ===");
    Ok(())
}
