use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::constraint::{Constraint, TagMatch, TagQuery};
use crate::holder::JobHolder;
use crate::job::{Job, JobHandler, JobId};
use crate::queue::JobQueue;

type HandlerFactory =
    Box<dyn Fn(&[u8]) -> anyhow::Result<Arc<dyn JobHandler>> + Send + Sync>;

/// Maps persisted handler kinds back to live handlers.
///
/// Every persistent handler kind must be registered before the engine
/// opens a durable queue, otherwise rows of that kind are unreadable and
/// get discarded on load.
#[derive(Default)]
pub struct JobRegistry {
    factories: HashMap<&'static str, HandlerFactory>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: &'static str, factory: F)
    where
        F: Fn(&[u8]) -> anyhow::Result<Arc<dyn JobHandler>> + Send + Sync + 'static,
    {
        self.factories.insert(kind, Box::new(factory));
    }

    fn rehydrate(&self, kind: &str, payload: &[u8]) -> anyhow::Result<Arc<dyn JobHandler>> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| anyhow::anyhow!("no handler registered for kind {kind:?}"))?;
        factory(payload)
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("kinds", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS quarry_jobs (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    priority INTEGER NOT NULL,
    group_name TEXT,
    single_instance_id TEXT,
    run_count INTEGER NOT NULL,
    retry_limit INTEGER NOT NULL,
    requires_network INTEGER NOT NULL,
    requires_unmetered INTEGER NOT NULL,
    delay_until_ns INTEGER NOT NULL,
    created_ns INTEGER NOT NULL,
    insertion_order INTEGER NOT NULL,
    session_id TEXT,
    payload BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS quarry_job_tags (
    job_id TEXT NOT NULL,
    tag TEXT NOT NULL,
    PRIMARY KEY (job_id, tag)
);

CREATE INDEX IF NOT EXISTS idx_quarry_jobs_dispatch
    ON quarry_jobs (priority DESC, delay_until_ns ASC, insertion_order ASC);

CREATE INDEX IF NOT EXISTS idx_quarry_job_tags_tag
    ON quarry_job_tags (tag);
"#;

/// SQLite-backed queue for persistent jobs.
///
/// Rows handed to a consumer stay in the table stamped with the current
/// engine session and are invisible to further queries; success deletes
/// the row, a retry clears the stamp. After a crash the stale stamps of
/// the previous session are wiped on open, which is what brings orphaned
/// jobs back.
pub struct SqliteJobQueue {
    pool: SqlitePool,
    registry: Arc<JobRegistry>,
}

impl SqliteJobQueue {
    /// Open the queue on `pool`, creating the schema and recovering any
    /// jobs a previous session left checked out.
    pub async fn open(pool: SqlitePool, registry: Arc<JobRegistry>) -> anyhow::Result<Self> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;

        let recovered = sqlx::query(
            "UPDATE quarry_jobs SET session_id = NULL WHERE session_id IS NOT NULL",
        )
        .execute(&pool)
        .await?;
        if recovered.rows_affected() > 0 {
            debug!(
                recovered = recovered.rows_affected(),
                "reclaimed jobs orphaned by a previous session"
            );
        }

        Ok(Self { pool, registry })
    }

    /// Append the WHERE fragment and bind values for `constraint`.
    ///
    /// `include_time_limit` is off for the readiness-horizon query, which
    /// wants the jobs the time limit would reject.
    fn constraint_sql(
        constraint: &Constraint,
        include_time_limit: bool,
        conditions: &mut Vec<String>,
        binds: &mut Vec<String>,
    ) {
        // Numeric binds travel as text; CAST keeps the comparisons integer.
        conditions.push("session_id IS NULL".to_string());
        if include_time_limit {
            if let Some(limit) = constraint.time_limit_ns {
                conditions.push("delay_until_ns <= CAST(? AS INTEGER)".to_string());
                binds.push((limit as i64).to_string());
            }
        }
        conditions.push(
            "(CASE WHEN requires_unmetered = 1 THEN 2 WHEN requires_network = 1 THEN 1 ELSE 0 END) <= CAST(? AS INTEGER)"
                .to_string(),
        );
        binds.push((constraint.network as i64).to_string());

        if !constraint.exclude_groups.is_empty() {
            let placeholders = placeholders(constraint.exclude_groups.len());
            conditions.push(format!(
                "(group_name IS NULL OR group_name NOT IN ({placeholders}))"
            ));
            binds.extend(constraint.exclude_groups.iter().cloned());
        }
        if !constraint.exclude_job_ids.is_empty() {
            let placeholders = placeholders(constraint.exclude_job_ids.len());
            conditions.push(format!("id NOT IN ({placeholders})"));
            binds.extend(constraint.exclude_job_ids.iter().map(ToString::to_string));
        }
        if let Some(tags) = &constraint.tags {
            let (sql, tag_binds) = tag_sql(tags);
            conditions.push(sql);
            binds.extend(tag_binds);
        }
    }

    async fn load_tags(&self, id: &str) -> anyhow::Result<HashSet<String>> {
        let rows = sqlx::query("SELECT tag FROM quarry_job_tags WHERE job_id = ?")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("tag").map_err(Into::into))
            .collect()
    }

    async fn row_to_holder(&self, row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<JobHolder> {
        let id_str: String = row.try_get("id")?;
        let kind: String = row.try_get("kind")?;
        let payload: Vec<u8> = row.try_get("payload")?;
        let handler = self.registry.rehydrate(&kind, &payload)?;

        let session_id: Option<String> = row.try_get("session_id")?;
        let running_session_id = session_id
            .map(|s| Uuid::parse_str(&s))
            .transpose()?;

        let job = Job {
            id: JobId(Uuid::parse_str(&id_str)?),
            priority: row.try_get::<i64, _>("priority")? as i32,
            delay_ms: 0,
            requires_network: row.try_get::<i64, _>("requires_network")? != 0,
            requires_unmetered_network: row.try_get::<i64, _>("requires_unmetered")? != 0,
            group_id: row.try_get("group_name")?,
            single_instance_id: row.try_get("single_instance_id")?,
            tags: self.load_tags(&id_str).await?,
            persistent: true,
            retry_limit: row.try_get::<i64, _>("retry_limit")? as u32,
        };

        Ok(JobHolder {
            job,
            handler,
            run_count: row.try_get::<i64, _>("run_count")? as u32,
            insertion_order: row.try_get::<i64, _>("insertion_order")? as u64,
            delay_until_ns: row.try_get::<i64, _>("delay_until_ns")? as u64,
            created_ns: row.try_get::<i64, _>("created_ns")? as u64,
            running_session_id,
            cancel_reason: None,
        })
    }

    async fn write_row(&self, holder: &JobHolder, replace: bool) -> anyhow::Result<()> {
        let payload = holder.handler.serialize_payload()?;
        let verb = if replace { "INSERT OR REPLACE" } else { "INSERT" };
        let id_str = holder.job.id.to_string();

        sqlx::query(&format!(
            r#"
            {verb} INTO quarry_jobs (
                id, kind, priority, group_name, single_instance_id,
                run_count, retry_limit, requires_network, requires_unmetered,
                delay_until_ns, created_ns, insertion_order, session_id, payload
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?)
            "#
        ))
        .bind(&id_str)
        .bind(holder.handler.kind())
        .bind(holder.job.priority as i64)
        .bind(&holder.job.group_id)
        .bind(&holder.job.single_instance_id)
        .bind(holder.run_count as i64)
        .bind(holder.job.retry_limit as i64)
        .bind(holder.job.requires_network as i64)
        .bind(holder.job.requires_unmetered_network as i64)
        .bind(holder.delay_until_ns as i64)
        .bind(holder.created_ns as i64)
        .bind(holder.insertion_order as i64)
        .bind(&payload)
        .execute(&self.pool)
        .await?;

        sqlx::query("DELETE FROM quarry_job_tags WHERE job_id = ?")
            .bind(&id_str)
            .execute(&self.pool)
            .await?;
        for tag in &holder.job.tags {
            sqlx::query("INSERT OR IGNORE INTO quarry_job_tags (job_id, tag) VALUES (?, ?)")
                .bind(&id_str)
                .bind(tag)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn delete_row(&self, id: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM quarry_jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM quarry_job_tags WHERE job_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn tag_sql(query: &TagQuery) -> (String, Vec<String>) {
    let placeholders = placeholders(query.tags.len());
    let binds: Vec<String> = query.tags.iter().cloned().collect();
    let sql = match query.match_type {
        TagMatch::Any => format!(
            "id IN (SELECT job_id FROM quarry_job_tags WHERE tag IN ({placeholders}))"
        ),
        TagMatch::All => format!(
            "(SELECT COUNT(DISTINCT tag) FROM quarry_job_tags \
             WHERE job_id = quarry_jobs.id AND tag IN ({placeholders})) = {}",
            query.tags.len()
        ),
    };
    (sql, binds)
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn insert(&mut self, holder: JobHolder) -> anyhow::Result<()> {
        self.write_row(&holder, false).await
    }

    async fn insert_or_replace(&mut self, mut holder: JobHolder) -> anyhow::Result<()> {
        holder.running_session_id = None;
        self.write_row(&holder, true).await
    }

    async fn remove(&mut self, id: JobId) -> anyhow::Result<Option<JobHolder>> {
        let id_str = id.to_string();
        let row = sqlx::query("SELECT * FROM quarry_jobs WHERE id = ?")
            .bind(&id_str)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let holder = match self.row_to_holder(&row).await {
            Ok(holder) => Some(holder),
            Err(error) => {
                warn!(job_id = %id, %error, "dropping unreadable persistent job");
                None
            }
        };
        self.delete_row(&id_str).await?;
        Ok(holder)
    }

    async fn count(&mut self) -> anyhow::Result<usize> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM quarry_jobs WHERE session_id IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("count")? as usize)
    }

    async fn count_ready(&mut self, constraint: &Constraint) -> anyhow::Result<usize> {
        let mut conditions = Vec::new();
        let mut binds = Vec::new();
        Self::constraint_sql(constraint, true, &mut conditions, &mut binds);

        let sql = format!(
            "SELECT COUNT(DISTINCT COALESCE(group_name, id)) AS count \
             FROM quarry_jobs WHERE {}",
            conditions.join(" AND ")
        );
        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        let row = query.fetch_one(&self.pool).await?;
        Ok(row.try_get::<i64, _>("count")? as usize)
    }

    async fn next_job(
        &mut self,
        constraint: &Constraint,
        session_id: Uuid,
    ) -> anyhow::Result<Option<JobHolder>> {
        let mut conditions = Vec::new();
        let mut binds = Vec::new();
        Self::constraint_sql(constraint, true, &mut conditions, &mut binds);
        let sql = format!(
            "SELECT * FROM quarry_jobs WHERE {} \
             ORDER BY priority DESC, delay_until_ns ASC, insertion_order ASC LIMIT 1",
            conditions.join(" AND ")
        );

        // Unreadable rows are deleted and the selection retried, so one
        // corrupt row cannot wedge dispatch.
        loop {
            let mut query = sqlx::query(&sql);
            for bind in &binds {
                query = query.bind(bind);
            }
            let Some(row) = query.fetch_optional(&self.pool).await? else {
                return Ok(None);
            };

            match self.row_to_holder(&row).await {
                Ok(mut holder) => {
                    holder.run_count += 1;
                    holder.running_session_id = Some(session_id);
                    sqlx::query(
                        "UPDATE quarry_jobs SET run_count = ?, session_id = ? WHERE id = ?",
                    )
                    .bind(holder.run_count as i64)
                    .bind(session_id.to_string())
                    .bind(holder.job.id.to_string())
                    .execute(&self.pool)
                    .await?;
                    return Ok(Some(holder));
                }
                Err(error) => {
                    let id_str: String = row.try_get("id")?;
                    warn!(job_id = %id_str, %error, "dropping unreadable persistent job");
                    self.delete_row(&id_str).await?;
                }
            }
        }
    }

    async fn next_delay_until_ns(
        &mut self,
        constraint: &Constraint,
    ) -> anyhow::Result<Option<u64>> {
        let mut conditions = Vec::new();
        let mut binds = Vec::new();
        Self::constraint_sql(constraint, false, &mut conditions, &mut binds);
        conditions.push("delay_until_ns > CAST(? AS INTEGER)".to_string());
        binds.push((constraint.time_limit_ns.unwrap_or(0) as i64).to_string());

        let sql = format!(
            "SELECT MIN(delay_until_ns) AS next FROM quarry_jobs WHERE {}",
            conditions.join(" AND ")
        );
        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        let row = query.fetch_one(&self.pool).await?;
        Ok(row
            .try_get::<Option<i64>, _>("next")?
            .map(|ns| ns as u64))
    }

    async fn find_by_tags(&mut self, query: &TagQuery) -> anyhow::Result<Vec<JobId>> {
        let (tag_condition, binds) = tag_sql(query);
        let sql = format!(
            "SELECT id FROM quarry_jobs WHERE session_id IS NULL AND {tag_condition}"
        );
        let mut q = sqlx::query(&sql);
        for bind in &binds {
            q = q.bind(bind);
        }
        let rows = q.fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| {
                let id: String = row.try_get("id")?;
                Ok(JobId(Uuid::parse_str(&id)?))
            })
            .collect()
    }

    async fn find_by_id(&mut self, id: JobId) -> anyhow::Result<Option<JobHolder>> {
        let id_str = id.to_string();
        let row = sqlx::query("SELECT * FROM quarry_jobs WHERE id = ?")
            .bind(&id_str)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        match self.row_to_holder(&row).await {
            Ok(holder) => Ok(Some(holder)),
            Err(error) => {
                warn!(job_id = %id, %error, "dropping unreadable persistent job");
                self.delete_row(&id_str).await?;
                Ok(None)
            }
        }
    }

    async fn find_jobs(&mut self, constraint: &Constraint) -> anyhow::Result<Vec<JobId>> {
        let mut conditions = Vec::new();
        let mut binds = Vec::new();
        Self::constraint_sql(constraint, true, &mut conditions, &mut binds);
        let sql = format!(
            "SELECT id FROM quarry_jobs WHERE {}",
            conditions.join(" AND ")
        );
        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| {
                let id: String = row.try_get("id")?;
                Ok(JobId(Uuid::parse_str(&id)?))
            })
            .collect()
    }

    async fn find_dependent_jobs(&mut self, job: &Job) -> anyhow::Result<Vec<JobId>> {
        if job.group_id.is_none() && job.single_instance_id.is_none() {
            return Ok(Vec::new());
        }
        let mut conditions = Vec::new();
        let mut binds: Vec<String> = Vec::new();
        if let Some(group) = &job.group_id {
            conditions.push("group_name = ?");
            binds.push(group.clone());
        }
        if let Some(instance) = &job.single_instance_id {
            conditions.push("single_instance_id = ?");
            binds.push(instance.clone());
        }
        let sql = format!(
            "SELECT id FROM quarry_jobs WHERE id != ? AND ({})",
            conditions.join(" OR ")
        );
        let mut query = sqlx::query(&sql).bind(job.id.to_string());
        for bind in &binds {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| {
                let id: String = row.try_get("id")?;
                Ok(JobId(Uuid::parse_str(&id)?))
            })
            .collect()
    }

    async fn clear(&mut self) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM quarry_jobs")
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM quarry_job_tags")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
