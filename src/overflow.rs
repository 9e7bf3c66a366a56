//! Overflow Queue (C7 in the component table's numbering starts here at
//! C6): a durable, Postgres-backed queue the scheduler spills into when the
//! in-memory queue is saturated or the CPU is hot, sharded by project id.
//! Grounded in the `triloy8-ragfeed-rs` example's `sqlx` usage, since the
//! teacher carries no SQL client at all.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{EmbedError, Result};
use crate::scheduler::Priority;

const EXPECTED_COLUMNS: &[&str] = &[
    "id",
    "project_id",
    "priority",
    "priority_original",
    "payload",
    "enqueued_at",
    "status",
    "retry_count",
    "last_error",
    "next_retry_at",
];

#[derive(Debug, Clone)]
pub struct OverflowItem {
    pub id: Uuid,
    pub priority: Priority,
    pub priority_original: Priority,
    pub payload: JsonValue,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: i32,
}

pub struct OverflowQueue {
    pool: PgPool,
    project_id: String,
}

impl OverflowQueue {
    pub async fn connect(database_url: &str, project_id: String) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        let queue = OverflowQueue { pool, project_id };
        queue.verify_schema().await?;
        Ok(queue)
    }

    /// Fails fast at startup if `embedding_queue` or its expected columns
    /// are missing, per the schema-ownership contract: this process never
    /// migrates, it only ever assumes the table already exists.
    async fn verify_schema(&self) -> Result<()> {
        let rows = sqlx::query(
            "SELECT column_name FROM information_schema.columns \
             WHERE table_name = 'embedding_queue'",
        )
        .fetch_all(&self.pool)
        .await?;

        let present: Vec<String> = rows.iter().map(|r| r.get::<String, _>("column_name")).collect();
        let missing: Vec<&str> = EXPECTED_COLUMNS
            .iter()
            .filter(|c| !present.iter().any(|p| p == *c))
            .copied()
            .collect();

        if present.is_empty() {
            return Err(EmbedError::Configuration(
                "embedding_queue table is missing; overflow is enabled but schema migration is out of scope here".to_string(),
            ));
        }
        if !missing.is_empty() {
            return Err(EmbedError::Configuration(format!(
                "embedding_queue table is missing expected columns: {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }

    pub async fn enqueue(&self, payload: JsonValue, priority: Priority) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO embedding_queue \
             (id, project_id, priority, priority_original, payload, enqueued_at, status, retry_count, next_retry_at) \
             VALUES ($1, $2, $3, $3, $4, now(), 'pending', 0, now())",
        )
        .bind(id)
        .bind(&self.project_id)
        .bind(priority.index() as i16)
        .bind(&payload)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Atomically claims up to `n` oldest pending items for this project
    /// whose `next_retry_at` has passed, using `FOR UPDATE SKIP LOCKED` so
    /// concurrent drain workers never double-claim a row.
    pub async fn dequeue(&self, n: i64) -> Result<Vec<OverflowItem>> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "SELECT id, priority, priority_original, payload, enqueued_at, retry_count \
             FROM embedding_queue \
             WHERE project_id = $1 AND status = 'pending' AND next_retry_at <= now() \
             ORDER BY enqueued_at ASC \
             LIMIT $2 \
             FOR UPDATE SKIP LOCKED",
        )
        .bind(&self.project_id)
        .bind(n)
        .fetch_all(&mut *tx)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: Uuid = row.get("id");
            sqlx::query("UPDATE embedding_queue SET status = 'processing' WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            items.push(OverflowItem {
                id,
                priority: priority_from_index(row.get::<i16, _>("priority")),
                priority_original: priority_from_index(row.get::<i16, _>("priority_original")),
                payload: row.get("payload"),
                enqueued_at: row.get("enqueued_at"),
                retry_count: row.get("retry_count"),
            });
        }
        tx.commit().await?;
        Ok(items)
    }

    pub async fn ack(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM embedding_queue WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn nack(&self, id: Uuid, error: &str, delay: std::time::Duration) -> Result<()> {
        sqlx::query(
            "UPDATE embedding_queue \
             SET status = 'pending', retry_count = retry_count + 1, last_error = $2, \
                 next_retry_at = now() + $3 * interval '1 second' \
             WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .bind(delay.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn dlq(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE embedding_queue SET status = 'failed' WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The underlying pool, for the re-embed commands which touch tables
    /// this queue doesn't otherwise own.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn priority_from_index(idx: i16) -> Priority {
    Priority::ALL.get(idx as usize).copied().unwrap_or(Priority::Medium)
}
