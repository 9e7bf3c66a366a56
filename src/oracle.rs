//! Dimension Oracle (C7): polls the project database for the authoritative
//! target dimension and propagates changes at runtime. No dimension
//! constant is compiled in — the oracle is the only source of truth unless
//! a per-request `force_dims` overrides it.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use sqlx::{PgPool, Row};
use tracing::{error, info, warn};

use crate::error::Result;

#[derive(Debug, Clone, Copy)]
pub struct DimensionSnapshot {
    pub target_dims: i64,
    pub last_refresh_epoch_ms: i64,
}

pub struct DimensionOracle {
    pool: PgPool,
    snapshot: ArcSwap<DimensionSnapshot>,
    refresh_interval: Duration,
}

impl DimensionOracle {
    /// Performs the first poll synchronously so callers never observe an
    /// uninitialised snapshot; subsequent polls run on the background task
    /// returned by [`DimensionOracle::spawn_refresh_loop`].
    pub async fn connect(pool: PgPool, refresh_interval: Duration) -> Result<Arc<Self>> {
        let target_dims = query_memories_dimension(&pool).await?;
        let oracle = Arc::new(DimensionOracle {
            pool,
            snapshot: ArcSwap::from_pointee(DimensionSnapshot {
                target_dims,
                last_refresh_epoch_ms: now_ms(),
            }),
            refresh_interval,
        });
        Ok(oracle)
    }

    /// Readers never lock: they load the atomic snapshot.
    pub fn target_dims(&self) -> i64 {
        self.snapshot.load().target_dims
    }

    pub fn snapshot(&self) -> DimensionSnapshot {
        *self.snapshot.load_full()
    }

    /// Forces an immediate poll outside the refresh interval, used by tests
    /// and by the `refresh_dimension` control message.
    pub async fn refresh_now(&self) -> Result<bool> {
        match query_memories_dimension(&self.pool).await {
            Ok(new_dims) => {
                let changed = new_dims != self.target_dims();
                if changed {
                    info!(from = self.target_dims(), to = new_dims, "target dimension changed");
                    self.propagate_change(new_dims).await;
                }
                self.snapshot.store(Arc::new(DimensionSnapshot {
                    target_dims: new_dims,
                    last_refresh_epoch_ms: now_ms(),
                }));
                Ok(changed)
            }
            Err(e) => {
                warn!(error = %e, "dimension oracle poll failed, keeping last known value");
                Ok(false)
            }
        }
    }

    /// Adapts the `codebase_files` sibling table to the new dimension:
    /// nulls out incompatible embeddings, then alters the column type.
    async fn propagate_change(&self, new_dims: i64) {
        let null_result = sqlx::query("UPDATE codebase_files SET embedding = NULL")
            .execute(&self.pool)
            .await;
        if let Err(e) = null_result {
            error!(error = %e, "failed to null out codebase_files embeddings ahead of dimension change");
            return;
        }

        let alter_sql = format!("ALTER TABLE codebase_files ALTER COLUMN embedding TYPE vector({new_dims})");
        if let Err(e) = sqlx::query(&alter_sql).execute(&self.pool).await {
            error!(error = %e, "failed to alter codebase_files.embedding column type");
        }
    }

    pub async fn spawn_refresh_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.refresh_interval);
        loop {
            ticker.tick().await;
            let _ = self.refresh_now().await;
        }
    }
}

async fn query_memories_dimension(pool: &PgPool) -> Result<i64> {
    let row = sqlx::query(
        "SELECT atttypmod FROM pg_attribute \
         WHERE attrelid = 'memories'::regclass AND attname = 'embedding' AND NOT attisdropped",
    )
    .fetch_one(pool)
    .await?;
    let raw: i32 = row.get("atttypmod");
    // pgvector stores the declared dimension directly in atttypmod (no -4 offset).
    Ok(raw.max(0) as i64)
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
