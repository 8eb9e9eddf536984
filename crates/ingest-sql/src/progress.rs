use sqlx::{PgPool, Row};

/// Backfill completion accounting, surfaced by the control plane as operator
/// progress. The root job records the number of child batches; each child
/// increments `attempted` when it runs and `done` when it succeeds.
#[derive(Clone)]
pub struct BackfillProgress {
    pool: PgPool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgressCounts {
    pub total_ingest_jobs: i64,
    pub attempted: i64,
    pub done: i64,
}

impl BackfillProgress {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn increment_total_ingest_jobs(
        &self,
        backfill_id: &str,
        count: i64,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO backfill_progress (backfill_id, total_ingest_jobs, attempted, done) \
             VALUES ($1, $2, 0, 0) \
             ON CONFLICT (backfill_id) DO UPDATE SET \
               total_ingest_jobs = backfill_progress.total_ingest_jobs + EXCLUDED.total_ingest_jobs",
        )
        .bind(backfill_id)
        .bind(count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record one child job run. `attempted` always advances; `done` only on
    /// success.
    pub async fn record_attempt(&self, backfill_id: &str, succeeded: bool) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO backfill_progress (backfill_id, total_ingest_jobs, attempted, done) \
             VALUES ($1, 0, 1, $2) \
             ON CONFLICT (backfill_id) DO UPDATE SET \
               attempted = backfill_progress.attempted + 1, \
               done = backfill_progress.done + EXCLUDED.done",
        )
        .bind(backfill_id)
        .bind(if succeeded { 1i64 } else { 0i64 })
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, backfill_id: &str) -> anyhow::Result<Option<ProgressCounts>> {
        let row = sqlx::query(
            "SELECT total_ingest_jobs, attempted, done \
             FROM backfill_progress WHERE backfill_id = $1",
        )
        .bind(backfill_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(ProgressCounts {
                total_ingest_jobs: row.try_get("total_ingest_jobs")?,
                attempted: row.try_get("attempted")?,
                done: row.try_get("done")?,
            })
        })
        .transpose()
    }
}
