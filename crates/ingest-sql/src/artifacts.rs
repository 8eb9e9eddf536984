use models::{Artifact, ArtifactEntity};
use sqlx::{PgPool, Row};

/// Artifacts are written in transactions of at most this many rows.
pub const UPSERT_BATCH_SIZE: usize = 50;

/// Store of normalized source snapshots in the tenant database
/// (`ingest_artifact`, unique on (entity, entity_id)).
#[derive(Clone)]
pub struct ArtifactStore {
    pool: PgPool,
}

impl ArtifactStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Upsert artifacts by entity id, in batches. Re-running with the same
    /// inputs converges to the same rows.
    pub async fn upsert_batch(&self, artifacts: &[Artifact]) -> anyhow::Result<()> {
        for chunk in artifacts.chunks(UPSERT_BATCH_SIZE) {
            let mut txn = self.pool.begin().await?;
            for artifact in chunk {
                sqlx::query(
                    "INSERT INTO ingest_artifact \
                       (id, entity, entity_id, content, metadata, ingest_job_id, source_updated_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7) \
                     ON CONFLICT (entity, entity_id) DO UPDATE SET \
                       content = EXCLUDED.content, \
                       metadata = EXCLUDED.metadata, \
                       ingest_job_id = EXCLUDED.ingest_job_id, \
                       source_updated_at = EXCLUDED.source_updated_at",
                )
                .bind(uuid::Uuid::new_v4())
                .bind(artifact.entity.as_str())
                .bind(&artifact.entity_id)
                .bind(&artifact.content)
                .bind(&artifact.metadata)
                .bind(artifact.ingest_job_id)
                .bind(artifact.source_updated_at)
                .execute(&mut txn)
                .await?;
            }
            txn.commit().await?;
        }

        tracing::debug!(count = artifacts.len(), "upserted artifact batch");
        Ok(())
    }

    /// Delete one artifact. Deleting an absent row is a success; the count
    /// is returned for logging.
    pub async fn delete(&self, entity: ArtifactEntity, entity_id: &str) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM ingest_artifact WHERE entity = $1 AND entity_id = $2")
            .bind(entity.as_str())
            .bind(entity_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn entity_ids(&self, entity: ArtifactEntity) -> anyhow::Result<Vec<String>> {
        let rows = sqlx::query("SELECT entity_id FROM ingest_artifact WHERE entity = $1")
            .bind(entity.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| Ok(row.try_get::<String, _>("entity_id")?))
            .collect()
    }
}
