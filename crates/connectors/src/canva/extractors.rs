use super::{client_for_tenant, make_design_artifact};
use crate::{generate_backfill_id, trigger_indexing, Extractor, JobContext};
use ingest_sql::{ArtifactStore, BackfillProgress};
use models::{Artifact, CanvaDesignBackfillConfig, JobConfig, SourceKind};

/// Design ids per child job.
const CHILD_JOB_BATCH_SIZE: usize = 50;

/// Walks the design listing and fans out one process job per id batch.
pub struct CanvaBackfillRootExtractor;

#[async_trait::async_trait]
impl Extractor for CanvaBackfillRootExtractor {
    fn source_name(&self) -> &'static str {
        "canva_backfill_root"
    }

    #[tracing::instrument(skip_all, fields(job_id = %job_id))]
    async fn process_job(
        &self,
        ctx: &JobContext,
        job_id: uuid::Uuid,
        config: &JobConfig,
    ) -> anyhow::Result<()> {
        let JobConfig::CanvaBackfillRoot(config) = config else {
            anyhow::bail!("unexpected config for {}", self.source_name());
        };
        let backfill_id = config
            .backfill_id
            .clone()
            .unwrap_or_else(generate_backfill_id);

        let pool = ctx.pools.acquire(&config.tenant_id).await?;
        let client = client_for_tenant(ctx, &pool, &config.tenant_id).await?;

        let mut design_ids: Vec<String> = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let (designs, next) = client.list_designs(continuation.as_deref()).await?;
            design_ids.extend(
                designs
                    .iter()
                    .filter_map(|design| design.get("id")?.as_str().map(str::to_string)),
            );
            match next {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }
        tracing::info!(
            tenant_id = %config.tenant_id,
            backfill_id,
            designs = design_ids.len(),
            "enumerated Canva designs"
        );

        let batches: Vec<Vec<String>> = design_ids
            .chunks(CHILD_JOB_BATCH_SIZE)
            .map(<[String]>::to_vec)
            .collect();
        if batches.is_empty() {
            return Ok(());
        }

        BackfillProgress::new(pool.clone())
            .increment_total_ingest_jobs(&backfill_id, batches.len() as i64)
            .await?;
        for design_ids in batches {
            ctx.queue
                .send_backfill_ingest(&JobConfig::CanvaDesignBackfill(CanvaDesignBackfillConfig {
                    tenant_id: config.tenant_id.clone(),
                    backfill_id: Some(backfill_id.clone()),
                    suppress_notification: config.suppress_notification,
                    design_ids,
                }))
                .await?;
        }
        Ok(())
    }
}

/// Fetches one batch of designs and stores their artifacts.
pub struct CanvaDesignBackfillExtractor;

#[async_trait::async_trait]
impl Extractor for CanvaDesignBackfillExtractor {
    fn source_name(&self) -> &'static str {
        "canva_design_backfill"
    }

    #[tracing::instrument(skip_all, fields(job_id = %job_id))]
    async fn process_job(
        &self,
        ctx: &JobContext,
        job_id: uuid::Uuid,
        config: &JobConfig,
    ) -> anyhow::Result<()> {
        let JobConfig::CanvaDesignBackfill(config) = config else {
            anyhow::bail!("unexpected config for {}", self.source_name());
        };
        let pool = ctx.pools.acquire(&config.tenant_id).await?;

        let result = run_design_batch(ctx, job_id, config, &pool).await;
        if let Some(backfill_id) = &config.backfill_id {
            if let Err(err) = BackfillProgress::new(pool)
                .record_attempt(backfill_id, result.is_ok())
                .await
            {
                tracing::warn!(backfill_id, ?err, "failed to record backfill attempt");
            }
        }
        result
    }
}

async fn run_design_batch(
    ctx: &JobContext,
    job_id: uuid::Uuid,
    config: &CanvaDesignBackfillConfig,
    pool: &sqlx::PgPool,
) -> anyhow::Result<()> {
    let client = client_for_tenant(ctx, pool, &config.tenant_id).await?;
    let store = ArtifactStore::new(pool.clone());

    let mut artifacts: Vec<Artifact> = Vec::new();
    for design_id in &config.design_ids {
        match client.get_design(design_id).await {
            Ok(Some(design)) => {
                if let Some(artifact) = make_design_artifact(job_id, design) {
                    artifacts.push(artifact);
                }
            }
            Ok(None) => tracing::warn!(design_id, "design vanished; skipped"),
            Err(err) => tracing::error!(design_id, ?err, "failed to fetch design"),
        }
    }

    store.upsert_batch(&artifacts).await?;
    trigger_indexing(
        ctx.indexing.as_ref(),
        artifacts.iter().map(|a| a.entity_id.clone()).collect(),
        SourceKind::CanvaDesign,
        &config.tenant_id,
        config.backfill_id.as_deref(),
        config.suppress_notification,
    )
    .await?;

    tracing::info!(
        requested = config.design_ids.len(),
        stored = artifacts.len(),
        "processed Canva design batch"
    );
    Ok(())
}
