use super::{client_for_tenant, make_deal_artifact};
use crate::{generate_backfill_id, trigger_indexing, Extractor, JobContext};
use chrono::Utc;
use ingest_sql::{ArtifactStore, BackfillProgress, ConfigStore};
use models::{Artifact, JobConfig, PipedriveDealBackfillConfig, SourceKind};

const DEALS_SYNCED_UNTIL: &str = "PIPEDRIVE_DEALS_SYNCED_UNTIL";
const CHILD_JOB_BATCH_SIZE: usize = 100;

/// Enumerates all deals and fans out process batches, stamping the
/// incremental watermark before discovery.
pub struct PipedriveBackfillRootExtractor;

#[async_trait::async_trait]
impl Extractor for PipedriveBackfillRootExtractor {
    fn source_name(&self) -> &'static str {
        "pipedrive_backfill_root"
    }

    #[tracing::instrument(skip_all, fields(job_id = %job_id))]
    async fn process_job(
        &self,
        ctx: &JobContext,
        job_id: uuid::Uuid,
        config: &JobConfig,
    ) -> anyhow::Result<()> {
        let JobConfig::PipedriveBackfillRoot(config) = config else {
            anyhow::bail!("unexpected config for {}", self.source_name());
        };
        let backfill_id = config
            .backfill_id
            .clone()
            .unwrap_or_else(generate_backfill_id);
        let pool = ctx.pools.acquire(&config.tenant_id).await?;
        let sync_config = ConfigStore::new(pool.clone());

        sync_config
            .set_datetime(DEALS_SYNCED_UNTIL, Some(Utc::now()))
            .await?;

        let client = client_for_tenant(ctx, &pool, &config.tenant_id).await?;
        let deals = client.collect_deals(None).await?;
        let deal_ids: Vec<i64> = deals
            .iter()
            .filter_map(|deal| deal.get("id")?.as_i64())
            .collect();
        tracing::info!(
            tenant_id = %config.tenant_id,
            backfill_id,
            deals = deal_ids.len(),
            "enumerated Pipedrive deals"
        );

        let batches: Vec<Vec<i64>> = deal_ids
            .chunks(CHILD_JOB_BATCH_SIZE)
            .map(<[i64]>::to_vec)
            .collect();
        if batches.is_empty() {
            return Ok(());
        }

        BackfillProgress::new(pool.clone())
            .increment_total_ingest_jobs(&backfill_id, batches.len() as i64)
            .await?;
        for deal_ids in batches {
            ctx.queue
                .send_backfill_ingest(&JobConfig::PipedriveDealBackfill(
                    PipedriveDealBackfillConfig {
                        tenant_id: config.tenant_id.clone(),
                        backfill_id: Some(backfill_id.clone()),
                        suppress_notification: config.suppress_notification,
                        deal_ids,
                    },
                ))
                .await?;
        }
        Ok(())
    }
}

/// Fetches one batch of deals in full and stores their artifacts.
pub struct PipedriveDealBackfillExtractor;

#[async_trait::async_trait]
impl Extractor for PipedriveDealBackfillExtractor {
    fn source_name(&self) -> &'static str {
        "pipedrive_deal_backfill"
    }

    #[tracing::instrument(skip_all, fields(job_id = %job_id))]
    async fn process_job(
        &self,
        ctx: &JobContext,
        job_id: uuid::Uuid,
        config: &JobConfig,
    ) -> anyhow::Result<()> {
        let JobConfig::PipedriveDealBackfill(config) = config else {
            anyhow::bail!("unexpected config for {}", self.source_name());
        };
        let pool = ctx.pools.acquire(&config.tenant_id).await?;

        let result = async {
            let client = client_for_tenant(ctx, &pool, &config.tenant_id).await?;
            let store = ArtifactStore::new(pool.clone());

            let mut artifacts: Vec<Artifact> = Vec::new();
            for &deal_id in &config.deal_ids {
                match client.get_deal(deal_id).await {
                    Ok(Some(deal)) => {
                        if let Some(artifact) = make_deal_artifact(job_id, deal) {
                            artifacts.push(artifact);
                        }
                    }
                    Ok(None) => tracing::warn!(deal_id, "deal vanished; skipped"),
                    Err(err) => tracing::error!(deal_id, ?err, "failed to fetch deal"),
                }
            }

            store.upsert_batch(&artifacts).await?;
            trigger_indexing(
                ctx.indexing.as_ref(),
                artifacts.iter().map(|a| a.entity_id.clone()).collect(),
                SourceKind::PipedriveDeal,
                &config.tenant_id,
                config.backfill_id.as_deref(),
                config.suppress_notification,
            )
            .await?;
            anyhow::Ok(())
        }
        .await;

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

/// Incremental deal sync via the `updated_since` filter.
pub struct PipedriveDealSyncExtractor;

#[async_trait::async_trait]
impl Extractor for PipedriveDealSyncExtractor {
    fn source_name(&self) -> &'static str {
        "pipedrive_deal_sync"
    }

    #[tracing::instrument(skip_all, fields(job_id = %job_id))]
    async fn process_job(
        &self,
        ctx: &JobContext,
        job_id: uuid::Uuid,
        config: &JobConfig,
    ) -> anyhow::Result<()> {
        let JobConfig::PipedriveDealSync(config) = config else {
            anyhow::bail!("unexpected config for {}", self.source_name());
        };
        let pool = ctx.pools.acquire(&config.tenant_id).await?;
        let sync_config = ConfigStore::new(pool.clone());

        let Some(synced_until) = sync_config.get_datetime(DEALS_SYNCED_UNTIL).await? else {
            tracing::warn!(
                tenant_id = %config.tenant_id,
                "no deal sync watermark; refusing incremental sync"
            );
            return Ok(());
        };

        let since = synced_until - chrono::Duration::seconds(1);
        let sync_start = Utc::now();
        let client = client_for_tenant(ctx, &pool, &config.tenant_id).await?;
        let store = ArtifactStore::new(pool.clone());

        let deals = client.collect_deals(Some(since)).await?;
        let mut artifacts: Vec<Artifact> = Vec::new();
        let mut failed = 0usize;
        for deal in deals {
            match make_deal_artifact(job_id, deal) {
                Some(artifact) => artifacts.push(artifact),
                None => failed += 1,
            }
        }

        store.upsert_batch(&artifacts).await?;
        trigger_indexing(
            ctx.indexing.as_ref(),
            artifacts.iter().map(|a| a.entity_id.clone()).collect(),
            SourceKind::PipedriveDeal,
            &config.tenant_id,
            None,
            true,
        )
        .await?;

        if failed == 0 {
            sync_config
                .set_datetime(DEALS_SYNCED_UNTIL, Some(sync_start))
                .await?;
        } else {
            tracing::warn!(failed, "cursor pinned; failed deals re-examined next run");
        }
        tracing::info!(
            tenant_id = %config.tenant_id,
            updated = artifacts.len(),
            failed,
            "Pipedrive deal sync complete"
        );
        Ok(())
    }
}
