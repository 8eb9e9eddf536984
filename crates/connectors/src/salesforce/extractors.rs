use super::{client_for_tenant, delete_record, make_object_artifact, SalesforceSyncService};
use crate::{generate_backfill_id, trigger_indexing, Extractor, JobContext};
use anyhow::Context;
use ingest_sql::{ArtifactStore, BackfillProgress, ConfigStore};
use models::{
    Artifact, CdcOperation, JobConfig, SalesforceBackfillConfig, SalesforceCdcEvent,
    SalesforceCdcWebhookBody, SalesforceObject, SalesforceObjectBatch, SourceKind,
};
use std::collections::HashSet;

/// Records per child job; high enough to keep Salesforce API usage low.
pub const CHILD_JOB_BATCH_SIZE: usize = 400;

/// Discovers all record ids per object type and fans out one process job
/// per batch, tracking the batch count for operator progress.
pub struct SalesforceBackfillRootExtractor;

#[async_trait::async_trait]
impl Extractor for SalesforceBackfillRootExtractor {
    fn source_name(&self) -> &'static str {
        "salesforce_backfill_root"
    }

    #[tracing::instrument(skip_all, fields(job_id = %job_id))]
    async fn process_job(
        &self,
        ctx: &JobContext,
        job_id: uuid::Uuid,
        config: &JobConfig,
    ) -> anyhow::Result<()> {
        let JobConfig::SalesforceBackfillRoot(config) = config else {
            anyhow::bail!("unexpected config for {}", self.source_name());
        };
        let backfill_id = config
            .backfill_id
            .clone()
            .unwrap_or_else(generate_backfill_id);
        tracing::info!(tenant_id = %config.tenant_id, backfill_id, "starting Salesforce backfill root");

        let pool = ctx.pools.acquire(&config.tenant_id).await?;
        let client = client_for_tenant(ctx, &pool, &config.tenant_id).await?;

        let mut batches: Vec<SalesforceObjectBatch> = Vec::new();
        for &object in SalesforceObject::ALL {
            let record_ids = client
                .get_all_object_ids(object)
                .await
                .with_context(|| format!("failed to discover {object} records"))?;
            tracing::info!(%object, count = record_ids.len(), "discovered records");

            for chunk in record_ids.chunks(CHILD_JOB_BATCH_SIZE) {
                batches.push(SalesforceObjectBatch {
                    object_type: object,
                    record_ids: chunk.to_vec(),
                });
            }
        }

        if batches.is_empty() {
            tracing::info!(backfill_id, "no records discovered; nothing to enqueue");
            return Ok(());
        }

        BackfillProgress::new(pool.clone())
            .increment_total_ingest_jobs(&backfill_id, batches.len() as i64)
            .await?;

        let total = batches.len();
        for batch in batches {
            ctx.queue
                .send_backfill_ingest(&JobConfig::SalesforceBackfill(SalesforceBackfillConfig {
                    tenant_id: config.tenant_id.clone(),
                    backfill_id: Some(backfill_id.clone()),
                    suppress_notification: config.suppress_notification,
                    object_batches: vec![batch],
                }))
                .await?;
        }
        tracing::info!(backfill_id, total, "enqueued Salesforce child jobs");
        Ok(())
    }
}

/// Fetches one batch of records in full and upserts their artifacts.
pub struct SalesforceBackfillExtractor;

#[async_trait::async_trait]
impl Extractor for SalesforceBackfillExtractor {
    fn source_name(&self) -> &'static str {
        "salesforce_backfill"
    }

    #[tracing::instrument(skip_all, fields(job_id = %job_id))]
    async fn process_job(
        &self,
        ctx: &JobContext,
        job_id: uuid::Uuid,
        config: &JobConfig,
    ) -> anyhow::Result<()> {
        let JobConfig::SalesforceBackfill(config) = config else {
            anyhow::bail!("unexpected config for {}", self.source_name());
        };
        let pool = ctx.pools.acquire(&config.tenant_id).await?;

        let result = run_backfill_batch(ctx, job_id, config, &pool).await;

        // `attempted` advances on every run, `done` only on success.
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

async fn run_backfill_batch(
    ctx: &JobContext,
    job_id: uuid::Uuid,
    config: &SalesforceBackfillConfig,
    pool: &sqlx::PgPool,
) -> anyhow::Result<()> {
    let client = client_for_tenant(ctx, pool, &config.tenant_id).await?;
    let store = ArtifactStore::new(pool.clone());

    for batch in &config.object_batches {
        let records = client
            .get_records_by_ids(batch.object_type, &batch.record_ids, None)
            .await?;

        let mut artifacts: Vec<Artifact> = Vec::new();
        for record in records {
            match make_object_artifact(job_id, batch.object_type, record) {
                Some(artifact) => artifacts.push(artifact),
                None => tracing::warn!(object = %batch.object_type, "record missing Id; skipped"),
            }
        }

        // Vendor-missing ids are logged but never fail the batch.
        if artifacts.len() < batch.record_ids.len() {
            let returned: HashSet<&str> = artifacts
                .iter()
                .map(|artifact| artifact.entity_id.as_str())
                .collect();
            let entity = batch.object_type.entity();
            let missing = batch
                .record_ids
                .iter()
                .filter(|id| !returned.contains(entity.entity_id(id).as_str()))
                .count();
            tracing::warn!(
                object = %batch.object_type,
                requested = batch.record_ids.len(),
                returned = artifacts.len(),
                missing,
                "batch fetch returned fewer records than requested"
            );
        }

        store.upsert_batch(&artifacts).await?;
        trigger_indexing(
            ctx.indexing.as_ref(),
            artifacts.iter().map(|a| a.entity_id.clone()).collect(),
            SourceKind::Salesforce,
            &config.tenant_id,
            config.backfill_id.as_deref(),
            config.suppress_notification,
        )
        .await?;
        tracing::info!(
            object = %batch.object_type,
            stored = artifacts.len(),
            "processed Salesforce object batch"
        );
    }
    Ok(())
}

/// Hourly delta sync: per object type, fetch records modified since the
/// watermark and advance it only when every record stored cleanly.
pub struct SalesforceObjectSyncExtractor;

#[async_trait::async_trait]
impl Extractor for SalesforceObjectSyncExtractor {
    fn source_name(&self) -> &'static str {
        "salesforce_object_sync"
    }

    #[tracing::instrument(skip_all, fields(job_id = %job_id))]
    async fn process_job(
        &self,
        ctx: &JobContext,
        job_id: uuid::Uuid,
        config: &JobConfig,
    ) -> anyhow::Result<()> {
        let JobConfig::SalesforceObjectSync(config) = config else {
            anyhow::bail!("unexpected config for {}", self.source_name());
        };
        let pool = ctx.pools.acquire(&config.tenant_id).await?;
        let client = client_for_tenant(ctx, &pool, &config.tenant_id).await?;
        let store = ArtifactStore::new(pool.clone());
        let sync = SalesforceSyncService::new(ConfigStore::new(pool.clone()));

        for &object in SalesforceObject::ALL {
            let Some(last_synced_at) = sync.get_object_last_synced_at(object).await? else {
                // Refusing here keeps a scheduled sync from silently skipping
                // history before a backfill has recorded a watermark.
                tracing::warn!(%object, "no sync watermark recorded; refusing incremental sync");
                continue;
            };

            let ids = client.get_updated_object_ids(object, last_synced_at).await?;
            if ids.is_empty() {
                tracing::debug!(%object, "no updated records");
                continue;
            }

            let records = client.get_records_by_ids(object, &ids, None).await?;
            let mut artifacts: Vec<Artifact> = Vec::new();
            let mut failed = 0usize;
            for record in records {
                match make_object_artifact(job_id, object, record) {
                    Some(artifact) => artifacts.push(artifact),
                    None => failed += 1,
                }
            }

            store.upsert_batch(&artifacts).await?;
            trigger_indexing(
                ctx.indexing.as_ref(),
                artifacts.iter().map(|a| a.entity_id.clone()).collect(),
                SourceKind::Salesforce,
                &config.tenant_id,
                None,
                config.suppress_notification,
            )
            .await?;

            if failed > 0 {
                // Failed records re-surface next run because the cursor stays.
                tracing::warn!(%object, failed, "cursor pinned; some records failed to process");
                continue;
            }
            let max_updated = artifacts.iter().map(|a| a.source_updated_at).max();
            if let Some(max_updated) = max_updated {
                // One second of overlap against boundary misses, never
                // regressing below the prior watermark.
                let next = (max_updated - chrono::Duration::seconds(1)).max(last_synced_at);
                sync.set_object_last_synced_at(object, Some(next)).await?;
            }
            tracing::info!(%object, updated = artifacts.len(), "object sync pass complete");
        }
        Ok(())
    }
}

/// Consumes CDC event batches from the webhook lane: DELETE routes through
/// the pruner; everything else re-fetches the full record and upserts.
pub struct SalesforceCdcExtractor;

#[async_trait::async_trait]
impl Extractor for SalesforceCdcExtractor {
    fn source_name(&self) -> &'static str {
        "ingest_webhook"
    }

    #[tracing::instrument(skip_all, fields(job_id = %job_id))]
    async fn process_job(
        &self,
        ctx: &JobContext,
        job_id: uuid::Uuid,
        config: &JobConfig,
    ) -> anyhow::Result<()> {
        let JobConfig::IngestWebhook(envelope) = config else {
            anyhow::bail!("unexpected config for {}", self.source_name());
        };
        anyhow::ensure!(
            envelope.source_type == SourceKind::Salesforce,
            "no webhook handler for source {}",
            envelope.source_type
        );
        let body: SalesforceCdcWebhookBody =
            serde_json::from_str(&envelope.body).context("invalid CDC webhook body")?;
        tracing::info!(
            tenant_id = %envelope.tenant_id,
            events = body.events.len(),
            "processing CDC event batch"
        );

        let pool = ctx.pools.acquire(&envelope.tenant_id).await?;
        let client = client_for_tenant(ctx, &pool, &envelope.tenant_id).await?;
        let store = ArtifactStore::new(pool.clone());

        let mut artifacts: Vec<Artifact> = Vec::new();
        for event in &body.events {
            match process_cdc_event(ctx, &client, &store, &envelope.tenant_id, job_id, event).await
            {
                Ok(Some(artifact)) => artifacts.push(artifact),
                Ok(None) => (),
                Err(err) => {
                    tracing::error!(
                        record_id = %event.record_id,
                        object = %event.object_type,
                        ?err,
                        "failed to process CDC event"
                    );
                }
            }
        }

        if !artifacts.is_empty() {
            store.upsert_batch(&artifacts).await?;
            trigger_indexing(
                ctx.indexing.as_ref(),
                artifacts.iter().map(|a| a.entity_id.clone()).collect(),
                SourceKind::Salesforce,
                &envelope.tenant_id,
                None,
                false,
            )
            .await?;
        }
        Ok(())
    }
}

async fn process_cdc_event(
    ctx: &JobContext,
    client: &super::SalesforceClient,
    store: &ArtifactStore,
    tenant_id: &str,
    job_id: uuid::Uuid,
    event: &SalesforceCdcEvent,
) -> anyhow::Result<Option<Artifact>> {
    if event.operation_type == CdcOperation::Delete {
        let deleted = delete_record(
            store,
            ctx.index.as_ref(),
            tenant_id,
            event.object_type,
            &event.record_id,
        )
        .await;
        anyhow::ensure!(deleted, "delete cascade incomplete for {}", event.record_id);
        return Ok(None);
    }

    // INSERT, UPDATE, UNDELETE: the CDC payload is often partial, so fetch
    // the current record in full.
    let records = client
        .get_records_by_ids(event.object_type, &[event.record_id.clone()], None)
        .await?;
    let Some(record) = records.into_iter().next() else {
        tracing::warn!(
            record_id = %event.record_id,
            object = %event.object_type,
            "could not fetch complete record for CDC event"
        );
        return Ok(None);
    };
    Ok(make_object_artifact(job_id, event.object_type, record))
}
