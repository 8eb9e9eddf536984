use super::{
    client_for_tenant, delete_task, enrich_tasks_with_included, is_indexable, make_task_artifact,
    visibility_flag_missing, TeamworkSyncService,
};
use crate::{generate_backfill_id, trigger_indexing, Extractor, JobContext};
use chrono::Utc;
use ingest_sql::{ArtifactStore, BackfillProgress, ConfigStore};
use models::{Artifact, JobConfig, SourceKind, TeamworkTaskBackfillConfig};
use serde_json::Value;

/// Task ids per child job. Batched task fetches carry full sideloads, so
/// batches stay small.
pub const CHILD_JOB_BATCH_SIZE: usize = 50;

/// Abort de-indexing when more than this share of a run's tasks came back
/// without a visibility flag: a misbehaving API must not cause mass pruning.
const MISSING_VISIBILITY_ABORT_RATE: f64 = 0.2;

pub fn should_abort_deindex(total_processed: usize, missing_visibility: usize) -> bool {
    total_processed > 0
        && (missing_visibility as f64 / total_processed as f64) > MISSING_VISIBILITY_ABORT_RATE
}

/// Enumerates all tasks and fans out batch jobs. The watermark is stamped
/// before discovery so mutations racing the backfill surface in the next
/// incremental run.
pub struct TeamworkBackfillRootExtractor;

#[async_trait::async_trait]
impl Extractor for TeamworkBackfillRootExtractor {
    fn source_name(&self) -> &'static str {
        "teamwork_backfill_root"
    }

    #[tracing::instrument(skip_all, fields(job_id = %job_id))]
    async fn process_job(
        &self,
        ctx: &JobContext,
        job_id: uuid::Uuid,
        config: &JobConfig,
    ) -> anyhow::Result<()> {
        let JobConfig::TeamworkBackfillRoot(config) = config else {
            anyhow::bail!("unexpected config for {}", self.source_name());
        };
        let backfill_id = config
            .backfill_id
            .clone()
            .unwrap_or_else(generate_backfill_id);
        tracing::info!(tenant_id = %config.tenant_id, backfill_id, "starting Teamwork backfill root");

        let pool = ctx.pools.acquire(&config.tenant_id).await?;
        let sync = TeamworkSyncService::new(ConfigStore::new(pool.clone()));

        let sync_start = Utc::now();
        sync.set_tasks_synced_until(Some(sync_start)).await?;

        let client = client_for_tenant(ctx, &pool, &config.tenant_id).await?;
        let mut task_ids: Vec<i64> = Vec::new();
        let mut pages = client.task_pages(None);
        while let Some((tasks, _next_page)) = pages.next_page().await? {
            task_ids.extend(tasks.iter().filter_map(|task| task.get("id")?.as_i64()));
        }
        tracing::info!(discovered = task_ids.len(), "enumerated Teamwork tasks");

        let batches: Vec<Vec<i64>> = task_ids
            .chunks(CHILD_JOB_BATCH_SIZE)
            .map(<[i64]>::to_vec)
            .collect();
        if !batches.is_empty() {
            BackfillProgress::new(pool.clone())
                .increment_total_ingest_jobs(&backfill_id, batches.len() as i64)
                .await?;
            let total = batches.len();
            for task_ids in batches {
                ctx.queue
                    .send_backfill_ingest(&JobConfig::TeamworkTaskBackfill(
                        TeamworkTaskBackfillConfig {
                            tenant_id: config.tenant_id.clone(),
                            backfill_id: Some(backfill_id.clone()),
                            suppress_notification: config.suppress_notification,
                            task_ids,
                        },
                    ))
                    .await?;
            }
            tracing::info!(backfill_id, total, "enqueued Teamwork child jobs");
        }

        sync.set_backfill_complete(true).await?;
        Ok(())
    }
}

/// Fetches one batch of tasks with sideloads, enriches them, and stores the
/// artifacts of the indexable ones.
pub struct TeamworkTaskBackfillExtractor;

#[async_trait::async_trait]
impl Extractor for TeamworkTaskBackfillExtractor {
    fn source_name(&self) -> &'static str {
        "teamwork_task_backfill"
    }

    #[tracing::instrument(skip_all, fields(job_id = %job_id))]
    async fn process_job(
        &self,
        ctx: &JobContext,
        job_id: uuid::Uuid,
        config: &JobConfig,
    ) -> anyhow::Result<()> {
        let JobConfig::TeamworkTaskBackfill(config) = config else {
            anyhow::bail!("unexpected config for {}", self.source_name());
        };
        let pool = ctx.pools.acquire(&config.tenant_id).await?;

        let result = run_task_batch(ctx, job_id, config, &pool).await;
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

async fn run_task_batch(
    ctx: &JobContext,
    job_id: uuid::Uuid,
    config: &TeamworkTaskBackfillConfig,
    pool: &sqlx::PgPool,
) -> anyhow::Result<()> {
    let client = client_for_tenant(ctx, pool, &config.tenant_id).await?;
    let store = ArtifactStore::new(pool.clone());

    let (tasks, included) = client.get_tasks_by_ids(&config.task_ids, None).await?;
    let enriched = enrich_tasks_with_included(tasks, &included);

    let mut artifacts: Vec<Artifact> = Vec::new();
    let mut skipped_non_public = 0usize;
    for mut task in enriched {
        if !is_indexable(&task) {
            skipped_non_public += 1;
            continue;
        }
        let comments = task
            .as_object_mut()
            .and_then(|object| object.remove("_comments"))
            .and_then(|comments| comments.as_array().cloned())
            .unwrap_or_default();
        match make_task_artifact(job_id, task, comments) {
            Some(artifact) => artifacts.push(artifact),
            None => tracing::warn!("task missing id; skipped"),
        }
    }

    store.upsert_batch(&artifacts).await?;
    trigger_indexing(
        ctx.indexing.as_ref(),
        artifacts.iter().map(|a| a.entity_id.clone()).collect(),
        SourceKind::TeamworkTask,
        &config.tenant_id,
        config.backfill_id.as_deref(),
        config.suppress_notification,
    )
    .await?;

    tracing::info!(
        requested = config.task_ids.len(),
        stored = artifacts.len(),
        skipped_non_public,
        "processed Teamwork task batch"
    );
    Ok(())
}

/// Incremental sync via the `updatedAfter` filter, with fail-closed privacy:
/// records flipping private are de-indexed before the cursor advances, and
/// any failure pins the cursor so the records re-surface next run.
pub struct TeamworkIncrementalExtractor;

#[async_trait::async_trait]
impl Extractor for TeamworkIncrementalExtractor {
    fn source_name(&self) -> &'static str {
        "teamwork_incremental"
    }

    #[tracing::instrument(skip_all, fields(job_id = %job_id))]
    async fn process_job(
        &self,
        ctx: &JobContext,
        job_id: uuid::Uuid,
        config: &JobConfig,
    ) -> anyhow::Result<()> {
        let JobConfig::TeamworkIncremental(config) = config else {
            anyhow::bail!("unexpected config for {}", self.source_name());
        };
        let tenant_id = &config.tenant_id;
        let pool = ctx.pools.acquire(tenant_id).await?;
        let sync = TeamworkSyncService::new(ConfigStore::new(pool.clone()));

        let Some(last_sync) = sync.get_tasks_synced_until().await? else {
            // No fallback window here: running "last 24h" instead would
            // silently skip history before the backfill.
            let backfill_complete = sync.get_backfill_complete().await?;
            tracing::warn!(
                tenant_id,
                backfill_complete,
                "no sync watermark; refusing incremental sync"
            );
            return Ok(());
        };

        // One second of overlap against boundary misses.
        let since = last_sync - chrono::Duration::seconds(1);
        let sync_start = Utc::now();

        let client = client_for_tenant(ctx, &pool, tenant_id).await?;
        let store = ArtifactStore::new(pool.clone());

        let mut artifacts: Vec<Artifact> = Vec::new();
        let mut tasks_to_deindex: Vec<i64> = Vec::new();
        let mut private_skipped = 0usize;
        let mut missing_visibility_skipped = 0usize;
        let mut failed = 0usize;

        let mut pages = client.task_pages(Some(since));
        while let Some((tasks, _next_page)) = pages.next_page().await? {
            for task in tasks {
                let Some(task_id) = task.get("id").and_then(Value::as_i64) else {
                    continue;
                };

                if !is_indexable(&task) {
                    if visibility_flag_missing(&task) {
                        missing_visibility_skipped += 1;
                    } else {
                        private_skipped += 1;
                    }
                    // It may have been indexed while public; queue a de-index.
                    tasks_to_deindex.push(task_id);
                    continue;
                }

                let comments = match client.get_all_task_comments(task_id).await {
                    Ok(comments) => comments,
                    Err(err) => {
                        tracing::warn!(tenant_id, task_id, ?err, "failed to fetch task comments");
                        failed += 1;
                        continue;
                    }
                };
                match make_task_artifact(job_id, task, comments) {
                    Some(artifact) => artifacts.push(artifact),
                    None => failed += 1,
                }
            }
        }

        if !artifacts.is_empty() {
            store.upsert_batch(&artifacts).await?;
            trigger_indexing(
                ctx.indexing.as_ref(),
                artifacts.iter().map(|a| a.entity_id.clone()).collect(),
                SourceKind::TeamworkTask,
                tenant_id,
                None,
                true,
            )
            .await?;
        }

        // De-index before touching the cursor, so a failed delete re-surfaces
        // the task next run.
        let total_processed = artifacts.len() + private_skipped + missing_visibility_skipped;
        let mut deindexed = 0usize;
        let mut deindex_failed = 0usize;
        let mut deindex_skipped = false;

        if !tasks_to_deindex.is_empty() {
            if should_abort_deindex(total_processed, missing_visibility_skipped) {
                tracing::error!(
                    tenant_id,
                    missing_visibility_skipped,
                    total_processed,
                    "aborting de-indexing: missing-visibility rate too high, likely an API fault"
                );
                deindex_skipped = true;
            } else {
                tracing::info!(
                    tenant_id,
                    count = tasks_to_deindex.len(),
                    "de-indexing tasks that became private or lost visibility"
                );
                for task_id in &tasks_to_deindex {
                    if delete_task(&store, ctx.index.as_ref(), tenant_id, *task_id).await {
                        deindexed += 1;
                    } else {
                        deindex_failed += 1;
                    }
                }
            }
        }

        let cursor_advances = deindex_failed == 0 && failed == 0;
        if cursor_advances {
            sync.set_tasks_synced_until(Some(sync_start)).await?;
        } else {
            tracing::warn!(
                tenant_id,
                failed,
                deindex_failed,
                "not advancing sync cursor; failed items will be re-examined next run"
            );
        }

        tracing::info!(
            tenant_id,
            tasks_updated = artifacts.len(),
            private_skipped,
            missing_visibility_skipped,
            deindexed,
            deindex_failed,
            deindex_skipped,
            cursor_advances,
            "Teamwork incremental sync complete"
        );
        Ok(())
    }
}

/// Authoritative reconciliation: find indexed tasks which are deleted,
/// private, or of unknown visibility upstream, and prune each one.
pub struct TeamworkPruneExtractor;

#[async_trait::async_trait]
impl Extractor for TeamworkPruneExtractor {
    fn source_name(&self) -> &'static str {
        "teamwork_prune"
    }

    #[tracing::instrument(skip_all, fields(job_id = %job_id))]
    async fn process_job(
        &self,
        ctx: &JobContext,
        job_id: uuid::Uuid,
        config: &JobConfig,
    ) -> anyhow::Result<()> {
        let JobConfig::TeamworkPrune(config) = config else {
            anyhow::bail!("unexpected config for {}", self.source_name());
        };
        let tenant_id = &config.tenant_id;
        let pool = ctx.pools.acquire(tenant_id).await?;
        let store = ArtifactStore::new(pool.clone());

        let stale = super::find_stale_documents(ctx, &pool, tenant_id).await?;
        let mut pruned = 0usize;
        let mut failed = 0usize;
        for doc_id in &stale {
            let Some(task_id) = doc_id
                .strip_prefix("teamwork_task_")
                .and_then(|id| id.parse::<i64>().ok())
            else {
                continue;
            };
            if delete_task(&store, ctx.index.as_ref(), tenant_id, task_id).await {
                pruned += 1;
            } else {
                failed += 1;
            }
        }

        tracing::info!(
            tenant_id,
            stale = stale.len(),
            pruned,
            failed,
            "Teamwork prune pass complete"
        );
        anyhow::ensure!(failed == 0, "{failed} stale documents failed to prune");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn guardrail_trips_above_twenty_percent() {
        assert!(!should_abort_deindex(0, 0));
        assert!(!should_abort_deindex(100, 20));
        assert!(should_abort_deindex(100, 21));
        assert!(should_abort_deindex(4, 1));
        assert!(!should_abort_deindex(5, 1));
    }
}
