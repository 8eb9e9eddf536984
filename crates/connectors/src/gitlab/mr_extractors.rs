use super::{client_for_tenant, make_mr_artifact, GitlabClient, GitlabSyncService};
use crate::{generate_backfill_id, trigger_indexing, Extractor, JobContext};
use chrono::Utc;
use ingest_sql::{ArtifactStore, BackfillProgress, ConfigStore};
use models::{
    Artifact, GitlabMrBackfillConfig, GitlabMrBackfillProjectConfig,
    GitlabMrIncrementalProjectConfig, JobConfig, SourceKind,
};
use serde_json::Value;

/// Merge requests per child job.
pub const MR_CHILD_JOB_BATCH_SIZE: usize = 50;

/// Discovers accessible projects and fans out one project enumeration job
/// per project.
pub struct GitlabMrBackfillRootExtractor;

#[async_trait::async_trait]
impl Extractor for GitlabMrBackfillRootExtractor {
    fn source_name(&self) -> &'static str {
        "gitlab_mr_backfill_root"
    }

    #[tracing::instrument(skip_all, fields(job_id = %job_id))]
    async fn process_job(
        &self,
        ctx: &JobContext,
        job_id: uuid::Uuid,
        config: &JobConfig,
    ) -> anyhow::Result<()> {
        let JobConfig::GitlabMrBackfillRoot(config) = config else {
            anyhow::bail!("unexpected config for {}", self.source_name());
        };
        let backfill_id = config
            .backfill_id
            .clone()
            .unwrap_or_else(generate_backfill_id);

        let pool = ctx.pools.acquire(&config.tenant_id).await?;
        let client = client_for_tenant(ctx, &pool, &config.tenant_id).await?;

        let projects = client.get_accessible_projects().await?;
        tracing::info!(
            tenant_id = %config.tenant_id,
            backfill_id,
            projects = projects.len(),
            "discovered GitLab projects"
        );

        for project in &projects {
            let Some(project_id) = project.get("id").and_then(Value::as_i64) else {
                continue;
            };
            ctx.queue
                .send_backfill_ingest(&JobConfig::GitlabMrBackfillProject(
                    GitlabMrBackfillProjectConfig {
                        tenant_id: config.tenant_id.clone(),
                        backfill_id: Some(backfill_id.clone()),
                        suppress_notification: config.suppress_notification,
                        project_id,
                    },
                ))
                .await?;
        }
        Ok(())
    }
}

/// Enumerates all MRs of one project and fans out process batches, then
/// records the incremental watermark so hourly syncs can take over.
pub struct GitlabMrBackfillProjectExtractor;

#[async_trait::async_trait]
impl Extractor for GitlabMrBackfillProjectExtractor {
    fn source_name(&self) -> &'static str {
        "gitlab_mr_backfill_project"
    }

    #[tracing::instrument(skip_all, fields(job_id = %job_id))]
    async fn process_job(
        &self,
        ctx: &JobContext,
        job_id: uuid::Uuid,
        config: &JobConfig,
    ) -> anyhow::Result<()> {
        let JobConfig::GitlabMrBackfillProject(config) = config else {
            anyhow::bail!("unexpected config for {}", self.source_name());
        };
        let pool = ctx.pools.acquire(&config.tenant_id).await?;
        let client = client_for_tenant(ctx, &pool, &config.tenant_id).await?;
        let sync = GitlabSyncService::new(ConfigStore::new(pool.clone()));

        // Anything updated after this instant belongs to the incremental.
        let sync_cursor_time = Utc::now();

        let merge_requests = client
            .get_project_merge_requests(config.project_id, None)
            .await?;
        let mr_iids: Vec<i64> = merge_requests
            .iter()
            .filter_map(|mr| mr.get("iid")?.as_i64())
            .collect();
        tracing::info!(
            project_id = config.project_id,
            count = mr_iids.len(),
            "enumerated merge requests"
        );

        let batches: Vec<Vec<i64>> = mr_iids
            .chunks(MR_CHILD_JOB_BATCH_SIZE)
            .map(<[i64]>::to_vec)
            .collect();

        if !batches.is_empty() {
            if let Some(backfill_id) = &config.backfill_id {
                BackfillProgress::new(pool.clone())
                    .increment_total_ingest_jobs(backfill_id, batches.len() as i64)
                    .await?;
            }
            for mr_iids in batches {
                ctx.queue
                    .send_backfill_ingest(&JobConfig::GitlabMrBackfill(GitlabMrBackfillConfig {
                        tenant_id: config.tenant_id.clone(),
                        backfill_id: config.backfill_id.clone(),
                        suppress_notification: config.suppress_notification,
                        project_id: config.project_id,
                        mr_iids,
                    }))
                    .await?;
            }
        }

        sync.set_mr_synced_until(config.project_id, Some(sync_cursor_time))
            .await?;
        tracing::info!(
            project_id = config.project_id,
            cursor = %sync_cursor_time,
            "set MR sync cursor"
        );
        Ok(())
    }
}

/// Fetches one batch of MRs in full (notes, diffs, approvals) and stores
/// their artifacts.
pub struct GitlabMrBackfillExtractor;

#[async_trait::async_trait]
impl Extractor for GitlabMrBackfillExtractor {
    fn source_name(&self) -> &'static str {
        "gitlab_mr_backfill"
    }

    #[tracing::instrument(skip_all, fields(job_id = %job_id))]
    async fn process_job(
        &self,
        ctx: &JobContext,
        job_id: uuid::Uuid,
        config: &JobConfig,
    ) -> anyhow::Result<()> {
        let JobConfig::GitlabMrBackfill(config) = config else {
            anyhow::bail!("unexpected config for {}", self.source_name());
        };
        let pool = ctx.pools.acquire(&config.tenant_id).await?;

        let result = run_mr_batch(ctx, job_id, config, &pool).await;
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

async fn run_mr_batch(
    ctx: &JobContext,
    job_id: uuid::Uuid,
    config: &GitlabMrBackfillConfig,
    pool: &sqlx::PgPool,
) -> anyhow::Result<()> {
    let client = client_for_tenant(ctx, pool, &config.tenant_id).await?;
    let store = ArtifactStore::new(pool.clone());

    let mut artifacts: Vec<Artifact> = Vec::new();
    for &mr_iid in &config.mr_iids {
        match fetch_full_mr(&client, job_id, config.project_id, mr_iid).await {
            Ok(Some(artifact)) => artifacts.push(artifact),
            Ok(None) => tracing::warn!(mr_iid, "merge request vanished; skipped"),
            Err(err) => {
                // One bad MR never fails the batch.
                tracing::error!(project_id = config.project_id, mr_iid, ?err, "failed to fetch MR");
            }
        }
    }

    store.upsert_batch(&artifacts).await?;
    trigger_indexing(
        ctx.indexing.as_ref(),
        artifacts.iter().map(|a| a.entity_id.clone()).collect(),
        SourceKind::GitlabMr,
        &config.tenant_id,
        config.backfill_id.as_deref(),
        config.suppress_notification,
    )
    .await?;

    tracing::info!(
        project_id = config.project_id,
        requested = config.mr_iids.len(),
        stored = artifacts.len(),
        "processed MR batch"
    );
    Ok(())
}

async fn fetch_full_mr(
    client: &GitlabClient,
    job_id: uuid::Uuid,
    project_id: i64,
    mr_iid: i64,
) -> anyhow::Result<Option<Artifact>> {
    let Some(mr) = client.get_merge_request(project_id, mr_iid).await? else {
        return Ok(None);
    };
    let notes = client.get_merge_request_notes(project_id, mr_iid).await?;
    let diffs = client.get_merge_request_diffs(project_id, mr_iid).await?;
    let approvals = client
        .get_merge_request_approvals(project_id, mr_iid)
        .await?;

    Ok(make_mr_artifact(
        job_id, project_id, mr, notes, diffs, approvals,
    ))
}

/// Fans the incremental MR sync out over every accessible project.
pub struct GitlabMrIncrementalRootExtractor;

#[async_trait::async_trait]
impl Extractor for GitlabMrIncrementalRootExtractor {
    fn source_name(&self) -> &'static str {
        "gitlab_mr_incremental_root"
    }

    #[tracing::instrument(skip_all, fields(job_id = %job_id))]
    async fn process_job(
        &self,
        ctx: &JobContext,
        job_id: uuid::Uuid,
        config: &JobConfig,
    ) -> anyhow::Result<()> {
        let JobConfig::GitlabMrIncrementalRoot(config) = config else {
            anyhow::bail!("unexpected config for {}", self.source_name());
        };
        let pool = ctx.pools.acquire(&config.tenant_id).await?;
        let client = client_for_tenant(ctx, &pool, &config.tenant_id).await?;

        for project in client.get_accessible_projects().await? {
            let Some(project_id) = project.get("id").and_then(Value::as_i64) else {
                continue;
            };
            ctx.queue
                .send_backfill_ingest(&JobConfig::GitlabMrIncrementalProject(
                    GitlabMrIncrementalProjectConfig {
                        tenant_id: config.tenant_id.clone(),
                        backfill_id: None,
                        suppress_notification: true,
                        project_id,
                    },
                ))
                .await?;
        }
        Ok(())
    }
}

/// Incremental MR sync for one project, driven by the `updated_after`
/// watermark recorded at backfill time.
pub struct GitlabMrIncrementalProjectExtractor;

#[async_trait::async_trait]
impl Extractor for GitlabMrIncrementalProjectExtractor {
    fn source_name(&self) -> &'static str {
        "gitlab_mr_incremental_project"
    }

    #[tracing::instrument(skip_all, fields(job_id = %job_id))]
    async fn process_job(
        &self,
        ctx: &JobContext,
        job_id: uuid::Uuid,
        config: &JobConfig,
    ) -> anyhow::Result<()> {
        let JobConfig::GitlabMrIncrementalProject(config) = config else {
            anyhow::bail!("unexpected config for {}", self.source_name());
        };
        let pool = ctx.pools.acquire(&config.tenant_id).await?;
        let sync = GitlabSyncService::new(ConfigStore::new(pool.clone()));

        let Some(last_sync) = sync.get_mr_synced_until(config.project_id).await? else {
            // Without a watermark an incremental would skip history; the
            // full backfill records one.
            tracing::warn!(
                project_id = config.project_id,
                "no MR sync watermark; refusing incremental sync"
            );
            return Ok(());
        };

        let since = last_sync - chrono::Duration::seconds(1);
        let sync_start = Utc::now();

        let client = client_for_tenant(ctx, &pool, &config.tenant_id).await?;
        let store = ArtifactStore::new(pool.clone());

        let updated = client
            .get_project_merge_requests(config.project_id, Some(since))
            .await?;
        if updated.is_empty() {
            sync.set_mr_synced_until(config.project_id, Some(sync_start))
                .await?;
            return Ok(());
        }

        let mut artifacts: Vec<Artifact> = Vec::new();
        let mut failed = 0usize;
        for mr in &updated {
            let Some(mr_iid) = mr.get("iid").and_then(Value::as_i64) else {
                continue;
            };
            match fetch_full_mr(&client, job_id, config.project_id, mr_iid).await {
                Ok(Some(artifact)) => artifacts.push(artifact),
                Ok(None) => (),
                Err(err) => {
                    tracing::error!(mr_iid, ?err, "failed to fetch updated MR");
                    failed += 1;
                }
            }
        }

        store.upsert_batch(&artifacts).await?;
        trigger_indexing(
            ctx.indexing.as_ref(),
            artifacts.iter().map(|a| a.entity_id.clone()).collect(),
            SourceKind::GitlabMr,
            &config.tenant_id,
            None,
            true,
        )
        .await?;

        if failed == 0 {
            sync.set_mr_synced_until(config.project_id, Some(sync_start))
                .await?;
        } else {
            tracing::warn!(
                project_id = config.project_id,
                failed,
                "cursor pinned; failed MRs will be re-examined next run"
            );
        }
        tracing::info!(
            project_id = config.project_id,
            updated = artifacts.len(),
            failed,
            "incremental MR sync complete"
        );
        Ok(())
    }
}
