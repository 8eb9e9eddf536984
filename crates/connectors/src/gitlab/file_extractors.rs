use super::{client_for_tenant, is_indexable_path, make_file_artifact, GitlabSyncService};
use crate::{generate_backfill_id, trigger_indexing, Extractor, JobContext};
use ingest_sql::{ArtifactStore, BackfillProgress, ConfigStore};
use models::{
    Artifact, GitlabFileBackfillConfig, GitlabFileBackfillProjectConfig, JobConfig, SourceKind,
};
use serde_json::Value;
use std::collections::BTreeSet;

/// File paths per child job.
const FILE_CHILD_JOB_BATCH_SIZE: usize = 50;

/// Files above this size are skipped at fetch time.
const MAX_FILE_BYTES: usize = 1 << 20;

/// Fans the file backfill out over every accessible project.
pub struct GitlabFileBackfillRootExtractor;

#[async_trait::async_trait]
impl Extractor for GitlabFileBackfillRootExtractor {
    fn source_name(&self) -> &'static str {
        "gitlab_file_backfill_root"
    }

    #[tracing::instrument(skip_all, fields(job_id = %job_id))]
    async fn process_job(
        &self,
        ctx: &JobContext,
        job_id: uuid::Uuid,
        config: &JobConfig,
    ) -> anyhow::Result<()> {
        let JobConfig::GitlabFileBackfillRoot(config) = config else {
            anyhow::bail!("unexpected config for {}", self.source_name());
        };
        let backfill_id = config
            .backfill_id
            .clone()
            .unwrap_or_else(generate_backfill_id);

        let pool = ctx.pools.acquire(&config.tenant_id).await?;
        let client = client_for_tenant(ctx, &pool, &config.tenant_id).await?;

        for project in client.get_accessible_projects().await? {
            let Some(project_id) = project.get("id").and_then(Value::as_i64) else {
                continue;
            };
            ctx.queue
                .send_backfill_ingest(&JobConfig::GitlabFileBackfillProject(
                    GitlabFileBackfillProjectConfig {
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

/// Enumerates a project's tree at the head commit, fans out file batches
/// pinned to that commit, and records it as the incremental cursor.
pub struct GitlabFileBackfillProjectExtractor;

#[async_trait::async_trait]
impl Extractor for GitlabFileBackfillProjectExtractor {
    fn source_name(&self) -> &'static str {
        "gitlab_file_backfill_project"
    }

    #[tracing::instrument(skip_all, fields(job_id = %job_id))]
    async fn process_job(
        &self,
        ctx: &JobContext,
        job_id: uuid::Uuid,
        config: &JobConfig,
    ) -> anyhow::Result<()> {
        let JobConfig::GitlabFileBackfillProject(config) = config else {
            anyhow::bail!("unexpected config for {}", self.source_name());
        };
        let pool = ctx.pools.acquire(&config.tenant_id).await?;
        let client = client_for_tenant(ctx, &pool, &config.tenant_id).await?;
        let sync = GitlabSyncService::new(ConfigStore::new(pool.clone()));

        let default_branch = client.get_default_branch(config.project_id).await?;
        let Some(head_sha) = client
            .get_latest_commit(config.project_id, &default_branch)
            .await?
            .and_then(|commit| commit.get("id")?.as_str().map(str::to_string))
        else {
            tracing::info!(project_id = config.project_id, "empty repository; nothing to do");
            return Ok(());
        };

        let tree = client
            .get_repository_tree(config.project_id, &head_sha)
            .await?;
        let file_paths: Vec<String> = tree
            .iter()
            .filter(|entry| entry.get("type").and_then(Value::as_str) == Some("blob"))
            .filter_map(|entry| entry.get("path")?.as_str().map(str::to_string))
            .filter(|path| is_indexable_path(path))
            .collect();

        tracing::info!(
            project_id = config.project_id,
            head = %head_sha,
            files = file_paths.len(),
            "enumerated repository files"
        );

        let batches: Vec<Vec<String>> = file_paths
            .chunks(FILE_CHILD_JOB_BATCH_SIZE)
            .map(<[String]>::to_vec)
            .collect();
        if !batches.is_empty() {
            if let Some(backfill_id) = &config.backfill_id {
                BackfillProgress::new(pool.clone())
                    .increment_total_ingest_jobs(backfill_id, batches.len() as i64)
                    .await?;
            }
            for file_paths in batches {
                ctx.queue
                    .send_backfill_ingest(&JobConfig::GitlabFileBackfill(
                        GitlabFileBackfillConfig {
                            tenant_id: config.tenant_id.clone(),
                            backfill_id: config.backfill_id.clone(),
                            suppress_notification: config.suppress_notification,
                            project_id: config.project_id,
                            ref_sha: head_sha.clone(),
                            file_paths,
                        },
                    ))
                    .await?;
            }
        }

        // The incremental walks commits forward from here.
        sync.set_file_synced_commit(config.project_id, Some(&head_sha))
            .await?;
        Ok(())
    }
}

/// Fetches one batch of files at a pinned ref and stores their artifacts.
pub struct GitlabFileBackfillExtractor;

#[async_trait::async_trait]
impl Extractor for GitlabFileBackfillExtractor {
    fn source_name(&self) -> &'static str {
        "gitlab_file_backfill"
    }

    #[tracing::instrument(skip_all, fields(job_id = %job_id))]
    async fn process_job(
        &self,
        ctx: &JobContext,
        job_id: uuid::Uuid,
        config: &JobConfig,
    ) -> anyhow::Result<()> {
        let JobConfig::GitlabFileBackfill(config) = config else {
            anyhow::bail!("unexpected config for {}", self.source_name());
        };
        let pool = ctx.pools.acquire(&config.tenant_id).await?;

        let result = run_file_batch(ctx, job_id, config, &pool).await;
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

async fn run_file_batch(
    ctx: &JobContext,
    job_id: uuid::Uuid,
    config: &GitlabFileBackfillConfig,
    pool: &sqlx::PgPool,
) -> anyhow::Result<()> {
    let client = client_for_tenant(ctx, pool, &config.tenant_id).await?;
    let store = ArtifactStore::new(pool.clone());

    let mut artifacts: Vec<Artifact> = Vec::new();
    for file_path in &config.file_paths {
        match client
            .get_file_raw(config.project_id, file_path, &config.ref_sha)
            .await
        {
            Ok(Some(bytes)) if bytes.len() > MAX_FILE_BYTES => {
                tracing::debug!(file_path, size = bytes.len(), "file too large; skipped");
            }
            Ok(Some(bytes)) => {
                if let Some(artifact) = make_file_artifact(
                    job_id,
                    config.project_id,
                    file_path,
                    &config.ref_sha,
                    &bytes,
                ) {
                    artifacts.push(artifact);
                }
            }
            Ok(None) => tracing::debug!(file_path, "file vanished at pinned ref; skipped"),
            Err(err) => {
                tracing::error!(file_path, ?err, "failed to fetch file");
            }
        }
    }

    store.upsert_batch(&artifacts).await?;
    trigger_indexing(
        ctx.indexing.as_ref(),
        artifacts.iter().map(|a| a.entity_id.clone()).collect(),
        SourceKind::GitlabFile,
        &config.tenant_id,
        config.backfill_id.as_deref(),
        config.suppress_notification,
    )
    .await?;

    tracing::info!(
        project_id = config.project_id,
        requested = config.file_paths.len(),
        stored = artifacts.len(),
        "processed file batch"
    );
    Ok(())
}

/// Incremental file sync: walk commits since the stored SHA on the default
/// branch and re-ingest every touched file.
pub struct GitlabFileIncrementalProjectExtractor;

#[async_trait::async_trait]
impl Extractor for GitlabFileIncrementalProjectExtractor {
    fn source_name(&self) -> &'static str {
        "gitlab_file_incremental_project"
    }

    #[tracing::instrument(skip_all, fields(job_id = %job_id))]
    async fn process_job(
        &self,
        ctx: &JobContext,
        job_id: uuid::Uuid,
        config: &JobConfig,
    ) -> anyhow::Result<()> {
        let JobConfig::GitlabFileIncrementalProject(config) = config else {
            anyhow::bail!("unexpected config for {}", self.source_name());
        };
        let pool = ctx.pools.acquire(&config.tenant_id).await?;
        let sync = GitlabSyncService::new(ConfigStore::new(pool.clone()));

        let Some(last_synced_commit) = sync.get_file_synced_commit(config.project_id).await? else {
            tracing::warn!(
                project_id = config.project_id,
                "no file sync cursor; refusing incremental sync (run a full backfill first)"
            );
            return Ok(());
        };

        let client = client_for_tenant(ctx, &pool, &config.tenant_id).await?;
        let store = ArtifactStore::new(pool.clone());
        let default_branch = client.get_default_branch(config.project_id).await?;

        // Resolve the cursor commit; a vanished SHA means history was
        // rewritten (force push) and the cursor is stale.
        let since_date = match client.get_commit(config.project_id, &last_synced_commit).await {
            Ok(commit) => commit
                .get("authored_date")
                .and_then(Value::as_str)
                .map(str::to_string),
            Err(err) if err.is_not_found() => {
                tracing::warn!(
                    project_id = config.project_id,
                    cursor = %last_synced_commit,
                    "cursor commit not found (force push?); clearing stale cursor"
                );
                sync.set_file_synced_commit(config.project_id, None).await?;
                return Ok(());
            }
            Err(err) => {
                tracing::warn!(
                    project_id = config.project_id,
                    ?err,
                    "could not resolve cursor commit; will retry next run"
                );
                return Ok(());
            }
        };

        let mut new_commits = client
            .get_repository_commits(config.project_id, &default_branch, since_date.as_deref())
            .await?;
        new_commits.retain(|commit| {
            commit.get("id").and_then(Value::as_str) != Some(last_synced_commit.as_str())
        });
        if new_commits.is_empty() {
            tracing::info!(project_id = config.project_id, "no new commits since cursor");
            return Ok(());
        }

        // Commits arrive newest-first; the head becomes the next cursor.
        let latest_commit_sha = new_commits
            .first()
            .and_then(|commit| commit.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut changed_files: BTreeSet<String> = BTreeSet::new();
        for commit in &new_commits {
            let Some(commit_sha) = commit.get("id").and_then(Value::as_str) else {
                continue;
            };
            match client.get_commit_diff(config.project_id, commit_sha).await {
                Ok(diffs) => {
                    for diff in diffs {
                        // Deleted files no longer exist; skip them.
                        if diff.get("deleted_file").and_then(Value::as_bool) == Some(true) {
                            continue;
                        }
                        if let Some(new_path) = diff.get("new_path").and_then(Value::as_str) {
                            if is_indexable_path(new_path) {
                                changed_files.insert(new_path.to_string());
                            }
                        }
                    }
                }
                Err(err) => tracing::warn!(commit_sha, ?err, "failed to get commit diff"),
            }
        }
        tracing::info!(
            project_id = config.project_id,
            commits = new_commits.len(),
            changed_files = changed_files.len(),
            "collected changed files"
        );

        let mut artifacts: Vec<Artifact> = Vec::new();
        let mut failed = 0usize;
        for file_path in &changed_files {
            match client
                .get_file_raw(config.project_id, file_path, &default_branch)
                .await
            {
                Ok(Some(bytes)) if bytes.len() > MAX_FILE_BYTES => (),
                Ok(Some(bytes)) => {
                    if let Some(artifact) = make_file_artifact(
                        job_id,
                        config.project_id,
                        file_path,
                        &default_branch,
                        &bytes,
                    ) {
                        artifacts.push(artifact);
                    }
                }
                Ok(None) => (), // Deleted between the diff walk and now.
                Err(err) => {
                    tracing::error!(file_path, ?err, "failed to process changed file");
                    failed += 1;
                }
            }
        }

        store.upsert_batch(&artifacts).await?;
        trigger_indexing(
            ctx.indexing.as_ref(),
            artifacts.iter().map(|a| a.entity_id.clone()).collect(),
            SourceKind::GitlabFile,
            &config.tenant_id,
            None,
            true,
        )
        .await?;

        // The cursor only moves when every changed file processed, so failed
        // files are re-examined next run.
        match (latest_commit_sha, failed) {
            (Some(latest), 0) => {
                sync.set_file_synced_commit(config.project_id, Some(&latest))
                    .await?;
                tracing::info!(project_id = config.project_id, cursor = %latest, "advanced file sync cursor");
            }
            (_, failed) if failed > 0 => {
                tracing::warn!(
                    project_id = config.project_id,
                    failed,
                    "cursor pinned; failed files will be re-examined next run"
                );
            }
            _ => (),
        }
        Ok(())
    }
}
