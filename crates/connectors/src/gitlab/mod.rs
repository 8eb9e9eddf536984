//! GitLab connector: REST client over the v4 API, merge-request backfill and
//! incremental sync per project, and repository-file sync driven by a
//! commit-SHA cursor.

mod artifacts;
mod client;
mod file_extractors;
mod mr_extractors;
mod sync;

pub use artifacts::{is_indexable_path, make_file_artifact, make_mr_artifact};
pub use client::{client_for_tenant, GitlabClient, DEFAULT_PER_PAGE};
pub use file_extractors::{
    GitlabFileBackfillExtractor, GitlabFileBackfillProjectExtractor,
    GitlabFileBackfillRootExtractor, GitlabFileIncrementalProjectExtractor,
};
pub use mr_extractors::{
    GitlabMrBackfillExtractor, GitlabMrBackfillProjectExtractor, GitlabMrBackfillRootExtractor,
    GitlabMrIncrementalProjectExtractor, GitlabMrIncrementalRootExtractor, MR_CHILD_JOB_BATCH_SIZE,
};
pub use sync::GitlabSyncService;

use crate::health::{HealthCheck, HealthStatus};
use crate::JobContext;
use models::SourceKind;

pub struct GitlabHealthCheck;

#[async_trait::async_trait]
impl HealthCheck for GitlabHealthCheck {
    fn source(&self) -> SourceKind {
        SourceKind::GitlabMr
    }

    async fn check(&self, ctx: &JobContext, tenant_id: &str) -> HealthStatus {
        let pool = match ctx.pools.acquire(tenant_id).await {
            Ok(pool) => pool,
            Err(err) => return HealthStatus::unhealthy(format!("tenant database: {err:#}")),
        };
        let client = match client_for_tenant(ctx, &pool, tenant_id).await {
            Ok(client) => client,
            Err(err) => return HealthStatus::unhealthy(format!("client setup: {err}")),
        };
        match client.get_current_user().await {
            Ok(user) => HealthStatus::healthy(format!(
                "authenticated as {}",
                user.get("username")
                    .and_then(|name| name.as_str())
                    .unwrap_or("unknown")
            )),
            Err(err) => HealthStatus::unhealthy(format!("user probe failed: {err}")),
        }
    }
}
