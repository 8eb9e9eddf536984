//! Teamwork connector: v3 REST client with sideloaded-data enrichment,
//! task backfill and incremental sync with fail-closed privacy, and the
//! stale-document pruner.

mod artifacts;
mod client;
mod extractors;
mod pruner;
mod sync;

pub use artifacts::{is_indexable, make_task_artifact, visibility_flag_missing};
pub use client::{
    client_for_tenant, enrich_tasks_with_included, extract_ref_id, IncludedData, TeamworkClient,
    TeamworkSearchResult, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE,
};
pub use extractors::{
    should_abort_deindex, TeamworkBackfillRootExtractor, TeamworkIncrementalExtractor,
    TeamworkPruneExtractor, TeamworkTaskBackfillExtractor, CHILD_JOB_BATCH_SIZE,
};
pub use pruner::{classify_stale_tasks, delete_task, find_stale_documents, task_doc_id};
pub use sync::TeamworkSyncService;

use crate::health::{HealthCheck, HealthStatus};
use crate::JobContext;
use models::SourceKind;

pub struct TeamworkHealthCheck;

#[async_trait::async_trait]
impl HealthCheck for TeamworkHealthCheck {
    fn source(&self) -> SourceKind {
        SourceKind::TeamworkTask
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
                user.get("firstName")
                    .and_then(|name| name.as_str())
                    .unwrap_or("unknown")
            )),
            Err(err) => HealthStatus::unhealthy(format!("me probe failed: {err}")),
        }
    }
}
