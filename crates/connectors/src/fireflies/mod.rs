//! Fireflies connector: GraphQL transcript client and the time-sliced full
//! backfill which walks history backwards while incremental syncs walk
//! forwards.

mod client;
mod extractors;
mod sync;

pub use client::{classify_graphql_errors, client_for_tenant, FirefliesClient};
pub use extractors::{
    make_transcript_artifact, FirefliesFullBackfillExtractor, FirefliesIncrementalExtractor,
};
pub use sync::FirefliesSyncService;

use crate::health::{HealthCheck, HealthStatus};
use crate::JobContext;
use models::SourceKind;

pub struct FirefliesHealthCheck;

#[async_trait::async_trait]
impl HealthCheck for FirefliesHealthCheck {
    fn source(&self) -> SourceKind {
        SourceKind::FirefliesTranscript
    }

    async fn check(&self, ctx: &JobContext, tenant_id: &str) -> HealthStatus {
        let client = match client_for_tenant(ctx, tenant_id).await {
            Ok(client) => client,
            Err(err) => return HealthStatus::unhealthy(format!("client setup: {err}")),
        };
        match client.get_users().await {
            Ok(users) => HealthStatus::healthy(format!("workspace has {} users", users.len())),
            Err(err) => HealthStatus::unhealthy(format!("users probe failed: {err}")),
        }
    }
}
