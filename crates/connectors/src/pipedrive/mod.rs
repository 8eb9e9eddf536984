//! Pipedrive connector: v2 REST client with cursor pagination, OAuth
//! refresh (refresh tokens rotate only when the vendor says so), and the
//! deal backfill/sync extractors.

mod client;
mod extractors;
mod factory;

pub use client::{make_deal_artifact, PipedriveClient};
pub use extractors::{
    PipedriveBackfillRootExtractor, PipedriveDealBackfillExtractor, PipedriveDealSyncExtractor,
};
pub use factory::client_for_tenant;

use crate::health::{HealthCheck, HealthStatus};
use crate::JobContext;
use models::SourceKind;

pub struct PipedriveHealthCheck;

#[async_trait::async_trait]
impl HealthCheck for PipedriveHealthCheck {
    fn source(&self) -> SourceKind {
        SourceKind::PipedriveDeal
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
        match client.get_deals(None, None).await {
            Ok(_) => HealthStatus::healthy("deal listing probe succeeded"),
            Err(err) => HealthStatus::unhealthy(format!("deal probe failed: {err}")),
        }
    }
}
