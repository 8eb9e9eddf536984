//! Canva connector: Connect API client with continuation-token pagination
//! and the one-shot refresh-token rotation flow (every refresh rotates both
//! tokens, persisted together under the tenant's refresh lock).

mod client;
mod extractors;
mod factory;

pub use client::{make_design_artifact, CanvaClient};
pub use extractors::{CanvaBackfillRootExtractor, CanvaDesignBackfillExtractor};
pub use factory::client_for_tenant;

use crate::health::{HealthCheck, HealthStatus};
use crate::JobContext;
use models::SourceKind;

pub struct CanvaHealthCheck;

#[async_trait::async_trait]
impl HealthCheck for CanvaHealthCheck {
    fn source(&self) -> SourceKind {
        SourceKind::CanvaDesign
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
                user.get("display_name")
                    .and_then(|name| name.as_str())
                    .unwrap_or("unknown")
            )),
            Err(err) => HealthStatus::unhealthy(format!("me probe failed: {err}")),
        }
    }
}
