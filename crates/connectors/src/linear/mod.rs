//! Linear connector: GraphQL client whose rate limiting honors both the
//! request and complexity budgets Linear exposes through response headers
//! and GraphQL error metadata.

mod client;

pub use client::{
    client_for_tenant, retry_from_headers, retry_from_rate_limit_meta, LinearClient,
};

use crate::health::{HealthCheck, HealthStatus};
use crate::JobContext;
use models::SourceKind;

pub struct LinearHealthCheck;

#[async_trait::async_trait]
impl HealthCheck for LinearHealthCheck {
    fn source(&self) -> SourceKind {
        SourceKind::LinearIssue
    }

    async fn check(&self, ctx: &JobContext, tenant_id: &str) -> HealthStatus {
        let client = match client_for_tenant(ctx, tenant_id).await {
            Ok(client) => client,
            Err(err) => return HealthStatus::unhealthy(format!("client setup: {err}")),
        };
        match client.get_viewer().await {
            Ok(viewer) => HealthStatus::healthy(format!(
                "authenticated as {}",
                viewer
                    .get("name")
                    .and_then(|name| name.as_str())
                    .unwrap_or("unknown")
            )),
            Err(err) => HealthStatus::unhealthy(format!("viewer probe failed: {err}")),
        }
    }
}
