//! Salesforce connector: REST/SOQL client with OAuth refresh, bulk backfill
//! fan-out, hourly object sync, CDC event processing, and pruning.

mod artifacts;
mod client;
mod extractors;
mod factory;
mod pruner;
mod sync;

pub use artifacts::{make_object_artifact, record_updated_at};
pub use client::{chunk_ids_for_soql, SalesforceClient, SOQL_WHERE_IN_LIMIT};
pub use extractors::{
    SalesforceBackfillExtractor, SalesforceBackfillRootExtractor, SalesforceCdcExtractor,
    SalesforceObjectSyncExtractor, CHILD_JOB_BATCH_SIZE,
};
pub use factory::client_for_tenant;
pub use pruner::delete_record;
pub use sync::SalesforceSyncService;

use crate::health::{HealthCheck, HealthStatus};
use crate::JobContext;
use models::SourceKind;

pub struct SalesforceHealthCheck;

#[async_trait::async_trait]
impl HealthCheck for SalesforceHealthCheck {
    fn source(&self) -> SourceKind {
        SourceKind::Salesforce
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
        match client.query_soql("SELECT Id FROM Account LIMIT 1").await {
            Ok(_) => HealthStatus::healthy("authenticated SOQL query succeeded"),
            Err(err) => HealthStatus::unhealthy(format!("SOQL probe failed: {err}")),
        }
    }
}
