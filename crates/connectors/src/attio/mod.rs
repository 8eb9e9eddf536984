//! Attio connector: records are queried per object (companies, people, …)
//! through POST query endpoints, with an LRU-cached object descriptor
//! lookup and an `updated_at`-filtered incremental sync.

mod client;
mod extractors;

pub use client::{client_for_tenant, AttioClient, DEFAULT_OBJECT_SLUGS};
pub use extractors::{make_record_artifact, AttioRecordSyncExtractor};

use crate::health::{HealthCheck, HealthStatus};
use crate::JobContext;
use models::SourceKind;

pub struct AttioHealthCheck;

#[async_trait::async_trait]
impl HealthCheck for AttioHealthCheck {
    fn source(&self) -> SourceKind {
        SourceKind::AttioRecord
    }

    async fn check(&self, ctx: &JobContext, tenant_id: &str) -> HealthStatus {
        let client = match client_for_tenant(ctx, tenant_id).await {
            Ok(client) => client,
            Err(err) => return HealthStatus::unhealthy(format!("client setup: {err}")),
        };
        match client.get_object("companies").await {
            Ok(_) => HealthStatus::healthy("object descriptor lookup succeeded"),
            Err(err) => HealthStatus::unhealthy(format!("object probe failed: {err}")),
        }
    }
}
