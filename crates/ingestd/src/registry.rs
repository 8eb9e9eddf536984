//! Explicit startup registration of every extractor and health check, keyed
//! by the job `source` discriminator and source tag respectively.

use connectors::health::HealthRegistry;
use connectors::ExtractorRegistry;
use connectors::{
    attio, canva, figma, fireflies, gitlab, linear, pipedrive, posthog, pylon, salesforce,
    teamwork,
};
use models::JobConfig;
use std::sync::Arc;

pub fn extractor_registry() -> ExtractorRegistry {
    ExtractorRegistry::new()
        .register(Arc::new(salesforce::SalesforceBackfillRootExtractor))
        .register(Arc::new(salesforce::SalesforceBackfillExtractor))
        .register(Arc::new(salesforce::SalesforceObjectSyncExtractor))
        .register(Arc::new(salesforce::SalesforceCdcExtractor))
        .register(Arc::new(gitlab::GitlabMrBackfillRootExtractor))
        .register(Arc::new(gitlab::GitlabMrBackfillProjectExtractor))
        .register(Arc::new(gitlab::GitlabMrBackfillExtractor))
        .register(Arc::new(gitlab::GitlabMrIncrementalRootExtractor))
        .register(Arc::new(gitlab::GitlabMrIncrementalProjectExtractor))
        .register(Arc::new(gitlab::GitlabFileBackfillRootExtractor))
        .register(Arc::new(gitlab::GitlabFileBackfillProjectExtractor))
        .register(Arc::new(gitlab::GitlabFileBackfillExtractor))
        .register(Arc::new(gitlab::GitlabFileIncrementalProjectExtractor))
        .register(Arc::new(teamwork::TeamworkBackfillRootExtractor))
        .register(Arc::new(teamwork::TeamworkTaskBackfillExtractor))
        .register(Arc::new(teamwork::TeamworkIncrementalExtractor))
        .register(Arc::new(teamwork::TeamworkPruneExtractor))
        .register(Arc::new(fireflies::FirefliesFullBackfillExtractor))
        .register(Arc::new(fireflies::FirefliesIncrementalExtractor))
        .register(Arc::new(canva::CanvaBackfillRootExtractor))
        .register(Arc::new(canva::CanvaDesignBackfillExtractor))
        .register(Arc::new(attio::AttioRecordSyncExtractor))
        .register(Arc::new(pipedrive::PipedriveBackfillRootExtractor))
        .register(Arc::new(pipedrive::PipedriveDealBackfillExtractor))
        .register(Arc::new(pipedrive::PipedriveDealSyncExtractor))
}

pub fn health_registry() -> HealthRegistry {
    HealthRegistry::new()
        .register(Arc::new(salesforce::SalesforceHealthCheck))
        .register(Arc::new(gitlab::GitlabHealthCheck))
        .register(Arc::new(teamwork::TeamworkHealthCheck))
        .register(Arc::new(fireflies::FirefliesHealthCheck))
        .register(Arc::new(canva::CanvaHealthCheck))
        .register(Arc::new(attio::AttioHealthCheck))
        .register(Arc::new(pipedrive::PipedriveHealthCheck))
        .register(Arc::new(figma::FigmaHealthCheck))
        .register(Arc::new(posthog::PosthogHealthCheck))
        .register(Arc::new(pylon::PylonHealthCheck))
        .register(Arc::new(linear::LinearHealthCheck))
}

/// Build the root/sync job the scheduler (or an operator) enqueues for a
/// tenant, by `source` discriminator.
pub fn root_job(source: &str, tenant_id: &str) -> Option<JobConfig> {
    macro_rules! config {
        ($variant:ident, $config:ident) => {
            JobConfig::$variant(models::$config {
                tenant_id: tenant_id.to_string(),
                backfill_id: None,
                suppress_notification: false,
            })
        };
    }

    Some(match source {
        "salesforce_backfill_root" => config!(SalesforceBackfillRoot, SalesforceBackfillRootConfig),
        "salesforce_object_sync" => config!(SalesforceObjectSync, SalesforceObjectSyncConfig),
        "gitlab_mr_backfill_root" => config!(GitlabMrBackfillRoot, GitlabMrBackfillRootConfig),
        "gitlab_mr_incremental_root" => {
            config!(GitlabMrIncrementalRoot, GitlabMrIncrementalRootConfig)
        }
        "gitlab_file_backfill_root" => config!(GitlabFileBackfillRoot, GitlabFileBackfillRootConfig),
        "teamwork_backfill_root" => config!(TeamworkBackfillRoot, TeamworkBackfillRootConfig),
        "teamwork_incremental" => config!(TeamworkIncremental, TeamworkIncrementalConfig),
        "teamwork_prune" => config!(TeamworkPrune, TeamworkPruneConfig),
        "fireflies_full_backfill" => JobConfig::FirefliesFullBackfill(
            serde_json::from_value(serde_json::json!({"tenant_id": tenant_id}))
                .expect("static config shape"),
        ),
        "fireflies_incremental" => config!(FirefliesIncremental, FirefliesIncrementalConfig),
        "canva_backfill_root" => config!(CanvaBackfillRoot, CanvaBackfillRootConfig),
        "pipedrive_backfill_root" => config!(PipedriveBackfillRoot, PipedriveBackfillRootConfig),
        "pipedrive_deal_sync" => config!(PipedriveDealSync, PipedriveDealSyncConfig),
        "attio_record_sync" => JobConfig::AttioRecordSync(models::AttioRecordSyncConfig {
            tenant_id: tenant_id.to_string(),
            backfill_id: None,
            suppress_notification: false,
            object_slugs: None,
        }),
        _ => return None,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn registries_build_without_duplicate_registrations() {
        let extractors = extractor_registry();
        assert!(extractors.get("salesforce_backfill_root").is_some());
        assert!(extractors.get("ingest_webhook").is_some());
        assert!(extractors.get("unknown_source").is_none());

        let health = health_registry();
        assert_eq!(health.sources().len(), 11);
    }

    #[test]
    fn root_jobs_resolve_by_discriminator() {
        let config = root_job("teamwork_backfill_root", "tenant42").unwrap();
        assert_eq!(config.source_name(), "teamwork_backfill_root");
        assert_eq!(config.tenant_id(), "tenant42");

        let config = root_job("gitlab_file_incremental_project", "tenant42");
        assert!(config.is_none(), "per-container jobs are not root jobs");
    }

    #[test]
    fn every_root_job_has_a_registered_extractor() {
        let extractors = extractor_registry();
        for source in [
            "salesforce_backfill_root",
            "salesforce_object_sync",
            "gitlab_mr_backfill_root",
            "gitlab_mr_incremental_root",
            "gitlab_file_backfill_root",
            "teamwork_backfill_root",
            "teamwork_incremental",
            "teamwork_prune",
            "fireflies_full_backfill",
            "fireflies_incremental",
            "canva_backfill_root",
            "pipedrive_backfill_root",
            "pipedrive_deal_sync",
            "attio_record_sync",
        ] {
            let config = root_job(source, "t").unwrap();
            assert_eq!(config.source_name(), source);
            assert!(
                extractors.get(source).is_some(),
                "no extractor registered for {source}"
            );
        }
    }
}
