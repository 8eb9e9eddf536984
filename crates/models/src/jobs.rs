use crate::{SalesforceObject, SourceKind};
use std::collections::BTreeMap;

/// A batch of Salesforce record ids of one object type, processed by a
/// single child job.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SalesforceObjectBatch {
    pub object_type: SalesforceObject,
    pub record_ids: Vec<String>,
}

macro_rules! job_config {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $field:ident : $ty:ty),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
        pub struct $name {
            pub tenant_id: String,
            #[serde(default, skip_serializing_if = "Option::is_none")]
            pub backfill_id: Option<String>,
            #[serde(default)]
            pub suppress_notification: bool,
            $( $(#[$fmeta])* pub $field: $ty, )*
        }
    };
}

job_config!(
    /// Discover all Salesforce record ids and fan out process batches.
    SalesforceBackfillRootConfig {}
);
job_config!(
    /// Fetch and store one batch of Salesforce records.
    SalesforceBackfillConfig {
        object_batches: Vec<SalesforceObjectBatch>,
    }
);
job_config!(
    /// Hourly delta sync of Salesforce objects via LastModifiedDate.
    SalesforceObjectSyncConfig {}
);

job_config!(GitlabMrBackfillRootConfig {});
job_config!(GitlabMrBackfillProjectConfig { project_id: i64 });
job_config!(GitlabMrBackfillConfig {
    project_id: i64,
    mr_iids: Vec<i64>,
});
job_config!(
    /// Root of the incremental MR sync: one project job per known project.
    GitlabMrIncrementalRootConfig {}
);
job_config!(GitlabMrIncrementalProjectConfig { project_id: i64 });
job_config!(GitlabFileBackfillRootConfig {});
job_config!(GitlabFileBackfillProjectConfig { project_id: i64 });
job_config!(GitlabFileBackfillConfig {
    project_id: i64,
    ref_sha: String,
    file_paths: Vec<String>,
});
job_config!(
    /// Walks commits since the stored SHA and re-ingests touched files.
    GitlabFileIncrementalProjectConfig { project_id: i64 }
);

job_config!(TeamworkBackfillRootConfig {});
job_config!(TeamworkTaskBackfillConfig { task_ids: Vec<i64> });
job_config!(TeamworkIncrementalConfig {});
job_config!(
    /// Reconcile indexed Teamwork documents against the source and prune
    /// deleted or private tasks.
    TeamworkPruneConfig {}
);

fn default_fireflies_duration() -> u64 {
    // SQS visibility timeout is 15 minutes; undershoot it a bit.
    60 * 13
}

job_config!(
    /// Time-sliced full transcript backfill: makes progress for
    /// `duration_seconds` and re-enqueues itself until complete.
    FirefliesFullBackfillConfig {
        #[serde(default = "default_fireflies_duration")]
        duration_seconds: u64,
    }
);
job_config!(FirefliesIncrementalConfig {});

job_config!(CanvaBackfillRootConfig {});
job_config!(CanvaDesignBackfillConfig {
    design_ids: Vec<String>,
});

job_config!(AttioRecordSyncConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    object_slugs: Option<Vec<String>>,
});
job_config!(PipedriveBackfillRootConfig {});
job_config!(PipedriveDealBackfillConfig { deal_ids: Vec<i64> });
job_config!(PipedriveDealSyncConfig {});

/// An inbound webhook (or CDC batch) forwarded onto the ingest queue by the
/// gatekeeper or a listener. The `body` is the raw payload; routing is by
/// `source_type`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WebhookEnvelope {
    pub tenant_id: String,
    pub source_type: SourceKind,
    pub body: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// JobConfig is the tagged union of every message the ingest queue carries.
/// The `source` discriminator selects the extractor which runs the job.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum JobConfig {
    SalesforceBackfillRoot(SalesforceBackfillRootConfig),
    SalesforceBackfill(SalesforceBackfillConfig),
    SalesforceObjectSync(SalesforceObjectSyncConfig),
    GitlabMrBackfillRoot(GitlabMrBackfillRootConfig),
    GitlabMrBackfillProject(GitlabMrBackfillProjectConfig),
    GitlabMrBackfill(GitlabMrBackfillConfig),
    GitlabMrIncrementalRoot(GitlabMrIncrementalRootConfig),
    GitlabMrIncrementalProject(GitlabMrIncrementalProjectConfig),
    GitlabFileBackfillRoot(GitlabFileBackfillRootConfig),
    GitlabFileBackfillProject(GitlabFileBackfillProjectConfig),
    GitlabFileBackfill(GitlabFileBackfillConfig),
    GitlabFileIncrementalProject(GitlabFileIncrementalProjectConfig),
    TeamworkBackfillRoot(TeamworkBackfillRootConfig),
    TeamworkTaskBackfill(TeamworkTaskBackfillConfig),
    TeamworkIncremental(TeamworkIncrementalConfig),
    TeamworkPrune(TeamworkPruneConfig),
    FirefliesFullBackfill(FirefliesFullBackfillConfig),
    FirefliesIncremental(FirefliesIncrementalConfig),
    CanvaBackfillRoot(CanvaBackfillRootConfig),
    CanvaDesignBackfill(CanvaDesignBackfillConfig),
    AttioRecordSync(AttioRecordSyncConfig),
    PipedriveBackfillRoot(PipedriveBackfillRootConfig),
    PipedriveDealBackfill(PipedriveDealBackfillConfig),
    PipedriveDealSync(PipedriveDealSyncConfig),
    IngestWebhook(WebhookEnvelope),
}

impl JobConfig {
    /// The wire value of the `source` discriminator.
    pub fn source_name(&self) -> &'static str {
        match self {
            JobConfig::SalesforceBackfillRoot(_) => "salesforce_backfill_root",
            JobConfig::SalesforceBackfill(_) => "salesforce_backfill",
            JobConfig::SalesforceObjectSync(_) => "salesforce_object_sync",
            JobConfig::GitlabMrBackfillRoot(_) => "gitlab_mr_backfill_root",
            JobConfig::GitlabMrBackfillProject(_) => "gitlab_mr_backfill_project",
            JobConfig::GitlabMrBackfill(_) => "gitlab_mr_backfill",
            JobConfig::GitlabMrIncrementalRoot(_) => "gitlab_mr_incremental_root",
            JobConfig::GitlabMrIncrementalProject(_) => "gitlab_mr_incremental_project",
            JobConfig::GitlabFileBackfillRoot(_) => "gitlab_file_backfill_root",
            JobConfig::GitlabFileBackfillProject(_) => "gitlab_file_backfill_project",
            JobConfig::GitlabFileBackfill(_) => "gitlab_file_backfill",
            JobConfig::GitlabFileIncrementalProject(_) => "gitlab_file_incremental_project",
            JobConfig::TeamworkBackfillRoot(_) => "teamwork_backfill_root",
            JobConfig::TeamworkTaskBackfill(_) => "teamwork_task_backfill",
            JobConfig::TeamworkIncremental(_) => "teamwork_incremental",
            JobConfig::TeamworkPrune(_) => "teamwork_prune",
            JobConfig::FirefliesFullBackfill(_) => "fireflies_full_backfill",
            JobConfig::FirefliesIncremental(_) => "fireflies_incremental",
            JobConfig::CanvaBackfillRoot(_) => "canva_backfill_root",
            JobConfig::CanvaDesignBackfill(_) => "canva_design_backfill",
            JobConfig::AttioRecordSync(_) => "attio_record_sync",
            JobConfig::PipedriveBackfillRoot(_) => "pipedrive_backfill_root",
            JobConfig::PipedriveDealBackfill(_) => "pipedrive_deal_backfill",
            JobConfig::PipedriveDealSync(_) => "pipedrive_deal_sync",
            JobConfig::IngestWebhook(_) => "ingest_webhook",
        }
    }

    pub fn tenant_id(&self) -> &str {
        match self {
            JobConfig::SalesforceBackfillRoot(c) => &c.tenant_id,
            JobConfig::SalesforceBackfill(c) => &c.tenant_id,
            JobConfig::SalesforceObjectSync(c) => &c.tenant_id,
            JobConfig::GitlabMrBackfillRoot(c) => &c.tenant_id,
            JobConfig::GitlabMrBackfillProject(c) => &c.tenant_id,
            JobConfig::GitlabMrBackfill(c) => &c.tenant_id,
            JobConfig::GitlabMrIncrementalRoot(c) => &c.tenant_id,
            JobConfig::GitlabMrIncrementalProject(c) => &c.tenant_id,
            JobConfig::GitlabFileBackfillRoot(c) => &c.tenant_id,
            JobConfig::GitlabFileBackfillProject(c) => &c.tenant_id,
            JobConfig::GitlabFileBackfill(c) => &c.tenant_id,
            JobConfig::GitlabFileIncrementalProject(c) => &c.tenant_id,
            JobConfig::TeamworkBackfillRoot(c) => &c.tenant_id,
            JobConfig::TeamworkTaskBackfill(c) => &c.tenant_id,
            JobConfig::TeamworkIncremental(c) => &c.tenant_id,
            JobConfig::TeamworkPrune(c) => &c.tenant_id,
            JobConfig::FirefliesFullBackfill(c) => &c.tenant_id,
            JobConfig::FirefliesIncremental(c) => &c.tenant_id,
            JobConfig::CanvaBackfillRoot(c) => &c.tenant_id,
            JobConfig::CanvaDesignBackfill(c) => &c.tenant_id,
            JobConfig::AttioRecordSync(c) => &c.tenant_id,
            JobConfig::PipedriveBackfillRoot(c) => &c.tenant_id,
            JobConfig::PipedriveDealBackfill(c) => &c.tenant_id,
            JobConfig::PipedriveDealSync(c) => &c.tenant_id,
            JobConfig::IngestWebhook(c) => &c.tenant_id,
        }
    }
}

/// A fire-and-forget request for the downstream transformer stage to
/// (re-)index a set of entities.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct IndexingRequest {
    pub entity_ids: Vec<String>,
    pub source: SourceKind,
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backfill_id: Option<String>,
    #[serde(default)]
    pub suppress_notification: bool,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn job_config_wire_format() {
        let config = JobConfig::SalesforceBackfill(SalesforceBackfillConfig {
            tenant_id: "tenant42".to_string(),
            backfill_id: Some("b-1".to_string()),
            suppress_notification: false,
            object_batches: vec![SalesforceObjectBatch {
                object_type: SalesforceObject::Account,
                record_ids: vec!["001ABC".to_string()],
            }],
        });

        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["source"], "salesforce_backfill");
        assert_eq!(value["tenant_id"], "tenant42");
        assert_eq!(value["object_batches"][0]["object_type"], "Account");

        let round: JobConfig = serde_json::from_value(value).unwrap();
        assert_eq!(round.source_name(), config.source_name());
        assert_eq!(round.tenant_id(), "tenant42");
    }

    #[test]
    fn discriminators_match_serde_tags() {
        let configs = vec![
            JobConfig::TeamworkIncremental(TeamworkIncrementalConfig {
                tenant_id: "t".to_string(),
                backfill_id: None,
                suppress_notification: true,
            }),
            JobConfig::FirefliesFullBackfill(FirefliesFullBackfillConfig {
                tenant_id: "t".to_string(),
                backfill_id: None,
                suppress_notification: false,
                duration_seconds: 780,
            }),
            JobConfig::GitlabFileBackfill(GitlabFileBackfillConfig {
                tenant_id: "t".to_string(),
                backfill_id: None,
                suppress_notification: false,
                project_id: 7,
                ref_sha: "abc".to_string(),
                file_paths: vec!["README.md".to_string()],
            }),
        ];
        for config in configs {
            let value = serde_json::to_value(&config).unwrap();
            assert_eq!(value["source"], config.source_name());
        }
    }

    #[test]
    fn webhook_envelopes_ride_the_same_union() {
        let envelope = WebhookEnvelope {
            tenant_id: "tenant42".to_string(),
            source_type: SourceKind::Salesforce,
            body: "{\"events\":[]}".to_string(),
            headers: BTreeMap::new(),
        };
        let value = serde_json::to_value(JobConfig::IngestWebhook(envelope)).unwrap();
        assert_eq!(value["source"], "ingest_webhook");
        assert_eq!(value["source_type"], "salesforce");

        let round: JobConfig = serde_json::from_value(value).unwrap();
        let JobConfig::IngestWebhook(envelope) = round else {
            panic!("expected an ingest_webhook config");
        };
        assert_eq!(envelope.body, "{\"events\":[]}");
    }

    #[test]
    fn fireflies_duration_defaults() {
        let config: FirefliesFullBackfillConfig =
            serde_json::from_value(serde_json::json!({"tenant_id": "t"})).unwrap();
        assert_eq!(config.duration_seconds, 780);
    }
}
