mod artifact;
mod cdc;
mod jobs;
pub mod lanes;
mod source;

pub use artifact::Artifact;
pub use cdc::{CdcOperation, SalesforceCdcEvent, SalesforceCdcWebhookBody};
pub use jobs::{
    AttioRecordSyncConfig, CanvaBackfillRootConfig, CanvaDesignBackfillConfig,
    FirefliesFullBackfillConfig, FirefliesIncrementalConfig, GitlabFileBackfillConfig,
    GitlabFileBackfillProjectConfig, GitlabFileBackfillRootConfig,
    GitlabFileIncrementalProjectConfig, GitlabMrBackfillConfig, GitlabMrBackfillProjectConfig,
    GitlabMrBackfillRootConfig, GitlabMrIncrementalProjectConfig, GitlabMrIncrementalRootConfig,
    IndexingRequest, JobConfig, PipedriveBackfillRootConfig, PipedriveDealBackfillConfig,
    PipedriveDealSyncConfig,
    SalesforceBackfillConfig, SalesforceBackfillRootConfig, SalesforceObjectBatch,
    SalesforceObjectSyncConfig, TeamworkBackfillRootConfig, TeamworkIncrementalConfig,
    TeamworkPruneConfig, TeamworkTaskBackfillConfig, WebhookEnvelope,
};
pub use source::{ArtifactEntity, SalesforceObject, SourceKind};
