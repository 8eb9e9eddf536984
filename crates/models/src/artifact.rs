use crate::ArtifactEntity;

/// Artifact is the normalized, immutable snapshot of a source record.
/// Uniquely identified by (tenant, entity, entity_id); mutated only by
/// whole-row replacement through upsert, deleted only by the pruner or a
/// CDC DELETE.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Artifact {
    pub entity: ArtifactEntity,
    pub entity_id: String,
    /// Raw normalized API response.
    pub content: serde_json::Value,
    /// Small typed projection used for filtering downstream.
    pub metadata: serde_json::Value,
    pub ingest_job_id: uuid::Uuid,
    pub source_updated_at: chrono::DateTime<chrono::Utc>,
}
