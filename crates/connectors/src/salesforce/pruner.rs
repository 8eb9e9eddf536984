use ingest_sql::ArtifactStore;
use models::SalesforceObject;
use pruner::IndexWriter;

/// Remove every trace of a Salesforce record: the artifact row and the
/// indexed document. The doc id convention matches the entity id.
pub async fn delete_record(
    artifacts: &ArtifactStore,
    index: &dyn IndexWriter,
    tenant_id: &str,
    object: SalesforceObject,
    record_id: &str,
) -> bool {
    let entity = object.entity();
    let entity_id = entity.entity_id(record_id);
    tracing::info!(tenant_id, %entity, record_id, "deleting Salesforce record");

    pruner::delete_entity(artifacts, index, tenant_id, entity, &entity_id, |entity_id| {
        entity_id.to_string()
    })
    .await
}
