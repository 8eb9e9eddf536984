//! Removal of an entity from everything downstream: the artifact store and
//! the tenant's index namespace. Connector-specific pruners bind the entity
//! kind and doc-id resolution and call [`delete_entity`].

use ingest_sql::ArtifactStore;
use models::ArtifactEntity;
use std::collections::HashSet;
use std::sync::Mutex;

/// The index namespace holding one tenant's documents.
pub fn tenant_namespace(tenant_id: &str) -> String {
    format!("tenant-{tenant_id}")
}

/// External collaborator: the downstream index.
#[async_trait::async_trait]
pub trait IndexWriter: Send + Sync {
    /// Delete a document from the tenant's namespace. Deleting an absent
    /// document is a success.
    async fn delete_document(&self, tenant_id: &str, doc_id: &str) -> anyhow::Result<()>;
}

/// Delete one entity from the artifact store and the index.
///
/// Returns `true` only when both deletions succeeded. A `false` return means
/// some trace may remain and the caller must not treat the entity as gone
/// (incremental extractors keep their cursor pinned on it).
pub async fn delete_entity<F>(
    artifacts: &ArtifactStore,
    index: &dyn IndexWriter,
    tenant_id: &str,
    entity: ArtifactEntity,
    entity_id: &str,
    doc_id_resolver: F,
) -> bool
where
    F: FnOnce(&str) -> String,
{
    let artifact_ok = match artifacts.delete(entity, entity_id).await {
        Ok(rows) => {
            tracing::debug!(tenant_id, entity = %entity, entity_id, rows, "deleted artifact");
            true
        }
        Err(err) => {
            tracing::warn!(tenant_id, entity = %entity, entity_id, ?err, "artifact delete failed");
            false
        }
    };

    let doc_id = doc_id_resolver(entity_id);
    let index_ok = match index.delete_document(tenant_id, &doc_id).await {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(tenant_id, doc_id, ?err, "index delete failed");
            false
        }
    };

    artifact_ok && index_ok
}

/// Why a previously indexed document is now stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// The source no longer returns the record.
    Deleted,
    /// The record's visibility flipped to private.
    Private,
    /// The source returned the record without a visibility flag; fail closed.
    MissingVisibility,
}

/// Index writer fake for tests: records deletions and can be told to fail
/// specific doc ids.
#[derive(Default)]
pub struct MemoryIndexWriter {
    deleted: Mutex<Vec<(String, String)>>,
    failing: Mutex<HashSet<String>>,
}

impl MemoryIndexWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, doc_id: &str) {
        self.failing.lock().unwrap().insert(doc_id.to_string());
    }

    pub fn deleted(&self) -> Vec<(String, String)> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl IndexWriter for MemoryIndexWriter {
    async fn delete_document(&self, tenant_id: &str, doc_id: &str) -> anyhow::Result<()> {
        if self.failing.lock().unwrap().contains(doc_id) {
            anyhow::bail!("injected index delete failure for {doc_id}");
        }
        self.deleted
            .lock()
            .unwrap()
            .push((tenant_id.to_string(), doc_id.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn namespace_shape() {
        assert_eq!(tenant_namespace("tenant42"), "tenant-tenant42");
    }

    #[tokio::test]
    async fn memory_writer_records_and_fails() {
        let writer = MemoryIndexWriter::new();
        writer
            .delete_document("t1", "teamwork_task_7001")
            .await
            .unwrap();
        writer.fail_on("teamwork_task_7002");
        assert!(writer
            .delete_document("t1", "teamwork_task_7002")
            .await
            .is_err());

        assert_eq!(
            writer.deleted(),
            vec![("t1".to_string(), "teamwork_task_7001".to_string())]
        );
    }
}
