//! Connectors: one module per third-party source, each bundling a typed
//! client, a credential factory, extractors, a sync-state service, and a
//! health check. The [`Extractor`] trait and [`JobContext`] are the seam the
//! worker harness drives; everything else is per-source.

use ingest_queue::Queue;
use ingest_sql::TenantPools;
use models::{IndexingRequest, JobConfig, SourceKind};
use pruner::IndexWriter;
use std::collections::HashMap;
use std::sync::Arc;
use vault::Vault;

pub mod attio;
pub mod canva;
pub mod figma;
pub mod fireflies;
pub mod gitlab;
pub mod health;
pub mod linear;
pub mod pipedrive;
pub mod posthog;
pub mod pylon;
pub mod salesforce;
pub mod teamwork;
pub mod util;

/// Indexing requests are issued in chunks of this many entity ids.
pub const INDEX_BATCH_SIZE: usize = 100;

/// Shared handles every job runs with. Constructed once per process and
/// injected; tests assemble one from in-memory fakes.
#[derive(Clone)]
pub struct JobContext {
    pub queue: Arc<dyn Queue>,
    pub vault: Arc<dyn Vault>,
    pub pools: Arc<TenantPools>,
    pub index: Arc<dyn IndexWriter>,
    pub indexing: Arc<dyn IndexingTrigger>,
    pub limits: Arc<limiter::Registry>,
}

/// Fire-and-forget hand-off to the downstream transformer stage.
#[async_trait::async_trait]
pub trait IndexingTrigger: Send + Sync {
    async fn trigger(&self, request: IndexingRequest) -> anyhow::Result<()>;
}

/// Issue indexing requests for `entity_ids` in [`INDEX_BATCH_SIZE`] chunks.
pub async fn trigger_indexing(
    trigger: &dyn IndexingTrigger,
    entity_ids: Vec<String>,
    source: SourceKind,
    tenant_id: &str,
    backfill_id: Option<&str>,
    suppress_notification: bool,
) -> anyhow::Result<()> {
    for chunk in entity_ids.chunks(INDEX_BATCH_SIZE) {
        trigger
            .trigger(IndexingRequest {
                entity_ids: chunk.to_vec(),
                source,
                tenant_id: tenant_id.to_string(),
                backfill_id: backfill_id.map(String::from),
                suppress_notification,
            })
            .await?;
    }
    Ok(())
}

/// Recording trigger for tests.
#[derive(Default)]
pub struct MemoryIndexingTrigger {
    requests: std::sync::Mutex<Vec<IndexingRequest>>,
}

impl MemoryIndexingTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<IndexingRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl IndexingTrigger for MemoryIndexingTrigger {
    async fn trigger(&self, request: IndexingRequest) -> anyhow::Result<()> {
        self.requests.lock().unwrap().push(request);
        Ok(())
    }
}

/// One job kind, end to end. Implementations parse their own config variant
/// and bail on a mismatched dispatch.
#[async_trait::async_trait]
pub trait Extractor: Send + Sync {
    /// The `source` discriminator this extractor consumes.
    fn source_name(&self) -> &'static str;

    async fn process_job(
        &self,
        ctx: &JobContext,
        job_id: uuid::Uuid,
        config: &JobConfig,
    ) -> anyhow::Result<()>;
}

/// Registry mapping `source` discriminators to extractors. Populated
/// explicitly at startup, in the style of the worker's executor server.
#[derive(Default)]
pub struct ExtractorRegistry {
    extractors: HashMap<&'static str, Arc<dyn Extractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, extractor: Arc<dyn Extractor>) -> Self {
        let name = extractor.source_name();
        if self.extractors.insert(name, extractor).is_some() {
            panic!("an Extractor for {name:?} is already registered");
        }
        self
    }

    pub fn get(&self, source: &str) -> Option<Arc<dyn Extractor>> {
        self.extractors.get(source).cloned()
    }

    pub fn source_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.extractors.keys().copied().collect();
        names.sort();
        names
    }
}

/// Short random id correlating a root backfill job with its descendants.
pub fn generate_backfill_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..16].to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn indexing_requests_chunk_at_the_batch_size() {
        let trigger = MemoryIndexingTrigger::new();
        let ids: Vec<String> = (0..250).map(|i| format!("salesforce_account_{i}")).collect();

        trigger_indexing(
            &trigger,
            ids,
            SourceKind::Salesforce,
            "tenant42",
            Some("b-1"),
            false,
        )
        .await
        .unwrap();

        let requests = trigger.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].entity_ids.len(), 100);
        assert_eq!(requests[1].entity_ids.len(), 100);
        assert_eq!(requests[2].entity_ids.len(), 50);
        assert!(requests.iter().all(|r| r.backfill_id.as_deref() == Some("b-1")));
    }

    #[test]
    fn backfill_ids_are_short_and_unique() {
        let a = generate_backfill_id();
        let b = generate_backfill_id();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }
}
