//! Implementations of the external-collaborator seams the worker wires in:
//! the indexing hand-off queue, the index writer service, and the CDC
//! credential source.

use cdc::{CdcCredentials, SalesforceAuth};
use connectors::{IndexingTrigger, JobContext};
use ingest_queue::Queue;
use models::{lanes, IndexingRequest};
use pruner::IndexWriter;
use std::sync::Arc;
use std::time::Duration;

/// Hands indexing requests to the transformer stage through its own queue,
/// laned per tenant.
pub struct QueueIndexingTrigger {
    queue: Arc<dyn Queue>,
}

impl QueueIndexingTrigger {
    pub fn new(queue: Arc<dyn Queue>) -> Self {
        Self { queue }
    }
}

#[async_trait::async_trait]
impl IndexingTrigger for QueueIndexingTrigger {
    async fn trigger(&self, request: IndexingRequest) -> anyhow::Result<()> {
        let body = serde_json::to_string(&request)?;
        self.queue
            .send(body, &lanes::ingest_lane(&request.tenant_id), None)
            .await?;
        tracing::debug!(
            source = %request.source,
            tenant_id = %request.tenant_id,
            entities = request.entity_ids.len(),
            "triggered indexing"
        );
        Ok(())
    }
}

/// The downstream index writer service, addressed over HTTP. Deletes are
/// idempotent on the service side.
pub struct HttpIndexWriter {
    http: reqwest::Client,
    base_url: String,
}

impl HttpIndexWriter {
    pub fn new(base_url: String) -> anyhow::Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait::async_trait]
impl IndexWriter for HttpIndexWriter {
    async fn delete_document(&self, tenant_id: &str, doc_id: &str) -> anyhow::Result<()> {
        let namespace = pruner::tenant_namespace(tenant_id);
        let url = format!("{}/namespaces/{namespace}/documents", self.base_url);
        let response = self
            .http
            .delete(&url)
            .json(&serde_json::json!({"doc_id": doc_id}))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() && status.as_u16() != 404 {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("index writer delete failed ({status}): {body}");
        }
        Ok(())
    }
}

/// CDC credential source: rides the Salesforce client factory, so listeners
/// share the token refresh path (and its advisory lock) with extractors.
pub struct SalesforceCdcCredentials {
    ctx: JobContext,
}

impl SalesforceCdcCredentials {
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }
}

#[async_trait::async_trait]
impl CdcCredentials for SalesforceCdcCredentials {
    async fn fetch(&self, tenant_id: &str) -> anyhow::Result<SalesforceAuth> {
        let pool = self.ctx.pools.acquire(tenant_id).await?;
        let client = connectors::salesforce::client_for_tenant(&self.ctx, &pool, tenant_id).await?;
        Ok(SalesforceAuth {
            access_token: client.access_token.clone(),
            instance_url: client.instance_url().to_string(),
            org_id: client.org_id.clone(),
        })
    }
}
