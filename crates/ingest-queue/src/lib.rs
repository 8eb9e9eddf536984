//! Adapter over the ingest FIFO queue.
//!
//! Messages are JSON [`models::JobConfig`] bodies. Lanes (message groups)
//! serialize per-tenant work and per-record CDC updates; deduplication ids
//! collapse the duplicates produced by concurrently-subscribed CDC listeners.
//! Bodies above the queue's size cap transparently offload to the payload
//! store and are replaced by a pointer which [`Queue::receive`] dereferences.

use models::{lanes, JobConfig, WebhookEnvelope};
use std::time::Duration;

mod memory;
mod payload;
mod sqs;

pub use memory::MemoryQueue;
pub use payload::{MemoryPayloadStore, PayloadPointer, PayloadStore, S3PayloadStore};
pub use sqs::SqsQueue;

/// Queue message size cap (the SQS limit). Bodies above this offload to the
/// payload store.
pub const MAX_INLINE_MESSAGE_BYTES: usize = 256 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("queue {operation} failed: {message}")]
    Backend {
        operation: &'static str,
        message: String,
    },
    #[error("failed to encode or decode message body")]
    Serde(#[from] serde_json::Error),
    #[error("payload store error: {0}")]
    Payload(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Opaque redelivery handle for one received message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handle(pub String);

#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub body: String,
    pub handle: Handle,
}

impl ReceivedMessage {
    pub fn job_config(&self) -> Result<JobConfig> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

#[async_trait::async_trait]
pub trait Queue: Send + Sync {
    /// Send a raw body onto a lane, with optional explicit deduplication.
    async fn send(&self, body: String, group_id: &str, dedup_id: Option<&str>) -> Result<()>;

    /// Receive up to `max` messages, long-polling up to `wait`.
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<ReceivedMessage>>;

    /// Acknowledge and remove a message.
    async fn delete(&self, handle: &Handle) -> Result<()>;

    /// Extend (or shrink) the invisibility window of an in-flight message
    /// without acknowledging it.
    async fn change_visibility(&self, handle: &Handle, timeout: Duration) -> Result<()>;

    /// Enqueue a backfill/sync job on the tenant's ingest lane.
    async fn send_backfill_ingest(&self, config: &JobConfig) -> Result<()> {
        let body = serde_json::to_string(config)?;
        tracing::debug!(
            source = config.source_name(),
            tenant_id = config.tenant_id(),
            "enqueueing ingest job"
        );
        self.send(body, &lanes::ingest_lane(config.tenant_id()), None)
            .await
    }

    /// Enqueue a webhook/CDC envelope on an explicit lane with explicit
    /// deduplication.
    async fn send_ingest_webhook(
        &self,
        envelope: WebhookEnvelope,
        group_id: &str,
        dedup_id: &str,
    ) -> Result<()> {
        let body = serde_json::to_string(&JobConfig::IngestWebhook(envelope))?;
        self.send(body, group_id, Some(dedup_id)).await
    }
}
