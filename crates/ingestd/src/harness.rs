//! The worker loop: receive queue messages, dispatch them to extractors,
//! and translate job outcomes back into queue operations.
//!
//! Outcome handling follows the error taxonomy:
//! - success deletes the message;
//! - `ExtendVisibility` extends the invisibility window and yields, so the
//!   job redelivers after the wait without burning a worker slot;
//! - `AuthFailed` acknowledges the message (redelivering it would loop
//!   forever) and surfaces to the operator;
//! - everything else leaves the message for redelivery, and ultimately the
//!   queue's dead-letter policy.

use connectors::{ExtractorRegistry, JobContext};
use ingest_queue::{Queue, ReceivedMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const RECEIVE_WAIT: Duration = Duration::from_secs(20);

pub struct Worker {
    pub ctx: JobContext,
    pub registry: Arc<ExtractorRegistry>,
    pub permits: u32,
}

impl Worker {
    /// Consume jobs until `shutdown` flips true, then drain in-flight work.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) {
        let Worker {
            ctx,
            registry,
            permits,
        } = self;
        let semaphore = Arc::new(tokio::sync::Semaphore::new(permits as usize));

        tracing::info!(
            permits,
            sources = ?registry.source_names(),
            "worker serving ingest queue"
        );

        loop {
            // Block until at least one slot is free.
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => permit.expect("semaphore closed"),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                    continue;
                }
            };

            let messages = tokio::select! {
                received = ctx.queue.receive(1 + semaphore.available_permits(), RECEIVE_WAIT) => received,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                    continue;
                }
            };
            let messages = match messages {
                Ok(messages) => messages,
                Err(err) => {
                    tracing::error!(?err, "failed to receive from ingest queue (will retry)");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let mut messages = messages.into_iter();
            let Some(first) = messages.next() else {
                continue; // Idle long poll.
            };

            spawn_job(&ctx, &registry, first, permit);
            for message in messages {
                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    // Out of slots: the unstarted messages simply time out
                    // back onto the queue.
                    break;
                };
                spawn_job(&ctx, &registry, message, permit);
            }
        }

        tracing::info!("worker loop signaled to stop; awaiting running jobs");
        let _ = semaphore.acquire_many_owned(permits).await;
    }
}

fn spawn_job(
    ctx: &JobContext,
    registry: &Arc<ExtractorRegistry>,
    message: ReceivedMessage,
    permit: tokio::sync::OwnedSemaphorePermit,
) {
    let ctx = ctx.clone();
    let registry = registry.clone();
    tokio::spawn(async move {
        let _permit = permit;
        handle_message(&ctx, &registry, message).await;
    });
}

pub async fn handle_message(
    ctx: &JobContext,
    registry: &ExtractorRegistry,
    message: ReceivedMessage,
) {
    let config = match message.job_config() {
        Ok(config) => config,
        Err(err) => {
            // Invalid payloads redeliver until the dead-letter policy claims
            // them; operators inspect the DLQ.
            tracing::error!(?err, "invalid job payload; leaving for redelivery");
            return;
        }
    };
    let job_id = uuid::Uuid::new_v4();
    let source = config.source_name();

    let Some(extractor) = registry.get(source) else {
        tracing::error!(source, "no extractor registered; leaving for redelivery");
        return;
    };

    tracing::info!(source, %job_id, tenant_id = config.tenant_id(), "processing job");
    match extractor.process_job(ctx, job_id, &config).await {
        Ok(()) => {
            if let Err(err) = ctx.queue.delete(&message.handle).await {
                tracing::error!(?err, "failed to acknowledge completed job");
            }
        }
        Err(err) => match control_error(&err) {
            Some(limiter::Error::ExtendVisibility(timeout)) => {
                let timeout = *timeout;
                tracing::info!(
                    source,
                    %job_id,
                    timeout_secs = timeout.as_secs(),
                    "job yielded; extending message visibility"
                );
                if let Err(err) = ctx.queue.change_visibility(&message.handle, timeout).await {
                    tracing::error!(?err, "failed to extend message visibility");
                }
            }
            Some(limiter::Error::AuthFailed { status, .. }) => {
                tracing::error!(
                    source,
                    %job_id,
                    status,
                    "job failed authentication; acknowledging to avoid a redelivery loop"
                );
                if let Err(err) = ctx.queue.delete(&message.handle).await {
                    tracing::error!(?err, "failed to acknowledge auth-failed job");
                }
            }
            _ => {
                tracing::error!(source, %job_id, err = ?err, "job failed; returning to queue");
            }
        },
    }
}

/// Find a typed client/control error anywhere in the chain.
fn control_error(err: &anyhow::Error) -> Option<&limiter::Error> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<limiter::Error>())
}

#[cfg(test)]
mod test {
    use super::*;
    use connectors::{Extractor, MemoryIndexingTrigger};
    use ingest_queue::MemoryQueue;
    use ingest_sql::TenantPools;
    use models::{JobConfig, TeamworkIncrementalConfig};
    use pruner::MemoryIndexWriter;
    use std::sync::atomic::{AtomicU32, Ordering};
    use vault::MemoryVault;

    fn test_ctx(queue: Arc<MemoryQueue>) -> JobContext {
        let vault = Arc::new(MemoryVault::new());
        JobContext {
            queue,
            vault: vault.clone(),
            pools: Arc::new(TenantPools::new(vault, 4)),
            index: Arc::new(MemoryIndexWriter::new()),
            indexing: Arc::new(MemoryIndexingTrigger::new()),
            limits: Arc::new(limiter::Registry::new()),
        }
    }

    struct ScriptedExtractor {
        calls: AtomicU32,
        result: fn(u32) -> anyhow::Result<()>,
    }

    #[async_trait::async_trait]
    impl Extractor for ScriptedExtractor {
        fn source_name(&self) -> &'static str {
            "teamwork_incremental"
        }

        async fn process_job(
            &self,
            _ctx: &JobContext,
            _job_id: uuid::Uuid,
            _config: &JobConfig,
        ) -> anyhow::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            (self.result)(call)
        }
    }

    fn job_body() -> String {
        serde_json::to_string(&JobConfig::TeamworkIncremental(TeamworkIncrementalConfig {
            tenant_id: "tenant42".to_string(),
            backfill_id: None,
            suppress_notification: false,
        }))
        .unwrap()
    }

    async fn receive_one(queue: &MemoryQueue) -> ReceivedMessage {
        queue
            .receive(1, Duration::ZERO)
            .await
            .unwrap()
            .into_iter()
            .next()
            .expect("expected a deliverable message")
    }

    #[tokio::test(start_paused = true)]
    async fn successful_jobs_are_acknowledged() {
        let queue = Arc::new(MemoryQueue::new());
        let ctx = test_ctx(queue.clone());
        let registry = ExtractorRegistry::new().register(Arc::new(ScriptedExtractor {
            calls: AtomicU32::new(0),
            result: |_| Ok(()),
        }));

        queue.send(job_body(), "lane", None).await.unwrap();
        let message = receive_one(&queue).await;
        handle_message(&ctx, &registry, message).await;

        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn extend_visibility_delays_redelivery_without_acking() {
        let queue = Arc::new(MemoryQueue::with_visibility(Duration::from_secs(30)));
        let ctx = test_ctx(queue.clone());
        let registry = ExtractorRegistry::new().register(Arc::new(ScriptedExtractor {
            calls: AtomicU32::new(0),
            result: |_| {
                Err(anyhow::Error::new(limiter::Error::ExtendVisibility(
                    Duration::from_secs(45),
                )))
            },
        }));

        queue.send(job_body(), "lane", None).await.unwrap();
        let message = receive_one(&queue).await;
        handle_message(&ctx, &registry, message).await;

        // Still queued, but invisible for the extended window.
        assert_eq!(queue.len(), 1);
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(queue.receive(1, Duration::ZERO).await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(queue.receive(1, Duration::ZERO).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failures_are_acked_not_retried() {
        let queue = Arc::new(MemoryQueue::new());
        let ctx = test_ctx(queue.clone());
        let registry = ExtractorRegistry::new().register(Arc::new(ScriptedExtractor {
            calls: AtomicU32::new(0),
            result: |_| {
                Err(anyhow::Error::new(limiter::Error::AuthFailed {
                    status: 401,
                    body: "expired".to_string(),
                })
                .context("while fetching records"))
            },
        }));

        queue.send(job_body(), "lane", None).await.unwrap();
        let message = receive_one(&queue).await;
        handle_message(&ctx, &registry, message).await;

        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn other_failures_return_to_the_queue() {
        let queue = Arc::new(MemoryQueue::with_visibility(Duration::from_secs(5)));
        let ctx = test_ctx(queue.clone());
        let registry = ExtractorRegistry::new().register(Arc::new(ScriptedExtractor {
            calls: AtomicU32::new(0),
            result: |_| Err(anyhow::anyhow!("transient parse failure")),
        }));

        queue.send(job_body(), "lane", None).await.unwrap();
        let message = receive_one(&queue).await;
        handle_message(&ctx, &registry, message).await;

        assert_eq!(queue.len(), 1);
        tokio::time::sleep(Duration::from_secs(6)).await;
        // Redelivered after the default visibility window.
        assert_eq!(queue.receive(1, Duration::ZERO).await.unwrap().len(), 1);
    }
}
