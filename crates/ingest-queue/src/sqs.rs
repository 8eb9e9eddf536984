use crate::{payload, Error, Handle, PayloadStore, Queue, ReceivedMessage, Result};
use std::sync::Arc;
use std::time::Duration;

/// The production queue: an SQS high-throughput FIFO queue plus the S3
/// payload store for oversized bodies.
pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
    queue_url: String,
    payloads: Arc<dyn PayloadStore>,
}

impl SqsQueue {
    pub fn new(
        client: aws_sdk_sqs::Client,
        queue_url: String,
        payloads: Arc<dyn PayloadStore>,
    ) -> Self {
        Self {
            client,
            queue_url,
            payloads,
        }
    }

    fn backend_error<E>(operation: &'static str, err: E) -> Error
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Backend {
            operation,
            message: format!("{}", aws_sdk_sqs::error::DisplayErrorContext(&err)),
        }
    }
}

#[async_trait::async_trait]
impl Queue for SqsQueue {
    async fn send(&self, body: String, group_id: &str, dedup_id: Option<&str>) -> Result<()> {
        let body = payload::encode_body(self.payloads.as_ref(), body).await?;

        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .message_group_id(group_id)
            .set_message_deduplication_id(dedup_id.map(String::from))
            .send()
            .await
            .map_err(|err| Self::backend_error("send_message", err))?;
        Ok(())
    }

    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<ReceivedMessage>> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max.min(10) as i32)
            .wait_time_seconds(wait.as_secs().min(20) as i32)
            .send()
            .await
            .map_err(|err| Self::backend_error("receive_message", err))?;

        let mut received = Vec::new();
        for message in output.messages.unwrap_or_default() {
            let (Some(body), Some(receipt_handle)) = (message.body, message.receipt_handle) else {
                continue;
            };
            let body = payload::decode_body(self.payloads.as_ref(), body).await?;
            received.push(ReceivedMessage {
                body,
                handle: Handle(receipt_handle),
            });
        }
        Ok(received)
    }

    async fn delete(&self, handle: &Handle) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(&handle.0)
            .send()
            .await
            .map_err(|err| Self::backend_error("delete_message", err))?;
        Ok(())
    }

    async fn change_visibility(&self, handle: &Handle, timeout: Duration) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(&handle.0)
            .visibility_timeout(timeout.as_secs().min(43_200) as i32)
            .send()
            .await
            .map_err(|err| Self::backend_error("change_message_visibility", err))?;

        tracing::info!(
            timeout_secs = timeout.as_secs(),
            "extended message visibility"
        );
        Ok(())
    }
}
