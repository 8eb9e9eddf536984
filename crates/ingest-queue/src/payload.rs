use crate::{Error, Result, MAX_INLINE_MESSAGE_BYTES};
use std::collections::HashMap;
use std::sync::Mutex;

/// Pointer left in a queue body whose payload was offloaded.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PayloadPointer {
    pub bucket: String,
    pub key: String,
}

/// Wire shape of an offloaded body: an object with the single `s3_pointer`
/// key, so real job payloads can never be mistaken for one.
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct PointerBody {
    s3_pointer: PayloadPointer,
}

#[async_trait::async_trait]
pub trait PayloadStore: Send + Sync {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<PayloadPointer>;
    async fn get(&self, pointer: &PayloadPointer) -> Result<Vec<u8>>;
}

/// Offload `body` if it exceeds the inline cap, returning what should be
/// sent as the queue message.
pub async fn encode_body(store: &dyn PayloadStore, body: String) -> Result<String> {
    if body.len() <= MAX_INLINE_MESSAGE_BYTES {
        return Ok(body);
    }
    let key = uuid::Uuid::new_v4().to_string();
    let size = body.len();
    let pointer = store.put(&key, body.into_bytes()).await?;
    tracing::info!(key, size, "offloaded oversized queue payload");
    Ok(serde_json::to_string(&PointerBody { s3_pointer: pointer })?)
}

/// Dereference a received body if it is an offload pointer.
pub async fn decode_body(store: &dyn PayloadStore, body: String) -> Result<String> {
    let Ok(PointerBody { s3_pointer }) = serde_json::from_str::<PointerBody>(&body) else {
        return Ok(body);
    };
    let bytes = store.get(&s3_pointer).await?;
    String::from_utf8(bytes)
        .map_err(|_| Error::Payload(format!("payload {} is not UTF-8", s3_pointer.key)))
}

/// KMS-encrypted S3 payload store.
pub struct S3PayloadStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    kms_key_id: String,
}

impl S3PayloadStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: String, kms_key_id: String) -> Self {
        Self {
            client,
            bucket,
            kms_key_id,
        }
    }
}

#[async_trait::async_trait]
impl PayloadStore for S3PayloadStore {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<PayloadPointer> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(aws_sdk_s3::primitives::ByteStream::from(body))
            .server_side_encryption(aws_sdk_s3::types::ServerSideEncryption::AwsKms)
            .ssekms_key_id(&self.kms_key_id)
            .send()
            .await
            .map_err(|err| Error::Backend {
                operation: "put_object",
                message: format!("{}", aws_sdk_s3::error::DisplayErrorContext(&err)),
            })?;

        Ok(PayloadPointer {
            bucket: self.bucket.clone(),
            key: key.to_string(),
        })
    }

    async fn get(&self, pointer: &PayloadPointer) -> Result<Vec<u8>> {
        let output = self
            .client
            .get_object()
            .bucket(&pointer.bucket)
            .key(&pointer.key)
            .send()
            .await
            .map_err(|err| Error::Backend {
                operation: "get_object",
                message: format!("{}", aws_sdk_s3::error::DisplayErrorContext(&err)),
            })?;

        let bytes = output.body.collect().await.map_err(|err| Error::Backend {
            operation: "get_object",
            message: err.to_string(),
        })?;
        Ok(bytes.into_bytes().to_vec())
    }
}

/// In-memory payload store for tests.
#[derive(Default)]
pub struct MemoryPayloadStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryPayloadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl PayloadStore for MemoryPayloadStore {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<PayloadPointer> {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), body);
        Ok(PayloadPointer {
            bucket: "memory".to_string(),
            key: key.to_string(),
        })
    }

    async fn get(&self, pointer: &PayloadPointer) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&pointer.key)
            .cloned()
            .ok_or_else(|| Error::Payload(format!("no payload object {}", pointer.key)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn small_bodies_stay_inline() {
        let store = MemoryPayloadStore::new();
        let body = "{\"source\":\"teamwork_incremental\"}".to_string();
        let encoded = encode_body(&store, body.clone()).await.unwrap();
        assert_eq!(encoded, body);
        assert_eq!(store.object_count(), 0);
    }

    #[tokio::test]
    async fn oversized_bodies_round_trip_through_the_store() {
        let store = MemoryPayloadStore::new();
        let body = format!("{{\"padding\":\"{}\"}}", "x".repeat(MAX_INLINE_MESSAGE_BYTES));

        let encoded = encode_body(&store, body.clone()).await.unwrap();
        assert_ne!(encoded, body);
        assert!(encoded.len() < 1024);
        assert_eq!(store.object_count(), 1);

        let decoded = decode_body(&store, encoded).await.unwrap();
        assert_eq!(decoded, body);
    }

    #[tokio::test]
    async fn regular_bodies_never_parse_as_pointers() {
        let store = MemoryPayloadStore::new();
        // A body which happens to mention the field but has siblings.
        let body = "{\"s3_pointer\":{\"bucket\":\"b\",\"key\":\"k\"},\"other\":1}".to_string();
        let decoded = decode_body(&store, body.clone()).await.unwrap();
        assert_eq!(decoded, body);
    }
}
