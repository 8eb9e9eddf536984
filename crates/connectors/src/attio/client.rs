use crate::util::{items_array, redact_path};
use crate::JobContext;
use chrono::{DateTime, Utc};
use limiter::{retry, Error, RateLimit, RetryPolicy, TokenBucket};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const API_BASE: &str = "https://api.attio.com/v2";

/// Attio allows high request rates; this mostly smooths bursts.
pub const RATE_LIMIT: RateLimit = RateLimit::per_second(25);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RECORDS_PER_PAGE: usize = 500;
const OBJECT_CACHE_SIZE: usize = 128;

/// The standard objects synced when a tenant doesn't configure a list.
pub const DEFAULT_OBJECT_SLUGS: &[&str] = &["companies", "people", "deals"];

/// Attio API client for one (tenant, job). Object descriptors are cached
/// LRU-style; entries are immutable once fetched.
pub struct AttioClient {
    http: reqwest::Client,
    bucket: Arc<TokenBucket>,
    retry_policy: RetryPolicy,
    object_cache: Mutex<(HashMap<String, Value>, Vec<String>)>,
}

impl AttioClient {
    pub fn new(access_token: &str, bucket: Arc<TokenBucket>) -> limiter::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth: reqwest::header::HeaderValue = format!("Bearer {access_token}")
            .parse()
            .map_err(|_| Error::Api {
                status: 0,
                body: "access token is not a valid header value".to_string(),
            })?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        Ok(Self {
            http: reqwest::Client::builder()
                .default_headers(headers)
                .timeout(REQUEST_TIMEOUT)
                .build()
                .map_err(Error::from)?,
            bucket,
            retry_policy: RetryPolicy::default(),
            object_cache: Mutex::new((HashMap::new(), Vec::new())),
        })
    }

    async fn request_json(
        &self,
        method: reqwest::Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> limiter::Result<Value> {
        retry(self.retry_policy, "attio", || async {
            self.bucket.acquire().await;

            let url = format!("{API_BASE}{endpoint}");
            let mut request = self.http.request(method.clone(), &url);
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await?;
            let status = response.status();

            if status.as_u16() == 429 {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse().ok())
                    .unwrap_or(30);
                tracing::warn!(endpoint = %redact_path(endpoint), "Attio rate limit hit");
                return Err(Error::rate_limited(retry_after, "Attio rate limit"));
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(Error::from_status(status.as_u16(), body));
            }

            let text = response.text().await?;
            if text.trim().is_empty() {
                return Ok(Value::Object(Default::default()));
            }
            serde_json::from_str(&text).map_err(|err| {
                Error::Other(anyhow::Error::new(err).context("invalid Attio response JSON"))
            })
        })
        .await
    }

    /// Query one page of records, optionally filtered to those updated at or
    /// after `updated_after`.
    pub async fn query_records(
        &self,
        object_slug: &str,
        offset: usize,
        updated_after: Option<DateTime<Utc>>,
    ) -> limiter::Result<Vec<Value>> {
        let mut body = serde_json::json!({
            "limit": MAX_RECORDS_PER_PAGE,
            "offset": offset,
        });
        if let Some(updated_after) = updated_after {
            body["filter"] = serde_json::json!({
                "updated_at": {"$gte": updated_after.to_rfc3339()}
            });
        }

        let response = self
            .request_json(
                reqwest::Method::POST,
                &format!("/objects/{object_slug}/records/query"),
                Some(&body),
            )
            .await?;
        Ok(items_array(&response, "data"))
    }

    /// All records matching the filter, walking offset pages to exhaustion.
    pub async fn collect_records(
        &self,
        object_slug: &str,
        updated_after: Option<DateTime<Utc>>,
    ) -> limiter::Result<Vec<Value>> {
        let mut all_records = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.query_records(object_slug, offset, updated_after).await?;
            let count = page.len();
            all_records.extend(page);
            if count < MAX_RECORDS_PER_PAGE {
                break;
            }
            offset += count;
        }
        Ok(all_records)
    }

    /// Object descriptor by id or slug, LRU-cached.
    pub async fn get_object(&self, object_id_or_slug: &str) -> limiter::Result<Value> {
        if let Some(cached) = self.cache_get(object_id_or_slug) {
            return Ok(cached);
        }

        let response = self
            .request_json(
                reqwest::Method::GET,
                &format!("/objects/{object_id_or_slug}"),
                None,
            )
            .await?;
        let object = response.get("data").cloned().unwrap_or(response);
        self.cache_put(object_id_or_slug, object.clone());
        Ok(object)
    }

    fn cache_get(&self, key: &str) -> Option<Value> {
        let mut cache = self.object_cache.lock().unwrap();
        let (entries, order) = &mut *cache;
        let value = entries.get(key).cloned()?;
        // Move to the back of the eviction order.
        order.retain(|k| k != key);
        order.push(key.to_string());
        Some(value)
    }

    fn cache_put(&self, key: &str, value: Value) {
        let mut cache = self.object_cache.lock().unwrap();
        let (entries, order) = &mut *cache;
        if !entries.contains_key(key) && entries.len() >= OBJECT_CACHE_SIZE {
            if let Some(oldest) = order.first().cloned() {
                entries.remove(&oldest);
                order.remove(0);
            }
        }
        entries.insert(key.to_string(), value);
        order.retain(|k| k != key);
        order.push(key.to_string());
    }
}

pub async fn client_for_tenant(ctx: &JobContext, tenant_id: &str) -> limiter::Result<AttioClient> {
    let access_token = ctx
        .vault
        .get_api_key(tenant_id, "ATTIO_ACCESS_TOKEN")
        .await
        .map_err(|err| Error::Other(err.into()))?
        .ok_or_else(|| {
            Error::Other(anyhow::anyhow!(
                "no Attio access token configured for tenant {tenant_id}"
            ))
        })?;

    let bucket = ctx.limits.bucket(tenant_id, "attio", RATE_LIMIT);
    AttioClient::new(&access_token, bucket)
}
