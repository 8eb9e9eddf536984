//! Pylon connector: issue listing via cursor pagination.

use crate::health::{HealthCheck, HealthStatus};
use crate::util::items_array;
use crate::JobContext;
use limiter::{retry, Error, RateLimit, RetryPolicy, TokenBucket};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const API_BASE: &str = "https://api.usepylon.com";

/// Published limit: 100 requests per minute.
pub const RATE_LIMIT: RateLimit = RateLimit::per_minute(100);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct PylonClient {
    http: reqwest::Client,
    bucket: Arc<TokenBucket>,
    retry_policy: RetryPolicy,
}

impl PylonClient {
    pub fn new(api_key: &str, bucket: Arc<TokenBucket>) -> limiter::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth: reqwest::header::HeaderValue = format!("Bearer {api_key}")
            .parse()
            .map_err(|_| Error::Api {
                status: 0,
                body: "API key is not a valid header value".to_string(),
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
        })
    }

    async fn get_json(&self, endpoint: &str, params: &[(String, String)]) -> limiter::Result<Value> {
        retry(self.retry_policy, "pylon", || async {
            self.bucket.acquire().await;

            let response = self
                .http
                .get(format!("{API_BASE}{endpoint}"))
                .query(params)
                .send()
                .await?;
            let status = response.status();

            if status.as_u16() == 429 {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse().ok())
                    .unwrap_or(60);
                return Err(Error::rate_limited(retry_after, "Pylon rate limit"));
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(Error::from_status(status.as_u16(), body));
            }
            Ok(response.json().await?)
        })
        .await
    }

    pub async fn get_me(&self) -> limiter::Result<Value> {
        self.get_json("/me", &[]).await
    }

    /// One page of issues; pass the returned cursor to continue.
    pub async fn get_issues(
        &self,
        cursor: Option<&str>,
    ) -> limiter::Result<(Vec<Value>, Option<String>)> {
        let mut params = vec![("limit".to_string(), "100".to_string())];
        if let Some(cursor) = cursor {
            params.push(("cursor".to_string(), cursor.to_string()));
        }

        let response = self.get_json("/issues", &params).await?;
        let issues = items_array(&response, "data");
        let next_cursor = response
            .pointer("/pagination/cursor")
            .and_then(Value::as_str)
            .filter(|cursor| !cursor.is_empty())
            .map(str::to_string);
        Ok((issues, next_cursor))
    }
}

pub async fn client_for_tenant(ctx: &JobContext, tenant_id: &str) -> limiter::Result<PylonClient> {
    let api_key = ctx
        .vault
        .get_api_key(tenant_id, "PYLON_API_KEY")
        .await
        .map_err(|err| Error::Other(err.into()))?
        .ok_or_else(|| {
            Error::Other(anyhow::anyhow!(
                "no Pylon API key configured for tenant {tenant_id}"
            ))
        })?;
    let bucket = ctx.limits.bucket(tenant_id, "pylon", RATE_LIMIT);
    PylonClient::new(&api_key, bucket)
}

pub struct PylonHealthCheck;

#[async_trait::async_trait]
impl HealthCheck for PylonHealthCheck {
    fn source(&self) -> models::SourceKind {
        models::SourceKind::PylonIssue
    }

    async fn check(&self, ctx: &JobContext, tenant_id: &str) -> HealthStatus {
        let client = match client_for_tenant(ctx, tenant_id).await {
            Ok(client) => client,
            Err(err) => return HealthStatus::unhealthy(format!("client setup: {err}")),
        };
        match client.get_me().await {
            Ok(_) => HealthStatus::healthy("authenticated call succeeded"),
            Err(err) => HealthStatus::unhealthy(format!("me probe failed: {err}")),
        }
    }
}
