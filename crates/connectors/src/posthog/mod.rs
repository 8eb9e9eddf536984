//! PostHog connector: insight listing via offset pagination.

use crate::health::{HealthCheck, HealthStatus};
use crate::util::items_array;
use crate::JobContext;
use limiter::{retry, Error, RateLimit, RetryPolicy, TokenBucket};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const API_BASE: &str = "https://app.posthog.com";

/// Analytics endpoints allow 240 requests per minute.
pub const RATE_LIMIT: RateLimit = RateLimit::per_minute(240);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PAGE_LIMIT: usize = 100;

pub struct PosthogClient {
    http: reqwest::Client,
    bucket: Arc<TokenBucket>,
    retry_policy: RetryPolicy,
}

impl PosthogClient {
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
        retry(self.retry_policy, "posthog", || async {
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
                return Err(Error::rate_limited(retry_after, "PostHog rate limit"));
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
        self.get_json("/api/users/@me/", &[]).await
    }

    /// One page of insights; `next` is the offset of the following page.
    pub async fn get_insights(
        &self,
        project_id: &str,
        offset: usize,
    ) -> limiter::Result<(Vec<Value>, Option<usize>)> {
        let response = self
            .get_json(
                &format!("/api/projects/{project_id}/insights/"),
                &[
                    ("limit".to_string(), PAGE_LIMIT.to_string()),
                    ("offset".to_string(), offset.to_string()),
                ],
            )
            .await?;

        let insights = items_array(&response, "results");
        let next = response
            .get("next")
            .and_then(Value::as_str)
            .map(|_| offset + insights.len());
        Ok((insights, next))
    }
}

pub async fn client_for_tenant(ctx: &JobContext, tenant_id: &str) -> limiter::Result<PosthogClient> {
    let api_key = ctx
        .vault
        .get_api_key(tenant_id, "POSTHOG_API_KEY")
        .await
        .map_err(|err| Error::Other(err.into()))?
        .ok_or_else(|| {
            Error::Other(anyhow::anyhow!(
                "no PostHog API key configured for tenant {tenant_id}"
            ))
        })?;
    let bucket = ctx.limits.bucket(tenant_id, "posthog", RATE_LIMIT);
    PosthogClient::new(&api_key, bucket)
}

pub struct PosthogHealthCheck;

#[async_trait::async_trait]
impl HealthCheck for PosthogHealthCheck {
    fn source(&self) -> models::SourceKind {
        models::SourceKind::PosthogInsight
    }

    async fn check(&self, ctx: &JobContext, tenant_id: &str) -> HealthStatus {
        let client = match client_for_tenant(ctx, tenant_id).await {
            Ok(client) => client,
            Err(err) => return HealthStatus::unhealthy(format!("client setup: {err}")),
        };
        match client.get_me().await {
            Ok(me) => HealthStatus::healthy(format!(
                "authenticated as {}",
                me.get("email").and_then(|email| email.as_str()).unwrap_or("unknown")
            )),
            Err(err) => HealthStatus::unhealthy(format!("me probe failed: {err}")),
        }
    }
}
