//! Figma connector: file listing per team. Team listings are small, so
//! [`FigmaClient::files_for_team`] buffers the full list rather than
//! streaming.

use crate::health::{HealthCheck, HealthStatus};
use crate::util::items_array;
use crate::JobContext;
use limiter::{retry, Error, RateLimit, RetryPolicy, TokenBucket};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const API_BASE: &str = "https://api.figma.com/v1";

pub const RATE_LIMIT: RateLimit = RateLimit::per_minute(60);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct FigmaClient {
    http: reqwest::Client,
    bucket: Arc<TokenBucket>,
    retry_policy: RetryPolicy,
}

impl FigmaClient {
    pub fn new(access_token: &str, bucket: Arc<TokenBucket>) -> limiter::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth: reqwest::header::HeaderValue =
            access_token.parse().map_err(|_| Error::Api {
                status: 0,
                body: "access token is not a valid header value".to_string(),
            })?;
        auth.set_sensitive(true);
        headers.insert("X-Figma-Token", auth);

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

    async fn get_json(&self, endpoint: &str) -> limiter::Result<Value> {
        retry(self.retry_policy, "figma", || async {
            self.bucket.acquire().await;

            let response = self.http.get(format!("{API_BASE}{endpoint}")).send().await?;
            let status = response.status();

            if status.as_u16() == 429 {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse().ok())
                    .unwrap_or(60);
                return Err(Error::rate_limited(retry_after, "Figma rate limit"));
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
        self.get_json("/me").await
    }

    pub async fn get_team_projects(&self, team_id: &str) -> limiter::Result<Vec<Value>> {
        let response = self.get_json(&format!("/teams/{team_id}/projects")).await?;
        Ok(items_array(&response, "projects"))
    }

    pub async fn get_project_files(&self, project_id: &str) -> limiter::Result<Vec<Value>> {
        let response = self.get_json(&format!("/projects/{project_id}/files")).await?;
        Ok(items_array(&response, "files"))
    }

    /// Every file in every project of a team, buffered.
    pub async fn files_for_team(&self, team_id: &str) -> limiter::Result<Vec<Value>> {
        let mut files = Vec::new();
        for project in self.get_team_projects(team_id).await? {
            let Some(project_id) = project.get("id").and_then(value_as_id) else {
                continue;
            };
            files.extend(self.get_project_files(&project_id).await?);
        }
        Ok(files)
    }
}

fn value_as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub async fn client_for_tenant(ctx: &JobContext, tenant_id: &str) -> limiter::Result<FigmaClient> {
    let access_token = ctx
        .vault
        .get_api_key(tenant_id, "FIGMA_ACCESS_TOKEN")
        .await
        .map_err(|err| Error::Other(err.into()))?
        .ok_or_else(|| {
            Error::Other(anyhow::anyhow!(
                "no Figma access token configured for tenant {tenant_id}"
            ))
        })?;
    let bucket = ctx.limits.bucket(tenant_id, "figma", RATE_LIMIT);
    FigmaClient::new(&access_token, bucket)
}

pub struct FigmaHealthCheck;

#[async_trait::async_trait]
impl HealthCheck for FigmaHealthCheck {
    fn source(&self) -> models::SourceKind {
        models::SourceKind::FigmaFile
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

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_normalize_numbers_and_strings() {
        assert_eq!(value_as_id(&json!("abc")), Some("abc".to_string()));
        assert_eq!(value_as_id(&json!(42)), Some("42".to_string()));
        assert_eq!(value_as_id(&json!(null)), None);
    }
}
