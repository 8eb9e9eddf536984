use crate::util::{items_array, redact_path};
use chrono::{TimeZone, Utc};
use limiter::{retry, Error, RateLimit, RetryPolicy, TokenBucket};
use models::{Artifact, ArtifactEntity};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const API_BASE: &str = "https://api.canva.com/rest/v1";

/// Per-endpoint published limit: 100 requests per minute per user.
pub const RATE_LIMIT: RateLimit = RateLimit::per_minute(100);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the artifact for one design.
pub fn make_design_artifact(ingest_job_id: uuid::Uuid, design: Value) -> Option<Artifact> {
    let design_id = design.get("id")?.as_str()?.to_string();
    let source_updated_at = design
        .get("updated_at")
        .and_then(Value::as_i64)
        .and_then(|seconds| Utc.timestamp_opt(seconds, 0).single())
        .unwrap_or_else(Utc::now);

    Some(Artifact {
        entity: ArtifactEntity::CanvaDesign,
        entity_id: ArtifactEntity::CanvaDesign.entity_id(&design_id),
        metadata: serde_json::json!({
            "design_id": design_id,
            "title": design.get("title").cloned(),
            "owner": design.get("owner").cloned(),
            "page_count": design.get("page_count").cloned(),
        }),
        content: serde_json::json!({ "design_data": design }),
        ingest_job_id,
        source_updated_at,
    })
}

/// Connect API client for one (tenant, job). The access token is fresh for
/// roughly four hours; the factory refreshes on every construction.
pub struct CanvaClient {
    http: reqwest::Client,
    bucket: Arc<TokenBucket>,
    retry_policy: RetryPolicy,
}

impl CanvaClient {
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
            retry_policy: RetryPolicy::with_max_retries(3),
        })
    }

    async fn get_json(&self, endpoint: &str, params: &[(String, String)]) -> limiter::Result<Value> {
        retry(self.retry_policy, "canva", || async {
            self.bucket.acquire().await;

            let url = format!("{API_BASE}{endpoint}");
            let response = self.http.get(&url).query(params).send().await?;
            let status = response.status();

            if status.as_u16() == 429 {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse().ok())
                    .unwrap_or(60);
                tracing::warn!(endpoint = %redact_path(endpoint), retry_after, "Canva rate limit hit");
                return Err(Error::rate_limited(retry_after, "Canva rate limit"));
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
                Error::Other(anyhow::Error::new(err).context("invalid Canva response JSON"))
            })
        })
        .await
    }

    pub async fn get_current_user(&self) -> limiter::Result<Value> {
        self.get_json("/users/me", &[]).await
    }

    /// One page of designs; pass the continuation from the prior page.
    pub async fn list_designs(
        &self,
        continuation: Option<&str>,
    ) -> limiter::Result<(Vec<Value>, Option<String>)> {
        let mut params = vec![
            ("limit".to_string(), "100".to_string()),
            ("ownership".to_string(), "any".to_string()),
            ("sort_by".to_string(), "modified_descending".to_string()),
        ];
        if let Some(continuation) = continuation {
            params.push(("continuation".to_string(), continuation.to_string()));
        }

        let response = self.get_json("/designs", &params).await?;
        let designs = items_array(&response, "items");
        let next = response
            .get("continuation")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok((designs, next))
    }

    /// A single design's metadata, or `None` on 404.
    pub async fn get_design(&self, design_id: &str) -> limiter::Result<Option<Value>> {
        match self.get_json(&format!("/designs/{design_id}"), &[]).await {
            // The API nests under "design" on some surfaces and not others.
            Ok(response) => Ok(Some(
                response.get("design").cloned().unwrap_or(response),
            )),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn design_artifacts_convert_unix_timestamps() {
        let design = json!({
            "id": "DAF123",
            "title": "Launch deck",
            "updated_at": 1767312000,
            "page_count": 12,
        });
        let artifact = make_design_artifact(uuid::Uuid::new_v4(), design).unwrap();
        assert_eq!(artifact.entity_id, "canva_design_DAF123");
        assert_eq!(
            artifact.source_updated_at,
            Utc.timestamp_opt(1767312000, 0).single().unwrap()
        );
    }

    #[test]
    fn designs_without_ids_are_rejected() {
        assert!(make_design_artifact(uuid::Uuid::new_v4(), json!({"title": "x"})).is_none());
    }
}
