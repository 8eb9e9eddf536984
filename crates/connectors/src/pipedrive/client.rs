use crate::util::{items_array, parse_source_datetime, redact_path};
use chrono::{DateTime, Utc};
use limiter::{retry, Error, RateLimit, RetryPolicy, TokenBucket};
use models::{Artifact, ArtifactEntity};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Burst limit: a rolling two-second window per user; the daily token
/// budget is handled by backoff.
pub const RATE_LIMIT: RateLimit = RateLimit {
    requests: 90,
    window: Duration::from_secs(10),
    burst: 30,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RECORDS_PER_PAGE: usize = 100;

/// Build the artifact for one deal.
pub fn make_deal_artifact(ingest_job_id: uuid::Uuid, deal: Value) -> Option<Artifact> {
    let deal_id = deal.get("id")?.as_i64()?;
    let source_updated_at = deal
        .get("update_time")
        .and_then(Value::as_str)
        .and_then(parse_source_datetime)
        .unwrap_or_else(Utc::now);

    Some(Artifact {
        entity: ArtifactEntity::PipedriveDeal,
        entity_id: ArtifactEntity::PipedriveDeal.entity_id(deal_id),
        metadata: serde_json::json!({
            "deal_id": deal_id,
            "title": deal.get("title").cloned(),
            "status": deal.get("status").cloned(),
            "stage_id": deal.get("stage_id").cloned(),
        }),
        content: serde_json::json!({ "deal_data": deal }),
        ingest_job_id,
        source_updated_at,
    })
}

/// Pipedrive v2 REST client for one (tenant, job). The api domain is
/// company-specific; pagination is cursor-based.
pub struct PipedriveClient {
    http: reqwest::Client,
    api_domain: String,
    bucket: Arc<TokenBucket>,
    retry_policy: RetryPolicy,
}

impl PipedriveClient {
    pub fn new(
        access_token: &str,
        api_domain: &str,
        bucket: Arc<TokenBucket>,
    ) -> limiter::Result<Self> {
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
            api_domain: api_domain.trim_end_matches('/').to_string(),
            bucket,
            retry_policy: RetryPolicy::default(),
        })
    }

    async fn get_json(&self, endpoint: &str, params: &[(String, String)]) -> limiter::Result<Value> {
        retry(self.retry_policy, "pipedrive", || async {
            self.bucket.acquire().await;

            let url = format!("{}/api/v2{endpoint}", self.api_domain);
            let response = self.http.get(&url).query(params).send().await?;
            let status = response.status();

            if status.as_u16() == 429 {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse().ok())
                    .unwrap_or(10);
                tracing::warn!(endpoint = %redact_path(endpoint), "Pipedrive rate limit hit");
                return Err(Error::rate_limited(retry_after, "Pipedrive rate limit"));
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
                Error::Other(anyhow::Error::new(err).context("invalid Pipedrive response JSON"))
            })
        })
        .await
    }

    /// One page of deals, with the continuation cursor for the next.
    pub async fn get_deals(
        &self,
        cursor: Option<&str>,
        updated_after: Option<DateTime<Utc>>,
    ) -> limiter::Result<(Vec<Value>, Option<String>)> {
        let mut params = vec![
            ("limit".to_string(), MAX_RECORDS_PER_PAGE.to_string()),
            ("sort_by".to_string(), "update_time".to_string()),
            ("sort_direction".to_string(), "desc".to_string()),
        ];
        if let Some(cursor) = cursor {
            params.push(("cursor".to_string(), cursor.to_string()));
        }
        if let Some(updated_after) = updated_after {
            params.push((
                "updated_since".to_string(),
                updated_after.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            ));
        }

        let response = self.get_json("/deals", &params).await?;
        let deals = items_array(&response, "data");
        let next_cursor = response
            .pointer("/additional_data/next_cursor")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok((deals, next_cursor))
    }

    /// Every deal matching the filter, following cursors to exhaustion.
    pub async fn collect_deals(
        &self,
        updated_after: Option<DateTime<Utc>>,
    ) -> limiter::Result<Vec<Value>> {
        let mut all_deals = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let (deals, next_cursor) = self.get_deals(cursor.as_deref(), updated_after).await?;
            // Termination: an empty cursor together with a partial page.
            let done = next_cursor.is_none() && deals.len() < MAX_RECORDS_PER_PAGE;
            all_deals.extend(deals);
            if next_cursor.is_none() || done {
                break;
            }
            cursor = next_cursor;
        }
        Ok(all_deals)
    }

    /// A single deal, or `None` on 404.
    pub async fn get_deal(&self, deal_id: i64) -> limiter::Result<Option<Value>> {
        match self.get_json(&format!("/deals/{deal_id}"), &[]).await {
            Ok(response) => Ok(response.get("data").cloned().filter(|data| !data.is_null())),
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
    fn deal_artifacts_key_on_the_deal_id() {
        let deal = json!({
            "id": 501,
            "title": "Enterprise plan",
            "status": "open",
            "update_time": "2026-01-20T09:30:00Z",
        });
        let artifact = make_deal_artifact(uuid::Uuid::new_v4(), deal).unwrap();
        assert_eq!(artifact.entity_id, "pipedrive_deal_501");
        assert_eq!(artifact.metadata["title"], "Enterprise plan");
    }
}
