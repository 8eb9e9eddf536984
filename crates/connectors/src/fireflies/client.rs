use crate::JobContext;
use chrono::{DateTime, Utc};
use limiter::{retry, Error, RateLimit, RetryPolicy, TokenBucket};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const API_URL: &str = "https://api.fireflies.ai/graphql";

/// Published limit: 60 requests per minute (free/pro tiers are far lower;
/// those tenants simply back off more).
pub const RATE_LIMIT: RateLimit = RateLimit::per_minute(60);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub const TRANSCRIPT_PAGE_SIZE: usize = 25;

const TRANSCRIPTS_QUERY: &str = r#"
query ($limit: Int, $skip: Int, $from_date: DateTime, $to_date: DateTime) {
  transcripts(limit: $limit, skip: $skip, fromDate: $from_date, toDate: $to_date) {
    id
    title
    dateString
    duration
    transcript_url
    organizer_email
    participants
    meeting_info { summary_status }
    speakers { id name }
    summary { notes }
    sentences { text speaker_id }
  }
}
"#;

const USERS_QUERY: &str = "query { users { user_id name } }";

/// Map a GraphQL `errors[]` array into the client error taxonomy.
/// `too_many_requests` carries a retry-at in epoch milliseconds.
pub fn classify_graphql_errors(errors: &[Value], now: DateTime<Utc>) -> Option<Error> {
    let code_of = |error: &Value| {
        error
            .pointer("/extensions/code")
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    if let Some(error) = errors
        .iter()
        .find(|error| code_of(error).as_deref() == Some("too_many_requests"))
    {
        let retry_at_ms = error
            .pointer("/extensions/metadata/retry_after")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let wait = ((retry_at_ms / 1000.0) - now.timestamp() as f64).max(0.0);
        return Some(Error::rate_limited(
            wait.ceil() as u64,
            "Fireflies GraphQL rate limit",
        ));
    }
    if errors
        .iter()
        .any(|error| code_of(error).as_deref() == Some("object_not_found"))
    {
        return Some(Error::NotFound);
    }
    if errors.is_empty() {
        None
    } else {
        Some(Error::Api {
            status: 200,
            body: serde_json::to_string(errors).unwrap_or_default(),
        })
    }
}

/// GraphQL client for the Fireflies API, one per (tenant, job).
pub struct FirefliesClient {
    http: reqwest::Client,
    bucket: Arc<TokenBucket>,
    retry_policy: RetryPolicy,
}

impl FirefliesClient {
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

    /// POST one GraphQL document. The `errors[]` array is inspected before
    /// the data is handed out.
    async fn graphql(&self, query: &str, variables: Value) -> limiter::Result<Value> {
        let payload = serde_json::json!({"query": query, "variables": variables});

        retry(self.retry_policy, "fireflies", || async {
            self.bucket.acquire().await;

            let response = self.http.post(API_URL).json(&payload).send().await?;
            let status = response.status();

            if status.is_server_error() {
                return Err(Error::rate_limited(
                    10,
                    format!("Fireflies server error {status}"),
                ));
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(Error::from_status(status.as_u16(), body));
            }

            let body: Value = response.json().await?;
            if let Some(errors) = body.get("errors").and_then(Value::as_array) {
                if let Some(err) = classify_graphql_errors(errors, Utc::now()) {
                    return Err(err);
                }
            }
            Ok(body.get("data").cloned().unwrap_or_default())
        })
        .await
    }

    /// One page of transcripts, newest first, bounded by the optional date
    /// range.
    pub async fn get_transcripts(
        &self,
        skip: usize,
        from_date: Option<DateTime<Utc>>,
        to_date: Option<DateTime<Utc>>,
    ) -> limiter::Result<Vec<Value>> {
        let data = self
            .graphql(
                TRANSCRIPTS_QUERY,
                serde_json::json!({
                    "limit": TRANSCRIPT_PAGE_SIZE,
                    "skip": skip,
                    "from_date": from_date.map(|date| date.to_rfc3339()),
                    "to_date": to_date.map(|date| date.to_rfc3339()),
                }),
            )
            .await?;
        Ok(data
            .get("transcripts")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    pub async fn get_users(&self) -> limiter::Result<Vec<Value>> {
        let data = self.graphql(USERS_QUERY, serde_json::json!({})).await?;
        Ok(data
            .get("users")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }
}

pub async fn client_for_tenant(
    ctx: &JobContext,
    tenant_id: &str,
) -> limiter::Result<FirefliesClient> {
    let api_key = ctx
        .vault
        .get_api_key(tenant_id, "FIREFLIES_API_KEY")
        .await
        .map_err(|err| Error::Other(err.into()))?
        .ok_or_else(|| {
            Error::Other(anyhow::anyhow!(
                "no Fireflies API key configured for tenant {tenant_id}"
            ))
        })?;

    let bucket = ctx.limits.bucket(tenant_id, "fireflies", RATE_LIMIT);
    FirefliesClient::new(&api_key, bucket)
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn rate_limit_errors_compute_the_wait_from_epoch_millis() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let retry_at_ms = (now.timestamp() + 42) * 1000;
        let errors = vec![json!({
            "message": "Too many requests",
            "extensions": {"code": "too_many_requests", "metadata": {"retry_after": retry_at_ms}},
        })];

        match classify_graphql_errors(&errors, now) {
            Some(Error::RateLimited { retry_after, .. }) => {
                assert_eq!(retry_after, Some(Duration::from_secs(42)));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn stale_rate_limit_hints_never_go_negative() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let errors = vec![json!({
            "extensions": {"code": "too_many_requests", "metadata": {"retry_after": 1000}},
        })];
        match classify_graphql_errors(&errors, now) {
            Some(Error::RateLimited { retry_after, .. }) => {
                assert_eq!(retry_after, Some(Duration::ZERO));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn not_found_and_generic_errors_map_to_the_taxonomy() {
        let not_found = vec![json!({"extensions": {"code": "object_not_found"}})];
        assert!(matches!(
            classify_graphql_errors(&not_found, Utc::now()),
            Some(Error::NotFound)
        ));

        let other = vec![json!({"message": "boom", "extensions": {"code": "forbidden"}})];
        assert!(matches!(
            classify_graphql_errors(&other, Utc::now()),
            Some(Error::Api { .. })
        ));

        assert!(classify_graphql_errors(&[], Utc::now()).is_none());
    }
}
