use crate::JobContext;
use chrono::{DateTime, Utc};
use limiter::{retry, Error, RateLimit, RetryPolicy, TokenBucket};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const API_URL: &str = "https://api.linear.app/graphql";

/// Standard plan: 1500 requests per hour; complexity budgets bite first for
/// heavy queries and are handled by backoff.
pub const RATE_LIMIT: RateLimit = RateLimit {
    requests: 1500,
    window: Duration::from_secs(3600),
    burst: 25,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Bounds applied to every computed wait.
const MIN_RETRY_SECS: u64 = 1;
const MAX_RETRY_SECS: u64 = 300;

/// Derive a wait from Linear's millisecond-epoch reset headers. The
/// endpoint-specific reset wins, then requests, then complexity.
pub fn retry_from_headers(
    reset_headers: &[Option<&str>],
    now: DateTime<Utc>,
) -> Option<u64> {
    for reset in reset_headers.iter().flatten() {
        let Ok(reset_ms) = reset.parse::<i64>() else {
            continue;
        };
        let wait = (reset_ms / 1000) - now.timestamp() + 1; // 1s buffer
        return Some((wait.max(MIN_RETRY_SECS as i64) as u64).min(MAX_RETRY_SECS));
    }
    None
}

/// Derive a wait from `extensions.meta.rateLimitResult` using the leaky
/// bucket's refill rate: wait long enough for a couple of tokens so the
/// next request isn't immediately re-limited.
pub fn retry_from_rate_limit_meta(extensions: &Value) -> u64 {
    let rate_limit = extensions.pointer("/meta/rateLimitResult");
    let limit = rate_limit
        .and_then(|meta| meta.get("limit"))
        .and_then(Value::as_f64);
    let duration_ms = rate_limit
        .and_then(|meta| meta.get("duration"))
        .and_then(Value::as_f64);

    if let (Some(limit), Some(duration_ms)) = (limit, duration_ms) {
        if limit > 0.0 && duration_ms > 0.0 {
            let refill_per_sec = limit / (duration_ms / 1000.0);
            let secs_per_token = 1.0 / refill_per_sec;
            let tokens_to_wait = if refill_per_sec >= 1.0 { 2.0 } else { 1.0 };
            let wait = (secs_per_token * tokens_to_wait) as u64 + 1;
            return wait.clamp(MIN_RETRY_SECS, MAX_RETRY_SECS);
        }
    }
    // Fallback: the documented standard refill is ~2.4s per request.
    5
}

/// GraphQL client for the Linear API, one per (tenant, job).
pub struct LinearClient {
    http: reqwest::Client,
    bucket: Arc<TokenBucket>,
    retry_policy: RetryPolicy,
}

impl LinearClient {
    pub fn new(token: &str, bucket: Arc<TokenBucket>) -> limiter::Result<Self> {
        if token.is_empty() {
            return Err(Error::Other(anyhow::anyhow!(
                "Linear token cannot be empty"
            )));
        }
        let mut headers = reqwest::header::HeaderMap::new();
        // Linear expects the raw token, not a Bearer prefix.
        let mut auth: reqwest::header::HeaderValue =
            token.parse().map_err(|_| Error::Api {
                status: 0,
                body: "token is not a valid header value".to_string(),
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

    async fn graphql(&self, query: &str, variables: Value) -> limiter::Result<Value> {
        let payload = serde_json::json!({"query": query, "variables": variables});

        retry(self.retry_policy, "linear", || async {
            self.bucket.acquire().await;

            let response = self.http.post(API_URL).json(&payload).send().await?;
            let status = response.status();

            let reset_headers: Vec<Option<String>> = [
                "x-ratelimit-endpoint-requests-reset",
                "x-ratelimit-requests-reset",
                "x-ratelimit-complexity-reset",
            ]
            .iter()
            .map(|name| {
                response
                    .headers()
                    .get(*name)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string)
            })
            .collect();

            let body: Value = match response.json().await {
                Ok(body) => body,
                Err(_) if status.as_u16() == 429 => {
                    return Err(Error::rate_limited(60, "Linear HTTP 429"));
                }
                Err(err) => return Err(Error::from(err)),
            };

            // Linear reports rate limiting as a GraphQL error with HTTP 400,
            // so the errors array is inspected before the status.
            if let Some(errors) = body.get("errors").and_then(Value::as_array) {
                for error in errors {
                    let extensions = error.get("extensions").cloned().unwrap_or_default();
                    if extensions.get("code").and_then(Value::as_str) == Some("RATELIMITED") {
                        let borrowed: Vec<Option<&str>> =
                            reset_headers.iter().map(Option::as_deref).collect();
                        let wait = retry_from_headers(&borrowed, Utc::now())
                            .unwrap_or_else(|| retry_from_rate_limit_meta(&extensions));
                        tracing::warn!(wait, "Linear GraphQL rate limit hit");
                        return Err(Error::rate_limited(wait, "Linear GraphQL rate limit"));
                    }
                }
                return Err(Error::Api {
                    status: status.as_u16(),
                    body: serde_json::to_string(errors).unwrap_or_default(),
                });
            }

            if !status.is_success() {
                return Err(Error::from_status(status.as_u16(), body.to_string()));
            }
            Ok(body.get("data").cloned().unwrap_or_default())
        })
        .await
    }

    pub async fn get_viewer(&self) -> limiter::Result<Value> {
        let data = self
            .graphql("query { viewer { id name } }", serde_json::json!({}))
            .await?;
        Ok(data.get("viewer").cloned().unwrap_or_default())
    }

    /// Public (non-private) teams visible to the token.
    pub async fn get_public_teams(&self) -> limiter::Result<Vec<Value>> {
        let query = r#"
        query {
            teams(filter: { private: { eq: false } }) {
                nodes { id name }
            }
        }"#;
        let data = self.graphql(query, serde_json::json!({})).await?;
        Ok(data
            .pointer("/teams/nodes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// One page of issue ids, with the cursor for the next page.
    pub async fn get_issue_ids(
        &self,
        team_id: Option<&str>,
        after: Option<&str>,
    ) -> limiter::Result<(Vec<String>, Option<String>)> {
        let filter = match team_id {
            Some(team_id) => format!("filter: {{ team: {{ id: {{ eq: \"{team_id}\" }} }} }},"),
            None => String::new(),
        };
        let query = format!(
            r#"
            query($first: Int, $after: String) {{
                issues(first: $first, after: $after, {filter} includeArchived: false) {{
                    nodes {{ id }}
                    pageInfo {{ hasNextPage endCursor }}
                }}
            }}"#
        );
        let data = self
            .graphql(
                &query,
                serde_json::json!({"first": 100, "after": after}),
            )
            .await?;

        let ids = data
            .pointer("/issues/nodes")
            .and_then(Value::as_array)
            .map(|nodes| {
                nodes
                    .iter()
                    .filter_map(|node| node.get("id")?.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let has_next = data
            .pointer("/issues/pageInfo/hasNextPage")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let cursor = has_next
            .then(|| {
                data.pointer("/issues/pageInfo/endCursor")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .flatten();
        Ok((ids, cursor))
    }
}

/// Linear tokens: prefer the OAuth access token, fall back to legacy API
/// keys.
pub async fn client_for_tenant(ctx: &JobContext, tenant_id: &str) -> limiter::Result<LinearClient> {
    let token = match ctx
        .vault
        .get_api_key(tenant_id, "LINEAR_ACCESS_TOKEN")
        .await
        .map_err(|err| Error::Other(err.into()))?
    {
        Some(token) => token,
        None => ctx
            .vault
            .get_api_key(tenant_id, "LINEAR_API_KEY")
            .await
            .map_err(|err| Error::Other(err.into()))?
            .ok_or_else(|| {
                Error::Other(anyhow::anyhow!(
                    "no Linear token configured for tenant {tenant_id}"
                ))
            })?,
    };

    let bucket = ctx.limits.bucket(tenant_id, "linear", RATE_LIMIT);
    LinearClient::new(&token, bucket)
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn header_resets_win_and_are_bounded() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let reset_ms = ((now.timestamp() + 42) * 1000).to_string();

        let wait = retry_from_headers(&[Some(reset_ms.as_str())], now).unwrap();
        assert_eq!(wait, 43); // 42s remaining + 1s buffer

        // Past resets clamp up to the minimum, far futures clamp down.
        let stale_ms = ((now.timestamp() - 100) * 1000).to_string();
        assert_eq!(retry_from_headers(&[Some(stale_ms.as_str())], now), Some(1));
        let far_ms = ((now.timestamp() + 100_000) * 1000).to_string();
        assert_eq!(retry_from_headers(&[Some(far_ms.as_str())], now), Some(300));

        // Unparsable or missing headers fall through.
        assert_eq!(retry_from_headers(&[Some("soon"), None], now), None);
        assert_eq!(retry_from_headers(&[], now), None);
    }

    #[test]
    fn leaky_bucket_meta_math() {
        // 1500 requests per hour: 0.417 req/s, 2.4s per token, wait 1 token.
        let extensions = json!({
            "meta": {"rateLimitResult": {"limit": 1500, "duration": 3_600_000}}
        });
        assert_eq!(retry_from_rate_limit_meta(&extensions), 3);

        // A fast bucket waits for two tokens.
        let fast = json!({
            "meta": {"rateLimitResult": {"limit": 10, "duration": 1000}}
        });
        assert_eq!(retry_from_rate_limit_meta(&fast), 1);

        // Malformed metadata falls back to the documented default.
        assert_eq!(retry_from_rate_limit_meta(&json!({})), 5);
        let zero = json!({"meta": {"rateLimitResult": {"limit": 0, "duration": 0}}});
        assert_eq!(retry_from_rate_limit_meta(&zero), 5);
    }
}
