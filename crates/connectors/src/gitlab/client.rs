use crate::util::{redact_path, redact_token};
use crate::JobContext;
use chrono::{DateTime, Utc};
use limiter::{retry, Error, RateLimit, RetryPolicy, TokenBucket};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_PER_PAGE: usize = 100;
const MAX_PER_PAGE: usize = 100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Published limit: 5 requests per second per token.
pub const RATE_LIMIT: RateLimit = RateLimit::per_second(5);

/// Percent-encode one path segment (file paths include `/`, which must
/// render as `%2F` inside the URL path).
fn encode_path_segment(segment: &str) -> String {
    let mut encoded = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char)
            }
            other => encoded.push_str(&format!("%{other:02X}")),
        }
    }
    encoded
}

/// Typed façade over the GitLab v4 REST API for one (tenant, job).
pub struct GitlabClient {
    http: reqwest::Client,
    base_url: String,
    per_page: usize,
    bucket: Arc<TokenBucket>,
    retry_policy: RetryPolicy,
}

impl GitlabClient {
    pub fn new(
        host: &str,
        access_token: &str,
        per_page: usize,
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
            base_url: format!("{}/api/v4", host.trim_end_matches('/')),
            per_page: per_page.min(MAX_PER_PAGE),
            bucket,
            retry_policy: RetryPolicy::default(),
        })
    }

    /// One GET, returning the parsed body and the `x-total-pages` header.
    async fn get_json(
        &self,
        endpoint: &str,
        params: &[(String, String)],
    ) -> limiter::Result<(Value, Option<u32>)> {
        retry(self.retry_policy, "gitlab", || async {
            self.bucket.acquire().await;

            let url = format!("{}{endpoint}", self.base_url);
            let response = self.http.get(&url).query(params).send().await?;
            let status = response.status();

            if status.as_u16() == 429 {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse().ok())
                    .unwrap_or(60);
                tracing::warn!(endpoint = %redact_path(endpoint), "GitLab rate limit hit");
                return Err(Error::rate_limited(retry_after, "GitLab rate limit"));
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(Error::from_status(status.as_u16(), body));
            }

            let total_pages = response
                .headers()
                .get("x-total-pages")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse().ok());

            let text = response.text().await?;
            if text.trim().is_empty() {
                return Ok((Value::Object(Default::default()), total_pages));
            }
            let value = serde_json::from_str(&text).map_err(|err| {
                Error::Other(anyhow::Error::new(err).context("invalid GitLab response JSON"))
            })?;
            Ok((value, total_pages))
        })
        .await
    }

    /// Raw (non-JSON) GET, for file contents.
    async fn get_raw(&self, endpoint: &str, params: &[(String, String)]) -> limiter::Result<Vec<u8>> {
        retry(self.retry_policy, "gitlab", || async {
            self.bucket.acquire().await;

            let url = format!("{}{endpoint}", self.base_url);
            let response = self.http.get(&url).query(params).send().await?;
            let status = response.status();

            if status.as_u16() == 429 {
                return Err(Error::rate_limited(60, "GitLab rate limit"));
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(Error::from_status(status.as_u16(), body));
            }
            Ok(response.bytes().await?.to_vec())
        })
        .await
    }

    /// Page-number pagination: increment `page` until the `x-total-pages`
    /// header says we're done, or a short page arrives.
    async fn get_paginated(
        &self,
        endpoint: &str,
        params: &[(String, String)],
    ) -> limiter::Result<Vec<Value>> {
        let mut all_items = Vec::new();
        let mut page: u32 = 1;

        loop {
            let mut page_params = params.to_vec();
            page_params.push(("per_page".to_string(), self.per_page.to_string()));
            page_params.push(("page".to_string(), page.to_string()));

            let (value, total_pages) = self.get_json(endpoint, &page_params).await?;
            let items = value.as_array().cloned().unwrap_or_default();
            let count = items.len();
            all_items.extend(items);

            if let Some(total_pages) = total_pages {
                if page >= total_pages {
                    break;
                }
            }
            if count < self.per_page {
                break;
            }
            page += 1;
        }
        Ok(all_items)
    }

    pub async fn get_current_user(&self) -> limiter::Result<Value> {
        Ok(self.get_json("/user", &[]).await?.0)
    }

    pub async fn get_project(&self, project_id: i64) -> limiter::Result<Value> {
        Ok(self.get_json(&format!("/projects/{project_id}"), &[]).await?.0)
    }

    pub async fn get_default_branch(&self, project_id: i64) -> limiter::Result<String> {
        let project = self.get_project(project_id).await?;
        Ok(project
            .get("default_branch")
            .and_then(|branch| branch.as_str())
            .unwrap_or("main")
            .to_string())
    }

    /// Projects the token is a member of.
    pub async fn get_accessible_projects(&self) -> limiter::Result<Vec<Value>> {
        self.get_paginated(
            "/projects",
            &[
                ("membership".to_string(), "true".to_string()),
                ("archived".to_string(), "false".to_string()),
                ("order_by".to_string(), "last_activity_at".to_string()),
            ],
        )
        .await
    }

    /// All merge requests of a project, optionally filtered to those updated
    /// after the given instant.
    pub async fn get_project_merge_requests(
        &self,
        project_id: i64,
        updated_after: Option<DateTime<Utc>>,
    ) -> limiter::Result<Vec<Value>> {
        let mut params = vec![
            ("state".to_string(), "all".to_string()),
            ("scope".to_string(), "all".to_string()),
            ("order_by".to_string(), "updated_at".to_string()),
            ("sort".to_string(), "desc".to_string()),
        ];
        if let Some(updated_after) = updated_after {
            params.push(("updated_after".to_string(), updated_after.to_rfc3339()));
        }
        self.get_paginated(&format!("/projects/{project_id}/merge_requests"), &params)
            .await
    }

    /// A single merge request, or `None` on 404.
    pub async fn get_merge_request(
        &self,
        project_id: i64,
        mr_iid: i64,
    ) -> limiter::Result<Option<Value>> {
        match self
            .get_json(
                &format!("/projects/{project_id}/merge_requests/{mr_iid}"),
                &[],
            )
            .await
        {
            Ok((value, _)) => Ok(Some(value)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn get_merge_request_notes(
        &self,
        project_id: i64,
        mr_iid: i64,
    ) -> limiter::Result<Vec<Value>> {
        self.get_paginated(
            &format!("/projects/{project_id}/merge_requests/{mr_iid}/notes"),
            &[("order_by".to_string(), "created_at".to_string())],
        )
        .await
    }

    pub async fn get_merge_request_diffs(
        &self,
        project_id: i64,
        mr_iid: i64,
    ) -> limiter::Result<Vec<Value>> {
        self.get_paginated(
            &format!("/projects/{project_id}/merge_requests/{mr_iid}/diffs"),
            &[],
        )
        .await
    }

    pub async fn get_merge_request_approvals(
        &self,
        project_id: i64,
        mr_iid: i64,
    ) -> limiter::Result<Value> {
        Ok(self
            .get_json(
                &format!("/projects/{project_id}/merge_requests/{mr_iid}/approvals"),
                &[],
            )
            .await?
            .0)
    }

    /// The repository tree at `ref`, recursively; blobs only is the caller's
    /// concern.
    pub async fn get_repository_tree(
        &self,
        project_id: i64,
        ref_name: &str,
    ) -> limiter::Result<Vec<Value>> {
        self.get_paginated(
            &format!("/projects/{project_id}/repository/tree"),
            &[
                ("recursive".to_string(), "true".to_string()),
                ("ref".to_string(), ref_name.to_string()),
            ],
        )
        .await
    }

    /// Raw file bytes at `ref`, or `None` on 404.
    pub async fn get_file_raw(
        &self,
        project_id: i64,
        file_path: &str,
        ref_name: &str,
    ) -> limiter::Result<Option<Vec<u8>>> {
        let endpoint = format!(
            "/projects/{project_id}/repository/files/{}/raw",
            encode_path_segment(file_path)
        );
        match self
            .get_raw(&endpoint, &[("ref".to_string(), ref_name.to_string())])
            .await
        {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// The head commit of a ref, without walking history.
    pub async fn get_latest_commit(
        &self,
        project_id: i64,
        ref_name: &str,
    ) -> limiter::Result<Option<Value>> {
        let (value, _) = self
            .get_json(
                &format!("/projects/{project_id}/repository/commits"),
                &[
                    ("ref_name".to_string(), ref_name.to_string()),
                    ("per_page".to_string(), "1".to_string()),
                ],
            )
            .await?;
        Ok(value
            .as_array()
            .and_then(|commits| commits.first())
            .cloned())
    }

    pub async fn get_repository_commits(
        &self,
        project_id: i64,
        ref_name: &str,
        since: Option<&str>,
    ) -> limiter::Result<Vec<Value>> {
        let mut params = vec![("ref_name".to_string(), ref_name.to_string())];
        if let Some(since) = since {
            params.push(("since".to_string(), since.to_string()));
        }
        self.get_paginated(&format!("/projects/{project_id}/repository/commits"), &params)
            .await
    }

    pub async fn get_commit(&self, project_id: i64, commit_sha: &str) -> limiter::Result<Value> {
        Ok(self
            .get_json(
                &format!("/projects/{project_id}/repository/commits/{commit_sha}"),
                &[],
            )
            .await?
            .0)
    }

    /// Files touched by one commit.
    pub async fn get_commit_diff(
        &self,
        project_id: i64,
        commit_sha: &str,
    ) -> limiter::Result<Vec<Value>> {
        self.get_paginated(
            &format!("/projects/{project_id}/repository/commits/{commit_sha}/diff"),
            &[],
        )
        .await
    }
}

/// GitLab uses long-lived tokens; the factory is a plain lookup. The host
/// defaults to gitlab.com and is overridable per tenant for self-managed
/// instances.
pub async fn client_for_tenant(
    ctx: &JobContext,
    pool: &sqlx::PgPool,
    tenant_id: &str,
) -> limiter::Result<GitlabClient> {
    let access_token = ctx
        .vault
        .get_api_key(tenant_id, "GITLAB_TOKEN")
        .await
        .map_err(|err| Error::Other(err.into()))?
        .ok_or_else(|| {
            Error::Other(anyhow::anyhow!(
                "no GitLab token configured for tenant {tenant_id}"
            ))
        })?;

    let host = ingest_sql::ConfigStore::new(pool.clone())
        .get("GITLAB_HOST")
        .await?
        .unwrap_or_else(|| "https://gitlab.com".to_string());

    tracing::info!(
        tenant_id,
        token_preview = %redact_token(&access_token),
        host,
        "GitLab client credentials loaded"
    );

    let bucket = ctx.limits.bucket(tenant_id, "gitlab", RATE_LIMIT);
    GitlabClient::new(&host, &access_token, DEFAULT_PER_PAGE, bucket)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn path_segments_encode_slashes() {
        assert_eq!(encode_path_segment("src/main.rs"), "src%2Fmain.rs");
        assert_eq!(encode_path_segment("a b.txt"), "a%20b.txt");
        assert_eq!(encode_path_segment("plain-name_1.rs"), "plain-name_1.rs");
    }
}
