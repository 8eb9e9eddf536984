use crate::util::redact_path;
use limiter::{retry, Error, RateLimit, RetryPolicy, TokenBucket};
use models::SalesforceObject;
use std::sync::Arc;
use std::time::Duration;

const API_VERSION: &str = "v65.0";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Budget applied to interactive REST calls. The real constraint is the
/// org's daily API quota, so this only smooths bursts.
pub const RATE_LIMIT: RateLimit = RateLimit::per_second(25);

/// Character budget of one serialized `WHERE Id IN (…)` clause. The vendor
/// caps a WHERE clause at 4k characters; stay under it.
pub const SOQL_WHERE_IN_LIMIT: usize = 3600;

/// Governor cap on records returned by one bulk query.
const BULK_QUERY_POLL_INTERVAL: Duration = Duration::from_secs(2);
const BULK_QUERY_MAX_WAIT: Duration = Duration::from_secs(600);

/// Split `record_ids` into chunks whose serialized `'id', 'id', …` rendering
/// stays within `limit` characters. The union of chunked queries equals the
/// unchunked semantics.
pub fn chunk_ids_for_soql(record_ids: &[String], limit: usize) -> Vec<Vec<String>> {
    let mut chunks: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_len = 0usize;

    for id in record_ids {
        // `'…'` plus the `, ` separator.
        let rendered = id.len() + 4;
        if !current.is_empty() && current_len + rendered > limit {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current_len += rendered;
        current.push(id.clone());
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Typed façade over the Salesforce REST API for one (tenant, job).
pub struct SalesforceClient {
    http: reqwest::Client,
    instance_url: String,
    pub org_id: String,
    pub access_token: String,
    bucket: Arc<TokenBucket>,
    retry_policy: RetryPolicy,
}

impl SalesforceClient {
    pub fn new(
        instance_url: &str,
        org_id: &str,
        access_token: &str,
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

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(Error::from)?;

        Ok(Self {
            http,
            instance_url: instance_url.trim_end_matches('/').to_string(),
            org_id: org_id.to_string(),
            access_token: access_token.to_string(),
            bucket,
            retry_policy: RetryPolicy::with_max_retries(3),
        })
    }

    pub fn instance_url(&self) -> &str {
        &self.instance_url
    }

    async fn request_json(
        &self,
        method: reqwest::Method,
        endpoint: &str,
        body: Option<&serde_json::Value>,
    ) -> limiter::Result<serde_json::Value> {
        let url = format!(
            "{}/services/data/{API_VERSION}{endpoint}",
            self.instance_url
        );

        retry(self.retry_policy, "salesforce", || async {
            self.bucket.acquire().await;

            let mut request = self.http.request(method.clone(), &url);
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await?;
            let status = response.status();

            if status.as_u16() == 429 {
                let retry_after = parse_retry_after(response.headers()).unwrap_or(60);
                tracing::warn!(
                    endpoint = %redact_path(endpoint),
                    retry_after,
                    "Salesforce rate limit hit"
                );
                return Err(Error::rate_limited(retry_after, "Salesforce rate limit"));
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(Error::from_status(status.as_u16(), body));
            }

            let text = response.text().await?;
            if text.trim().is_empty() {
                // A 2xx with an empty body is an empty record, never null.
                return Ok(serde_json::Value::Object(Default::default()));
            }
            serde_json::from_str(&text).map_err(|err| {
                Error::Other(anyhow::Error::new(err).context("invalid Salesforce response JSON"))
            })
        })
        .await
    }

    /// Execute a SOQL query, following `nextRecordsUrl` pagination, with
    /// Salesforce's per-record `attributes` metadata stripped.
    pub async fn query_soql(&self, soql: &str) -> limiter::Result<Vec<serde_json::Value>> {
        let mut records = Vec::new();
        let mut query_path = format!(
            "/query?q={}",
            url::form_urlencoded::byte_serialize(soql.as_bytes()).collect::<String>()
        );

        loop {
            let result = self
                .request_json(reqwest::Method::GET, &query_path, None)
                .await?;

            if let Some(page) = result.get("records").and_then(|r| r.as_array()) {
                records.extend(page.iter().map(|record| {
                    let mut record = record.clone();
                    if let Some(map) = record.as_object_mut() {
                        map.remove("attributes");
                    }
                    record
                }));
            }

            if result.get("done").and_then(|d| d.as_bool()).unwrap_or(true) {
                break;
            }
            match result.get("nextRecordsUrl").and_then(|u| u.as_str()) {
                Some(next) => {
                    // The vendor returns an absolute versioned path.
                    query_path = next
                        .split(&format!("/services/data/{API_VERSION}"))
                        .last()
                        .unwrap_or(next)
                        .to_string();
                }
                None => break,
            }
        }

        Ok(records)
    }

    /// Execute a SOQL query through the Bulk API: create a query job, poll it
    /// to completion, and parse the CSV results.
    pub async fn bulk_query_soql(&self, soql: &str) -> limiter::Result<Vec<serde_json::Value>> {
        let created = self
            .request_json(
                reqwest::Method::POST,
                "/jobs/query",
                Some(&serde_json::json!({"operation": "query", "query": soql})),
            )
            .await?;
        let job_id = created
            .get("id")
            .and_then(|id| id.as_str())
            .ok_or_else(|| Error::Api {
                status: 0,
                body: format!("bulk query job creation returned no id: {created}"),
            })?
            .to_string();
        tracing::info!(job_id, "created bulk query job");

        let mut waited = Duration::ZERO;
        loop {
            let status = self
                .request_json(reqwest::Method::GET, &format!("/jobs/query/{job_id}"), None)
                .await?;
            match status.get("state").and_then(|s| s.as_str()) {
                Some("JobComplete") => break,
                Some(state @ ("Failed" | "Aborted")) => {
                    let message = status
                        .get("errorMessage")
                        .and_then(|m| m.as_str())
                        .unwrap_or("unknown error");
                    return Err(Error::Api {
                        status: 0,
                        body: format!("bulk query job {state}: {message}"),
                    });
                }
                state => {
                    tracing::debug!(job_id, ?state, "bulk query job pending");
                }
            }
            if waited >= BULK_QUERY_MAX_WAIT {
                return Err(Error::rate_limited(
                    35,
                    format!("bulk query job {job_id} did not complete in time"),
                ));
            }
            tokio::time::sleep(BULK_QUERY_POLL_INTERVAL).await;
            waited += BULK_QUERY_POLL_INTERVAL;
        }

        // Results come back as CSV.
        self.bucket.acquire().await;
        let url = format!(
            "{}/services/data/{API_VERSION}/jobs/query/{job_id}/results",
            self.instance_url
        );
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::from_status(status.as_u16(), body));
        }
        let csv_text = response.text().await?;

        let mut reader = csv::Reader::from_reader(csv_text.as_bytes());
        let headers = reader
            .headers()
            .map_err(|err| Error::Other(anyhow::Error::new(err).context("bulk query CSV header")))?
            .clone();
        let mut records = Vec::new();
        for row in reader.records() {
            let row = row.map_err(|err| {
                Error::Other(anyhow::Error::new(err).context("bulk query CSV row"))
            })?;
            let record: serde_json::Map<String, serde_json::Value> = headers
                .iter()
                .zip(row.iter())
                .map(|(key, value)| (key.to_string(), serde_json::Value::from(value)))
                .collect();
            records.push(serde_json::Value::Object(record));
        }

        tracing::info!(job_id, count = records.len(), "bulk query job complete");
        Ok(records)
    }

    /// Batch-get records by id via chunked `WHERE Id IN (…)` queries.
    /// Records return in no particular order; absent ids are simply missing.
    pub async fn get_records_by_ids(
        &self,
        object: SalesforceObject,
        record_ids: &[String],
        fields: Option<&[&str]>,
    ) -> limiter::Result<Vec<serde_json::Value>> {
        if record_ids.is_empty() {
            return Ok(Vec::new());
        }

        let fields_clause = match fields {
            Some(fields) => fields.join(", "),
            None => "FIELDS(ALL)".to_string(),
        };

        let mut all_records = Vec::new();
        for chunk in chunk_ids_for_soql(record_ids, SOQL_WHERE_IN_LIMIT) {
            let ids_clause = chunk
                .iter()
                .map(|id| format!("'{id}'"))
                .collect::<Vec<_>>()
                .join(", ");
            let soql = format!(
                "SELECT {fields_clause} FROM {} WHERE Id IN ({ids_clause})",
                object.api_name()
            );
            all_records.extend(self.query_soql(&soql).await?);
        }
        Ok(all_records)
    }

    /// All record ids of one object type, via the Bulk API (up to the 50k
    /// governor limit).
    pub async fn get_all_object_ids(
        &self,
        object: SalesforceObject,
    ) -> limiter::Result<Vec<String>> {
        let records = self
            .bulk_query_soql(&format!("SELECT Id FROM {}", object.api_name()))
            .await?;
        Ok(records
            .iter()
            .filter_map(|record| record.get("Id")?.as_str().map(str::to_string))
            .collect())
    }

    /// Ids of records modified strictly after `since`.
    pub async fn get_updated_object_ids(
        &self,
        object: SalesforceObject,
        since: chrono::DateTime<chrono::Utc>,
    ) -> limiter::Result<Vec<String>> {
        let soql = format!(
            "SELECT Id FROM {} WHERE LastModifiedDate > {}",
            object.api_name(),
            since.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        );
        let records = self.query_soql(&soql).await?;
        Ok(records
            .iter()
            .filter_map(|record| record.get("Id")?.as_str().map(str::to_string))
            .collect())
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

#[cfg(test)]
mod test {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("001{i:015}")).collect()
    }

    #[test]
    fn chunking_respects_the_clause_budget() {
        let record_ids = ids(1000);
        let chunks = chunk_ids_for_soql(&record_ids, SOQL_WHERE_IN_LIMIT);

        for chunk in &chunks {
            let rendered = chunk
                .iter()
                .map(|id| format!("'{id}'"))
                .collect::<Vec<_>>()
                .join(", ");
            assert!(rendered.len() <= SOQL_WHERE_IN_LIMIT);
        }

        // Union of chunks equals the input, in order.
        let flattened: Vec<String> = chunks.into_iter().flatten().collect();
        assert_eq!(flattened, record_ids);
    }

    #[test]
    fn single_oversized_id_still_gets_a_chunk() {
        let record_ids = vec!["x".repeat(8000)];
        let chunks = chunk_ids_for_soql(&record_ids, SOQL_WHERE_IN_LIMIT);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 1);
    }

    #[test]
    fn empty_input_has_no_chunks() {
        assert!(chunk_ids_for_soql(&[], SOQL_WHERE_IN_LIMIT).is_empty());
    }
}
