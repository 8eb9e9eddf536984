use crate::util::{items_array, redact_path, redact_token};
use crate::JobContext;
use chrono::{DateTime, Utc};
use limiter::{retry, Error, RateLimit, RetryPolicy, TokenBucket};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const MAX_PAGE_SIZE: usize = 250;

/// Premium-tier budget: 150 requests per minute per user.
pub const RATE_LIMIT: RateLimit = RateLimit::per_minute(150);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Related data requested with batched task fetches.
const DEFAULT_TASK_INCLUDES: &[&str] = &[
    "projects",
    "tasklists",
    "tags",
    "comments",
    "attachments",
    "users",
    "parentTasks",
];

/// Fields requested for tasks. `isPrivate` is load-bearing for privacy
/// filtering; the relationship fields feed enrichment.
const DEFAULT_TASK_FIELDS: &[&str] = &[
    "id",
    "name",
    "description",
    "status",
    "priority",
    "progress",
    "startDate",
    "dueDate",
    "createdAt",
    "updatedAt",
    "completedAt",
    "completed",
    "isPrivate",
    "estimatedMinutes",
    "project",
    "taskList",
    "parentTask",
    "createdBy",
    "assignees",
    "tags",
];

#[derive(Debug, Clone)]
pub struct TeamworkSearchResult {
    pub items: Vec<Value>,
    pub next_page: Option<u32>,
    pub total_items: Option<i64>,
}

/// Sideloaded `included` data, keyed by type then by id.
#[derive(Debug, Default, Clone)]
pub struct IncludedData {
    by_type: HashMap<String, HashMap<i64, Value>>,
}

impl IncludedData {
    /// Parse an `included` section. Values arrive either as lists of objects
    /// or as maps already keyed by id.
    pub fn parse(included: &Value) -> Self {
        let mut by_type = HashMap::new();
        let Some(included) = included.as_object() else {
            return Self { by_type };
        };

        for (include_type, items) in included {
            let mut by_id: HashMap<i64, Value> = HashMap::new();
            match items {
                Value::Array(items) => {
                    for item in items {
                        if let Some(id) = item.get("id").and_then(ref_id_value) {
                            by_id.insert(id, item.clone());
                        }
                    }
                }
                Value::Object(items) => {
                    for (key, item) in items {
                        if let Ok(id) = key.parse::<i64>() {
                            by_id.insert(id, item.clone());
                        }
                    }
                }
                _ => continue,
            }
            by_type.insert(include_type.clone(), by_id);
        }
        Self { by_type }
    }

    pub fn of_type(&self, include_type: &str) -> Option<&HashMap<i64, Value>> {
        self.by_type.get(include_type)
    }

    pub fn types(&self) -> Vec<&str> {
        self.by_type.keys().map(String::as_str).collect()
    }
}

fn ref_id_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Extract the id from a relationship reference, which vendors render as a
/// bare id, an `{id: …}` object, or either form as a string.
pub fn extract_ref_id(value: &Value) -> Option<i64> {
    match value {
        Value::Object(object) => object.get("id").and_then(ref_id_value),
        other => ref_id_value(other),
    }
}

/// Merge sideloaded data into each task under underscored keys, so
/// extractors consume fully joined records.
pub fn enrich_tasks_with_included(tasks: Vec<Value>, included: &IncludedData) -> Vec<Value> {
    let empty = HashMap::new();
    let projects = included.of_type("projects").unwrap_or(&empty);
    let tasklists = included.of_type("tasklists").unwrap_or(&empty);
    let users = included.of_type("users").unwrap_or(&empty);
    let tags = included.of_type("tags").unwrap_or(&empty);
    let comments = included.of_type("comments").unwrap_or(&empty);
    let attachments = included.of_type("attachments").unwrap_or(&empty);
    let parent_tasks = included.of_type("parentTasks").unwrap_or(&empty);

    let lookup_list = |refs: Option<&Value>, table: &HashMap<i64, Value>| -> Vec<Value> {
        refs.and_then(|refs| refs.as_array())
            .map(|refs| {
                refs.iter()
                    .filter_map(extract_ref_id)
                    .filter_map(|id| table.get(&id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    };

    tasks
        .into_iter()
        .map(|task| {
            let task_id = task.get("id").and_then(ref_id_value);
            let mut enriched = task;
            let Some(object) = enriched.as_object_mut() else {
                return enriched;
            };

            if let Some(project) = object
                .get("project")
                .and_then(extract_ref_id)
                .and_then(|id| projects.get(&id))
            {
                object.insert("_project".to_string(), project.clone());
            }
            if let Some(tasklist) = object
                .get("taskList")
                .and_then(extract_ref_id)
                .and_then(|id| tasklists.get(&id))
            {
                object.insert("_tasklist".to_string(), tasklist.clone());
            }
            if let Some(creator) = object
                .get("createdBy")
                .and_then(extract_ref_id)
                .and_then(|id| users.get(&id))
            {
                object.insert("_creator".to_string(), creator.clone());
            }
            if let Some(parent) = object
                .get("parentTask")
                .and_then(extract_ref_id)
                .and_then(|id| parent_tasks.get(&id))
            {
                object.insert("_parentTask".to_string(), parent.clone());
            }

            let assignees = lookup_list(object.get("assignees"), users);
            if !assignees.is_empty() {
                object.insert("_assignees".to_string(), Value::Array(assignees));
            }
            let task_tags = lookup_list(object.get("tags"), tags);
            if !task_tags.is_empty() {
                object.insert("_tags".to_string(), Value::Array(task_tags));
            }

            // Comments and attachments reference the task, not the reverse.
            if let Some(task_id) = task_id {
                let owned = |table: &HashMap<i64, Value>| -> Vec<Value> {
                    let mut owned: Vec<Value> = table
                        .values()
                        .filter(|item| {
                            item.get("task")
                                .and_then(extract_ref_id)
                                .map_or(false, |id| id == task_id)
                        })
                        .cloned()
                        .collect();
                    owned.sort_by_key(|item| item.get("id").and_then(ref_id_value));
                    owned
                };

                let task_comments = owned(comments);
                if !task_comments.is_empty() {
                    object.insert("_comments".to_string(), Value::Array(task_comments));
                }
                let task_attachments = owned(attachments);
                if !task_attachments.is_empty() {
                    object.insert("_attachments".to_string(), Value::Array(task_attachments));
                }
            }
            enriched
        })
        .collect()
}

/// Typed façade over the Teamwork v3 REST API for one (tenant, job).
/// Access tokens are long-lived; the api domain is instance-specific.
pub struct TeamworkClient {
    http: reqwest::Client,
    api_domain: String,
    bucket: Arc<TokenBucket>,
    retry_policy: RetryPolicy,
}

impl TeamworkClient {
    pub fn new(
        access_token: &str,
        api_domain: &str,
        bucket: Arc<TokenBucket>,
    ) -> limiter::Result<Self> {
        if access_token.is_empty() {
            return Err(Error::Other(anyhow::anyhow!(
                "Teamwork access token cannot be empty"
            )));
        }
        if api_domain.is_empty() {
            return Err(Error::Other(anyhow::anyhow!(
                "Teamwork API domain cannot be empty"
            )));
        }

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
        retry(self.retry_policy, "teamwork", || async {
            self.bucket.acquire().await;

            let url = format!("{}{endpoint}", self.api_domain);
            let response = self.http.get(&url).query(params).send().await?;
            let status = response.status();

            if status.as_u16() == 429 {
                // Teamwork windows are a minute; default accordingly.
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse().ok())
                    .unwrap_or(60);
                tracing::warn!(endpoint = %redact_path(endpoint), "Teamwork rate limit hit");
                return Err(Error::rate_limited(retry_after, "Teamwork rate limit"));
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                tracing::warn!(
                    endpoint = %redact_path(endpoint),
                    status = status.as_u16(),
                    "Teamwork API error"
                );
                return Err(Error::from_status(status.as_u16(), body));
            }

            let text = response.text().await?;
            if text.trim().is_empty() {
                return Ok(Value::Object(Default::default()));
            }
            serde_json::from_str(&text).map_err(|err| {
                Error::Other(anyhow::Error::new(err).context("invalid Teamwork response JSON"))
            })
        })
        .await
    }

    pub async fn get_tasks(
        &self,
        page: u32,
        page_size: usize,
        updated_after: Option<DateTime<Utc>>,
    ) -> limiter::Result<TeamworkSearchResult> {
        let mut params = vec![
            ("page".to_string(), page.to_string()),
            (
                "pageSize".to_string(),
                page_size.min(MAX_PAGE_SIZE).to_string(),
            ),
            ("includeCompletedTasks".to_string(), "true".to_string()),
            (
                "fields[tasks]".to_string(),
                DEFAULT_TASK_FIELDS.join(","),
            ),
        ];
        if let Some(updated_after) = updated_after {
            params.push((
                "updatedAfter".to_string(),
                updated_after.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            ));
        }

        let response = self.get_json("/projects/api/v3/tasks", &params).await?;
        Ok(parse_search_result(&response, "tasks", page))
    }

    /// Page through tasks; each call yields one page and the next page
    /// number, so callers can checkpoint resumable walks. `None` when
    /// exhausted.
    pub fn task_pages(&self, updated_after: Option<DateTime<Utc>>) -> TaskPages<'_> {
        TaskPages {
            client: self,
            page: Some(1),
            updated_after,
        }
    }

    /// Batch-fetch tasks by id with sideloaded related data.
    pub async fn get_tasks_by_ids(
        &self,
        task_ids: &[i64],
        includes: Option<&[&str]>,
    ) -> limiter::Result<(Vec<Value>, IncludedData)> {
        if task_ids.is_empty() {
            return Ok((Vec::new(), IncludedData::default()));
        }
        let includes = includes.unwrap_or(DEFAULT_TASK_INCLUDES);

        let mut params = vec![
            (
                "ids".to_string(),
                task_ids
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            (
                "fields[tasks]".to_string(),
                DEFAULT_TASK_FIELDS.join(","),
            ),
        ];
        if !includes.is_empty() {
            params.push(("include".to_string(), includes.join(",")));
        }

        let response = self.get_json("/projects/api/v3/tasks", &params).await?;
        let tasks = items_array(&response, "tasks");
        let included = IncludedData::parse(response.get("included").unwrap_or(&Value::Null));

        tracing::info!(
            requested = task_ids.len(),
            fetched = tasks.len(),
            includes = ?included.types(),
            "batch fetched tasks"
        );
        Ok((tasks, included))
    }

    /// A single task, or `None` on 404.
    pub async fn get_task(&self, task_id: i64) -> limiter::Result<Option<Value>> {
        match self
            .get_json(&format!("/projects/api/v3/tasks/{task_id}"), &[])
            .await
        {
            Ok(response) => Ok(response.get("task").cloned()),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn get_task_comments(
        &self,
        task_id: i64,
        page: u32,
    ) -> limiter::Result<TeamworkSearchResult> {
        let params = vec![
            ("page".to_string(), page.to_string()),
            ("pageSize".to_string(), DEFAULT_PAGE_SIZE.to_string()),
        ];
        let response = self
            .get_json(&format!("/projects/api/v3/tasks/{task_id}/comments"), &params)
            .await?;
        Ok(parse_search_result(&response, "comments", page))
    }

    pub async fn get_all_task_comments(&self, task_id: i64) -> limiter::Result<Vec<Value>> {
        let mut comments = Vec::new();
        let mut page = 1;
        loop {
            let result = self.get_task_comments(task_id, page).await?;
            comments.extend(result.items);
            match result.next_page {
                Some(next) => page = next,
                None => break,
            }
        }
        Ok(comments)
    }

    pub async fn get_current_user(&self) -> limiter::Result<Value> {
        let response = self.get_json("/projects/api/v3/me", &[]).await?;
        Ok(response.get("person").cloned().unwrap_or_default())
    }
}

pub struct TaskPages<'a> {
    client: &'a TeamworkClient,
    page: Option<u32>,
    updated_after: Option<DateTime<Utc>>,
}

impl TaskPages<'_> {
    pub async fn next_page(&mut self) -> limiter::Result<Option<(Vec<Value>, Option<u32>)>> {
        let Some(page) = self.page else {
            return Ok(None);
        };
        let result = self
            .client
            .get_tasks(page, DEFAULT_PAGE_SIZE, self.updated_after)
            .await?;
        self.page = result.next_page;
        if result.items.is_empty() && result.next_page.is_none() {
            return Ok(None);
        }
        Ok(Some((result.items, result.next_page)))
    }
}

fn parse_search_result(response: &Value, items_key: &str, page: u32) -> TeamworkSearchResult {
    let items = items_array(response, items_key);
    let page_info = response
        .get("meta")
        .and_then(|meta| meta.get("page"))
        .cloned()
        .unwrap_or_default();
    let has_more = page_info
        .get("hasMore")
        .and_then(|more| more.as_bool())
        .unwrap_or(false);

    TeamworkSearchResult {
        items,
        next_page: has_more.then_some(page + 1),
        total_items: page_info.get("count").and_then(|count| count.as_i64()),
    }
}

/// Teamwork uses long-lived OAuth access tokens, so the factory is a plain
/// credential lookup: token from the vault, instance domain from the tenant
/// config.
pub async fn client_for_tenant(
    ctx: &JobContext,
    pool: &sqlx::PgPool,
    tenant_id: &str,
) -> limiter::Result<TeamworkClient> {
    let access_token = ctx
        .vault
        .get_api_key(tenant_id, "TEAMWORK_ACCESS_TOKEN")
        .await
        .map_err(|err| Error::Other(err.into()))?
        .ok_or_else(|| {
            Error::Other(anyhow::anyhow!(
                "no Teamwork access token configured for tenant {tenant_id}"
            ))
        })?;

    let api_domain = ingest_sql::ConfigStore::new(pool.clone())
        .get("TEAMWORK_API_DOMAIN")
        .await?
        .ok_or_else(|| {
            Error::Other(anyhow::anyhow!(
                "no Teamwork API domain configured for tenant {tenant_id}"
            ))
        })?;

    tracing::info!(
        tenant_id,
        token_preview = %redact_token(&access_token),
        api_domain,
        "Teamwork client credentials loaded"
    );

    let bucket = ctx.limits.bucket(tenant_id, "teamwork", RATE_LIMIT);
    TeamworkClient::new(&access_token, &api_domain, bucket)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn ref_ids_parse_all_three_shapes() {
        assert_eq!(extract_ref_id(&json!(42)), Some(42));
        assert_eq!(extract_ref_id(&json!("42")), Some(42));
        assert_eq!(extract_ref_id(&json!({"id": 42})), Some(42));
        assert_eq!(extract_ref_id(&json!({"id": "42"})), Some(42));
        assert_eq!(extract_ref_id(&json!(null)), None);
        assert_eq!(extract_ref_id(&json!({"name": "no id"})), None);
    }

    #[test]
    fn included_data_parses_lists_and_keyed_maps() {
        let included = IncludedData::parse(&json!({
            "projects": [{"id": 1, "name": "Alpha"}],
            "users": {"7": {"id": 7, "firstName": "Ada"}},
            "tags": null,
        }));
        assert_eq!(included.of_type("projects").unwrap().len(), 1);
        assert_eq!(
            included.of_type("users").unwrap()[&7]["firstName"],
            "Ada"
        );
        assert!(included.of_type("tags").is_none());
    }

    #[test]
    fn enrichment_joins_all_reference_shapes() {
        let included = IncludedData::parse(&json!({
            "projects": [{"id": 10, "name": "Alpha"}],
            "tasklists": [{"id": 20, "name": "Sprint"}],
            "users": [
                {"id": 7, "firstName": "Ada"},
                {"id": 8, "firstName": "Grace"},
            ],
            "parentTasks": [{"id": 99, "name": "Epic"}],
            "comments": [
                {"id": 1, "task": {"id": 7001}, "body": "first"},
                {"id": 2, "task": 7001, "body": "second"},
                {"id": 3, "task": 7002, "body": "other task"},
            ],
        }));

        let tasks = vec![json!({
            "id": 7001,
            "name": "Ship it",
            "project": 10,
            "taskList": {"id": 20},
            "createdBy": "7",
            "parentTask": {"id": 99},
            "assignees": [7, {"id": 8}],
        })];

        let enriched = enrich_tasks_with_included(tasks, &included);
        let task = &enriched[0];

        assert_eq!(task["_project"]["name"], "Alpha");
        assert_eq!(task["_tasklist"]["name"], "Sprint");
        assert_eq!(task["_creator"]["firstName"], "Ada");
        assert_eq!(task["_parentTask"]["name"], "Epic");
        assert_eq!(task["_assignees"].as_array().unwrap().len(), 2);

        // Only this task's comments attach, in id order.
        let comments = task["_comments"].as_array().unwrap();
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0]["body"], "first");
        assert_eq!(comments[1]["body"], "second");
    }

    #[test]
    fn enrichment_skips_dangling_references() {
        let included = IncludedData::parse(&json!({"projects": []}));
        let tasks = vec![json!({"id": 1, "project": 999})];
        let enriched = enrich_tasks_with_included(tasks, &included);
        assert!(enriched[0].get("_project").is_none());
    }

    #[test]
    fn search_results_paginate_on_has_more() {
        let response = json!({
            "tasks": [{"id": 1}],
            "meta": {"page": {"hasMore": true, "count": 41}},
        });
        let result = parse_search_result(&response, "tasks", 3);
        assert_eq!(result.next_page, Some(4));
        assert_eq!(result.total_items, Some(41));

        let last = json!({"tasks": null, "meta": {"page": {"hasMore": false}}});
        let result = parse_search_result(&last, "tasks", 4);
        assert!(result.items.is_empty());
        assert_eq!(result.next_page, None);
    }
}
