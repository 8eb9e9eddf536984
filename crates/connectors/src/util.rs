//! Helpers shared across connector clients.

use chrono::{DateTime, Utc};

/// Path segments which are structural API vocabulary rather than customer
/// data. Everything else in a logged path is replaced before emission.
const STRUCTURAL_SEGMENTS: &[&str] = &[
    "api", "approvals", "changes", "comments", "commits", "data", "deals", "designs", "diffs",
    "files", "folders", "graphql", "groups", "insights", "issues", "items", "jobs", "me",
    "merge_requests", "notes", "oauth", "objects", "people", "pipelines", "projects", "query",
    "raw", "records", "repository", "rest", "results", "services", "sobjects", "tasks", "teams",
    "token", "tree", "users", "v1", "v2", "v3", "v4", "v65.0",
];

/// Redact customer identifiers (project ids, record ids, file paths, SHAs)
/// from an endpoint path before it is logged.
pub fn redact_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if segment.is_empty() || STRUCTURAL_SEGMENTS.contains(&segment) {
                segment.to_string()
            } else {
                "…".to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Fetch an items array which a vendor may return as missing, null, or `[]`;
/// all three normalize to empty.
pub fn items_array(value: &serde_json::Value, key: &str) -> Vec<serde_json::Value> {
    value
        .get(key)
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
}

/// Parse the timestamp formats seen across vendor payloads: RFC 3339 /
/// ISO 8601 with offset, the Salesforce `+0000` offset variant, and bare
/// UTC timestamps without an offset.
pub fn parse_source_datetime(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.3f%z") {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(parsed.and_utc());
    }
    None
}

/// The max `updated_at` across a set of records, for cursor advancement.
pub fn max_updated_at<'a>(
    records: impl IntoIterator<Item = &'a serde_json::Value>,
    key: &str,
) -> Option<DateTime<Utc>> {
    records
        .into_iter()
        .filter_map(|record| record.get(key)?.as_str())
        .filter_map(parse_source_datetime)
        .max()
}

/// Preview of a secret for logs: first 8 and last 4 characters.
pub fn redact_token(token: &str) -> String {
    if token.len() > 12 {
        format!("{}…{}", &token[..8], &token[token.len() - 4..])
    } else {
        "***".to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn paths_redact_ids_and_file_paths() {
        assert_eq!(
            redact_path("/api/v4/projects/1234/repository/files/src%2Fmain.rs/raw"),
            "/api/v4/projects/…/repository/files/…/raw"
        );
        assert_eq!(
            redact_path("/projects/api/v3/tasks/7001/comments"),
            "/projects/api/v3/tasks/…/comments"
        );
        assert_eq!(redact_path("/services/data/v65.0/query"), "/services/data/v65.0/query");
    }

    #[test]
    fn item_arrays_normalize_to_empty() {
        assert!(items_array(&json!({}), "tasks").is_empty());
        assert!(items_array(&json!({"tasks": null}), "tasks").is_empty());
        assert!(items_array(&json!({"tasks": []}), "tasks").is_empty());
        assert_eq!(items_array(&json!({"tasks": [1, 2]}), "tasks").len(), 2);
    }

    #[test]
    fn datetime_formats() {
        let expected = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            parse_source_datetime("2026-01-02T03:04:05Z").unwrap(),
            expected
        );
        assert_eq!(
            parse_source_datetime("2026-01-02T03:04:05.000+0000").unwrap(),
            expected
        );
        assert_eq!(
            parse_source_datetime("2026-01-02T03:04:05.000000").unwrap(),
            expected
        );
        assert!(parse_source_datetime("yesterday").is_none());
    }

    #[test]
    fn max_updated_at_ignores_malformed_rows() {
        let records = vec![
            json!({"updated_at": "2026-01-02T03:04:05Z"}),
            json!({"updated_at": "garbage"}),
            json!({"updated_at": "2026-02-02T03:04:05Z"}),
            json!({}),
        ];
        assert_eq!(
            max_updated_at(&records, "updated_at").unwrap(),
            Utc.with_ymd_and_hms(2026, 2, 2, 3, 4, 5).unwrap()
        );
    }

    #[test]
    fn token_previews_never_leak_short_tokens() {
        assert_eq!(redact_token("abc"), "***");
        assert_eq!(redact_token("0123456789abcdef"), "01234567…cdef");
    }
}
