use crate::util::parse_source_datetime;
use chrono::Utc;
use models::{Artifact, ArtifactEntity};
use serde_json::Value;

/// Fail-closed indexability: a task may be indexed only when `isPrivate` is
/// explicitly `false`. Missing or null reads as private.
pub fn is_indexable(task: &Value) -> bool {
    matches!(task.get("isPrivate"), Some(Value::Bool(false)))
}

/// Whether the visibility flag is absent outright (as opposed to present
/// but null/true). Feeds the mass-deindex guardrail.
pub fn visibility_flag_missing(task: &Value) -> bool {
    task.get("isPrivate").is_none()
}

/// Build the artifact for one (enriched) task.
pub fn make_task_artifact(
    ingest_job_id: uuid::Uuid,
    task: Value,
    comments: Vec<Value>,
) -> Option<Artifact> {
    let task_id = task.get("id").and_then(|id| id.as_i64())?;
    let source_updated_at = task
        .get("updatedAt")
        .and_then(|value| value.as_str())
        .and_then(parse_source_datetime)
        .unwrap_or_else(Utc::now);

    let metadata = serde_json::json!({
        "task_id": task_id,
        "project_id": task.get("_project").and_then(|p| p.get("id")).cloned(),
        "project_name": task.get("_project").and_then(|p| p.get("name")).cloned(),
        "status": task.get("status").cloned(),
        "is_private": task.get("isPrivate").cloned().unwrap_or(Value::Null),
    });

    Some(Artifact {
        entity: ArtifactEntity::TeamworkTask,
        entity_id: ArtifactEntity::TeamworkTask.entity_id(task_id),
        content: serde_json::json!({
            "task_data": task,
            "comments": comments,
        }),
        metadata,
        ingest_job_id,
        source_updated_at,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn indexability_fails_closed() {
        assert!(is_indexable(&json!({"isPrivate": false})));
        assert!(!is_indexable(&json!({"isPrivate": true})));
        assert!(!is_indexable(&json!({"isPrivate": null})));
        assert!(!is_indexable(&json!({})));
        // A stringy "false" is still not explicitly false.
        assert!(!is_indexable(&json!({"isPrivate": "false"})));
    }

    #[test]
    fn missing_flag_is_distinct_from_null() {
        assert!(visibility_flag_missing(&json!({})));
        assert!(!visibility_flag_missing(&json!({"isPrivate": null})));
        assert!(!visibility_flag_missing(&json!({"isPrivate": true})));
    }

    #[test]
    fn artifacts_embed_comments_and_project_metadata() {
        let task = json!({
            "id": 7001,
            "name": "Ship it",
            "isPrivate": false,
            "updatedAt": "2026-03-01T10:00:00Z",
            "_project": {"id": 10, "name": "Alpha"},
        });
        let artifact = make_task_artifact(
            uuid::Uuid::new_v4(),
            task,
            vec![json!({"id": 1, "body": "lgtm"})],
        )
        .unwrap();

        assert_eq!(artifact.entity_id, "teamwork_task_7001");
        assert_eq!(artifact.metadata["project_name"], "Alpha");
        assert_eq!(artifact.metadata["is_private"], false);
        assert_eq!(artifact.content["comments"][0]["body"], "lgtm");
    }

    #[test]
    fn tasks_without_ids_are_rejected() {
        assert!(make_task_artifact(uuid::Uuid::new_v4(), json!({"name": "x"}), vec![]).is_none());
    }
}
