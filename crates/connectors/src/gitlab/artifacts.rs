use crate::util::parse_source_datetime;
use chrono::Utc;
use models::{Artifact, ArtifactEntity};
use serde_json::Value;

/// Extensions considered text for file ingestion. Anything else (binaries,
/// media, lockfiles) is skipped at enumeration time.
const INDEXABLE_EXTENSIONS: &[&str] = &[
    "c", "cc", "cfg", "conf", "cpp", "cs", "css", "dart", "go", "h", "hpp", "html", "ini", "java",
    "js", "json", "jsx", "kt", "markdown", "md", "php", "proto", "py", "rb", "rs", "scala", "sh",
    "sql", "swift", "toml", "ts", "tsx", "txt", "xml", "yaml", "yml",
];

/// Extensionless files worth ingesting anyway.
const INDEXABLE_BASENAMES: &[&str] = &["Dockerfile", "Makefile", "README", "LICENSE"];

pub fn is_indexable_path(path: &str) -> bool {
    let basename = path.rsplit('/').next().unwrap_or(path);
    if INDEXABLE_BASENAMES.contains(&basename) {
        return true;
    }
    match basename.rsplit_once('.') {
        Some((_, extension)) => INDEXABLE_EXTENSIONS.contains(&extension.to_lowercase().as_str()),
        None => false,
    }
}

/// Build the artifact for one merge request with its side data attached.
pub fn make_mr_artifact(
    ingest_job_id: uuid::Uuid,
    project_id: i64,
    mut mr: Value,
    notes: Vec<Value>,
    diffs: Vec<Value>,
    approvals: Value,
) -> Option<Artifact> {
    let mr_id = mr.get("id").and_then(Value::as_i64)?;
    let source_updated_at = mr
        .get("updated_at")
        .and_then(Value::as_str)
        .and_then(parse_source_datetime)
        .unwrap_or_else(Utc::now);

    let metadata = serde_json::json!({
        "project_id": project_id,
        "mr_id": mr_id,
        "mr_iid": mr.get("iid").cloned(),
        "state": mr.get("state").cloned(),
        "title": mr.get("title").cloned(),
        "author": mr.pointer("/author/username").cloned(),
    });

    if let Some(object) = mr.as_object_mut() {
        object.insert("notes".to_string(), Value::Array(notes));
        object.insert("diffs".to_string(), Value::Array(diffs));
        object.insert("approvals".to_string(), approvals);
    }

    Some(Artifact {
        entity: ArtifactEntity::GitlabMr,
        entity_id: ArtifactEntity::GitlabMr.entity_id(mr_id),
        content: serde_json::json!({ "mr_data": mr }),
        metadata,
        ingest_job_id,
        source_updated_at,
    })
}

/// Build the artifact for one repository file. Files are scoped to their
/// project because paths repeat across projects.
pub fn make_file_artifact(
    ingest_job_id: uuid::Uuid,
    project_id: i64,
    file_path: &str,
    ref_sha: &str,
    bytes: &[u8],
) -> Option<Artifact> {
    // Binary or non-UTF-8 content is not ingestible.
    let text = std::str::from_utf8(bytes).ok()?;

    Some(Artifact {
        entity: ArtifactEntity::GitlabFile,
        entity_id: ArtifactEntity::GitlabFile.scoped_entity_id(project_id, file_path),
        content: serde_json::json!({
            "file_path": file_path,
            "ref": ref_sha,
            "text": text,
        }),
        metadata: serde_json::json!({
            "project_id": project_id,
            "file_path": file_path,
            "ref_sha": ref_sha,
            "size_bytes": bytes.len(),
        }),
        ingest_job_id,
        source_updated_at: Utc::now(),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn indexable_paths() {
        assert!(is_indexable_path("src/main.rs"));
        assert!(is_indexable_path("docs/README.md"));
        assert!(is_indexable_path("Dockerfile"));
        assert!(is_indexable_path("a/b/Makefile"));
        assert!(!is_indexable_path("logo.png"));
        assert!(!is_indexable_path("bin/tool"));
        assert!(!is_indexable_path("video.MP4"));
        assert!(is_indexable_path("WEIRD/CASE.YML"));
    }

    #[test]
    fn mr_artifacts_attach_side_data() {
        let mr = json!({
            "id": 555,
            "iid": 7,
            "title": "Add retries",
            "state": "merged",
            "updated_at": "2026-03-01T12:00:00Z",
            "author": {"username": "ada"},
        });
        let artifact = make_mr_artifact(
            uuid::Uuid::new_v4(),
            42,
            mr,
            vec![json!({"id": 1, "body": "lgtm"})],
            vec![json!({"new_path": "src/lib.rs"})],
            json!({"approved": true}),
        )
        .unwrap();

        assert_eq!(artifact.entity_id, "gitlab_mr_555");
        assert_eq!(artifact.metadata["mr_iid"], 7);
        assert_eq!(artifact.metadata["author"], "ada");
        assert_eq!(artifact.content["mr_data"]["notes"][0]["body"], "lgtm");
        assert_eq!(artifact.content["mr_data"]["approvals"]["approved"], true);
    }

    #[test]
    fn file_artifacts_scope_to_the_project() {
        let artifact = make_file_artifact(
            uuid::Uuid::new_v4(),
            42,
            "src/main.rs",
            "abc123",
            b"fn main() {}",
        )
        .unwrap();
        assert_eq!(artifact.entity_id, "gitlab_file_42_src/main.rs");
        assert_eq!(artifact.content["text"], "fn main() {}");
    }

    #[test]
    fn binary_files_are_rejected() {
        assert!(make_file_artifact(uuid::Uuid::new_v4(), 42, "a.rs", "sha", &[0xff, 0xfe]).is_none());
    }
}
