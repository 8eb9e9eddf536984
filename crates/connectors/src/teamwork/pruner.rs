use super::{artifacts, client_for_tenant};
use crate::JobContext;
use ingest_sql::{indexed_document_ids, ArtifactStore};
use models::{ArtifactEntity, SourceKind};
use pruner::{IndexWriter, StaleReason};
use serde_json::Value;
use std::collections::HashMap;

/// Provider fetches during reconciliation are sized to fit one API call.
const PRUNE_BATCH_SIZE: usize = 50;

const DOC_ID_PREFIX: &str = "teamwork_task_";

pub fn task_doc_id(task_id: i64) -> String {
    format!("{DOC_ID_PREFIX}{task_id}")
}

/// Delete a task from the artifact store and the index. The doc id shares
/// the entity id shape, so the resolver is the identity.
pub async fn delete_task(
    artifacts: &ArtifactStore,
    index: &dyn IndexWriter,
    tenant_id: &str,
    task_id: i64,
) -> bool {
    tracing::info!(tenant_id, task_id, "deleting Teamwork task");
    let entity_id = ArtifactEntity::TeamworkTask.entity_id(task_id);
    pruner::delete_entity(
        artifacts,
        index,
        tenant_id,
        ArtifactEntity::TeamworkTask,
        &entity_id,
        |entity_id| entity_id.to_string(),
    )
    .await
}

/// Classify one reconciliation batch: absent tasks are deleted; present
/// tasks keep their document only with `isPrivate` explicitly false.
pub fn classify_stale_tasks(
    batch_ids: &[i64],
    fetched: &HashMap<i64, Value>,
) -> Vec<(i64, StaleReason)> {
    batch_ids
        .iter()
        .filter_map(|&task_id| {
            let Some(task) = fetched.get(&task_id) else {
                return Some((task_id, StaleReason::Deleted));
            };
            if artifacts::is_indexable(task) {
                None
            } else if artifacts::visibility_flag_missing(task) {
                Some((task_id, StaleReason::MissingVisibility))
            } else {
                Some((task_id, StaleReason::Private))
            }
        })
        .collect()
}

/// Find Teamwork documents which should no longer be indexed: deleted
/// upstream, flipped private, or visibility unknown (fail-closed). Returns
/// doc ids; the caller iterates [`delete_task`] over them.
pub async fn find_stale_documents(
    ctx: &JobContext,
    pool: &sqlx::PgPool,
    tenant_id: &str,
) -> anyhow::Result<Vec<String>> {
    let client = client_for_tenant(ctx, pool, tenant_id).await?;

    let indexed = indexed_document_ids(pool, SourceKind::TeamworkTask).await?;
    if indexed.is_empty() {
        tracing::info!(tenant_id, "no Teamwork documents to reconcile");
        return Ok(Vec::new());
    }

    // Doc ids are `teamwork_task_<id>`; anything else is skipped.
    let task_ids: Vec<i64> = indexed
        .iter()
        .filter_map(|doc_id| doc_id.strip_prefix(DOC_ID_PREFIX)?.parse().ok())
        .collect();

    tracing::info!(
        tenant_id,
        indexed = task_ids.len(),
        "checking indexed Teamwork tasks for staleness"
    );

    let mut stale_doc_ids = Vec::new();
    let mut deleted = 0usize;
    let mut private = 0usize;
    let mut missing_visibility = 0usize;

    for batch in task_ids.chunks(PRUNE_BATCH_SIZE) {
        // Only `isPrivate` matters here; skip the sideload cost.
        let (tasks, _included) = match client.get_tasks_by_ids(batch, Some(&[])).await {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(?err, "failed to check task batch for staleness");
                continue;
            }
        };

        let fetched: HashMap<i64, Value> = tasks
            .into_iter()
            .filter_map(|task| Some((task.get("id")?.as_i64()?, task)))
            .collect();

        for (task_id, reason) in classify_stale_tasks(batch, &fetched) {
            match reason {
                StaleReason::Deleted => deleted += 1,
                StaleReason::Private => private += 1,
                StaleReason::MissingVisibility => missing_visibility += 1,
            }
            stale_doc_ids.push(task_doc_id(task_id));
        }
    }

    tracing::info!(
        tenant_id,
        stale = stale_doc_ids.len(),
        deleted,
        private,
        missing_visibility,
        "found stale Teamwork documents"
    );
    Ok(stale_doc_ids)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn classification_is_fail_closed() {
        let batch = vec![1, 2, 3, 4, 5];
        let fetched: HashMap<i64, Value> = [
            (1, json!({"id": 1, "isPrivate": false})),
            (2, json!({"id": 2, "isPrivate": true})),
            (3, json!({"id": 3})),
            (4, json!({"id": 4, "isPrivate": null})),
        ]
        .into_iter()
        .collect();

        let stale = classify_stale_tasks(&batch, &fetched);
        assert_eq!(
            stale,
            vec![
                (2, StaleReason::Private),
                (3, StaleReason::MissingVisibility),
                (4, StaleReason::Private),
                (5, StaleReason::Deleted),
            ]
        );
    }

    #[test]
    fn doc_ids_match_entity_ids() {
        assert_eq!(task_doc_id(7001), "teamwork_task_7001");
    }
}
