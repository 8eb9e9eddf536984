use models::SourceKind;
use sqlx::{PgPool, Row};

/// Ids of the documents currently indexed for a source in this tenant's
/// database. Stale-document reconciliation starts from this set.
pub async fn indexed_document_ids(
    pool: &PgPool,
    source: SourceKind,
) -> anyhow::Result<Vec<String>> {
    let rows = sqlx::query("SELECT id FROM documents WHERE source = $1")
        .bind(source.as_str())
        .fetch_all(pool)
        .await?;
    rows.into_iter()
        .map(|row| Ok(row.try_get::<String, _>("id")?))
        .collect()
}
