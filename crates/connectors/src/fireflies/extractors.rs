use super::{client_for_tenant, FirefliesSyncService};
use crate::util::parse_source_datetime;
use crate::{generate_backfill_id, trigger_indexing, Extractor, JobContext};
use chrono::Utc;
use ingest_sql::{ArtifactStore, ConfigStore};
use models::{
    Artifact, ArtifactEntity, FirefliesFullBackfillConfig, JobConfig, SourceKind,
};
use serde_json::Value;
use std::time::{Duration, Instant};

/// Build the artifact for one transcript.
pub fn make_transcript_artifact(ingest_job_id: uuid::Uuid, transcript: Value) -> Option<Artifact> {
    let transcript_id = transcript.get("id")?.as_str()?.to_string();
    let source_updated_at = transcript
        .get("dateString")
        .and_then(Value::as_str)
        .and_then(parse_source_datetime)
        .unwrap_or_else(Utc::now);

    Some(Artifact {
        entity: ArtifactEntity::FirefliesTranscript,
        entity_id: ArtifactEntity::FirefliesTranscript.entity_id(&transcript_id),
        metadata: serde_json::json!({
            "transcript_id": transcript_id,
            "title": transcript.get("title").cloned(),
            "organizer_email": transcript.get("organizer_email").cloned(),
            "duration": transcript.get("duration").cloned(),
        }),
        content: serde_json::json!({ "transcript_data": transcript }),
        ingest_job_id,
        source_updated_at,
    })
}

/// Time-sliced full backfill. Each run walks transcripts backwards from the
/// lowest date already seen, persists progress after every page, and
/// re-enqueues itself when its time budget expires; the run that drains the
/// history flips the completion flag.
pub struct FirefliesFullBackfillExtractor;

#[async_trait::async_trait]
impl Extractor for FirefliesFullBackfillExtractor {
    fn source_name(&self) -> &'static str {
        "fireflies_full_backfill"
    }

    #[tracing::instrument(skip_all, fields(job_id = %job_id))]
    async fn process_job(
        &self,
        ctx: &JobContext,
        job_id: uuid::Uuid,
        config: &JobConfig,
    ) -> anyhow::Result<()> {
        let JobConfig::FirefliesFullBackfill(config) = config else {
            anyhow::bail!("unexpected config for {}", self.source_name());
        };
        let backfill_id = config
            .backfill_id
            .clone()
            .unwrap_or_else(generate_backfill_id);
        let started = Instant::now();
        let deadline = started + Duration::from_secs(config.duration_seconds);

        let pool = ctx.pools.acquire(&config.tenant_id).await?;
        let sync = FirefliesSyncService::new(ConfigStore::new(pool.clone()));

        if sync.get_backfill_complete().await? {
            tracing::info!(backfill_id, "Fireflies backfill already complete; skipping");
            return Ok(());
        }

        // First run: stamp the forward watermark before any discovery, so
        // meetings recorded during the backfill land in the incremental.
        if sync.get_synced_until().await?.is_none() {
            sync.set_synced_until(Some(Utc::now())).await?;
        }

        let client = client_for_tenant(ctx, &config.tenant_id).await?;
        let store = ArtifactStore::new(pool.clone());

        // Walk backwards: everything strictly before the lowest date seen.
        let synced_after = sync.get_synced_after().await?;
        let to_date = synced_after.map(|date| date - chrono::Duration::milliseconds(1));

        let mut skip = 0usize;
        let mut processed = 0usize;
        let complete = loop {
            let transcripts = client.get_transcripts(skip, None, to_date).await?;
            if transcripts.is_empty() {
                break true;
            }
            skip += transcripts.len();

            let mut artifacts: Vec<Artifact> = Vec::new();
            for transcript in &transcripts {
                match make_transcript_artifact(job_id, transcript.clone()) {
                    Some(artifact) => artifacts.push(artifact),
                    None => tracing::warn!("transcript missing id; skipped"),
                }
            }
            store.upsert_batch(&artifacts).await?;
            trigger_indexing(
                ctx.indexing.as_ref(),
                artifacts.iter().map(|a| a.entity_id.clone()).collect(),
                SourceKind::FirefliesTranscript,
                &config.tenant_id,
                Some(&backfill_id),
                config.suppress_notification,
            )
            .await?;
            processed += artifacts.len();

            // Transcripts arrive newest-first: the last one is the earliest,
            // and becomes the resume point for the next slice.
            if let Some(earliest) = transcripts
                .last()
                .and_then(|transcript| transcript.get("dateString"))
                .and_then(Value::as_str)
                .and_then(parse_source_datetime)
            {
                sync.set_synced_after(Some(earliest)).await?;
                tracing::info!(
                    count = transcripts.len(),
                    earliest = %earliest,
                    "backfilled transcript batch"
                );
            }

            if Instant::now() >= deadline {
                break false;
            }
        };

        if complete {
            sync.set_backfill_complete(true).await?;
            tracing::info!(
                backfill_id,
                processed,
                elapsed_secs = started.elapsed().as_secs(),
                "Fireflies backfill complete; no successor enqueued"
            );
        } else {
            // Out of budget: hand the remainder to a successor job carrying
            // the same backfill id.
            ctx.queue
                .send_backfill_ingest(&JobConfig::FirefliesFullBackfill(
                    FirefliesFullBackfillConfig {
                        tenant_id: config.tenant_id.clone(),
                        backfill_id: Some(backfill_id.clone()),
                        suppress_notification: config.suppress_notification,
                        duration_seconds: config.duration_seconds,
                    },
                ))
                .await?;
            tracing::info!(
                backfill_id,
                processed,
                elapsed_secs = started.elapsed().as_secs(),
                "Fireflies backfill budget spent; successor enqueued"
            );
        }
        Ok(())
    }
}

/// Forward incremental sync from the `SYNCED_UNTIL` watermark.
pub struct FirefliesIncrementalExtractor;

#[async_trait::async_trait]
impl Extractor for FirefliesIncrementalExtractor {
    fn source_name(&self) -> &'static str {
        "fireflies_incremental"
    }

    #[tracing::instrument(skip_all, fields(job_id = %job_id))]
    async fn process_job(
        &self,
        ctx: &JobContext,
        job_id: uuid::Uuid,
        config: &JobConfig,
    ) -> anyhow::Result<()> {
        let JobConfig::FirefliesIncremental(config) = config else {
            anyhow::bail!("unexpected config for {}", self.source_name());
        };
        let pool = ctx.pools.acquire(&config.tenant_id).await?;
        let sync = FirefliesSyncService::new(ConfigStore::new(pool.clone()));

        let Some(synced_until) = sync.get_synced_until().await? else {
            let backfill_complete = sync.get_backfill_complete().await?;
            tracing::warn!(
                tenant_id = %config.tenant_id,
                backfill_complete,
                "no forward watermark; refusing incremental sync"
            );
            return Ok(());
        };

        let from_date = synced_until - chrono::Duration::seconds(1);
        let client = client_for_tenant(ctx, &config.tenant_id).await?;
        let store = ArtifactStore::new(pool.clone());

        let mut skip = 0usize;
        let mut artifacts: Vec<Artifact> = Vec::new();
        let mut failed = 0usize;
        loop {
            let transcripts = client
                .get_transcripts(skip, Some(from_date), None)
                .await?;
            if transcripts.is_empty() {
                break;
            }
            skip += transcripts.len();
            for transcript in transcripts {
                match make_transcript_artifact(job_id, transcript) {
                    Some(artifact) => artifacts.push(artifact),
                    None => failed += 1,
                }
            }
        }

        if !artifacts.is_empty() {
            store.upsert_batch(&artifacts).await?;
            trigger_indexing(
                ctx.indexing.as_ref(),
                artifacts.iter().map(|a| a.entity_id.clone()).collect(),
                SourceKind::FirefliesTranscript,
                &config.tenant_id,
                None,
                true,
            )
            .await?;
        }

        if failed == 0 {
            let max_date = artifacts.iter().map(|a| a.source_updated_at).max();
            if let Some(max_date) = max_date {
                sync.set_synced_until(Some(max_date.max(synced_until))).await?;
            }
        } else {
            tracing::warn!(failed, "cursor pinned; failed transcripts re-examined next run");
        }

        tracing::info!(
            tenant_id = %config.tenant_id,
            updated = artifacts.len(),
            failed,
            "Fireflies incremental sync complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn transcript_artifacts_key_on_the_transcript_id() {
        let transcript = json!({
            "id": "tx-1",
            "title": "Weekly sync",
            "dateString": "2026-02-03T16:00:00Z",
            "organizer_email": "ada@example.com",
        });
        let artifact = make_transcript_artifact(uuid::Uuid::new_v4(), transcript).unwrap();
        assert_eq!(artifact.entity_id, "fireflies_transcript_tx-1");
        assert_eq!(artifact.metadata["title"], "Weekly sync");
    }

    #[test]
    fn transcripts_without_ids_are_rejected() {
        assert!(make_transcript_artifact(uuid::Uuid::new_v4(), json!({"title": "x"})).is_none());
    }
}
