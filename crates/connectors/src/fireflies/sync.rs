use chrono::{DateTime, Utc};
use ingest_sql::ConfigStore;

const SYNCED_AFTER: &str = "FIREFLIES_TRANSCRIPTS_SYNCED_AFTER";
const SYNCED_UNTIL: &str = "FIREFLIES_TRANSCRIPTS_SYNCED_UNTIL";
const BACKFILL_COMPLETE: &str = "FIREFLIES_TRANSCRIPTS_BACKFILL_COMPLETE";

/// Sync state for Fireflies transcripts. The full backfill walks history
/// backwards, lowering `SYNCED_AFTER`; incremental syncs walk forwards,
/// raising `SYNCED_UNTIL`.
pub struct FirefliesSyncService {
    config: ConfigStore,
}

impl FirefliesSyncService {
    pub fn new(config: ConfigStore) -> Self {
        Self { config }
    }

    /// The earliest transcript date the backfill has reached.
    pub async fn get_synced_after(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        self.config.get_datetime(SYNCED_AFTER).await
    }

    pub async fn set_synced_after(&self, value: Option<DateTime<Utc>>) -> anyhow::Result<()> {
        self.config.set_datetime(SYNCED_AFTER, value).await
    }

    /// The forward watermark consumed by incremental syncs.
    pub async fn get_synced_until(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        self.config.get_datetime(SYNCED_UNTIL).await
    }

    pub async fn set_synced_until(&self, value: Option<DateTime<Utc>>) -> anyhow::Result<()> {
        self.config.set_datetime(SYNCED_UNTIL, value).await
    }

    pub async fn get_backfill_complete(&self) -> anyhow::Result<bool> {
        self.config.get_bool(BACKFILL_COMPLETE).await
    }

    pub async fn set_backfill_complete(&self, value: bool) -> anyhow::Result<()> {
        self.config.set_bool(BACKFILL_COMPLETE, value).await
    }
}
