use chrono::{DateTime, Utc};
use ingest_sql::ConfigStore;

const TASKS_SYNCED_UNTIL: &str = "TEAMWORK_TASKS_SYNCED_UNTIL";
const TASKS_BACKFILL_COMPLETE: &str = "TEAMWORK_TASKS_BACKFILL_COMPLETE";

/// Sync-state keys for the Teamwork task sync.
pub struct TeamworkSyncService {
    config: ConfigStore,
}

impl TeamworkSyncService {
    pub fn new(config: ConfigStore) -> Self {
        Self { config }
    }

    pub async fn get_tasks_synced_until(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        self.config.get_datetime(TASKS_SYNCED_UNTIL).await
    }

    pub async fn set_tasks_synced_until(
        &self,
        value: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        self.config.set_datetime(TASKS_SYNCED_UNTIL, value).await
    }

    pub async fn get_backfill_complete(&self) -> anyhow::Result<bool> {
        self.config.get_bool(TASKS_BACKFILL_COMPLETE).await
    }

    pub async fn set_backfill_complete(&self, value: bool) -> anyhow::Result<()> {
        self.config.set_bool(TASKS_BACKFILL_COMPLETE, value).await
    }
}
