use chrono::{DateTime, Utc};
use ingest_sql::ConfigStore;

const MR_SYNCED_UNTIL_PREFIX: &str = "GITLAB_MR_SYNCED_UNTIL_";
const FILE_SYNCED_COMMIT_PREFIX: &str = "GITLAB_FILE_SYNCED_COMMIT_";

/// Sync-state keys for GitLab, per project: an `updated_at` watermark for
/// merge requests and a commit-SHA cursor for repository files.
pub struct GitlabSyncService {
    config: ConfigStore,
}

impl GitlabSyncService {
    pub fn new(config: ConfigStore) -> Self {
        Self { config }
    }

    fn mr_synced_until_key(project_id: i64) -> String {
        format!("{MR_SYNCED_UNTIL_PREFIX}{project_id}")
    }

    fn file_synced_commit_key(project_id: i64) -> String {
        format!("{FILE_SYNCED_COMMIT_PREFIX}{project_id}")
    }

    pub async fn get_mr_synced_until(
        &self,
        project_id: i64,
    ) -> anyhow::Result<Option<DateTime<Utc>>> {
        self.config
            .get_datetime(&Self::mr_synced_until_key(project_id))
            .await
    }

    pub async fn set_mr_synced_until(
        &self,
        project_id: i64,
        value: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        self.config
            .set_datetime(&Self::mr_synced_until_key(project_id), value)
            .await
    }

    pub async fn clear_all_mr_synced_until(&self) -> anyhow::Result<u64> {
        self.config.delete_prefix(MR_SYNCED_UNTIL_PREFIX).await
    }

    pub async fn get_file_synced_commit(
        &self,
        project_id: i64,
    ) -> anyhow::Result<Option<String>> {
        self.config.get(&Self::file_synced_commit_key(project_id)).await
    }

    pub async fn set_file_synced_commit(
        &self,
        project_id: i64,
        commit_sha: Option<&str>,
    ) -> anyhow::Result<()> {
        self.config
            .set(&Self::file_synced_commit_key(project_id), commit_sha)
            .await
    }

    pub async fn clear_all_file_synced_commits(&self) -> anyhow::Result<u64> {
        self.config.delete_prefix(FILE_SYNCED_COMMIT_PREFIX).await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn keys_are_scoped_per_project() {
        assert_eq!(
            GitlabSyncService::mr_synced_until_key(42),
            "GITLAB_MR_SYNCED_UNTIL_42"
        );
        assert_eq!(
            GitlabSyncService::file_synced_commit_key(42),
            "GITLAB_FILE_SYNCED_COMMIT_42"
        );
    }
}
