use chrono::{DateTime, Utc};
use ingest_sql::ConfigStore;
use models::SalesforceObject;

/// Sync-state keys for the Salesforce object sync, one watermark per object
/// type in the tenant's config table.
pub struct SalesforceSyncService {
    config: ConfigStore,
}

impl SalesforceSyncService {
    pub fn new(config: ConfigStore) -> Self {
        Self { config }
    }

    fn last_synced_key(object: SalesforceObject) -> String {
        format!(
            "SALESFORCE_OBJECT_SYNC_LAST_SYNCED_AT_{}",
            object.api_name().to_uppercase()
        )
    }

    pub async fn get_object_last_synced_at(
        &self,
        object: SalesforceObject,
    ) -> anyhow::Result<Option<DateTime<Utc>>> {
        self.config.get_datetime(&Self::last_synced_key(object)).await
    }

    pub async fn set_object_last_synced_at(
        &self,
        object: SalesforceObject,
        value: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        self.config
            .set_datetime(&Self::last_synced_key(object), value)
            .await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn keys_are_per_object_and_uppercase() {
        assert_eq!(
            SalesforceSyncService::last_synced_key(SalesforceObject::Opportunity),
            "SALESFORCE_OBJECT_SYNC_LAST_SYNCED_AT_OPPORTUNITY"
        );
    }
}
