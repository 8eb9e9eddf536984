use crate::util::parse_source_datetime;
use chrono::{DateTime, Utc};
use models::{Artifact, SalesforceObject};

/// Build the artifact for one Salesforce record. Records without an `Id`
/// cannot be stored and yield `None`.
pub fn make_object_artifact(
    ingest_job_id: uuid::Uuid,
    object: SalesforceObject,
    record: serde_json::Value,
) -> Option<Artifact> {
    let record_id = record.get("Id")?.as_str()?.to_string();
    let record_name = record
        .get("Name")
        .and_then(|name| name.as_str())
        .map(str::to_string);
    let source_updated_at = record_updated_at(&record).unwrap_or_else(Utc::now);

    let entity = object.entity();
    Some(Artifact {
        entity,
        entity_id: entity.entity_id(&record_id),
        metadata: serde_json::json!({
            "object_type": object.api_name(),
            "record_id": record_id,
            "record_name": record_name,
        }),
        content: serde_json::json!({ "record_data": record }),
        ingest_job_id,
        source_updated_at,
    })
}

pub fn record_updated_at(record: &serde_json::Value) -> Option<DateTime<Utc>> {
    record
        .get("LastModifiedDate")?
        .as_str()
        .and_then(parse_source_datetime)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn artifacts_key_on_the_record_id() {
        let record = json!({
            "Id": "001ABC",
            "Name": "Acme",
            "LastModifiedDate": "2026-01-02T03:04:05.000+0000",
        });
        let artifact =
            make_object_artifact(uuid::Uuid::new_v4(), SalesforceObject::Account, record).unwrap();

        assert_eq!(artifact.entity_id, "salesforce_account_001ABC");
        assert_eq!(artifact.metadata["record_name"], "Acme");
        assert_eq!(artifact.content["record_data"]["Id"], "001ABC");
    }

    #[test]
    fn records_without_an_id_are_rejected() {
        let record = json!({"Name": "orphan"});
        assert!(
            make_object_artifact(uuid::Uuid::new_v4(), SalesforceObject::Contact, record).is_none()
        );
    }
}
