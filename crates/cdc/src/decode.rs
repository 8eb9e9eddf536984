use anyhow::Context;
use models::{CdcOperation, SalesforceCdcEvent, SalesforceObject};
use std::collections::HashMap;
use std::sync::Mutex;

/// Process-local cache of Avro schemas by schema id. Entries are immutable
/// once written, so concurrent readers share freely.
#[derive(Default)]
pub struct SchemaCache {
    schemas: Mutex<HashMap<String, apache_avro::Schema>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, schema_id: &str) -> Option<apache_avro::Schema> {
        self.schemas.lock().unwrap().get(schema_id).cloned()
    }

    pub fn insert(&self, schema_id: &str, schema_json: &str) -> anyhow::Result<apache_avro::Schema> {
        let schema = apache_avro::Schema::parse_str(schema_json)
            .with_context(|| format!("failed to parse Avro schema {schema_id}"))?;
        self.schemas
            .lock()
            .unwrap()
            .insert(schema_id.to_string(), schema.clone());
        Ok(schema)
    }

    pub fn len(&self) -> usize {
        self.schemas.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decode a binary change-event payload into logical per-record CDC events.
///
/// Most events carry exactly one record id; compound transactions carry
/// several, and each becomes its own event so lane routing stays per-record.
/// An event without record ids decodes to an empty list.
pub fn decode_change_events(
    schema: &apache_avro::Schema,
    payload: &[u8],
    object_type: SalesforceObject,
) -> anyhow::Result<Vec<SalesforceCdcEvent>> {
    let mut reader = payload;
    let value = apache_avro::from_avro_datum(schema, &mut reader, None)
        .context("failed to decode Avro change event payload")?;
    let record_data = avro_to_json(value);

    let header = record_data
        .get("ChangeEventHeader")
        .cloned()
        .unwrap_or(serde_json::Value::Null);

    let operation_type = header
        .get("changeType")
        .and_then(|v| v.as_str())
        .map(CdcOperation::parse_header)
        .unwrap_or(CdcOperation::Update);

    let record_ids: Vec<String> = header
        .get("recordIds")
        .and_then(|v| v.as_array())
        .map(|ids| {
            ids.iter()
                .filter_map(|id| id.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    Ok(record_ids
        .into_iter()
        .map(|record_id| SalesforceCdcEvent {
            record_id,
            object_type,
            operation_type,
            change_event_header: header.clone(),
            record_data: record_data.clone(),
        })
        .collect())
}

/// Convert a decoded Avro value into plain JSON. Unions flatten to their
/// inner value; binary and temporal types normalize to strings and integers.
pub fn avro_to_json(value: apache_avro::types::Value) -> serde_json::Value {
    use apache_avro::types::Value;
    use serde_json::json;

    match value {
        Value::Null => serde_json::Value::Null,
        Value::Boolean(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::Long(i) => json!(i),
        Value::Float(f) => json!(f),
        Value::Double(f) => json!(f),
        Value::String(s) => json!(s),
        Value::Enum(_, symbol) => json!(symbol),
        Value::Union(_, inner) => avro_to_json(*inner),
        Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(avro_to_json).collect())
        }
        Value::Map(entries) => serde_json::Value::Object(
            entries
                .into_iter()
                .map(|(key, value)| (key, avro_to_json(value)))
                .collect(),
        ),
        Value::Record(fields) => serde_json::Value::Object(
            fields
                .into_iter()
                .map(|(key, value)| (key, avro_to_json(value)))
                .collect(),
        ),
        Value::Bytes(bytes) | Value::Fixed(_, bytes) => {
            json!(bytes.iter().map(|b| format!("{b:02x}")).collect::<String>())
        }
        Value::Date(days) => json!(days),
        Value::TimeMillis(ms) => json!(ms),
        Value::TimeMicros(us) => json!(us),
        Value::TimestampMillis(ms) => json!(ms),
        Value::TimestampMicros(us) => json!(us),
        Value::TimestampNanos(ns) => json!(ns),
        Value::LocalTimestampMillis(ms) => json!(ms),
        Value::LocalTimestampMicros(us) => json!(us),
        Value::LocalTimestampNanos(ns) => json!(ns),
        Value::Decimal(decimal) => {
            let bytes = <Vec<u8>>::try_from(&decimal).unwrap_or_default();
            json!(bytes.iter().map(|b| format!("{b:02x}")).collect::<String>())
        }
        Value::BigDecimal(decimal) => json!(decimal.to_string()),
        Value::Duration(duration) => json!(format!(
            "months:{} days:{} millis:{}",
            u32::from(duration.months()),
            u32::from(duration.days()),
            u32::from(duration.millis()),
        )),
        Value::Uuid(uuid) => json!(uuid.to_string()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const CHANGE_EVENT_SCHEMA: &str = r#"
    {
        "type": "record",
        "name": "AccountChangeEvent",
        "fields": [
            {
                "name": "ChangeEventHeader",
                "type": {
                    "type": "record",
                    "name": "ChangeEventHeader",
                    "fields": [
                        {"name": "entityName", "type": "string"},
                        {"name": "recordIds", "type": {"type": "array", "items": "string"}},
                        {"name": "changeType", "type": "string"},
                        {"name": "commitNumber", "type": "long"}
                    ]
                }
            },
            {"name": "Name", "type": ["null", "string"], "default": null}
        ]
    }"#;

    fn encode_event(record_ids: Vec<&str>, change_type: &str, commit: i64) -> Vec<u8> {
        use apache_avro::types::{Record, Value};

        let schema = apache_avro::Schema::parse_str(CHANGE_EVENT_SCHEMA).unwrap();
        let mut record = Record::new(&schema).unwrap();

        let header_schema = match &schema {
            apache_avro::Schema::Record(record_schema) => record_schema.fields[0].schema.clone(),
            _ => unreachable!(),
        };
        let mut header = Record::new(&header_schema).unwrap();
        header.put("entityName", Value::String("Account".to_string()));
        header.put(
            "recordIds",
            Value::Array(
                record_ids
                    .into_iter()
                    .map(|id| Value::String(id.to_string()))
                    .collect(),
            ),
        );
        header.put("changeType", Value::String(change_type.to_string()));
        header.put("commitNumber", Value::Long(commit));

        record.put("ChangeEventHeader", header);
        record.put(
            "Name",
            Value::Union(1, Box::new(Value::String("Acme".to_string()))),
        );

        apache_avro::to_avro_datum(&schema, record).unwrap()
    }

    #[test]
    fn decodes_one_event_per_record_id() {
        let cache = SchemaCache::new();
        let schema = cache.insert("schema-1", CHANGE_EVENT_SCHEMA).unwrap();

        let payload = encode_event(vec!["001ABC", "001DEF"], "UPDATE", 999);
        let events =
            decode_change_events(&schema, &payload, SalesforceObject::Account).unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].record_id, "001ABC");
        assert_eq!(events[1].record_id, "001DEF");
        assert_eq!(events[0].operation_type, CdcOperation::Update);
        assert_eq!(events[0].commit_number(), Some(999));
        assert_eq!(events[0].record_data["Name"], "Acme");
        assert_eq!(events[0].batch_identifier(), "Account_001ABC_999");
    }

    #[test]
    fn delete_events_carry_the_delete_operation() {
        let schema = apache_avro::Schema::parse_str(CHANGE_EVENT_SCHEMA).unwrap();
        let payload = encode_event(vec!["001ABC"], "DELETE", 1000);
        let events =
            decode_change_events(&schema, &payload, SalesforceObject::Account).unwrap();
        assert_eq!(events[0].operation_type, CdcOperation::Delete);
    }

    #[test]
    fn events_without_record_ids_decode_empty() {
        let schema = apache_avro::Schema::parse_str(CHANGE_EVENT_SCHEMA).unwrap();
        let payload = encode_event(vec![], "UPDATE", 1);
        let events =
            decode_change_events(&schema, &payload, SalesforceObject::Account).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn schema_cache_hits_after_insert() {
        let cache = SchemaCache::new();
        assert!(cache.get("schema-1").is_none());
        cache.insert("schema-1", CHANGE_EVENT_SCHEMA).unwrap();
        assert!(cache.get("schema-1").is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn garbage_schemas_are_rejected() {
        let cache = SchemaCache::new();
        assert!(cache.insert("bad", "not a schema").is_err());
        assert!(cache.is_empty());
    }
}
