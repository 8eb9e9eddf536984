use crate::SalesforceObject;

/// Change operations carried by a Salesforce CDC event header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CdcOperation {
    Insert,
    Update,
    Delete,
    Undelete,
}

impl CdcOperation {
    /// Headers occasionally carry composite change types (GAP_UPDATE and
    /// friends); anything unrecognized is treated as an update, which is the
    /// safe interpretation because updates re-fetch the full record.
    pub fn parse_header(change_type: &str) -> CdcOperation {
        match change_type {
            "CREATE" | "INSERT" => CdcOperation::Insert,
            "DELETE" => CdcOperation::Delete,
            "UNDELETE" => CdcOperation::Undelete,
            _ => CdcOperation::Update,
        }
    }
}

/// One logical change to one Salesforce record, as decoded from the Pub/Sub
/// stream. Events with multiple record ids are split into one of these per id
/// before they are enqueued.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SalesforceCdcEvent {
    pub record_id: String,
    pub object_type: SalesforceObject,
    pub operation_type: CdcOperation,
    /// The decoded ChangeEventHeader, kept verbatim for auditing.
    pub change_event_header: serde_json::Value,
    /// The decoded change payload. Often partial: consumers re-fetch the full
    /// record rather than trusting the delta.
    pub record_data: serde_json::Value,
}

impl SalesforceCdcEvent {
    pub fn commit_number(&self) -> Option<i64> {
        self.change_event_header.get("commitNumber")?.as_i64()
    }

    /// Identifier for dedup and lane derivation, built from the first event
    /// of a batch. Kept short: queue dedup ids are capped at 128 chars.
    pub fn batch_identifier(&self) -> String {
        format!(
            "{}_{}_{}",
            self.object_type.api_name(),
            self.record_id,
            self.commit_number().unwrap_or(0),
        )
    }
}

/// Body of the webhook-lane message a CDC listener enqueues.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SalesforceCdcWebhookBody {
    pub events: Vec<SalesforceCdcEvent>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn operation_serde_matches_wire_format() {
        assert_eq!(
            serde_json::to_string(&CdcOperation::Undelete).unwrap(),
            "\"UNDELETE\""
        );
        let op: CdcOperation = serde_json::from_str("\"DELETE\"").unwrap();
        assert_eq!(op, CdcOperation::Delete);
    }

    #[test]
    fn unknown_change_types_become_updates() {
        assert_eq!(
            CdcOperation::parse_header("GAP_UPDATE"),
            CdcOperation::Update
        );
        assert_eq!(CdcOperation::parse_header("CREATE"), CdcOperation::Insert);
    }

    #[test]
    fn batch_identifier_uses_header_commit() {
        let event = SalesforceCdcEvent {
            record_id: "001ABC".to_string(),
            object_type: SalesforceObject::Account,
            operation_type: CdcOperation::Update,
            change_event_header: serde_json::json!({"commitNumber": 999}),
            record_data: serde_json::json!({}),
        };
        assert_eq!(event.batch_identifier(), "Account_001ABC_999");
    }
}
