/// SourceKind tags the downstream document source of an ingested record.
/// It selects the transformer, the indexing namespace, and the health check
/// which apply to an entity, and is the discriminator carried by indexing
/// requests.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Salesforce,
    GitlabMr,
    GitlabFile,
    TeamworkTask,
    FirefliesTranscript,
    CanvaDesign,
    PipedriveDeal,
    AttioRecord,
    FigmaFile,
    PosthogInsight,
    PylonIssue,
    LinearIssue,
}

impl SourceKind {
    pub const ALL: &'static [SourceKind] = &[
        SourceKind::Salesforce,
        SourceKind::GitlabMr,
        SourceKind::GitlabFile,
        SourceKind::TeamworkTask,
        SourceKind::FirefliesTranscript,
        SourceKind::CanvaDesign,
        SourceKind::PipedriveDeal,
        SourceKind::AttioRecord,
        SourceKind::FigmaFile,
        SourceKind::PosthogInsight,
        SourceKind::PylonIssue,
        SourceKind::LinearIssue,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Salesforce => "salesforce",
            SourceKind::GitlabMr => "gitlab_mr",
            SourceKind::GitlabFile => "gitlab_file",
            SourceKind::TeamworkTask => "teamwork_task",
            SourceKind::FirefliesTranscript => "fireflies_transcript",
            SourceKind::CanvaDesign => "canva_design",
            SourceKind::PipedriveDeal => "pipedrive_deal",
            SourceKind::AttioRecord => "attio_record",
            SourceKind::FigmaFile => "figma_file",
            SourceKind::PosthogInsight => "posthog_insight",
            SourceKind::PylonIssue => "pylon_issue",
            SourceKind::LinearIssue => "linear_issue",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|kind| kind.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown source kind: {s:?}"))
    }
}

/// ArtifactEntity is the `entity` column of the artifact store, and the
/// prefix of every entity id. One SourceKind may fan out over multiple
/// entities (Salesforce objects each get their own).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactEntity {
    SalesforceAccount,
    SalesforceContact,
    SalesforceOpportunity,
    SalesforceLead,
    SalesforceCase,
    GitlabMr,
    GitlabFile,
    TeamworkTask,
    FirefliesTranscript,
    CanvaDesign,
    PipedriveDeal,
    AttioRecord,
    FigmaFile,
    PosthogInsight,
    PylonIssue,
    LinearIssue,
}

impl ArtifactEntity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactEntity::SalesforceAccount => "salesforce_account",
            ArtifactEntity::SalesforceContact => "salesforce_contact",
            ArtifactEntity::SalesforceOpportunity => "salesforce_opportunity",
            ArtifactEntity::SalesforceLead => "salesforce_lead",
            ArtifactEntity::SalesforceCase => "salesforce_case",
            ArtifactEntity::GitlabMr => "gitlab_mr",
            ArtifactEntity::GitlabFile => "gitlab_file",
            ArtifactEntity::TeamworkTask => "teamwork_task",
            ArtifactEntity::FirefliesTranscript => "fireflies_transcript",
            ArtifactEntity::CanvaDesign => "canva_design",
            ArtifactEntity::PipedriveDeal => "pipedrive_deal",
            ArtifactEntity::AttioRecord => "attio_record",
            ArtifactEntity::FigmaFile => "figma_file",
            ArtifactEntity::PosthogInsight => "posthog_insight",
            ArtifactEntity::PylonIssue => "pylon_issue",
            ArtifactEntity::LinearIssue => "linear_issue",
        }
    }

    /// Compose the stable entity id `<entity>_<provider_id>`.
    /// This is the only cross-layer identity key: the artifact store, the
    /// indexing callback, and the pruner all join on it.
    pub fn entity_id(&self, provider_id: impl std::fmt::Display) -> String {
        format!("{}_{}", self.as_str(), provider_id)
    }

    /// Compose a container-scoped entity id `<entity>_<container>_<provider_id>`,
    /// used for entities only unique within a container (files in a project).
    pub fn scoped_entity_id(
        &self,
        container_id: impl std::fmt::Display,
        provider_id: impl std::fmt::Display,
    ) -> String {
        format!("{}_{}_{}", self.as_str(), container_id, provider_id)
    }
}

impl std::fmt::Display for ArtifactEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The Salesforce SObject types this plane ingests.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum SalesforceObject {
    Account,
    Contact,
    Opportunity,
    Lead,
    Case,
}

impl SalesforceObject {
    pub const ALL: &'static [SalesforceObject] = &[
        SalesforceObject::Account,
        SalesforceObject::Contact,
        SalesforceObject::Opportunity,
        SalesforceObject::Lead,
        SalesforceObject::Case,
    ];

    pub fn api_name(&self) -> &'static str {
        match self {
            SalesforceObject::Account => "Account",
            SalesforceObject::Contact => "Contact",
            SalesforceObject::Opportunity => "Opportunity",
            SalesforceObject::Lead => "Lead",
            SalesforceObject::Case => "Case",
        }
    }

    pub fn entity(&self) -> ArtifactEntity {
        match self {
            SalesforceObject::Account => ArtifactEntity::SalesforceAccount,
            SalesforceObject::Contact => ArtifactEntity::SalesforceContact,
            SalesforceObject::Opportunity => ArtifactEntity::SalesforceOpportunity,
            SalesforceObject::Lead => ArtifactEntity::SalesforceLead,
            SalesforceObject::Case => ArtifactEntity::SalesforceCase,
        }
    }

    /// The Pub/Sub change-event channel for this object type.
    pub fn change_event_topic(&self) -> String {
        format!("/data/{}ChangeEvent", self.api_name())
    }
}

impl std::fmt::Display for SalesforceObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.api_name())
    }
}

impl std::str::FromStr for SalesforceObject {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|obj| obj.api_name() == s)
            .copied()
            .ok_or_else(|| format!("unknown Salesforce object type: {s:?}"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn entity_ids_are_stable() {
        assert_eq!(
            ArtifactEntity::TeamworkTask.entity_id(7001),
            "teamwork_task_7001"
        );
        assert_eq!(
            ArtifactEntity::SalesforceAccount.entity_id("001ABC"),
            "salesforce_account_001ABC"
        );
        assert_eq!(
            ArtifactEntity::GitlabFile.scoped_entity_id(42, "src/main.rs"),
            "gitlab_file_42_src/main.rs"
        );
        // Identical inputs produce identical outputs.
        assert_eq!(
            ArtifactEntity::TeamworkTask.entity_id(7001),
            ArtifactEntity::TeamworkTask.entity_id(7001),
        );
    }

    #[test]
    fn source_kind_round_trips() {
        for kind in SourceKind::ALL {
            let parsed: SourceKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, *kind);

            let json = serde_json::to_string(kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn salesforce_object_topics() {
        assert_eq!(
            SalesforceObject::Account.change_event_topic(),
            "/data/AccountChangeEvent"
        );
        assert_eq!(
            SalesforceObject::Opportunity.change_event_topic(),
            "/data/OpportunityChangeEvent"
        );
    }
}
