//! Core domain model for external lead ingestion: page connections, lead forms and leads.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadsync-core";

/// Source tag stamped on every ingested lead.
pub const LEAD_SOURCE_TAG: &str = "Facebook Ads";
pub const DEFAULT_LEAD_NAME: &str = "Facebook Lead";
pub const NEW_LEAD_STATUS: &str = "new";
pub const ACTIVE_PAGE_STATUS: &str = "active";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormStatus {
    Active,
    Inactive,
}

impl FormStatus {
    /// Maps the external status string onto the local two-state status.
    /// Only `ACTIVE` (any casing) counts as active.
    pub fn from_external(raw: Option<&str>) -> Self {
        match raw {
            Some(s) if s.trim().eq_ignore_ascii_case("active") => Self::Active,
            _ => Self::Inactive,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }
}

/// Pipeline stage of a lead inside the CRM. Synced leads always start at
/// `Screening`; the later stages are set by the CRM on rows it manages and
/// still have to decode when those rows are read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeadStage {
    Screening,
    Sourcing,
    #[serde(rename = "Walk-in")]
    WalkIn,
    Closure,
}

impl LeadStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Screening => "Screening",
            Self::Sourcing => "Sourcing",
            Self::WalkIn => "Walk-in",
            Self::Closure => "Closure",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Screening" => Some(Self::Screening),
            "Sourcing" => Some(Self::Sourcing),
            "Walk-in" => Some(Self::WalkIn),
            "Closure" => Some(Self::Closure),
            _ => None,
        }
    }
}

/// A page the tenant administers on the external platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageConnection {
    pub tenant_id: String,
    pub page_id: String,
    pub page_name: String,
    pub access_token: String,
    pub status: String,
    pub sync_enabled: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A lead-collection form attached to a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadForm {
    pub tenant_id: String,
    pub form_id: String,
    pub page_id: String,
    pub name: String,
    pub status: FormStatus,
    pub lead_count: i64,
    pub last_lead_fetched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One question/answer pair of a raw external lead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FieldEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub values: Vec<String>,
}

impl FieldEntry {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: vec![value.into()],
        }
    }

    fn first_value(&self) -> Option<String> {
        self.values.iter().find_map(|v| text_or_none(v))
    }
}

/// Contact details pulled out of a semi-structured field list.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExtractedContact {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub location: Option<String>,
}

impl ExtractedContact {
    /// Substring heuristic over field names: for every target the first field
    /// whose lowercased name matches and carries a non-blank value wins.
    pub fn from_field_data(fields: &[FieldEntry]) -> Self {
        Self {
            name: first_matching(fields, &["name", "full_name"]),
            email: first_matching(fields, &["email"]).map(|e| e.to_lowercase()),
            phone: first_matching(fields, &["phone", "number"]),
            location: first_matching(fields, &["city", "location", "address"]),
        }
    }

    pub fn has_contact(&self) -> bool {
        self.email.is_some() || self.phone.is_some()
    }
}

fn first_matching(fields: &[FieldEntry], needles: &[&str]) -> Option<String> {
    fields
        .iter()
        .filter(|field| {
            let name = field.name.to_lowercase();
            needles.iter().any(|needle| name.contains(needle))
        })
        .find_map(FieldEntry::first_value)
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Handoff contract from the lead fetcher into the ingestor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadDraft {
    pub tenant_id: String,
    pub external_lead_id: String,
    pub form_id: String,
    pub form_name: String,
    pub page_id: String,
    pub created_time: Option<DateTime<Utc>>,
    pub campaign_name: Option<String>,
    pub adset_name: Option<String>,
    pub ad_name: Option<String>,
    pub field_data: Vec<FieldEntry>,
    pub fetched_at: DateTime<Utc>,
}

/// Persisted lead record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub tenant_id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub location: Option<String>,
    pub source: String,
    pub stage: LeadStage,
    pub status: String,
    pub campaign_name: Option<String>,
    pub form_name: Option<String>,
    pub external_lead_id: Option<String>,
    pub form_id: Option<String>,
    pub page_id: Option<String>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: JsonValue,
}

impl Lead {
    /// Builds a fresh lead from an external record. Returns `None` when the
    /// record carries neither a phone nor an email.
    pub fn from_draft(draft: &LeadDraft) -> Option<Self> {
        let contact = ExtractedContact::from_field_data(&draft.field_data);
        if !contact.has_contact() {
            return None;
        }

        let metadata = serde_json::json!({
            "external_lead_id": draft.external_lead_id,
            "form_id": draft.form_id,
            "page_id": draft.page_id,
            "fetched_at": draft.fetched_at,
            "ad_name": draft.ad_name,
            "adset_name": draft.adset_name,
            "field_data": draft.field_data,
        });

        Some(Self {
            id: Uuid::new_v4(),
            tenant_id: draft.tenant_id.clone(),
            name: contact
                .name
                .unwrap_or_else(|| DEFAULT_LEAD_NAME.to_string()),
            email: contact.email,
            phone: contact.phone,
            location: contact.location,
            source: LEAD_SOURCE_TAG.to_string(),
            stage: LeadStage::Screening,
            status: NEW_LEAD_STATUS.to_string(),
            campaign_name: draft.campaign_name.clone(),
            form_name: Some(draft.form_name.clone()),
            external_lead_id: Some(draft.external_lead_id.clone()),
            form_id: Some(draft.form_id.clone()),
            page_id: Some(draft.page_id.clone()),
            fetched_at: Some(draft.fetched_at),
            created_at: draft.created_time.unwrap_or(draft.fetched_at),
            updated_at: draft.fetched_at,
            metadata,
        })
    }
}

/// Parses Graph timestamps such as `2024-01-15T10:30:00+0000`, falling back to RFC 3339.
pub fn parse_graph_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z")
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
                .ok()
                .map(|naive| naive.and_utc())
        })
}
