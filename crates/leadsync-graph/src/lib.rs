//! Graph API client for pages, lead-gen forms and leads, behind the `LeadSource` seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadsync_core::{parse_graph_timestamp, FieldEntry, LeadDraft, LeadForm};
use leadsync_storage::{ArtifactStore, FetchError, HttpFetcher, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "leadsync-graph";

pub const DEFAULT_GRAPH_API_URL: &str = "https://graph.facebook.com/v19.0";
pub const PAGE_FIELDS: &str = "id,name,access_token";
pub const FORM_FIELDS: &str = "id,name,status,leads_count";
pub const LEAD_FIELDS: &str = "id,created_time,field_data,campaign_name,adset_name,ad_name";
pub const BATCH_LIMIT: u32 = 100;
pub const REDACTED: &str = "[redacted]";

/// One response of a cursor-paginated listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<T> {
    pub items: Vec<T>,
    pub next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
    #[serde(default)]
    paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
struct Paging {
    #[serde(default)]
    next: Option<String>,
}

impl<T> Envelope<T> {
    fn into_batch(self) -> Batch<T> {
        Batch {
            items: self.data,
            next: self
                .paging
                .and_then(|p| p.next)
                .filter(|next| !next.trim().is_empty()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteIdentity {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePage {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteForm {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub leads_count: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLead {
    pub id: String,
    #[serde(default)]
    pub created_time: Option<String>,
    #[serde(default)]
    pub field_data: Vec<FieldEntry>,
    #[serde(default)]
    pub campaign_name: Option<String>,
    #[serde(default)]
    pub adset_name: Option<String>,
    #[serde(default)]
    pub ad_name: Option<String>,
}

impl RemoteLead {
    pub fn into_draft(self, form: &LeadForm, fetched_at: DateTime<Utc>) -> LeadDraft {
        LeadDraft {
            tenant_id: form.tenant_id.clone(),
            external_lead_id: self.id,
            form_id: form.form_id.clone(),
            form_name: form.name.clone(),
            page_id: form.page_id.clone(),
            created_time: self.created_time.as_deref().and_then(parse_graph_timestamp),
            campaign_name: self.campaign_name,
            adset_name: self.adset_name,
            ad_name: self.ad_name,
            field_data: self.field_data,
            fetched_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    code: Option<i64>,
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph api error (http {status}, code {code:?}): {message}")]
    Api {
        status: u16,
        code: Option<i64>,
        kind: Option<String>,
        message: String,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding {resource} response: {source}")]
    Decode {
        resource: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("building url for {0}")]
    Url(String),
}

impl GraphError {
    /// Graph error code 190 marks an expired or revoked access token.
    pub fn is_auth_failure(&self) -> bool {
        match self {
            Self::Api { status, code, .. } => *code == Some(190) || *status == 401,
            Self::Fetch(err) => err.status() == Some(401),
            _ => false,
        }
    }
}

/// Source of pages, forms and leads. `cursor` is `None` for the first batch and
/// the previous batch's `next` link afterwards.
#[async_trait]
pub trait LeadSource: Send + Sync {
    async fn me(&self, access_token: &str) -> Result<RemoteIdentity, GraphError>;

    async fn pages(
        &self,
        user_token: &str,
        cursor: Option<&str>,
    ) -> Result<Batch<RemotePage>, GraphError>;

    async fn lead_forms(
        &self,
        page_id: &str,
        page_token: &str,
        cursor: Option<&str>,
    ) -> Result<Batch<RemoteForm>, GraphError>;

    async fn leads(
        &self,
        form_id: &str,
        page_token: &str,
        cursor: Option<&str>,
    ) -> Result<Batch<RemoteLead>, GraphError>;
}

pub struct GraphClient {
    base_url: String,
    http: HttpFetcher,
    archive: Option<ArtifactStore>,
}

impl GraphClient {
    pub fn new(base_url: impl Into<String>, http: HttpFetcher) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            archive: None,
        }
    }

    /// Keeps a copy of every successful response body on disk.
    pub fn with_archive(mut self, archive: ArtifactStore) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn endpoint_url(
        &self,
        node: &str,
        edge: Option<&str>,
        params: &[(&str, &str)],
    ) -> Result<String, GraphError> {
        let raw = match edge {
            Some(edge) => format!("{}/{}/{}", self.base_url, node, edge),
            None => format!("{}/{}", self.base_url, node),
        };
        let mut url = Url::parse(&raw).map_err(|_| GraphError::Url(node.to_string()))?;
        url.query_pairs_mut().extend_pairs(params.iter().copied());
        Ok(url.to_string())
    }

    fn listing_url(
        &self,
        node: &str,
        edge: &str,
        token: &str,
        fields: &str,
        cursor: Option<&str>,
    ) -> Result<String, GraphError> {
        match cursor {
            Some(next) => Ok(next.to_string()),
            None => {
                let limit = BATCH_LIMIT.to_string();
                self.endpoint_url(
                    node,
                    Some(edge),
                    &[("access_token", token), ("fields", fields), ("limit", limit.as_str())],
                )
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        resource: &'static str,
        scope: &str,
        url: &str,
    ) -> Result<T, GraphError> {
        let response = self.http.fetch_bytes(resource, url).await.map_err(api_error)?;

        if let Some(archive) = &self.archive {
            let body = redact_access_tokens(&response.body);
            if let Err(err) = archive
                .archive_response(Utc::now(), scope, resource, &body)
                .await
            {
                warn!(resource, scope, error = %err, "failed to archive raw response");
            }
        }

        serde_json::from_slice(&response.body).map_err(|source| GraphError::Decode { resource, source })
    }
}

/// Replaces every `access_token` in a JSON body, including the query of paging
/// links, before it is written to disk. Bodies without a token are returned untouched.
pub fn redact_access_tokens(body: &[u8]) -> Cow<'_, [u8]> {
    fn scrub(value: &mut Value) -> bool {
        match value {
            Value::Object(map) => {
                let mut changed = false;
                for (key, field) in map.iter_mut() {
                    if key == "access_token" && field.is_string() {
                        *field = Value::String(REDACTED.to_string());
                        changed = true;
                    } else {
                        changed |= scrub(field);
                    }
                }
                changed
            }
            Value::Array(items) => items.iter_mut().fold(false, |acc, item| scrub(item) | acc),
            Value::String(text) if text.contains("access_token=") => match redact_url(text) {
                Some(redacted) => {
                    *text = redacted;
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    let Ok(mut value) = serde_json::from_slice::<Value>(body) else {
        return Cow::Borrowed(body);
    };
    if !scrub(&mut value) {
        return Cow::Borrowed(body);
    }
    match serde_json::to_vec(&value) {
        Ok(bytes) => Cow::Owned(bytes),
        Err(_) => Cow::Borrowed(body),
    }
}

fn redact_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw).ok()?;
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let v = if k == "access_token" { REDACTED.to_string() } else { v.into_owned() };
            (k.into_owned(), v)
        })
        .collect();
    url.query_pairs_mut().clear().extend_pairs(pairs);
    Some(url.to_string())
}

/// Lifts Graph error payloads out of HTTP failures.
fn api_error(err: FetchError) -> GraphError {
    if let FetchError::HttpStatus { status, body, .. } = &err {
        if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) {
            return GraphError::Api {
                status: *status,
                code: envelope.error.code,
                kind: envelope.error.kind,
                message: envelope.error.message,
            };
        }
    }
    GraphError::Fetch(err)
}

#[async_trait]
impl LeadSource for GraphClient {
    async fn me(&self, access_token: &str) -> Result<RemoteIdentity, GraphError> {
        let url = self.endpoint_url(
            "me",
            None,
            &[("access_token", access_token), ("fields", "id,name")],
        )?;
        self.get_json("me", "me", &url).await
    }

    async fn pages(
        &self,
        user_token: &str,
        cursor: Option<&str>,
    ) -> Result<Batch<RemotePage>, GraphError> {
        let url = self.listing_url("me", "accounts", user_token, PAGE_FIELDS, cursor)?;
        let envelope: Envelope<RemotePage> = self.get_json("pages", "me", &url).await?;
        Ok(envelope.into_batch())
    }

    async fn lead_forms(
        &self,
        page_id: &str,
        page_token: &str,
        cursor: Option<&str>,
    ) -> Result<Batch<RemoteForm>, GraphError> {
        let url = self.listing_url(page_id, "leadgen_forms", page_token, FORM_FIELDS, cursor)?;
        let envelope: Envelope<RemoteForm> = self.get_json("lead_forms", page_id, &url).await?;
        Ok(envelope.into_batch())
    }

    async fn leads(
        &self,
        form_id: &str,
        page_token: &str,
        cursor: Option<&str>,
    ) -> Result<Batch<RemoteLead>, GraphError> {
        let url = self.listing_url(form_id, "leads", page_token, LEAD_FIELDS, cursor)?;
        let envelope: Envelope<RemoteLead> = self.get_json("leads", form_id, &url).await?;
        Ok(envelope.into_batch())
    }
}
