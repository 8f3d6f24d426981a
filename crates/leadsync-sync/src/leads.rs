//! Per-form lead download and deduplicating ingest.

use std::collections::HashMap;

use anyhow::Result;
use chrono::Utc;
use leadsync_core::{FormStatus, Lead, LeadDraft, LeadForm};
use leadsync_graph::{GraphError, LeadSource};
use leadsync_storage::{InsertOutcome, LeadRepository};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::CursorGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Inserted,
    Duplicate,
    /// Neither phone nor email could be extracted.
    Discarded,
}

/// Turns drafts into stored leads, skipping any draft that matches an existing
/// lead of the tenant by phone, email or external id.
pub struct DeduplicatingIngestor<'a> {
    repo: &'a LeadRepository,
}

impl<'a> DeduplicatingIngestor<'a> {
    pub fn new(repo: &'a LeadRepository) -> Self {
        Self { repo }
    }

    pub async fn ingest(&self, draft: &LeadDraft) -> Result<IngestOutcome> {
        let Some(lead) = Lead::from_draft(draft) else {
            debug!(
                tenant_id = %draft.tenant_id,
                external_lead_id = %draft.external_lead_id,
                "lead has no phone or email, discarded"
            );
            return Ok(IngestOutcome::Discarded);
        };

        Ok(match self.repo.insert_lead_if_absent(&lead).await? {
            InsertOutcome::Inserted => IngestOutcome::Inserted,
            InsertOutcome::Duplicate => IngestOutcome::Duplicate,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadFetchSummary {
    pub forms_processed: usize,
    pub forms_skipped: usize,
    pub form_errors: usize,
    pub leads_seen: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub discarded: usize,
    pub lead_errors: usize,
}

pub struct LeadFetcher<'a> {
    source: &'a dyn LeadSource,
    repo: &'a LeadRepository,
    max_pages: usize,
    active_forms_only: bool,
}

impl<'a> LeadFetcher<'a> {
    pub fn new(source: &'a dyn LeadSource, repo: &'a LeadRepository, max_pages: usize) -> Self {
        Self {
            source,
            repo,
            max_pages,
            active_forms_only: false,
        }
    }

    pub fn active_forms_only(mut self, enabled: bool) -> Self {
        self.active_forms_only = enabled;
        self
    }

    /// Walks every stored form whose page connection has sync enabled. A form
    /// whose cursor fails is counted in `form_errors`; the remaining forms
    /// still run.
    pub async fn fetch_tenant(&self, tenant_id: &str) -> Result<LeadFetchSummary> {
        let pages: HashMap<String, _> = self
            .repo
            .list_pages(tenant_id)
            .await?
            .into_iter()
            .map(|page| (page.page_id.clone(), page))
            .collect();

        let mut summary = LeadFetchSummary::default();
        for form in self.repo.list_forms(tenant_id).await? {
            if self.active_forms_only && form.status != FormStatus::Active {
                summary.forms_skipped += 1;
                continue;
            }
            let Some(page) = pages.get(&form.page_id) else {
                warn!(tenant_id, form_id = %form.form_id, page_id = %form.page_id, "form has no page connection");
                summary.forms_skipped += 1;
                continue;
            };
            if !page.sync_enabled {
                debug!(tenant_id, page_id = %page.page_id, "page sync disabled");
                summary.forms_skipped += 1;
                continue;
            }
            if page.access_token.trim().is_empty() {
                warn!(tenant_id, page_id = %page.page_id, "page has no access token, skipping its forms");
                summary.forms_skipped += 1;
                continue;
            }

            summary.forms_processed += 1;
            let inserted_before = summary.inserted;
            match self.fetch_form(&form, &page.access_token, &mut summary).await {
                Ok(()) => {
                    self.repo
                        .mark_form_fetched(tenant_id, &form.form_id, Utc::now())
                        .await?;
                    info!(
                        tenant_id,
                        form_id = %form.form_id,
                        inserted = summary.inserted - inserted_before,
                        "form leads fetched"
                    );
                }
                Err(err) => {
                    warn!(tenant_id, form_id = %form.form_id, error = %err, "lead cursor stopped");
                    summary.form_errors += 1;
                }
            }
        }

        info!(
            tenant_id,
            forms = summary.forms_processed,
            inserted = summary.inserted,
            duplicates = summary.duplicates,
            discarded = summary.discarded,
            form_errors = summary.form_errors,
            "leads fetched"
        );
        Ok(summary)
    }

    async fn fetch_form(
        &self,
        form: &LeadForm,
        page_token: &str,
        summary: &mut LeadFetchSummary,
    ) -> Result<(), GraphError> {
        let ingestor = DeduplicatingIngestor::new(self.repo);
        let mut guard = CursorGuard::new(self.max_pages);
        let mut cursor: Option<String> = None;
        loop {
            let batch = self
                .source
                .leads(&form.form_id, page_token, cursor.as_deref())
                .await?;

            for remote in batch.items {
                summary.leads_seen += 1;
                let external_id = remote.id.clone();
                let draft = remote.into_draft(form, Utc::now());
                match ingestor.ingest(&draft).await {
                    Ok(IngestOutcome::Inserted) => summary.inserted += 1,
                    Ok(IngestOutcome::Duplicate) => summary.duplicates += 1,
                    Ok(IngestOutcome::Discarded) => summary.discarded += 1,
                    Err(err) => {
                        warn!(form_id = %form.form_id, external_lead_id = %external_id, error = %format!("{err:#}"), "failed to store lead");
                        summary.lead_errors += 1;
                    }
                }
            }

            match batch.next {
                Some(next) if guard.admit(&next) => cursor = Some(next),
                _ => return Ok(()),
            }
        }
    }
}
