//! Page and lead form discovery for one tenant.

use anyhow::{Context, Result};
use chrono::Utc;
use leadsync_core::FormStatus;
use leadsync_graph::{LeadSource, RemotePage};
use leadsync_storage::{LeadRepository, UpsertOutcome};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::CursorGuard;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSummary {
    pub pages_seen: usize,
    pub pages_created: usize,
    pub pages_skipped: usize,
    pub forms_found: usize,
    pub forms_created: usize,
    pub forms_updated: usize,
    pub page_errors: usize,
}

pub struct CatalogFetcher<'a> {
    source: &'a dyn LeadSource,
    repo: &'a LeadRepository,
    max_pages: usize,
}

impl<'a> CatalogFetcher<'a> {
    pub fn new(source: &'a dyn LeadSource, repo: &'a LeadRepository, max_pages: usize) -> Self {
        Self {
            source,
            repo,
            max_pages,
        }
    }

    /// Refreshes page connections and their lead forms. Only the credential
    /// check and the first page listing are fatal; a page whose forms cannot be
    /// listed is counted in `page_errors` and skipped.
    pub async fn sync_tenant(&self, tenant_id: &str, user_token: &str) -> Result<CatalogSummary> {
        let identity = self
            .source
            .me(user_token)
            .await
            .with_context(|| format!("validating access token for tenant {tenant_id}"))?;
        info!(tenant_id, identity = %identity.id, "access token accepted");

        let mut summary = CatalogSummary::default();
        let mut guard = CursorGuard::new(self.max_pages);
        let mut cursor: Option<String> = None;
        loop {
            let batch = match self.source.pages(user_token, cursor.as_deref()).await {
                Ok(batch) => batch,
                Err(err) if cursor.is_none() => {
                    return Err(err).with_context(|| format!("listing pages for tenant {tenant_id}"));
                }
                Err(err) => {
                    warn!(tenant_id, error = %err, "page listing stopped early");
                    summary.page_errors += 1;
                    break;
                }
            };

            for page in batch.items {
                self.sync_page(tenant_id, page, &mut summary).await?;
            }

            match batch.next {
                Some(next) if guard.admit(&next) => cursor = Some(next),
                _ => break,
            }
        }

        info!(
            tenant_id,
            pages = summary.pages_seen,
            forms = summary.forms_found,
            page_errors = summary.page_errors,
            "catalog refreshed"
        );
        Ok(summary)
    }

    async fn sync_page(
        &self,
        tenant_id: &str,
        page: RemotePage,
        summary: &mut CatalogSummary,
    ) -> Result<()> {
        summary.pages_seen += 1;
        let Some(page_token) = page.access_token.filter(|t| !t.trim().is_empty()) else {
            warn!(tenant_id, page_id = %page.id, "page returned without access token, skipping");
            summary.pages_skipped += 1;
            return Ok(());
        };

        let outcome = self
            .repo
            .upsert_page(tenant_id, &page.id, &page.name, &page_token, Utc::now())
            .await?;
        if outcome == UpsertOutcome::Created {
            summary.pages_created += 1;
        }

        let mut guard = CursorGuard::new(self.max_pages);
        let mut cursor: Option<String> = None;
        loop {
            let batch = match self
                .source
                .lead_forms(&page.id, &page_token, cursor.as_deref())
                .await
            {
                Ok(batch) => batch,
                Err(err) => {
                    warn!(tenant_id, page_id = %page.id, error = %err, "could not list lead forms");
                    summary.page_errors += 1;
                    return Ok(());
                }
            };

            for form in batch.items {
                summary.forms_found += 1;
                let status = FormStatus::from_external(form.status.as_deref());
                let outcome = self
                    .repo
                    .upsert_form(
                        tenant_id,
                        &page.id,
                        &form.id,
                        &form.name,
                        status,
                        form.leads_count.unwrap_or(0),
                        Utc::now(),
                    )
                    .await?;
                match outcome {
                    UpsertOutcome::Created => summary.forms_created += 1,
                    UpsertOutcome::Updated => summary.forms_updated += 1,
                }
            }

            match batch.next {
                Some(next) if guard.admit(&next) => cursor = Some(next),
                _ => return Ok(()),
            }
        }
    }
}
