//! One-off repair of leads stored twice and of drifted form lead counts.

use std::collections::HashMap;

use anyhow::Result;
use leadsync_core::Lead;
use leadsync_storage::LeadRepository;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupSummary {
    pub tenant_id: String,
    pub dry_run: bool,
    pub leads_examined: usize,
    pub duplicate_groups: usize,
    pub removed: u64,
    pub forms_recounted: usize,
}

/// Ids to delete. Leads are grouped by their exact (phone, email) pair; in a
/// group that contains at least one lead with an external id the first such
/// lead survives and every other member goes. Groups without any external id
/// are left alone, as are leads with neither phone nor email.
pub fn plan_duplicate_removal(leads: &[Lead]) -> Vec<Uuid> {
    let mut order: Vec<(Option<&str>, Option<&str>)> = Vec::new();
    let mut groups: HashMap<(Option<&str>, Option<&str>), Vec<&Lead>> = HashMap::new();
    for lead in leads {
        if lead.phone.is_none() && lead.email.is_none() {
            continue;
        }
        let key = (lead.phone.as_deref(), lead.email.as_deref());
        groups
            .entry(key)
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(lead);
    }

    let mut doomed = Vec::new();
    for key in order {
        let members = &groups[&key];
        if members.len() < 2 {
            continue;
        }
        let Some(keeper) = members.iter().find(|lead| lead.external_lead_id.is_some()) else {
            continue;
        };
        doomed.extend(
            members
                .iter()
                .filter(|lead| lead.id != keeper.id)
                .map(|lead| lead.id),
        );
    }
    doomed
}

pub async fn remove_duplicate_leads(
    repo: &LeadRepository,
    tenant_id: &str,
    dry_run: bool,
    recount_forms: bool,
) -> Result<CleanupSummary> {
    let leads = repo.list_leads(tenant_id).await?;
    let doomed = plan_duplicate_removal(&leads);

    let mut summary = CleanupSummary {
        tenant_id: tenant_id.to_string(),
        dry_run,
        leads_examined: leads.len(),
        ..Default::default()
    };
    summary.duplicate_groups = count_groups(&leads, &doomed);
    summary.removed = if dry_run {
        doomed.len() as u64
    } else {
        repo.delete_leads(&doomed).await?
    };

    if recount_forms {
        for form in repo.list_forms(tenant_id).await? {
            let stored = repo.count_leads_for_form(tenant_id, &form.form_id).await?;
            if stored == form.lead_count {
                continue;
            }
            info!(tenant_id, form_id = %form.form_id, from = form.lead_count, to = stored, dry_run, "recounting form leads");
            if !dry_run {
                repo.set_form_lead_count(tenant_id, &form.form_id, stored).await?;
            }
            summary.forms_recounted += 1;
        }
    }

    info!(
        tenant_id,
        dry_run,
        removed = summary.removed,
        groups = summary.duplicate_groups,
        "duplicate cleanup finished"
    );
    Ok(summary)
}

fn count_groups(leads: &[Lead], doomed: &[Uuid]) -> usize {
    let mut keys: Vec<(Option<&str>, Option<&str>)> = leads
        .iter()
        .filter(|lead| doomed.contains(&lead.id))
        .map(|lead| (lead.phone.as_deref(), lead.email.as_deref()))
        .collect();
    keys.sort();
    keys.dedup();
    keys.len()
}
