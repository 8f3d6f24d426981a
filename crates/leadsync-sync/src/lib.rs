//! Sync pipeline orchestration: tenant registry, catalog refresh, lead ingest,
//! run reports and the optional cron scheduler.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use leadsync_graph::{GraphClient, LeadSource, RemoteIdentity, DEFAULT_GRAPH_API_URL};
use leadsync_storage::{ArtifactStore, BackoffPolicy, HttpClientConfig, HttpFetcher, LeadRepository};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod catalog;
mod cleanup;
mod leads;

pub use catalog::{CatalogFetcher, CatalogSummary};
pub use cleanup::{plan_duplicate_removal, remove_duplicate_leads, CleanupSummary};
pub use leads::{DeduplicatingIngestor, IngestOutcome, LeadFetchSummary, LeadFetcher};

pub const CRATE_NAME: &str = "leadsync-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct TenantRegistry {
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TenantConfig {
    pub tenant_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Name of the environment variable holding the tenant's user access token.
    #[serde(default)]
    pub access_token_env: Option<String>,
    /// Inline token, only consulted when `access_token_env` is unset.
    #[serde(default)]
    pub access_token: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

impl TenantRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing tenant registry")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Enabled tenants, or exactly the named tenant (enabled or not) when one is given.
    pub fn select(&self, only: Option<&str>) -> Result<Vec<&TenantConfig>> {
        match only {
            Some(tenant_id) => {
                let tenant = self
                    .tenants
                    .iter()
                    .find(|t| t.tenant_id == tenant_id)
                    .with_context(|| format!("tenant {tenant_id} is not in the registry"))?;
                Ok(vec![tenant])
            }
            None => Ok(self.tenants.iter().filter(|t| t.enabled).collect()),
        }
    }
}

impl TenantConfig {
    pub fn resolve_access_token(&self) -> Result<String> {
        if let Some(var) = &self.access_token_env {
            let token = std::env::var(var).with_context(|| {
                format!("tenant {} expects its access token in ${var}", self.tenant_id)
            })?;
            if token.trim().is_empty() {
                bail!("${var} is empty for tenant {}", self.tenant_id);
            }
            return Ok(token);
        }
        self.access_token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .with_context(|| format!("tenant {} has no access token configured", self.tenant_id))
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub graph_api_url: String,
    pub tenants_file: PathBuf,
    pub artifacts_dir: Option<PathBuf>,
    pub reports_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_retries: usize,
    pub max_pages_per_cursor: usize,
    pub active_forms_only: bool,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://leadsync.db".to_string(),
            graph_api_url: DEFAULT_GRAPH_API_URL.to_string(),
            tenants_file: PathBuf::from("tenants.yaml"),
            artifacts_dir: None,
            reports_dir: PathBuf::from("reports"),
            user_agent: "leadsync/0.1".to_string(),
            http_timeout_secs: 20,
            max_retries: 2,
            max_pages_per_cursor: 500,
            active_forms_only: false,
            scheduler_enabled: false,
            sync_cron_1: "0 0 6 * * *".to_string(),
            sync_cron_2: "0 0 18 * * *".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            graph_api_url: std::env::var("GRAPH_API_URL").unwrap_or(defaults.graph_api_url),
            tenants_file: std::env::var("LEADSYNC_TENANTS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.tenants_file),
            artifacts_dir: std::env::var("ARTIFACTS_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            reports_dir: std::env::var("LEADSYNC_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            user_agent: std::env::var("LEADSYNC_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("LEADSYNC_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            max_retries: env_parse("LEADSYNC_MAX_RETRIES").unwrap_or(defaults.max_retries),
            max_pages_per_cursor: env_parse("LEADSYNC_MAX_PAGES")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_pages_per_cursor),
            active_forms_only: env_flag("LEADSYNC_ACTIVE_FORMS_ONLY"),
            scheduler_enabled: env_flag("LEADSYNC_SCHEDULER_ENABLED"),
            sync_cron_1: std::env::var("SYNC_CRON_1").unwrap_or(defaults.sync_cron_1),
            sync_cron_2: std::env::var("SYNC_CRON_2").unwrap_or(defaults.sync_cron_2),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Catalog refresh followed by lead download.
    Full,
    CatalogOnly,
    LeadsOnly,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::CatalogOnly => "catalog_only",
            SyncMode::LeadsOnly => "leads_only",
        }
    }

    fn includes_catalog(&self) -> bool {
        matches!(self, SyncMode::Full | SyncMode::CatalogOnly)
    }

    fn includes_leads(&self) -> bool {
        matches!(self, SyncMode::Full | SyncMode::LeadsOnly)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantSyncSummary {
    pub tenant_id: String,
    pub display_name: String,
    pub catalog: Option<CatalogSummary>,
    pub leads: Option<LeadFetchSummary>,
    pub stored_leads: i64,
    /// Set when the tenant was abandoned part way, e.g. a rejected token.
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub mode: SyncMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tenants: Vec<TenantSyncSummary>,
    pub reports_dir: String,
}

impl SyncRunSummary {
    pub fn total_inserted(&self) -> usize {
        self.tenants
            .iter()
            .filter_map(|t| t.leads.as_ref())
            .map(|l| l.inserted)
            .sum()
    }

    /// Failed tenants, page and form listings, and leads that could not be stored.
    pub fn total_errors(&self) -> usize {
        self.tenants
            .iter()
            .map(|t| {
                usize::from(t.error.is_some())
                    + t.catalog.as_ref().map_or(0, |c| c.page_errors)
                    + t.leads.as_ref().map_or(0, |l| l.form_errors + l.lead_errors)
            })
            .sum()
    }

    pub fn failed_tenants(&self) -> usize {
        self.tenants.iter().filter(|t| t.error.is_some()).count()
    }
}

/// Stops a cursor walk whose `next` link repeats or that exceeds the batch cap.
pub(crate) struct CursorGuard {
    seen: HashSet<String>,
    batches: usize,
    max_batches: usize,
}

impl CursorGuard {
    pub(crate) fn new(max_batches: usize) -> Self {
        Self {
            seen: HashSet::new(),
            batches: 1,
            max_batches,
        }
    }

    /// Called with the `next` link of a batch that has just been processed.
    pub(crate) fn admit(&mut self, next: &str) -> bool {
        if self.batches >= self.max_batches {
            warn!(max_batches = self.max_batches, "cursor batch cap reached");
            return false;
        }
        if !self.seen.insert(next.to_string()) {
            warn!("cursor returned a next link it already followed");
            return false;
        }
        self.batches += 1;
        true
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    registry: TenantRegistry,
    repo: LeadRepository,
    source: Box<dyn LeadSource>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        registry: TenantRegistry,
        repo: LeadRepository,
        source: Box<dyn LeadSource>,
    ) -> Self {
        Self {
            config,
            registry,
            repo,
            source,
        }
    }

    /// Loads the tenant registry, opens and migrates the database and wires the
    /// Graph client (with the raw response archive when `ARTIFACTS_DIR` is set).
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let registry = TenantRegistry::load(&config.tenants_file).await?;
        let repo = LeadRepository::connect(&config.database_url).await?;
        repo.migrate().await?;

        let http = HttpFetcher::new(config.http_client_config())?;
        let mut graph = GraphClient::new(config.graph_api_url.clone(), http);
        if let Some(dir) = &config.artifacts_dir {
            graph = graph.with_archive(ArtifactStore::new(dir.clone()));
        }
        Ok(Self::new(config, registry, repo, Box::new(graph)))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &TenantRegistry {
        &self.registry
    }

    pub fn repository(&self) -> &LeadRepository {
        &self.repo
    }

    pub async fn run_once(&self, only_tenant: Option<&str>) -> Result<SyncRunSummary> {
        self.run(SyncMode::Full, only_tenant).await
    }

    pub async fn run(&self, mode: SyncMode, only_tenant: Option<&str>) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("sync_run", %run_id, mode = mode.as_str());

        async move {
            let tenants = self.registry.select(only_tenant)?;
            if tenants.is_empty() {
                warn!("no enabled tenants in the registry");
            }

            let mut tenant_summaries = Vec::with_capacity(tenants.len());
            for tenant in tenants {
                let outcome = self
                    .sync_tenant(tenant, mode)
                    .instrument(info_span!("tenant", tenant_id = %tenant.tenant_id))
                    .await;
                match outcome {
                    Ok(summary) => tenant_summaries.push(summary),
                    // An explicitly selected tenant has nothing else to fall back on.
                    Err(err) if only_tenant.is_some() => return Err(err),
                    Err(err) => {
                        let message = format!("{err:#}");
                        error!(tenant_id = %tenant.tenant_id, error = %message, "tenant sync failed");
                        tenant_summaries.push(TenantSyncSummary {
                            tenant_id: tenant.tenant_id.clone(),
                            display_name: tenant.display_name.clone(),
                            catalog: None,
                            leads: None,
                            stored_leads: self.repo.count_leads(&tenant.tenant_id).await?,
                            error: Some(message),
                        });
                    }
                }
            }

            let reports_dir = self.config.reports_dir.join(run_id.to_string());
            let summary = SyncRunSummary {
                run_id,
                mode,
                started_at,
                finished_at: Utc::now(),
                tenants: tenant_summaries,
                reports_dir: reports_dir.display().to_string(),
            };
            write_reports(&reports_dir, &summary).await?;
            info!(
                tenants = summary.tenants.len(),
                inserted = summary.total_inserted(),
                errors = summary.total_errors(),
                failed_tenants = summary.failed_tenants(),
                "sync run finished"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    async fn sync_tenant(&self, tenant: &TenantConfig, mode: SyncMode) -> Result<TenantSyncSummary> {
        let tenant_id = tenant.tenant_id.as_str();
        let max_pages = self.config.max_pages_per_cursor;

        let catalog = if mode.includes_catalog() {
            let token = tenant.resolve_access_token()?;
            let fetcher = CatalogFetcher::new(self.source.as_ref(), &self.repo, max_pages);
            Some(fetcher.sync_tenant(tenant_id, &token).await?)
        } else {
            None
        };

        let leads = if mode.includes_leads() {
            let fetcher = LeadFetcher::new(self.source.as_ref(), &self.repo, max_pages)
                .active_forms_only(self.config.active_forms_only);
            Some(fetcher.fetch_tenant(tenant_id).await?)
        } else {
            None
        };

        Ok(TenantSyncSummary {
            tenant_id: tenant_id.to_string(),
            display_name: tenant.display_name.clone(),
            catalog,
            leads,
            stored_leads: self.repo.count_leads(tenant_id).await?,
            error: None,
        })
    }

    /// Resolves the tenant's credential and asks the API who it belongs to.
    pub async fn check_token(&self, tenant_id: &str) -> Result<RemoteIdentity> {
        let tenant = self
            .registry
            .select(Some(tenant_id))?
            .into_iter()
            .next()
            .with_context(|| format!("tenant {tenant_id} is not in the registry"))?;
        let token = tenant.resolve_access_token()?;
        self.source
            .me(&token)
            .await
            .with_context(|| format!("checking access token of tenant {tenant_id}"))
    }

    pub async fn remove_duplicates(
        &self,
        only_tenant: Option<&str>,
        dry_run: bool,
        recount_forms: bool,
    ) -> Result<Vec<CleanupSummary>> {
        let mut summaries = Vec::new();
        for tenant in self.registry.select(only_tenant)? {
            summaries.push(
                remove_duplicate_leads(&self.repo, &tenant.tenant_id, dry_run, recount_forms).await?,
            );
        }
        Ok(summaries)
    }

    /// Cron jobs running `run_once` for every enabled tenant, or `None` when
    /// scheduling is switched off.
    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in [self.config.sync_cron_1.clone(), self.config.sync_cron_2.clone()] {
            let pipeline = Arc::clone(&self);
            let job = Job::new_async(&cron, move |_uuid, _l| {
                let pipeline = Arc::clone(&pipeline);
                Box::pin(async move {
                    match pipeline.run_once(None).await {
                        Ok(summary) => info!(
                            run_id = %summary.run_id,
                            inserted = summary.total_inserted(),
                            "scheduled sync finished"
                        ),
                        Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let pipeline = SyncPipeline::from_config(SyncConfig::from_env()).await?;
    pipeline.run_once(None).await
}

async fn write_reports(reports_dir: &Path, summary: &SyncRunSummary) -> Result<()> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing sync summary")?;
    fs::write(reports_dir.join("sync_summary.json"), json)
        .await
        .context("writing sync_summary.json")?;
    fs::write(reports_dir.join("sync_brief.md"), render_brief(summary))
        .await
        .context("writing sync_brief.md")?;
    Ok(())
}

fn render_brief(summary: &SyncRunSummary) -> String {
    let mut lines = vec![
        "# Lead Sync Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Mode: {}", summary.mode.as_str()),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- New leads: {}", summary.total_inserted()),
        format!("- Errors: {}", summary.total_errors()),
        String::new(),
    ];
    for tenant in &summary.tenants {
        lines.push(format!("## {} (`{}`)", tenant.display_name, tenant.tenant_id));
        if let Some(err) = &tenant.error {
            lines.push(format!("- FAILED: {err}"));
        }
        if let Some(c) = &tenant.catalog {
            lines.push(format!(
                "- pages: {} seen, {} new, {} skipped, {} errors",
                c.pages_seen, c.pages_created, c.pages_skipped, c.page_errors
            ));
            lines.push(format!(
                "- forms: {} found, {} new, {} updated",
                c.forms_found, c.forms_created, c.forms_updated
            ));
        }
        if let Some(l) = &tenant.leads {
            lines.push(format!(
                "- leads: {} seen, {} inserted, {} duplicates, {} discarded, {} not stored",
                l.leads_seen, l.inserted, l.duplicates, l.discarded, l.lead_errors
            ));
            lines.push(format!(
                "- forms fetched: {} ({} skipped, {} failed)",
                l.forms_processed, l.forms_skipped, l.form_errors
            ));
        }
        lines.push(format!("- stored leads: {}", tenant.stored_leads));
        lines.push(String::new());
    }
    lines.join("\n")
}

/// Markdown overview of the most recent runs found under `reports_root`.
pub fn report_recent_runs(runs: usize, reports_root: &Path) -> Result<String> {
    let mut summaries = Vec::new();
    for entry in std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
    {
        let entry = entry.with_context(|| format!("listing {}", reports_root.display()))?;
        let path = entry.path().join("sync_summary.json");
        if !path.is_file() {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let summary: SyncRunSummary = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        summaries.push(summary);
    }
    summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    let mut lines = vec!["# Lead Sync Runs".to_string(), String::new()];
    for summary in summaries.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}` ({})", summary.run_id, summary.mode.as_str()));
        lines.push(format!("- started: {}", summary.started_at));
        lines.push(format!("- tenants: {}", summary.tenants.len()));
        lines.push(format!("- new leads: {}", summary.total_inserted()));
        lines.push(format!("- errors: {}", summary.total_errors()));
        lines.push(format!("- failed tenants: {}", summary.failed_tenants()));
        lines.push(format!("- reports: `{}`", summary.reports_dir));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use leadsync_core::{FieldEntry, FormStatus};
    use leadsync_graph::{Batch, GraphError, RemoteForm, RemoteLead, RemotePage};

    /// In-memory stand-in for the Graph API. `None` entries fail the request.
    #[derive(Default)]
    struct Script {
        me_fails: bool,
        pages: Vec<RemotePage>,
        forms: HashMap<String, Option<Vec<RemoteForm>>>,
        leads: HashMap<String, Vec<Option<Vec<RemoteLead>>>>,
    }

    #[derive(Clone, Default)]
    struct ScriptedSource(Arc<Mutex<Script>>);

    impl ScriptedSource {
        fn edit(&self, f: impl FnOnce(&mut Script)) {
            f(&mut self.0.lock().unwrap());
        }
    }

    fn failure() -> GraphError {
        GraphError::Api {
            status: 500,
            code: Some(2),
            kind: Some("OAuthException".into()),
            message: "service temporarily unavailable".into(),
        }
    }

    #[async_trait]
    impl LeadSource for ScriptedSource {
        async fn me(&self, _access_token: &str) -> Result<RemoteIdentity, GraphError> {
            if self.0.lock().unwrap().me_fails {
                return Err(failure());
            }
            Ok(RemoteIdentity {
                id: "u1".into(),
                name: Some("Ops".into()),
            })
        }

        async fn pages(
            &self,
            _user_token: &str,
            _cursor: Option<&str>,
        ) -> Result<Batch<RemotePage>, GraphError> {
            Ok(Batch {
                items: self.0.lock().unwrap().pages.clone(),
                next: None,
            })
        }

        async fn lead_forms(
            &self,
            page_id: &str,
            _page_token: &str,
            _cursor: Option<&str>,
        ) -> Result<Batch<RemoteForm>, GraphError> {
            match self.0.lock().unwrap().forms.get(page_id) {
                Some(Some(forms)) => Ok(Batch {
                    items: forms.clone(),
                    next: None,
                }),
                Some(None) => Err(failure()),
                None => Ok(Batch {
                    items: vec![],
                    next: None,
                }),
            }
        }

        async fn leads(
            &self,
            form_id: &str,
            _page_token: &str,
            cursor: Option<&str>,
        ) -> Result<Batch<RemoteLead>, GraphError> {
            let script = self.0.lock().unwrap();
            let Some(batches) = script.leads.get(form_id) else {
                return Ok(Batch {
                    items: vec![],
                    next: None,
                });
            };
            let index: usize = cursor
                .and_then(|c| c.rsplit(':').next())
                .and_then(|i| i.parse().ok())
                .unwrap_or(0);
            match &batches[index] {
                Some(items) => Ok(Batch {
                    items: items.clone(),
                    next: (index + 1 < batches.len()).then(|| format!("{form_id}:{}", index + 1)),
                }),
                None => Err(failure()),
            }
        }
    }

    fn page(id: &str) -> RemotePage {
        RemotePage {
            id: id.into(),
            name: format!("Page {id}"),
            access_token: Some(format!("token-{id}")),
        }
    }

    fn form(id: &str, status: &str, count: i64) -> RemoteForm {
        RemoteForm {
            id: id.into(),
            name: format!("Form {id}"),
            status: Some(status.into()),
            leads_count: Some(count),
        }
    }

    fn remote_lead(id: &str, fields: &[(&str, &str)]) -> RemoteLead {
        RemoteLead {
            id: id.into(),
            created_time: Some("2026-02-01T10:00:00+0000".into()),
            field_data: fields.iter().map(|(k, v)| FieldEntry::new(*k, *v)).collect(),
            campaign_name: Some("Spring".into()),
            adset_name: None,
            ad_name: None,
        }
    }

    fn registry() -> TenantRegistry {
        TenantRegistry::from_yaml_str(
            "tenants:\n  - tenant_id: acme\n    display_name: Acme Realty\n    access_token: user-token\n",
        )
        .unwrap()
    }

    async fn pipeline(source: &ScriptedSource, reports: &Path) -> SyncPipeline {
        let repo = LeadRepository::in_memory().await.unwrap();
        repo.migrate().await.unwrap();
        let config = SyncConfig {
            reports_dir: reports.to_path_buf(),
            ..Default::default()
        };
        SyncPipeline::new(config, registry(), repo, Box::new(source.clone()))
    }

    fn one_page_script(source: &ScriptedSource) {
        source.edit(|s| {
            s.pages = vec![page("p1")];
            s.forms.insert("p1".into(), Some(vec![form("f1", "ACTIVE", 3)]));
            s.leads.insert(
                "f1".into(),
                vec![Some(vec![
                    remote_lead("L1", &[("full_name", "Asha"), ("phone_number", "+911")]),
                    remote_lead("L2", &[("email", "Ravi@Example.com")]),
                    remote_lead("L3", &[("full_name", "Nobody")]),
                ])],
            );
        });
    }

    #[tokio::test]
    async fn rerun_without_new_data_keeps_lead_count() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::default();
        one_page_script(&source);
        let pipeline = pipeline(&source, dir.path()).await;

        let first = pipeline.run_once(None).await.unwrap();
        let leads = first.tenants[0].leads.as_ref().unwrap();
        assert_eq!(leads.inserted, 2);
        assert_eq!(leads.discarded, 1);
        assert_eq!(first.tenants[0].stored_leads, 2);

        let second = pipeline.run_once(None).await.unwrap();
        let leads = second.tenants[0].leads.as_ref().unwrap();
        assert_eq!(leads.inserted, 0);
        assert_eq!(leads.duplicates, 2);
        assert_eq!(second.tenants[0].stored_leads, 2);
    }

    #[tokio::test]
    async fn contactless_leads_are_never_stored() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::default();
        one_page_script(&source);
        let pipeline = pipeline(&source, dir.path()).await;
        pipeline.run_once(None).await.unwrap();

        let stored = pipeline.repository().list_leads("acme").await.unwrap();
        assert!(stored.iter().all(|l| l.phone.is_some() || l.email.is_some()));
        assert!(stored
            .iter()
            .all(|l| l.external_lead_id.as_deref() != Some("L3")));
        let ravi = stored
            .iter()
            .find(|l| l.external_lead_id.as_deref() == Some("L2"))
            .unwrap();
        assert_eq!(ravi.email.as_deref(), Some("ravi@example.com"));
        assert_eq!(ravi.name, "Facebook Lead");
    }

    #[tokio::test]
    async fn same_phone_across_forms_is_stored_once() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::default();
        source.edit(|s| {
            s.pages = vec![page("p1")];
            s.forms.insert(
                "p1".into(),
                Some(vec![form("f1", "ACTIVE", 1), form("f2", "ACTIVE", 1)]),
            );
            s.leads.insert(
                "f1".into(),
                vec![Some(vec![remote_lead("L1", &[("phone", "+44 7000")])])],
            );
            s.leads.insert(
                "f2".into(),
                vec![Some(vec![remote_lead(
                    "L9",
                    &[("phone", "+44 7000"), ("email", "other@x.io")],
                )])],
            );
        });
        let pipeline = pipeline(&source, dir.path()).await;

        let summary = pipeline.run_once(None).await.unwrap();
        let leads = summary.tenants[0].leads.as_ref().unwrap();
        assert_eq!(leads.inserted, 1);
        assert_eq!(leads.duplicates, 1);
        assert_eq!(pipeline.repository().count_leads("acme").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn form_status_follows_latest_listing() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::default();
        one_page_script(&source);
        let pipeline = pipeline(&source, dir.path()).await;
        pipeline.run(SyncMode::CatalogOnly, None).await.unwrap();

        source.edit(|s| {
            s.forms.insert("p1".into(), Some(vec![form("f1", "PAUSED", 8)]));
        });
        let summary = pipeline.run(SyncMode::CatalogOnly, None).await.unwrap();
        assert_eq!(summary.tenants[0].catalog.as_ref().unwrap().forms_updated, 1);
        assert!(summary.tenants[0].leads.is_none());

        let stored = pipeline.repository().get_form("acme", "f1").await.unwrap().unwrap();
        assert_eq!(stored.status, FormStatus::Inactive);
        assert_eq!(stored.lead_count, 8);
    }

    #[tokio::test]
    async fn failing_page_does_not_abort_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::default();
        source.edit(|s| {
            s.pages = vec![page("p1"), page("p2")];
            s.forms.insert("p1".into(), None);
            s.forms.insert("p2".into(), Some(vec![form("f2", "ACTIVE", 0)]));
        });
        let pipeline = pipeline(&source, dir.path()).await;

        let summary = pipeline.run_once(None).await.unwrap();
        let catalog = summary.tenants[0].catalog.as_ref().unwrap();
        assert_eq!(catalog.page_errors, 1);
        assert_eq!(catalog.pages_seen, 2);
        assert_eq!(catalog.forms_created, 1);
        assert!(pipeline.repository().get_form("acme", "f2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failing_cursor_stops_only_its_form() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::default();
        source.edit(|s| {
            s.pages = vec![page("p1")];
            s.forms.insert(
                "p1".into(),
                Some(vec![form("f1", "ACTIVE", 2), form("f2", "ACTIVE", 1)]),
            );
            s.leads.insert(
                "f1".into(),
                vec![Some(vec![remote_lead("L1", &[("phone", "+1")])]), None],
            );
            s.leads.insert(
                "f2".into(),
                vec![Some(vec![remote_lead("L2", &[("phone", "+2")])])],
            );
        });
        let pipeline = pipeline(&source, dir.path()).await;

        let summary = pipeline.run_once(None).await.unwrap();
        let leads = summary.tenants[0].leads.as_ref().unwrap();
        assert_eq!(leads.form_errors, 1);
        assert_eq!(leads.inserted, 2);

        let repo = pipeline.repository();
        let f1 = repo.get_form("acme", "f1").await.unwrap().unwrap();
        let f2 = repo.get_form("acme", "f2").await.unwrap().unwrap();
        assert!(f1.last_lead_fetched_at.is_none());
        assert!(f2.last_lead_fetched_at.is_some());
    }

    #[tokio::test]
    async fn disabled_page_forms_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::default();
        one_page_script(&source);
        let pipeline = pipeline(&source, dir.path()).await;
        pipeline.run(SyncMode::CatalogOnly, None).await.unwrap();
        assert!(pipeline
            .repository()
            .set_page_sync_enabled("acme", "p1", false)
            .await
            .unwrap());

        let summary = pipeline.run(SyncMode::LeadsOnly, None).await.unwrap();
        let leads = summary.tenants[0].leads.as_ref().unwrap();
        assert_eq!(leads.forms_skipped, 1);
        assert_eq!(leads.leads_seen, 0);

        // a catalog refresh must not re-enable the page
        pipeline.run(SyncMode::CatalogOnly, None).await.unwrap();
        let page = pipeline.repository().get_page("acme", "p1").await.unwrap().unwrap();
        assert!(!page.sync_enabled);
    }

    #[tokio::test]
    async fn active_forms_only_skips_inactive_forms() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::default();
        one_page_script(&source);
        source.edit(|s| {
            s.forms.insert("p1".into(), Some(vec![form("f1", "ARCHIVED", 3)]));
        });
        let repo = LeadRepository::in_memory().await.unwrap();
        repo.migrate().await.unwrap();
        let config = SyncConfig {
            reports_dir: dir.path().to_path_buf(),
            active_forms_only: true,
            ..Default::default()
        };
        let pipeline = SyncPipeline::new(config, registry(), repo, Box::new(source.clone()));

        let summary = pipeline.run_once(None).await.unwrap();
        let leads = summary.tenants[0].leads.as_ref().unwrap();
        assert_eq!(leads.forms_processed, 0);
        assert_eq!(leads.forms_skipped, 1);
    }

    #[tokio::test]
    async fn rejected_token_fails_an_explicit_tenant_run() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::default();
        source.edit(|s| s.me_fails = true);
        let pipeline = pipeline(&source, dir.path()).await;

        let err = pipeline.run_once(Some("acme")).await.unwrap_err();
        assert!(format!("{err:#}").contains("validating access token"));
        assert!(pipeline.check_token("acme").await.is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        let summary = pipeline.run_once(None).await.unwrap();
        assert_eq!(summary.failed_tenants(), 1);
        assert!(summary.tenants[0]
            .error
            .as_deref()
            .unwrap()
            .contains("validating access token"));
    }

    #[tokio::test]
    async fn broken_tenant_does_not_block_the_others() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::default();
        one_page_script(&source);
        let repo = LeadRepository::in_memory().await.unwrap();
        repo.migrate().await.unwrap();
        let registry = TenantRegistry::from_yaml_str(
            "tenants:\n  - tenant_id: broken\n    display_name: Broken\n    access_token_env: LEADSYNC_TEST_TOKEN_THAT_IS_NEVER_SET\n  - tenant_id: acme\n    display_name: Acme Realty\n    access_token: user-token\n",
        )
        .unwrap();
        let config = SyncConfig {
            reports_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let pipeline = SyncPipeline::new(config, registry, repo, Box::new(source.clone()));

        let summary = pipeline.run_once(None).await.unwrap();
        assert_eq!(summary.tenants.len(), 2);
        let broken = &summary.tenants[0];
        assert!(broken
            .error
            .as_deref()
            .unwrap()
            .contains("LEADSYNC_TEST_TOKEN_THAT_IS_NEVER_SET"));
        assert!(broken.catalog.is_none());

        let acme = &summary.tenants[1];
        assert!(acme.error.is_none());
        assert_eq!(acme.catalog.as_ref().unwrap().pages_created, 1);
        assert_eq!(acme.leads.as_ref().unwrap().inserted, 2);
        assert_eq!(summary.failed_tenants(), 1);
        assert_eq!(summary.total_errors(), 1);

        let run_dir = dir.path().join(summary.run_id.to_string());
        let brief = std::fs::read_to_string(run_dir.join("sync_brief.md")).unwrap();
        assert!(brief.contains("- FAILED: "));
        assert!(brief.contains("Acme Realty"));

        assert!(pipeline.run_once(Some("broken")).await.is_err());
    }

    #[test]
    fn unstored_leads_count_as_errors() {
        let at = Utc::now();
        let summary = SyncRunSummary {
            run_id: Uuid::new_v4(),
            mode: SyncMode::Full,
            started_at: at,
            finished_at: at,
            tenants: vec![TenantSyncSummary {
                tenant_id: "acme".into(),
                display_name: "Acme".into(),
                catalog: None,
                leads: Some(LeadFetchSummary {
                    leads_seen: 4,
                    inserted: 1,
                    form_errors: 1,
                    lead_errors: 3,
                    ..Default::default()
                }),
                stored_leads: 1,
                error: None,
            }],
            reports_dir: "reports".into(),
        };
        assert_eq!(summary.total_errors(), 4);
        let brief = render_brief(&summary);
        assert!(brief.contains("3 not stored"));
        assert!(brief.contains("- Errors: 4"));
    }

    #[tokio::test]
    async fn scheduler_is_built_only_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::default();
        let disabled = Arc::new(pipeline(&source, dir.path()).await);
        assert!(disabled.maybe_build_scheduler().await.unwrap().is_none());

        let repo = LeadRepository::in_memory().await.unwrap();
        repo.migrate().await.unwrap();
        let config = SyncConfig {
            reports_dir: dir.path().to_path_buf(),
            scheduler_enabled: true,
            ..Default::default()
        };
        let enabled = Arc::new(SyncPipeline::new(config, registry(), repo, Box::new(source.clone())));
        let mut sched = enabled.maybe_build_scheduler().await.unwrap().expect("scheduler");
        sched.shutdown().await.unwrap();
    }

    #[test]
    fn missing_token_variable_is_fatal() {
        let registry = TenantRegistry::from_yaml_str(
            "tenants:\n  - tenant_id: acme\n    display_name: Acme\n    access_token_env: LEADSYNC_TEST_TOKEN_THAT_IS_NEVER_SET\n",
        )
        .unwrap();
        let err = registry.tenants[0].resolve_access_token().unwrap_err();
        assert!(err.to_string().contains("LEADSYNC_TEST_TOKEN_THAT_IS_NEVER_SET"));
    }

    #[tokio::test]
    async fn reports_are_written_and_listed() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::default();
        one_page_script(&source);
        let pipeline = pipeline(&source, dir.path()).await;

        let summary = pipeline.run_once(None).await.unwrap();
        let run_dir = dir.path().join(summary.run_id.to_string());
        assert!(run_dir.join("sync_summary.json").is_file());
        let brief = std::fs::read_to_string(run_dir.join("sync_brief.md")).unwrap();
        assert!(brief.contains("Acme Realty"));
        assert!(brief.contains("2 inserted"));

        let overview = report_recent_runs(5, dir.path()).unwrap();
        assert!(overview.contains(&summary.run_id.to_string()));
        assert!(overview.contains("- new leads: 2"));
    }

    #[test]
    fn registry_selects_enabled_tenants() {
        let registry = TenantRegistry::from_yaml_str(
            "tenants:\n  - tenant_id: a\n    display_name: A\n  - tenant_id: b\n    display_name: B\n    enabled: false\n",
        )
        .unwrap();
        let ids: Vec<_> = registry
            .select(None)
            .unwrap()
            .into_iter()
            .map(|t| t.tenant_id.as_str())
            .collect();
        assert_eq!(ids, vec!["a"]);
        assert_eq!(registry.select(Some("b")).unwrap()[0].tenant_id, "b");
        assert!(registry.select(Some("zzz")).is_err());
    }

    #[test]
    fn cursor_guard_rejects_repeats_and_caps_batches() {
        let mut guard = CursorGuard::new(3);
        assert!(guard.admit("n1"));
        assert!(!guard.admit("n1"));
        assert!(guard.admit("n2"));
        assert!(!guard.admit("n3"));
    }
}
