//! SQLite persistence for page connections, lead forms and leads.

use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use leadsync_core::{FormStatus, Lead, LeadForm, LeadStage, PageConnection, ACTIVE_PAGE_STATUS};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct LeadRepository {
    pool: SqlitePool,
}

const LEAD_COLUMNS: &str = "id, tenant_id, name, email, phone, location, source, stage, status, \
     campaign_name, form_name, external_lead_id, form_id, page_id, fetched_at, created_at, \
     updated_at, metadata";

impl LeadRepository {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing database url {database_url}"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {database_url}"))?;
        Ok(Self { pool })
    }

    /// Single-connection in-memory database; the pool must never recycle the
    /// connection or the data disappears with it.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("opening in-memory sqlite")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running migrations")
    }

    /// Inserts a new page connection (sync enabled) or refreshes name/token of an
    /// existing one. The sync toggle is never touched on update.
    pub async fn upsert_page(
        &self,
        tenant_id: &str,
        page_id: &str,
        page_name: &str,
        access_token: &str,
        synced_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let inserted = sqlx::query(
            "INSERT INTO facebook_page_connections \
             (tenant_id, page_id, page_name, access_token, status, sync_enabled, last_sync_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, 1, ?, ?, ?) \
             ON CONFLICT (tenant_id, page_id) DO NOTHING",
        )
        .bind(tenant_id)
        .bind(page_id)
        .bind(page_name)
        .bind(access_token)
        .bind(ACTIVE_PAGE_STATUS)
        .bind(synced_at)
        .bind(synced_at)
        .bind(synced_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting page {page_id}"))?;
        if inserted.rows_affected() == 1 {
            return Ok(UpsertOutcome::Created);
        }

        sqlx::query(
            "UPDATE facebook_page_connections \
             SET page_name = ?, access_token = ?, last_sync_at = ?, updated_at = ? \
             WHERE tenant_id = ? AND page_id = ?",
        )
        .bind(page_name)
        .bind(access_token)
        .bind(synced_at)
        .bind(synced_at)
        .bind(tenant_id)
        .bind(page_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("updating page {page_id}"))?;
        Ok(UpsertOutcome::Updated)
    }

    pub async fn get_page(&self, tenant_id: &str, page_id: &str) -> Result<Option<PageConnection>> {
        let row = sqlx::query(
            "SELECT * FROM facebook_page_connections WHERE tenant_id = ? AND page_id = ?",
        )
        .bind(tenant_id)
        .bind(page_id)
        .fetch_optional(&self.pool)
        .await
        .context("loading page connection")?;
        row.as_ref().map(page_from_row).transpose()
    }

    pub async fn list_pages(&self, tenant_id: &str) -> Result<Vec<PageConnection>> {
        let rows = sqlx::query(
            "SELECT * FROM facebook_page_connections WHERE tenant_id = ? ORDER BY created_at, page_id",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .context("listing page connections")?;
        rows.iter().map(page_from_row).collect()
    }

    pub async fn set_page_sync_enabled(
        &self,
        tenant_id: &str,
        page_id: &str,
        enabled: bool,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE facebook_page_connections SET sync_enabled = ?, updated_at = ? \
             WHERE tenant_id = ? AND page_id = ?",
        )
        .bind(enabled)
        .bind(Utc::now())
        .bind(tenant_id)
        .bind(page_id)
        .execute(&self.pool)
        .await
        .context("toggling page sync")?;
        Ok(result.rows_affected() > 0)
    }

    /// Last-write-wins upsert: status and lead count always take the incoming values.
    pub async fn upsert_form(
        &self,
        tenant_id: &str,
        page_id: &str,
        form_id: &str,
        name: &str,
        status: FormStatus,
        lead_count: i64,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let inserted = sqlx::query(
            "INSERT INTO facebook_lead_forms \
             (tenant_id, form_id, page_id, name, status, lead_count, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (tenant_id, form_id) DO NOTHING",
        )
        .bind(tenant_id)
        .bind(form_id)
        .bind(page_id)
        .bind(name)
        .bind(status.as_str())
        .bind(lead_count)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting form {form_id}"))?;
        if inserted.rows_affected() == 1 {
            return Ok(UpsertOutcome::Created);
        }

        sqlx::query(
            "UPDATE facebook_lead_forms \
             SET page_id = ?, name = ?, status = ?, lead_count = ?, updated_at = ? \
             WHERE tenant_id = ? AND form_id = ?",
        )
        .bind(page_id)
        .bind(name)
        .bind(status.as_str())
        .bind(lead_count)
        .bind(now)
        .bind(tenant_id)
        .bind(form_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("updating form {form_id}"))?;
        Ok(UpsertOutcome::Updated)
    }

    pub async fn get_form(&self, tenant_id: &str, form_id: &str) -> Result<Option<LeadForm>> {
        let row = sqlx::query("SELECT * FROM facebook_lead_forms WHERE tenant_id = ? AND form_id = ?")
            .bind(tenant_id)
            .bind(form_id)
            .fetch_optional(&self.pool)
            .await
            .context("loading lead form")?;
        row.as_ref().map(form_from_row).transpose()
    }

    pub async fn list_forms(&self, tenant_id: &str) -> Result<Vec<LeadForm>> {
        let rows = sqlx::query(
            "SELECT * FROM facebook_lead_forms WHERE tenant_id = ? ORDER BY page_id, created_at, form_id",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .context("listing lead forms")?;
        rows.iter().map(form_from_row).collect()
    }

    pub async fn mark_form_fetched(
        &self,
        tenant_id: &str,
        form_id: &str,
        fetched_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE facebook_lead_forms SET last_lead_fetched_at = ?, updated_at = ? \
             WHERE tenant_id = ? AND form_id = ?",
        )
        .bind(fetched_at)
        .bind(fetched_at)
        .bind(tenant_id)
        .bind(form_id)
        .execute(&self.pool)
        .await
        .context("stamping form fetch time")?;
        Ok(())
    }

    pub async fn set_form_lead_count(&self, tenant_id: &str, form_id: &str, count: i64) -> Result<()> {
        sqlx::query(
            "UPDATE facebook_lead_forms SET lead_count = ?, updated_at = ? \
             WHERE tenant_id = ? AND form_id = ?",
        )
        .bind(count)
        .bind(Utc::now())
        .bind(tenant_id)
        .bind(form_id)
        .execute(&self.pool)
        .await
        .context("updating form lead count")?;
        Ok(())
    }

    /// Check-and-insert in one statement. A lead is a duplicate when any stored
    /// lead of the same tenant shares its phone, its email or its external id.
    /// NULL never compares equal in SQL, so absent keys cannot collide.
    pub async fn insert_lead_if_absent(&self, lead: &Lead) -> Result<InsertOutcome> {
        let metadata =
            serde_json::to_string(&lead.metadata).context("serializing lead metadata")?;
        let sql = format!(
            "INSERT INTO leads ({LEAD_COLUMNS}) \
             SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ? \
             WHERE NOT EXISTS ( \
                 SELECT 1 FROM leads WHERE tenant_id = ? \
                 AND (phone = ? OR email = ? OR external_lead_id = ?) \
             )"
        );
        let result = sqlx::query(&sql)
            .bind(lead.id.to_string())
            .bind(&lead.tenant_id)
            .bind(&lead.name)
            .bind(&lead.email)
            .bind(&lead.phone)
            .bind(&lead.location)
            .bind(&lead.source)
            .bind(lead.stage.as_str())
            .bind(&lead.status)
            .bind(&lead.campaign_name)
            .bind(&lead.form_name)
            .bind(&lead.external_lead_id)
            .bind(&lead.form_id)
            .bind(&lead.page_id)
            .bind(lead.fetched_at)
            .bind(lead.created_at)
            .bind(lead.updated_at)
            .bind(metadata)
            .bind(&lead.tenant_id)
            .bind(&lead.phone)
            .bind(&lead.email)
            .bind(&lead.external_lead_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("inserting lead {}", lead.id))?;

        Ok(if result.rows_affected() == 1 {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::Duplicate
        })
    }

    pub async fn count_leads(&self, tenant_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM leads WHERE tenant_id = ?")
            .bind(tenant_id)
            .fetch_one(&self.pool)
            .await
            .context("counting leads")?;
        Ok(count)
    }

    pub async fn count_leads_for_form(&self, tenant_id: &str, form_id: &str) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM leads WHERE tenant_id = ? AND form_id = ?")
                .bind(tenant_id)
                .bind(form_id)
                .fetch_one(&self.pool)
                .await
                .context("counting form leads")?;
        Ok(count)
    }

    /// All leads of a tenant in insertion order.
    pub async fn list_leads(&self, tenant_id: &str) -> Result<Vec<Lead>> {
        let sql = format!("SELECT {LEAD_COLUMNS} FROM leads WHERE tenant_id = ? ORDER BY rowid");
        let rows = sqlx::query(&sql)
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await
            .context("listing leads")?;
        rows.iter().map(lead_from_row).collect()
    }

    pub async fn delete_leads(&self, ids: &[Uuid]) -> Result<u64> {
        let mut tx = self.pool.begin().await.context("opening transaction")?;
        let mut removed = 0u64;
        for id in ids {
            removed += sqlx::query("DELETE FROM leads WHERE id = ?")
                .bind(id.to_string())
                .execute(&mut *tx)
                .await
                .with_context(|| format!("deleting lead {id}"))?
                .rows_affected();
        }
        tx.commit().await.context("committing lead deletion")?;
        Ok(removed)
    }
}

fn page_from_row(row: &SqliteRow) -> Result<PageConnection> {
    Ok(PageConnection {
        tenant_id: row.try_get("tenant_id")?,
        page_id: row.try_get("page_id")?,
        page_name: row.try_get("page_name")?,
        access_token: row.try_get("access_token")?,
        status: row.try_get("status")?,
        sync_enabled: row.try_get("sync_enabled")?,
        last_sync_at: row.try_get("last_sync_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn form_from_row(row: &SqliteRow) -> Result<LeadForm> {
    let status: String = row.try_get("status")?;
    Ok(LeadForm {
        tenant_id: row.try_get("tenant_id")?,
        form_id: row.try_get("form_id")?,
        page_id: row.try_get("page_id")?,
        name: row.try_get("name")?,
        status: FormStatus::parse(&status).ok_or_else(|| anyhow!("unknown form status {status}"))?,
        lead_count: row.try_get("lead_count")?,
        last_lead_fetched_at: row.try_get("last_lead_fetched_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn lead_from_row(row: &SqliteRow) -> Result<Lead> {
    let id: String = row.try_get("id")?;
    let stage: String = row.try_get("stage")?;
    let metadata: String = row.try_get("metadata")?;
    Ok(Lead {
        id: Uuid::parse_str(&id).with_context(|| format!("parsing lead id {id}"))?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        location: row.try_get("location")?,
        source: row.try_get("source")?,
        stage: LeadStage::parse(&stage).ok_or_else(|| anyhow!("unknown lead stage {stage}"))?,
        status: row.try_get("status")?,
        campaign_name: row.try_get("campaign_name")?,
        form_name: row.try_get("form_name")?,
        external_lead_id: row.try_get("external_lead_id")?,
        form_id: row.try_get("form_id")?,
        page_id: row.try_get("page_id")?,
        fetched_at: row.try_get("fetched_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        metadata: serde_json::from_str(&metadata).context("parsing lead metadata")?,
    })
}
