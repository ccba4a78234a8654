use chrono::NaiveDateTime;
use serde::Serialize;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::FromRow;
use std::collections::BTreeMap;

/// Audit log entry kinds, stored as their wire strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    Update,
    Unbind,
    AutoBind,
    RemovePermission,
    RemoveProjectPermission,
    DeleteBilling,
    DeleteProject,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Update => "update",
            OperationType::Unbind => "unbind",
            OperationType::AutoBind => "auto_bind",
            OperationType::RemovePermission => "remove_permission",
            OperationType::RemoveProjectPermission => "remove_project_permission",
            OperationType::DeleteBilling => "delete_billing",
            OperationType::DeleteProject => "delete_project",
        }
    }
}

/// `already_absent` is a success variant: the intended end state already
/// held, so nothing was written. The delete-project safety gate accepts
/// either success variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Success,
    AlreadyAbsent,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Success => "success",
            OperationStatus::AlreadyAbsent => "already_absent",
            OperationStatus::Failed => "failed",
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, OperationStatus::Failed)
    }
}

/// One intended change and its outcome, before persistence.
#[derive(Debug, Clone)]
pub struct OperationEvent {
    pub op: OperationType,
    pub project_id: Option<String>,
    pub billing_account_id: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub status: OperationStatus,
    pub message: String,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct IdentityRow {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub credentials_file: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ProjectRow {
    pub id: i64,
    pub project_id: String,
    pub service_account_id: i64,
    pub billing_account_id: Option<String>,
    pub billing_account_name: Option<String>,
    pub billing_account_display_name: Option<String>,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BillingAccountRow {
    pub id: i64,
    pub name: String,
    pub display_name: Option<String>,
    pub account_id: String,
    pub is_open: bool,
    pub is_used: bool,
    pub service_account_id: i64,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct OperationRow {
    pub id: i64,
    pub operation_type: String,
    pub service_account_id: i64,
    pub project_id: Option<String>,
    pub billing_account_id: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub status: String,
    pub message: Option<String>,
    pub created_at: NaiveDateTime,
}

/// Per-identity counters the identity list endpoint reports.
#[derive(Debug, Clone, Serialize)]
pub struct IdentitySummary {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub project_count: i64,
    pub active_billing_count: i64,
    pub inactive_billing_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusCounts {
    pub service_accounts: i64,
    pub projects: i64,
    pub active_billing_accounts: i64,
    pub inactive_billing_accounts: i64,
}

/// What `apply_cycle` could not persist. Missing audit rows are an
/// invariant violation, so the caller surfaces this count loudly.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyReport {
    pub audit_log_failures: usize,
}

/// Final observed state of one project after a cycle.
#[derive(Debug, Clone)]
pub struct ProjectState {
    pub project_id: String,
    /// Full billing account name, `None` when unbound.
    pub billing_name: Option<String>,
    pub billing_display_name: Option<String>,
}

/// Observed state of one billing account after a cycle. `is_used` is
/// recomputed from the projects table at apply time.
#[derive(Debug, Clone)]
pub struct BillingAccountState {
    pub name: String,
    pub display_name: String,
    pub open: bool,
}

/// Transactional persistence over MySQL. Each unit of work takes a fresh
/// short-lived transaction; nothing here ever spans a provider call.
#[derive(Clone)]
pub struct Store {
    pool: MySqlPool,
}

impl Store {
    pub async fn connect(database_url: &str, max_connections: u32) -> sqlx::Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Create the four tables if this is a fresh database.
    pub async fn migrate(&self) -> sqlx::Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS service_accounts (
                id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
                name VARCHAR(200) NOT NULL UNIQUE,
                email VARCHAR(200) NOT NULL,
                credentials_file VARCHAR(300) NOT NULL,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS projects (
                id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
                project_id VARCHAR(100) NOT NULL,
                service_account_id BIGINT NOT NULL,
                billing_account_id VARCHAR(100) NULL,
                billing_account_name VARCHAR(200) NULL,
                billing_account_display_name VARCHAR(200) NULL,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP,
                UNIQUE KEY uq_projects_identity_project (service_account_id, project_id)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS billing_accounts (
                id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
                name VARCHAR(200) NOT NULL,
                display_name VARCHAR(200) NULL,
                account_id VARCHAR(100) NOT NULL,
                is_open BOOLEAN NOT NULL DEFAULT TRUE,
                is_used BOOLEAN NOT NULL DEFAULT FALSE,
                service_account_id BIGINT NOT NULL,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP,
                UNIQUE KEY uq_billing_identity_name (service_account_id, name)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS billing_operations (
                id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
                operation_type VARCHAR(50) NOT NULL,
                service_account_id BIGINT NOT NULL,
                project_id VARCHAR(100) NULL,
                billing_account_id VARCHAR(100) NULL,
                old_value VARCHAR(300) NULL,
                new_value VARCHAR(300) NULL,
                status VARCHAR(50) NOT NULL,
                message TEXT NULL,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                KEY idx_operations_identity_time (service_account_id, created_at)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Look up an identity by name, creating the row on first sighting.
    pub async fn ensure_identity(
        &self,
        name: &str,
        email: &str,
        credentials_file: &str,
    ) -> sqlx::Result<i64> {
        if let Some(row) = sqlx::query_as::<_, IdentityRow>(
            "SELECT id, name, email, credentials_file, created_at, updated_at
             FROM service_accounts WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        {
            return Ok(row.id);
        }

        let result = sqlx::query(
            "INSERT INTO service_accounts (name, email, credentials_file) VALUES (?, ?, ?)",
        )
        .bind(name)
        .bind(email)
        .bind(credentials_file)
        .execute(&self.pool)
        .await?;
        tracing::info!(identity = name, email, "registered new service account");
        Ok(result.last_insert_id() as i64)
    }

    /// Stored project bindings for one identity: project id -> billing
    /// account name (None when the row is unbound).
    pub async fn stored_bindings(
        &self,
        identity_id: i64,
    ) -> sqlx::Result<BTreeMap<String, Option<String>>> {
        let rows = sqlx::query_as::<_, (String, Option<String>)>(
            "SELECT project_id, billing_account_name FROM projects WHERE service_account_id = ?",
        )
        .bind(identity_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    /// Persist everything one reconcile cycle observed, in one transaction:
    /// billing account upserts, project upserts, the `is_used` recompute,
    /// and the cycle's audit events in execution order.
    pub async fn apply_cycle(
        &self,
        identity_id: i64,
        billing_accounts: &[BillingAccountState],
        projects: &[ProjectState],
        events: &[OperationEvent],
    ) -> sqlx::Result<ApplyReport> {
        let mut tx = self.pool.begin().await?;
        let mut report = ApplyReport::default();

        for account in billing_accounts {
            sqlx::query(
                "INSERT INTO billing_accounts (name, display_name, account_id, is_open, service_account_id)
                 VALUES (?, ?, ?, ?, ?)
                 ON DUPLICATE KEY UPDATE
                     display_name = VALUES(display_name),
                     is_open = VALUES(is_open)",
            )
            .bind(&account.name)
            .bind(&account.display_name)
            .bind(crate::gcp::short_account_id(&account.name))
            .bind(account.open)
            .bind(identity_id)
            .execute(&mut *tx)
            .await?;
        }

        for project in projects {
            let short = project
                .billing_name
                .as_deref()
                .map(crate::gcp::short_account_id);
            sqlx::query(
                "INSERT INTO projects
                     (project_id, service_account_id, billing_account_id,
                      billing_account_name, billing_account_display_name)
                 VALUES (?, ?, ?, ?, ?)
                 ON DUPLICATE KEY UPDATE
                     billing_account_id = VALUES(billing_account_id),
                     billing_account_name = VALUES(billing_account_name),
                     billing_account_display_name = VALUES(billing_account_display_name)",
            )
            .bind(&project.project_id)
            .bind(identity_id)
            .bind(short)
            .bind(&project.billing_name)
            .bind(&project.billing_display_name)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "UPDATE billing_accounts ba
             SET ba.is_used = EXISTS (
                 SELECT 1 FROM projects p
                 WHERE p.service_account_id = ba.service_account_id
                   AND p.billing_account_name = ba.name
             )
             WHERE ba.service_account_id = ?",
        )
        .bind(identity_id)
        .execute(&mut *tx)
        .await?;

        for event in events {
            let inserted = sqlx::query(
                "INSERT INTO billing_operations
                     (operation_type, service_account_id, project_id, billing_account_id,
                      old_value, new_value, status, message)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(event.op.as_str())
            .bind(identity_id)
            .bind(&event.project_id)
            .bind(&event.billing_account_id)
            .bind(&event.old_value)
            .bind(&event.new_value)
            .bind(event.status.as_str())
            .bind(&event.message)
            .execute(&mut *tx)
            .await;
            if let Err(err) = inserted {
                // A missing audit row breaks audit completeness; count it
                // instead of dropping it silently.
                report.audit_log_failures += 1;
                tracing::warn!(
                    identity_id,
                    operation = event.op.as_str(),
                    error = %err,
                    "failed to persist audit event"
                );
            }
        }

        tx.commit().await?;
        Ok(report)
    }

    /// Append a single audit event outside a cycle (operator actions).
    pub async fn record_event(&self, identity_id: i64, event: &OperationEvent) -> sqlx::Result<()> {
        sqlx::query(
            "INSERT INTO billing_operations
                 (operation_type, service_account_id, project_id, billing_account_id,
                  old_value, new_value, status, message)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(event.op.as_str())
        .bind(identity_id)
        .bind(&event.project_id)
        .bind(&event.billing_account_id)
        .bind(&event.old_value)
        .bind(&event.new_value)
        .bind(event.status.as_str())
        .bind(&event.message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn identity(&self, id: i64) -> sqlx::Result<Option<IdentityRow>> {
        sqlx::query_as::<_, IdentityRow>(
            "SELECT id, name, email, credentials_file, created_at, updated_at
             FROM service_accounts WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn identity_summaries(&self) -> sqlx::Result<Vec<IdentitySummary>> {
        let rows = sqlx::query_as::<_, (i64, String, String, i64, i64, i64)>(
            "SELECT sa.id, sa.name, sa.email,
                    (SELECT COUNT(*) FROM projects p WHERE p.service_account_id = sa.id),
                    (SELECT COUNT(*) FROM billing_accounts b
                      WHERE b.service_account_id = sa.id AND b.is_open),
                    (SELECT COUNT(*) FROM billing_accounts b
                      WHERE b.service_account_id = sa.id AND NOT b.is_open)
             FROM service_accounts sa ORDER BY sa.id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(
                |(id, name, email, project_count, active, inactive)| IdentitySummary {
                    id,
                    name,
                    email,
                    project_count,
                    active_billing_count: active,
                    inactive_billing_count: inactive,
                },
            )
            .collect())
    }

    pub async fn projects(&self, identity_id: Option<i64>) -> sqlx::Result<Vec<ProjectRow>> {
        const COLS: &str = "id, project_id, service_account_id, billing_account_id,
                            billing_account_name, billing_account_display_name, updated_at";
        match identity_id {
            Some(id) => {
                sqlx::query_as::<_, ProjectRow>(&format!(
                    "SELECT {COLS} FROM projects WHERE service_account_id = ? ORDER BY project_id"
                ))
                .bind(id)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, ProjectRow>(&format!(
                    "SELECT {COLS} FROM projects ORDER BY project_id"
                ))
                .fetch_all(&self.pool)
                .await
            }
        }
    }

    pub async fn project(
        &self,
        identity_id: i64,
        project_id: &str,
    ) -> sqlx::Result<Option<ProjectRow>> {
        sqlx::query_as::<_, ProjectRow>(
            "SELECT id, project_id, service_account_id, billing_account_id,
                    billing_account_name, billing_account_display_name, updated_at
             FROM projects WHERE service_account_id = ? AND project_id = ?",
        )
        .bind(identity_id)
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn clear_project_billing(
        &self,
        identity_id: i64,
        project_id: &str,
    ) -> sqlx::Result<()> {
        sqlx::query(
            "UPDATE projects
             SET billing_account_id = NULL, billing_account_name = NULL,
                 billing_account_display_name = NULL
             WHERE service_account_id = ? AND project_id = ?",
        )
        .bind(identity_id)
        .bind(project_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn billing_accounts(
        &self,
        identity_id: Option<i64>,
        is_open: Option<bool>,
    ) -> sqlx::Result<Vec<BillingAccountRow>> {
        let mut sql = String::from(
            "SELECT id, name, display_name, account_id, is_open, is_used,
                    service_account_id, updated_at
             FROM billing_accounts WHERE 1 = 1",
        );
        if identity_id.is_some() {
            sql.push_str(" AND service_account_id = ?");
        }
        if is_open.is_some() {
            sql.push_str(" AND is_open = ?");
        }
        sql.push_str(" ORDER BY name");

        let mut query = sqlx::query_as::<_, BillingAccountRow>(&sql);
        if let Some(id) = identity_id {
            query = query.bind(id);
        }
        if let Some(open) = is_open {
            query = query.bind(open);
        }
        query.fetch_all(&self.pool).await
    }

    pub async fn billing_account_by_short_id(
        &self,
        identity_id: i64,
        account_id: &str,
    ) -> sqlx::Result<Option<BillingAccountRow>> {
        sqlx::query_as::<_, BillingAccountRow>(
            "SELECT id, name, display_name, account_id, is_open, is_used,
                    service_account_id, updated_at
             FROM billing_accounts WHERE service_account_id = ? AND account_id = ?",
        )
        .bind(identity_id)
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn operations(
        &self,
        identity_id: Option<i64>,
        operation_type: Option<&str>,
        limit: i64,
    ) -> sqlx::Result<Vec<OperationRow>> {
        let mut sql = String::from(
            "SELECT id, operation_type, service_account_id, project_id, billing_account_id,
                    old_value, new_value, status, message, created_at
             FROM billing_operations WHERE 1 = 1",
        );
        if identity_id.is_some() {
            sql.push_str(" AND service_account_id = ?");
        }
        if operation_type.is_some() {
            sql.push_str(" AND operation_type = ?");
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");

        let mut query = sqlx::query_as::<_, OperationRow>(&sql);
        if let Some(id) = identity_id {
            query = query.bind(id);
        }
        if let Some(op) = operation_type {
            query = query.bind(op);
        }
        query.bind(limit.max(1)).fetch_all(&self.pool).await
    }

    /// The delete-project safety gate: a successful admin-rights removal
    /// must exist before the row may go.
    pub async fn has_successful_permission_removal(
        &self,
        identity_id: i64,
        project_id: &str,
    ) -> sqlx::Result<bool> {
        let found: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM billing_operations
             WHERE operation_type = 'remove_project_permission'
               AND service_account_id = ? AND project_id = ?
               AND status IN ('success', 'already_absent')
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(identity_id)
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    /// Delete a project row and log the deletion in one transaction.
    pub async fn delete_project_row(
        &self,
        identity_id: i64,
        project_id: &str,
        event: &OperationEvent,
    ) -> sqlx::Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO billing_operations
                 (operation_type, service_account_id, project_id, billing_account_id,
                  old_value, new_value, status, message)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(event.op.as_str())
        .bind(identity_id)
        .bind(&event.project_id)
        .bind(&event.billing_account_id)
        .bind(&event.old_value)
        .bind(&event.new_value)
        .bind(event.status.as_str())
        .bind(&event.message)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM projects WHERE service_account_id = ? AND project_id = ?")
            .bind(identity_id)
            .bind(project_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await
    }

    pub async fn count_projects_using_billing(
        &self,
        identity_id: i64,
        account_id: &str,
    ) -> sqlx::Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM projects
             WHERE service_account_id = ? AND billing_account_id = ?",
        )
        .bind(identity_id)
        .bind(account_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Delete a billing account row and log the deletion in one transaction.
    pub async fn delete_billing_row(
        &self,
        identity_id: i64,
        account_id: &str,
        event: &OperationEvent,
    ) -> sqlx::Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO billing_operations
                 (operation_type, service_account_id, project_id, billing_account_id,
                  old_value, new_value, status, message)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(event.op.as_str())
        .bind(identity_id)
        .bind(&event.project_id)
        .bind(&event.billing_account_id)
        .bind(&event.old_value)
        .bind(&event.new_value)
        .bind(event.status.as_str())
        .bind(&event.message)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM billing_accounts WHERE service_account_id = ? AND account_id = ?")
            .bind(identity_id)
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await
    }

    pub async fn status_counts(&self) -> sqlx::Result<StatusCounts> {
        let (service_accounts, projects, active, inactive): (i64, i64, i64, i64) = sqlx::query_as(
            "SELECT (SELECT COUNT(*) FROM service_accounts),
                    (SELECT COUNT(*) FROM projects),
                    (SELECT COUNT(*) FROM billing_accounts WHERE is_open),
                    (SELECT COUNT(*) FROM billing_accounts WHERE NOT is_open)",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(StatusCounts {
            service_accounts,
            projects,
            active_billing_accounts: active,
            inactive_billing_accounts: inactive,
        })
    }
}
