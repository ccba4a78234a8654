use crate::auth::TokenSource;
use crate::config::AppConfig;
use crate::error::ActionError;
use crate::gcp::{
    BillingProvider, GcpBilling, IamResource, RevokeOutcome, BILLING_ADMIN_ROLES,
    PROJECT_ADMIN_ROLES,
};
use crate::rate::RateGate;
use crate::store::{IdentityRow, OperationEvent, OperationStatus, OperationType, Store};
use std::sync::Arc;

/// Operator-initiated mutations. Each runs against a fresh provider client
/// for the identity and records its outcome in the operation log under the
/// same invariants as the reconcile loop.
#[derive(Clone)]
pub struct Actions {
    pub store: Store,
    pub cfg: Arc<AppConfig>,
    pub gate: Arc<RateGate>,
}

impl Actions {
    async fn identity(&self, identity_id: i64) -> Result<IdentityRow, ActionError> {
        self.store
            .identity(identity_id)
            .await?
            .ok_or_else(|| ActionError::NotFound(format!("unknown service account {identity_id}")))
    }

    fn provider_for(&self, identity: &IdentityRow) -> Result<GcpBilling, ActionError> {
        let auth = TokenSource::from_file(&identity.credentials_file)?;
        Ok(GcpBilling::new(
            identity.name.clone(),
            auth,
            self.gate.clone(),
            self.cfg.retry_policy(),
            self.cfg.gate_acquire_timeout,
        ))
    }

    /// Detach a project's billing account. A project that already has no
    /// billing is a success without touching the provider.
    pub async fn detach_project_billing(
        &self,
        identity_id: i64,
        project_id: &str,
    ) -> Result<String, ActionError> {
        let identity = self.identity(identity_id).await?;
        let project = self
            .store
            .project(identity_id, project_id)
            .await?
            .ok_or_else(|| ActionError::NotFound(format!("unknown project {project_id}")))?;

        let Some(billing_name) = project.billing_account_name else {
            return Ok("project has no billing account attached".into());
        };

        let provider = self.provider_for(&identity)?;
        match provider.set_project_billing(project_id, "").await {
            Ok(()) => {
                self.store.clear_project_billing(identity_id, project_id).await?;
                self.store
                    .record_event(
                        identity_id,
                        &OperationEvent {
                            op: OperationType::Unbind,
                            project_id: Some(project_id.to_string()),
                            billing_account_id: project.billing_account_id.clone(),
                            old_value: Some(billing_name),
                            new_value: None,
                            status: OperationStatus::Success,
                            message: "billing detached by operator".into(),
                        },
                    )
                    .await?;
                Ok("billing account detached".into())
            }
            Err(err) => {
                self.store
                    .record_event(
                        identity_id,
                        &OperationEvent {
                            op: OperationType::Unbind,
                            project_id: Some(project_id.to_string()),
                            billing_account_id: project.billing_account_id.clone(),
                            old_value: Some(billing_name),
                            new_value: None,
                            status: OperationStatus::Failed,
                            message: format!("failed to detach billing: {err}"),
                        },
                    )
                    .await?;
                Err(err.into())
            }
        }
    }

    /// Remove the identity's administrator roles on a project.
    pub async fn revoke_project_admin(
        &self,
        identity_id: i64,
        project_id: &str,
    ) -> Result<String, ActionError> {
        let identity = self.identity(identity_id).await?;
        let provider = self.provider_for(&identity)?;
        let member = format!("serviceAccount:{}", identity.email);
        let resource = IamResource::Project(project_id.to_string());

        match provider
            .remove_member_from_roles(&resource, &member, PROJECT_ADMIN_ROLES)
            .await
        {
            Ok(outcome) => {
                let (status, message) = revoke_summary(outcome, &member, "project");
                self.store
                    .record_event(
                        identity_id,
                        &OperationEvent {
                            op: OperationType::RemoveProjectPermission,
                            project_id: Some(project_id.to_string()),
                            billing_account_id: None,
                            old_value: Some(member),
                            new_value: None,
                            status,
                            message: message.clone(),
                        },
                    )
                    .await?;
                Ok(message)
            }
            Err(err) => {
                self.store
                    .record_event(
                        identity_id,
                        &OperationEvent {
                            op: OperationType::RemoveProjectPermission,
                            project_id: Some(project_id.to_string()),
                            billing_account_id: None,
                            old_value: Some(member),
                            new_value: None,
                            status: OperationStatus::Failed,
                            message: format!("failed to remove project admin roles: {err}"),
                        },
                    )
                    .await?;
                Err(err.into())
            }
        }
    }

    /// Remove the identity's billing-admin role on a billing account.
    pub async fn revoke_billing_admin(
        &self,
        identity_id: i64,
        billing_id: &str,
    ) -> Result<String, ActionError> {
        let identity = self.identity(identity_id).await?;
        let provider = self.provider_for(&identity)?;
        let member = format!("serviceAccount:{}", identity.email);
        let resource = IamResource::BillingAccount(format!("billingAccounts/{billing_id}"));

        match provider
            .remove_member_from_roles(&resource, &member, BILLING_ADMIN_ROLES)
            .await
        {
            Ok(outcome) => {
                let (status, message) = revoke_summary(outcome, &member, "billing account");
                self.store
                    .record_event(
                        identity_id,
                        &OperationEvent {
                            op: OperationType::RemovePermission,
                            project_id: None,
                            billing_account_id: Some(billing_id.to_string()),
                            old_value: Some(member),
                            new_value: None,
                            status,
                            message: message.clone(),
                        },
                    )
                    .await?;
                Ok(message)
            }
            Err(err) => {
                self.store
                    .record_event(
                        identity_id,
                        &OperationEvent {
                            op: OperationType::RemovePermission,
                            project_id: None,
                            billing_account_id: Some(billing_id.to_string()),
                            old_value: Some(member),
                            new_value: None,
                            status: OperationStatus::Failed,
                            message: format!("failed to remove billing admin role: {err}"),
                        },
                    )
                    .await?;
                Err(err.into())
            }
        }
    }

    /// Delete a project row. Refused until a successful admin-rights
    /// removal for this project exists in the audit log.
    pub async fn delete_project_record(
        &self,
        identity_id: i64,
        project_id: &str,
    ) -> Result<String, ActionError> {
        self.identity(identity_id).await?;
        let project = self
            .store
            .project(identity_id, project_id)
            .await?
            .ok_or_else(|| ActionError::NotFound(format!("unknown project {project_id}")))?;

        if !self
            .store
            .has_successful_permission_removal(identity_id, project_id)
            .await?
        {
            return Err(ActionError::Refused(
                "remove the service account's admin rights on this project before deleting it"
                    .into(),
            ));
        }

        self.store
            .delete_project_row(
                identity_id,
                project_id,
                &OperationEvent {
                    op: OperationType::DeleteProject,
                    project_id: Some(project_id.to_string()),
                    billing_account_id: project.billing_account_id.clone(),
                    old_value: None,
                    new_value: None,
                    status: OperationStatus::Success,
                    message: "project record deleted by operator".into(),
                },
            )
            .await?;
        Ok("project record deleted".into())
    }

    /// Delete a billing-account row. Refused while any project row still
    /// references it.
    pub async fn delete_billing_record(
        &self,
        identity_id: i64,
        billing_id: &str,
    ) -> Result<String, ActionError> {
        self.identity(identity_id).await?;
        self.store
            .billing_account_by_short_id(identity_id, billing_id)
            .await?
            .ok_or_else(|| ActionError::NotFound(format!("unknown billing account {billing_id}")))?;

        let in_use = self
            .store
            .count_projects_using_billing(identity_id, billing_id)
            .await?;
        if in_use > 0 {
            return Err(ActionError::Refused(format!(
                "{in_use} project(s) still use this billing account; it cannot be deleted"
            )));
        }

        self.store
            .delete_billing_row(
                identity_id,
                billing_id,
                &OperationEvent {
                    op: OperationType::DeleteBilling,
                    project_id: None,
                    billing_account_id: Some(billing_id.to_string()),
                    old_value: None,
                    new_value: None,
                    status: OperationStatus::Success,
                    message: "billing account record deleted by operator".into(),
                },
            )
            .await?;
        Ok("billing account record deleted".into())
    }
}

fn revoke_summary(
    outcome: RevokeOutcome,
    member: &str,
    resource_kind: &str,
) -> (OperationStatus, String) {
    match outcome {
        RevokeOutcome::Removed { bindings_touched } => (
            OperationStatus::Success,
            format!("removed {member} from {bindings_touched} {resource_kind} role binding(s)"),
        ),
        RevokeOutcome::AlreadyAbsent => (
            OperationStatus::AlreadyAbsent,
            format!("{member} holds no admin role on this {resource_kind}; nothing to remove"),
        ),
    }
}
