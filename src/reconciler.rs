use crate::gcp::{short_account_id, BillingProvider};
use crate::planner::plan_allocations;
use crate::store::{
    BillingAccountState, OperationEvent, OperationStatus, OperationType, ProjectState,
};
use std::collections::{BTreeMap, BTreeSet};

/// What the reconciler knows about one identity before a cycle starts:
/// the stored project rows, keyed by project id, with their last persisted
/// billing binding.
#[derive(Debug, Clone, Default)]
pub struct IdentitySnapshot {
    pub name: String,
    pub stored_bindings: BTreeMap<String, Option<String>>,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcileSettings {
    /// Master switch for the allocation phase.
    pub auto_switch: bool,
    /// Cap on projects per billing account.
    pub max_projects_per_billing: usize,
}

/// Per-cycle counters, logged as a structured field at cycle end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub projects: usize,
    pub billing_accounts: usize,
    pub open_billing_accounts: usize,
    pub healthy: usize,
    pub stale_detached: usize,
    pub detach_failed: usize,
    pub bound: usize,
    pub bind_failed: usize,
    pub deferred: usize,
    pub skipped_no_access: usize,
    pub observed_changes: usize,
}

/// Everything one cycle observed and decided, ready for the store to apply
/// in a single transaction. Events are in execution order.
#[derive(Debug, Clone, Default)]
pub struct CycleOutcome {
    pub billing_accounts: Vec<BillingAccountState>,
    pub projects: Vec<ProjectState>,
    pub events: Vec<OperationEvent>,
    pub stats: CycleStats,
}

/// Run one reconcile cycle for one identity.
///
/// Provider calls happen here, outside any store transaction; the caller
/// persists the returned outcome afterwards. An error from discovery or
/// classification aborts the cycle with nothing to persist. Detach and bind
/// failures do not abort: they are recorded as failed events and the
/// affected projects are retried next cycle.
pub async fn run_cycle<P: BillingProvider + ?Sized>(
    provider: &P,
    snapshot: &IdentitySnapshot,
    settings: &ReconcileSettings,
) -> Result<CycleOutcome, crate::error::ProviderError> {
    let mut outcome = CycleOutcome::default();

    // Discover projects and billing accounts.
    let project_ids = provider.list_projects().await?;
    let accounts = provider.list_billing_accounts().await?;

    let open_billings: Vec<String> = accounts
        .iter()
        .filter(|a| a.open)
        .map(|a| a.name.clone())
        .collect();
    let open_set: BTreeSet<&str> = open_billings.iter().map(String::as_str).collect();
    let display_names: BTreeMap<&str, &str> = accounts
        .iter()
        .map(|a| (a.name.as_str(), a.display_name.as_str()))
        .collect();

    outcome.stats.projects = project_ids.len();
    outcome.stats.billing_accounts = accounts.len();
    outcome.stats.open_billing_accounts = open_billings.len();

    outcome.billing_accounts = accounts
        .iter()
        .map(|a| BillingAccountState {
            name: a.name.clone(),
            display_name: a.display_name.clone(),
            open: a.open,
        })
        .collect();

    // Classify every project by its current binding.
    let mut healthy: Vec<(String, String)> = Vec::new();
    let mut stale: Vec<(String, String)> = Vec::new();
    let mut unbound: Vec<String> = Vec::new();
    let mut skipped: Vec<String> = Vec::new();

    for project_id in project_ids {
        match provider.project_billing(&project_id).await? {
            None => {
                tracing::debug!(
                    identity = %snapshot.name,
                    project = %project_id,
                    "cannot read billing info; skipping this cycle"
                );
                skipped.push(project_id);
            }
            Some(binding) if binding.is_empty() => unbound.push(project_id),
            Some(binding) if open_set.contains(binding.as_str()) => {
                healthy.push((project_id, binding))
            }
            Some(binding) => stale.push((project_id, binding)),
        }
    }
    outcome.stats.healthy = healthy.len();
    outcome.stats.skipped_no_access = skipped.len();

    // Bindings that changed outside the keeper get an `update` event before
    // any mutation of our own, so the audit log explains every leg of a
    // transition even when we detach or re-bind the project later in this
    // same cycle. Skipped projects were not observed and stay silent.
    let observed_at_start = healthy
        .iter()
        .chain(stale.iter())
        .map(|(project_id, binding)| (project_id.as_str(), Some(binding.as_str())))
        .chain(unbound.iter().map(|project_id| (project_id.as_str(), None)));
    for (project_id, observed) in observed_at_start {
        let stored = snapshot
            .stored_bindings
            .get(project_id)
            .cloned()
            .unwrap_or(None);
        if stored.as_deref() != observed {
            outcome.stats.observed_changes += 1;
            outcome.events.push(OperationEvent {
                op: OperationType::Update,
                project_id: Some(project_id.to_string()),
                billing_account_id: observed
                    .or(stored.as_deref())
                    .map(|b| short_account_id(b).to_string()),
                old_value: stored,
                new_value: observed.map(str::to_string),
                status: OperationStatus::Success,
                message: "observed billing binding change".into(),
            });
        }
    }

    // Detach projects whose billing account has closed.
    let mut still_stale: Vec<(String, String)> = Vec::new();
    for (project_id, binding) in stale {
        match provider.set_project_billing(&project_id, "").await {
            Ok(()) => {
                outcome.stats.stale_detached += 1;
                outcome.events.push(OperationEvent {
                    op: OperationType::Unbind,
                    project_id: Some(project_id.clone()),
                    billing_account_id: Some(short_account_id(&binding).to_string()),
                    old_value: Some(binding),
                    new_value: None,
                    status: OperationStatus::Success,
                    message: "detached project from closed billing account".into(),
                });
                unbound.push(project_id);
            }
            Err(err) => {
                outcome.stats.detach_failed += 1;
                tracing::warn!(
                    identity = %snapshot.name,
                    project = %project_id,
                    error = %err,
                    "failed to detach stale billing binding"
                );
                outcome.events.push(OperationEvent {
                    op: OperationType::Unbind,
                    project_id: Some(project_id.clone()),
                    billing_account_id: Some(short_account_id(&binding).to_string()),
                    old_value: Some(binding.clone()),
                    new_value: None,
                    status: OperationStatus::Failed,
                    message: format!("failed to detach billing: {err}"),
                });
                still_stale.push((project_id, binding));
            }
        }
    }

    // Allocate unbound projects onto open billing accounts.
    let mut bound: Vec<(String, String)> = healthy;
    if settings.auto_switch && !unbound.is_empty() && !open_billings.is_empty() {
        // Usage counts every project currently pointing at an open billing
        // account, including ones whose binding we could not re-read this
        // cycle (their stored row stands in).
        let mut usage: BTreeMap<String, usize> = BTreeMap::new();
        for (_, binding) in &bound {
            *usage.entry(binding.clone()).or_default() += 1;
        }
        for project_id in &skipped {
            if let Some(Some(binding)) = snapshot.stored_bindings.get(project_id) {
                *usage.entry(binding.clone()).or_default() += 1;
            }
        }

        let plan = plan_allocations(
            &unbound,
            &open_billings,
            &usage,
            settings.max_projects_per_billing,
        );
        outcome.stats.deferred = plan.deferred.len();

        let mut queue = unbound.into_iter();
        let mut leftover: Vec<String> = Vec::new();
        for assignment in &plan.assignments {
            for _ in 0..assignment.count {
                let Some(project_id) = queue.next() else { break };
                match provider
                    .set_project_billing(&project_id, &assignment.billing_name)
                    .await
                {
                    Ok(()) => {
                        outcome.stats.bound += 1;
                        outcome.events.push(OperationEvent {
                            op: OperationType::AutoBind,
                            project_id: Some(project_id.clone()),
                            billing_account_id: Some(
                                short_account_id(&assignment.billing_name).to_string(),
                            ),
                            old_value: None,
                            new_value: Some(assignment.billing_name.clone()),
                            status: OperationStatus::Success,
                            message: "bound project to open billing account".into(),
                        });
                        bound.push((project_id, assignment.billing_name.clone()));
                    }
                    Err(err) => {
                        outcome.stats.bind_failed += 1;
                        tracing::warn!(
                            identity = %snapshot.name,
                            project = %project_id,
                            billing = %assignment.billing_name,
                            error = %err,
                            "failed to bind project; will retry next cycle"
                        );
                        outcome.events.push(OperationEvent {
                            op: OperationType::AutoBind,
                            project_id: Some(project_id.clone()),
                            billing_account_id: Some(
                                short_account_id(&assignment.billing_name).to_string(),
                            ),
                            old_value: None,
                            new_value: Some(assignment.billing_name.clone()),
                            status: OperationStatus::Failed,
                            message: format!("failed to bind billing: {err}"),
                        });
                        leftover.push(project_id);
                    }
                }
            }
        }
        leftover.extend(queue);
        unbound = leftover;
    } else {
        outcome.stats.deferred = unbound.len();
    }

    // Final observed rows. Skipped projects are left out so their stored
    // rows stay untouched.
    let display_for = |binding: &str| -> Option<String> {
        display_names.get(binding).map(|d| d.to_string())
    };

    let mut final_rows: Vec<ProjectState> = Vec::new();
    for (project_id, binding) in bound.iter().chain(still_stale.iter()) {
        final_rows.push(ProjectState {
            project_id: project_id.clone(),
            billing_name: Some(binding.clone()),
            billing_display_name: display_for(binding),
        });
    }
    for project_id in &unbound {
        final_rows.push(ProjectState {
            project_id: project_id.clone(),
            billing_name: None,
            billing_display_name: None,
        });
    }
    outcome.projects = final_rows;

    Ok(outcome)
}
