//! Reconcile-cycle tests against an in-memory provider fake.
//!
//! The fake implements the same capability trait as the REST client and
//! deterministically reproduces the behaviors the pipeline must handle:
//! closed billing accounts, permission-denied reads, failing writes, and
//! IAM policies with shared bindings.

use async_trait::async_trait;
use billing_keeper::error::ProviderError;
use billing_keeper::gcp::{
    BillingAccountInfo, BillingProvider, IamBinding, IamPolicy, IamResource, RevokeOutcome,
    strip_member_from_policy, PROJECT_ADMIN_ROLES,
};
use billing_keeper::reconciler::{run_cycle, CycleOutcome, IdentitySnapshot, ReconcileSettings};
use billing_keeper::retry::RetryPolicy;
use billing_keeper::store::{OperationStatus, OperationType};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;

const OPEN_B: &str = "billingAccounts/BBBB-000000-000001";
const OPEN_C: &str = "billingAccounts/CCCC-000000-000002";
const CLOSED_A: &str = "billingAccounts/AAAA-000000-000000";

#[derive(Default)]
struct FakeState {
    /// project id -> full billing name; empty string means unbound.
    projects: BTreeMap<String, String>,
    accounts: Vec<BillingAccountInfo>,
    /// Projects whose billing info reads are permission-denied.
    denied: BTreeSet<String>,
    /// Projects whose billing writes fail.
    fail_write: BTreeSet<String>,
    /// IAM policies keyed by resource.
    policies: BTreeMap<String, IamPolicy>,
    policy_writes: usize,
    /// Remaining transient failures for list_projects.
    list_failures_left: u32,
}

struct FakeProvider {
    state: Mutex<FakeState>,
}

impl FakeProvider {
    fn new(state: FakeState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    fn binding_of(&self, project_id: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.projects.get(project_id).cloned()
    }

    fn policy_writes(&self) -> usize {
        self.state.lock().unwrap().policy_writes
    }
}

fn account(name: &str, open: bool) -> BillingAccountInfo {
    BillingAccountInfo {
        name: name.to_string(),
        display_name: format!("Account {}", &name[name.len() - 1..]),
        open,
    }
}

fn resource_key(resource: &IamResource) -> String {
    match resource {
        IamResource::Project(id) => format!("project/{id}"),
        IamResource::BillingAccount(name) => name.clone(),
    }
}

#[async_trait]
impl BillingProvider for FakeProvider {
    async fn list_projects(&self) -> Result<Vec<String>, ProviderError> {
        let mut state = self.state.lock().unwrap();
        if state.list_failures_left > 0 {
            state.list_failures_left -= 1;
            return Err(ProviderError::Http {
                status: 429,
                message: "rate limited".into(),
            });
        }
        Ok(state.projects.keys().cloned().collect())
    }

    async fn list_billing_accounts(&self) -> Result<Vec<BillingAccountInfo>, ProviderError> {
        Ok(self.state.lock().unwrap().accounts.clone())
    }

    async fn project_billing(&self, project_id: &str) -> Result<Option<String>, ProviderError> {
        let state = self.state.lock().unwrap();
        if state.denied.contains(project_id) {
            return Ok(None);
        }
        Ok(state.projects.get(project_id).cloned())
    }

    async fn set_project_billing(
        &self,
        project_id: &str,
        billing_name: &str,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_write.contains(project_id) {
            return Err(ProviderError::Http {
                status: 500,
                message: "backend error".into(),
            });
        }
        state
            .projects
            .insert(project_id.to_string(), billing_name.to_string());
        Ok(())
    }

    async fn remove_member_from_roles(
        &self,
        resource: &IamResource,
        member: &str,
        roles: &[&str],
    ) -> Result<RevokeOutcome, ProviderError> {
        let mut state = self.state.lock().unwrap();
        let key = resource_key(resource);
        let mut policy = state.policies.get(&key).cloned().unwrap_or_default();
        let touched = strip_member_from_policy(&mut policy, member, roles);
        if touched == 0 {
            return Ok(RevokeOutcome::AlreadyAbsent);
        }
        state.policies.insert(key, policy);
        state.policy_writes += 1;
        Ok(RevokeOutcome::Removed {
            bindings_touched: touched,
        })
    }
}

fn settings() -> ReconcileSettings {
    ReconcileSettings {
        auto_switch: true,
        max_projects_per_billing: 3,
    }
}

fn snapshot_from(outcome: &CycleOutcome) -> IdentitySnapshot {
    IdentitySnapshot {
        name: "sa-test".into(),
        stored_bindings: outcome
            .projects
            .iter()
            .map(|p| (p.project_id.clone(), p.billing_name.clone()))
            .collect(),
    }
}

fn events_of(outcome: &CycleOutcome, op: OperationType) -> Vec<&billing_keeper::store::OperationEvent> {
    outcome.events.iter().filter(|e| e.op == op).collect()
}

fn bound_counts(outcome: &CycleOutcome) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for project in &outcome.projects {
        if let Some(binding) = &project.billing_name {
            *counts.entry(binding.clone()).or_insert(0) += 1;
        }
    }
    counts
}

/// Four projects stranded on a closed account get detached and re-bound
/// under the concentration policy: the busier open account fills first.
#[tokio::test]
async fn stale_bindings_are_detached_and_rebound_concentrated() {
    let mut projects = BTreeMap::new();
    for i in 1..=4 {
        projects.insert(format!("stale-{i}"), CLOSED_A.to_string());
    }
    projects.insert("healthy-1".into(), OPEN_B.to_string());
    projects.insert("healthy-2".into(), OPEN_B.to_string());

    let provider = FakeProvider::new(FakeState {
        projects,
        accounts: vec![account(CLOSED_A, false), account(OPEN_B, true), account(OPEN_C, true)],
        ..Default::default()
    });
    // The stored rows already agree with the world; only our own work
    // should show up in the audit log.
    let mut stored_bindings = BTreeMap::new();
    for i in 1..=4 {
        stored_bindings.insert(format!("stale-{i}"), Some(CLOSED_A.to_string()));
    }
    stored_bindings.insert("healthy-1".into(), Some(OPEN_B.to_string()));
    stored_bindings.insert("healthy-2".into(), Some(OPEN_B.to_string()));
    let snapshot = IdentitySnapshot {
        name: "sa-test".into(),
        stored_bindings,
    };

    let outcome = run_cycle(&provider, &snapshot, &settings()).await.unwrap();

    assert!(events_of(&outcome, OperationType::Update).is_empty());
    let unbinds = events_of(&outcome, OperationType::Unbind);
    assert_eq!(unbinds.len(), 4);
    assert!(unbinds.iter().all(|e| e.status == OperationStatus::Success));
    assert!(unbinds
        .iter()
        .all(|e| e.old_value.as_deref() == Some(CLOSED_A)));

    let binds = events_of(&outcome, OperationType::AutoBind);
    assert_eq!(binds.len(), 4);
    assert!(binds.iter().all(|e| e.status == OperationStatus::Success));
    let to_b = binds
        .iter()
        .filter(|e| e.new_value.as_deref() == Some(OPEN_B))
        .count();
    let to_c = binds
        .iter()
        .filter(|e| e.new_value.as_deref() == Some(OPEN_C))
        .count();
    assert_eq!((to_b, to_c), (1, 3));

    // Every unbind precedes every bind.
    let first_bind = outcome
        .events
        .iter()
        .position(|e| e.op == OperationType::AutoBind)
        .unwrap();
    assert!(outcome.events[..first_bind]
        .iter()
        .all(|e| e.op == OperationType::Unbind));

    // The cap holds and nothing stays on the closed account.
    let counts = bound_counts(&outcome);
    assert_eq!(counts.get(OPEN_B), Some(&3));
    assert_eq!(counts.get(OPEN_C), Some(&3));
    assert_eq!(counts.get(CLOSED_A), None);
    assert_eq!(outcome.stats.stale_detached, 4);
    assert_eq!(outcome.stats.bound, 4);

    // The provider agrees with what we persisted.
    assert_eq!(provider.binding_of("healthy-1").as_deref(), Some(OPEN_B));
    for project in &outcome.projects {
        assert_eq!(
            provider.binding_of(&project.project_id).as_deref(),
            Some(project.billing_name.as_deref().unwrap_or(""))
        );
    }
}

/// With one free slot across all open accounts, one project binds and the
/// rest wait for the next cycle; no failure events are logged.
#[tokio::test]
async fn cap_exhaustion_defers_the_overflow() {
    let mut projects = BTreeMap::new();
    for i in 1..=5 {
        projects.insert(format!("waiting-{i}"), String::new());
    }
    projects.insert("b1".into(), OPEN_B.to_string());
    projects.insert("b2".into(), OPEN_B.to_string());
    for i in 1..=3 {
        projects.insert(format!("c{i}"), OPEN_C.to_string());
    }

    let provider = FakeProvider::new(FakeState {
        projects,
        accounts: vec![account(OPEN_B, true), account(OPEN_C, true)],
        ..Default::default()
    });
    let mut stored_bindings = BTreeMap::new();
    for i in 1..=5 {
        stored_bindings.insert(format!("waiting-{i}"), None);
    }
    stored_bindings.insert("b1".into(), Some(OPEN_B.to_string()));
    stored_bindings.insert("b2".into(), Some(OPEN_B.to_string()));
    for i in 1..=3 {
        stored_bindings.insert(format!("c{i}"), Some(OPEN_C.to_string()));
    }
    let snapshot = IdentitySnapshot {
        name: "sa-test".into(),
        stored_bindings,
    };

    let outcome = run_cycle(&provider, &snapshot, &settings()).await.unwrap();

    assert_eq!(outcome.events.len(), 1, "exactly one bind, nothing else");
    let binds = events_of(&outcome, OperationType::AutoBind);
    assert_eq!(binds.len(), 1);
    assert_eq!(binds[0].status, OperationStatus::Success);
    assert_eq!(binds[0].new_value.as_deref(), Some(OPEN_B));

    assert_eq!(outcome.stats.bound, 1);
    assert_eq!(outcome.stats.bind_failed, 0);
    assert_eq!(outcome.stats.deferred, 4);

    let counts = bound_counts(&outcome);
    assert_eq!(counts.get(OPEN_B), Some(&3));
    assert_eq!(counts.get(OPEN_C), Some(&3));
    let unbound = outcome
        .projects
        .iter()
        .filter(|p| p.billing_name.is_none())
        .count();
    assert_eq!(unbound, 4);
}

/// A second cycle over an unchanged world emits no events at all.
#[tokio::test]
async fn unchanged_world_is_idempotent() {
    let mut projects = BTreeMap::new();
    projects.insert("stale-1".into(), CLOSED_A.to_string());
    projects.insert("healthy-1".into(), OPEN_B.to_string());

    let provider = FakeProvider::new(FakeState {
        projects,
        accounts: vec![account(CLOSED_A, false), account(OPEN_B, true)],
        ..Default::default()
    });
    let snapshot = IdentitySnapshot {
        name: "sa-test".into(),
        stored_bindings: BTreeMap::new(),
    };

    let first = run_cycle(&provider, &snapshot, &settings()).await.unwrap();
    assert!(!first.events.is_empty());

    let second = run_cycle(&provider, &snapshot_from(&first), &settings())
        .await
        .unwrap();
    assert!(
        second.events.is_empty(),
        "unexpected events on an unchanged world: {:?}",
        second.events
    );
    assert_eq!(second.projects.len(), first.projects.len());
}

/// Projects whose billing info cannot be read are skipped, not failed, and
/// their stored rows are left alone.
#[tokio::test]
async fn permission_denied_reads_skip_the_project() {
    let mut projects = BTreeMap::new();
    projects.insert("visible".into(), OPEN_B.to_string());
    projects.insert("opaque".into(), OPEN_B.to_string());

    let provider = FakeProvider::new(FakeState {
        projects,
        accounts: vec![account(OPEN_B, true)],
        denied: BTreeSet::from(["opaque".to_string()]),
        ..Default::default()
    });
    let snapshot = IdentitySnapshot {
        name: "sa-test".into(),
        stored_bindings: BTreeMap::from([
            ("visible".to_string(), Some(OPEN_B.to_string())),
            ("opaque".to_string(), Some(OPEN_B.to_string())),
        ]),
    };

    let outcome = run_cycle(&provider, &snapshot, &settings()).await.unwrap();

    assert_eq!(outcome.stats.skipped_no_access, 1);
    assert!(outcome.events.is_empty());
    assert!(outcome.projects.iter().all(|p| p.project_id != "opaque"));
}

/// A failed detach is logged and the project keeps its stale binding until
/// the next cycle.
#[tokio::test]
async fn failed_detach_keeps_the_stale_binding() {
    let mut projects = BTreeMap::new();
    projects.insert("stuck".into(), CLOSED_A.to_string());

    let provider = FakeProvider::new(FakeState {
        projects,
        accounts: vec![account(CLOSED_A, false), account(OPEN_B, true)],
        fail_write: BTreeSet::from(["stuck".to_string()]),
        ..Default::default()
    });
    let snapshot = IdentitySnapshot {
        name: "sa-test".into(),
        stored_bindings: BTreeMap::from([("stuck".to_string(), Some(CLOSED_A.to_string()))]),
    };

    let outcome = run_cycle(&provider, &snapshot, &settings()).await.unwrap();

    let unbinds = events_of(&outcome, OperationType::Unbind);
    assert_eq!(unbinds.len(), 1);
    assert_eq!(unbinds[0].status, OperationStatus::Failed);
    assert_eq!(outcome.stats.detach_failed, 1);

    let row = outcome
        .projects
        .iter()
        .find(|p| p.project_id == "stuck")
        .unwrap();
    assert_eq!(row.billing_name.as_deref(), Some(CLOSED_A));
    assert!(events_of(&outcome, OperationType::AutoBind).is_empty());
}

/// A binding changed behind our back gets an `update` audit event.
#[tokio::test]
async fn external_binding_change_is_recorded() {
    let mut projects = BTreeMap::new();
    projects.insert("moved".into(), OPEN_C.to_string());

    let provider = FakeProvider::new(FakeState {
        projects,
        accounts: vec![account(OPEN_B, true), account(OPEN_C, true)],
        ..Default::default()
    });
    let snapshot = IdentitySnapshot {
        name: "sa-test".into(),
        stored_bindings: BTreeMap::from([("moved".to_string(), Some(OPEN_B.to_string()))]),
    };

    let outcome = run_cycle(&provider, &snapshot, &settings()).await.unwrap();

    let updates = events_of(&outcome, OperationType::Update);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].old_value.as_deref(), Some(OPEN_B));
    assert_eq!(updates[0].new_value.as_deref(), Some(OPEN_C));
    assert_eq!(updates[0].status, OperationStatus::Success);
    assert_eq!(outcome.stats.observed_changes, 1);
}

/// A project detached behind our back and re-bound in the same cycle keeps
/// the full audit trail: the external detach gets its `update` event before
/// the `auto_bind` records our own work.
#[tokio::test]
async fn external_detach_then_rebind_keeps_full_audit_trail() {
    let mut projects = BTreeMap::new();
    projects.insert("moved".into(), String::new());

    let provider = FakeProvider::new(FakeState {
        projects,
        accounts: vec![account(OPEN_B, true), account(OPEN_C, true)],
        ..Default::default()
    });
    // The stored row still says the project is on B.
    let snapshot = IdentitySnapshot {
        name: "sa-test".into(),
        stored_bindings: BTreeMap::from([("moved".to_string(), Some(OPEN_B.to_string()))]),
    };

    let outcome = run_cycle(&provider, &snapshot, &settings()).await.unwrap();

    let updates = events_of(&outcome, OperationType::Update);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].old_value.as_deref(), Some(OPEN_B));
    assert_eq!(updates[0].new_value, None);

    let binds = events_of(&outcome, OperationType::AutoBind);
    assert_eq!(binds.len(), 1);
    assert_eq!(binds[0].status, OperationStatus::Success);
    assert_eq!(binds[0].old_value, None);

    // The observation precedes the re-bind in the log.
    let update_at = outcome
        .events
        .iter()
        .position(|e| e.op == OperationType::Update)
        .unwrap();
    let bind_at = outcome
        .events
        .iter()
        .position(|e| e.op == OperationType::AutoBind)
        .unwrap();
    assert!(update_at < bind_at);
}

/// With auto-switch off, unbound projects stay unbound and only the
/// deferred counter moves.
#[tokio::test]
async fn auto_switch_off_never_binds() {
    let mut projects = BTreeMap::new();
    projects.insert("waiting-1".into(), String::new());
    projects.insert("waiting-2".into(), String::new());

    let provider = FakeProvider::new(FakeState {
        projects,
        accounts: vec![account(OPEN_B, true)],
        ..Default::default()
    });
    let snapshot = IdentitySnapshot {
        name: "sa-test".into(),
        stored_bindings: BTreeMap::new(),
    };
    let settings = ReconcileSettings {
        auto_switch: false,
        max_projects_per_billing: 3,
    };

    let outcome = run_cycle(&provider, &snapshot, &settings).await.unwrap();

    assert!(events_of(&outcome, OperationType::AutoBind).is_empty());
    assert_eq!(outcome.stats.deferred, 2);
    assert!(outcome.projects.iter().all(|p| p.billing_name.is_none()));
}

/// Revoking admin roles twice: the first call rewrites the policy, the
/// second finds the member absent and writes nothing.
#[tokio::test]
async fn admin_revoke_is_idempotent() {
    let member = "serviceAccount:keeper@demo.iam.gserviceaccount.com";
    let policy = IamPolicy {
        version: 1,
        bindings: vec![
            IamBinding {
                role: "roles/owner".into(),
                members: vec![member.to_string(), "user:alice@example.com".into()],
                condition: None,
            },
            IamBinding {
                role: "roles/editor".into(),
                members: vec![member.to_string()],
                condition: None,
            },
        ],
        etag: Some("v1".into()),
    };
    let provider = FakeProvider::new(FakeState {
        policies: BTreeMap::from([("project/p1".to_string(), policy)]),
        ..Default::default()
    });
    let resource = IamResource::Project("p1".into());

    let first = provider
        .remove_member_from_roles(&resource, member, PROJECT_ADMIN_ROLES)
        .await
        .unwrap();
    assert_eq!(first, RevokeOutcome::Removed { bindings_touched: 2 });
    assert_eq!(provider.policy_writes(), 1);

    let second = provider
        .remove_member_from_roles(&resource, member, PROJECT_ADMIN_ROLES)
        .await
        .unwrap();
    assert_eq!(second, RevokeOutcome::AlreadyAbsent);
    assert_eq!(provider.policy_writes(), 1, "no write for an absent member");
}

/// Transient 429s on discovery are absorbed by the retry executor and the
/// cycle completes without any audit noise.
#[tokio::test]
async fn transient_list_failures_are_retried_to_success() {
    let mut projects = BTreeMap::new();
    projects.insert("healthy-1".into(), OPEN_B.to_string());

    let provider = FakeProvider::new(FakeState {
        projects,
        accounts: vec![account(OPEN_B, true)],
        list_failures_left: 2,
        ..Default::default()
    });

    let retry = RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
        jitter: false,
    };
    let listed = retry.run(|| provider.list_projects()).await.unwrap();
    assert_eq!(listed, vec!["healthy-1".to_string()]);

    // The flakiness is spent; a full cycle now runs clean.
    let snapshot = IdentitySnapshot {
        name: "sa-test".into(),
        stored_bindings: BTreeMap::from([("healthy-1".to_string(), Some(OPEN_B.to_string()))]),
    };
    let outcome = run_cycle(&provider, &snapshot, &settings()).await.unwrap();
    assert!(outcome.events.is_empty());
}
