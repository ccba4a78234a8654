use crate::auth::TokenSource;
use crate::error::ProviderError;
use crate::rate::RateGate;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const RESOURCE_MANAGER: &str = "https://cloudresourcemanager.googleapis.com/v1";
const CLOUD_BILLING: &str = "https://cloudbilling.googleapis.com/v1";

/// Roles that make a service account an administrator of a project.
pub const PROJECT_ADMIN_ROLES: &[&str] = &[
    "roles/owner",
    "roles/editor",
    "roles/resourcemanager.projectIamAdmin",
];

/// Roles that make a service account an administrator of a billing account.
pub const BILLING_ADMIN_ROLES: &[&str] = &["roles/billing.admin"];

/// IAM policy version that can carry conditional bindings. Requesting
/// anything lower makes the API silently drop conditions on read.
const POLICY_VERSION: i64 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingAccountInfo {
    /// Full resource name, `billingAccounts/XXXXXX-XXXXXX-XXXXXX`.
    pub name: String,
    pub display_name: String,
    pub open: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IamResource {
    Project(String),
    BillingAccount(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeOutcome {
    /// The member was present and has been removed from `bindings_touched`
    /// role bindings.
    Removed { bindings_touched: usize },
    /// The member held none of the roles; nothing was written.
    AlreadyAbsent,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IamPolicy {
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub bindings: Vec<IamBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IamBinding {
    pub role: String,
    #[serde(default)]
    pub members: Vec<String>,
    /// Conditional bindings must round-trip untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Value>,
}

/// The capability set the reconciler and operator actions need from the
/// cloud provider. Implemented by [`GcpBilling`] against the REST surface
/// and by an in-memory fake in the integration tests.
#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Project ids visible to this identity, active ones only.
    async fn list_projects(&self) -> Result<Vec<String>, ProviderError>;

    async fn list_billing_accounts(&self) -> Result<Vec<BillingAccountInfo>, ProviderError>;

    /// Current billing binding of a project.
    ///
    /// `Ok(Some(name))` is the bound billing account, `Ok(Some(""))` means
    /// the project has no billing attached, and `Ok(None)` means this
    /// identity cannot read the binding (skip the project, not a failure).
    async fn project_billing(&self, project_id: &str) -> Result<Option<String>, ProviderError>;

    /// Bind `project_id` to `billing_name`; an empty name detaches.
    async fn set_project_billing(
        &self,
        project_id: &str,
        billing_name: &str,
    ) -> Result<(), ProviderError>;

    /// Remove `member` from every binding of `roles` on `resource`,
    /// preserving all other bindings.
    async fn remove_member_from_roles(
        &self,
        resource: &IamResource,
        member: &str,
        roles: &[&str],
    ) -> Result<RevokeOutcome, ProviderError>;
}

/// REST client for one identity. Every call takes one rate-gate token and
/// runs under the retry executor.
pub struct GcpBilling {
    identity: String,
    auth: TokenSource,
    http: reqwest::Client,
    gate: Arc<RateGate>,
    retry: RetryPolicy,
    acquire_timeout: Duration,
}

impl GcpBilling {
    pub fn new(
        identity: String,
        auth: TokenSource,
        gate: Arc<RateGate>,
        retry: RetryPolicy,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            identity,
            auth,
            http: reqwest::Client::new(),
            gate,
            retry,
            acquire_timeout,
        }
    }

    /// One admitted HTTP attempt: gate token, bearer token, request, and
    /// status mapping. Retries happen in the callers via `self.retry`.
    async fn attempt(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value, ProviderError> {
        self.gate.acquire(&self.identity, self.acquire_timeout).await?;
        let token = self.auth.bearer().await?;

        let mut request = self.http.request(method, url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(ProviderError::transport)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                status: status.as_u16(),
                message: truncate(&message, 240),
            });
        }
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        response
            .json()
            .await
            .map_err(|e| ProviderError::UnexpectedResponse(e.to_string()))
    }

    async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<Value>,
    ) -> Result<Value, ProviderError> {
        self.retry
            .run(|| self.attempt(method.clone(), url, body.as_ref()))
            .await
    }

    /// Page through `url`, collecting `items_key` arrays until the provider
    /// stops returning a `nextPageToken`.
    async fn paged(&self, base_url: &str, items_key: &str) -> Result<Vec<Value>, ProviderError> {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let url = match &page_token {
                Some(token) => format!("{base_url}{}pageToken={token}", join_char(base_url)),
                None => base_url.to_string(),
            };
            let page = self.request(Method::GET, &url, None).await?;
            if let Some(chunk) = page.get(items_key).and_then(Value::as_array) {
                items.extend(chunk.iter().cloned());
            }
            match page.get("nextPageToken").and_then(Value::as_str) {
                Some(token) if !token.is_empty() => page_token = Some(token.to_string()),
                _ => return Ok(items),
            }
        }
    }

    async fn get_iam_policy(&self, resource: &IamResource) -> Result<IamPolicy, ProviderError> {
        let (url, body) = match resource {
            IamResource::Project(id) => (
                format!("{RESOURCE_MANAGER}/projects/{id}:getIamPolicy"),
                json!({ "options": { "requestedPolicyVersion": POLICY_VERSION } }),
            ),
            IamResource::BillingAccount(name) => (
                format!("{CLOUD_BILLING}/{name}:getIamPolicy?options.requestedPolicyVersion={POLICY_VERSION}"),
                json!({}),
            ),
        };
        let raw = self.request(Method::POST, &url, Some(body)).await?;
        serde_json::from_value(raw).map_err(|e| ProviderError::UnexpectedResponse(e.to_string()))
    }

    /// Single write attempt; the OCC loop in `remove_member_from_roles`
    /// owns conflict handling, so this must not blind-retry a stale etag.
    async fn set_iam_policy_once(
        &self,
        resource: &IamResource,
        policy: &IamPolicy,
    ) -> Result<(), ProviderError> {
        let url = match resource {
            IamResource::Project(id) => format!("{RESOURCE_MANAGER}/projects/{id}:setIamPolicy"),
            IamResource::BillingAccount(name) => format!("{CLOUD_BILLING}/{name}:setIamPolicy"),
        };
        let body = json!({ "policy": policy });
        self.attempt(Method::POST, &url, Some(&body)).await?;
        Ok(())
    }
}

#[async_trait]
impl BillingProvider for GcpBilling {
    async fn list_projects(&self) -> Result<Vec<String>, ProviderError> {
        // Prefer the server-side filter; fall back to an unfiltered list
        // plus client-side filtering when the API rejects it.
        let filtered = format!("{RESOURCE_MANAGER}/projects?filter=lifecycleState:ACTIVE");
        let raw = match self.paged(&filtered, "projects").await {
            Ok(items) => items,
            Err(err) if matches!(err.status(), Some(400) | Some(404)) => {
                tracing::warn!(
                    identity = %self.identity,
                    error = %err,
                    "filtered project list unavailable; listing unfiltered"
                );
                self.paged(&format!("{RESOURCE_MANAGER}/projects"), "projects")
                    .await?
            }
            Err(err) => return Err(err),
        };

        Ok(raw
            .iter()
            .filter(|p| {
                p.get("lifecycleState")
                    .and_then(Value::as_str)
                    .map(|s| s == "ACTIVE")
                    .unwrap_or(true)
            })
            .filter_map(|p| p.get("projectId").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }

    async fn list_billing_accounts(&self) -> Result<Vec<BillingAccountInfo>, ProviderError> {
        let raw = self
            .paged(&format!("{CLOUD_BILLING}/billingAccounts"), "billingAccounts")
            .await?;
        Ok(raw
            .iter()
            .filter_map(|b| {
                let name = b.get("name").and_then(Value::as_str)?;
                Some(BillingAccountInfo {
                    name: name.to_string(),
                    display_name: b
                        .get("displayName")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    open: b.get("open").and_then(Value::as_bool).unwrap_or(false),
                })
            })
            .collect())
    }

    async fn project_billing(&self, project_id: &str) -> Result<Option<String>, ProviderError> {
        let url = format!("{CLOUD_BILLING}/projects/{project_id}/billingInfo");
        match self.request(Method::GET, &url, None).await {
            Ok(info) => Ok(Some(
                info.get("billingAccountName")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            )),
            // This identity cannot read the binding; the caller skips the
            // project for this cycle rather than failing it.
            Err(err) if err.is_permission_denied() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn set_project_billing(
        &self,
        project_id: &str,
        billing_name: &str,
    ) -> Result<(), ProviderError> {
        let url = format!("{CLOUD_BILLING}/projects/{project_id}/billingInfo");
        let body = json!({ "billingAccountName": billing_name });
        self.request(Method::PUT, &url, Some(body)).await?;
        Ok(())
    }

    async fn remove_member_from_roles(
        &self,
        resource: &IamResource,
        member: &str,
        roles: &[&str],
    ) -> Result<RevokeOutcome, ProviderError> {
        // Read-modify-write under optimistic concurrency: a 409/412 on the
        // write means the etag went stale, so re-read and try again.
        let mut attempt = 0u32;
        loop {
            let mut policy = self.get_iam_policy(resource).await?;
            let touched = strip_member_from_policy(&mut policy, member, roles);
            if touched == 0 {
                return Ok(RevokeOutcome::AlreadyAbsent);
            }
            policy.version = POLICY_VERSION;

            match self.set_iam_policy_once(resource, &policy).await {
                Ok(()) => return Ok(RevokeOutcome::Removed { bindings_touched: touched }),
                Err(err)
                    if (err.is_iam_conflict() || err.is_retryable())
                        && attempt < self.retry.max_retries =>
                {
                    let delay = self.retry.delay_for(attempt, err.status());
                    tracing::debug!(
                        identity = %self.identity,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "IAM policy write lost the race; re-reading"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Drop `member` from every binding whose role is in `roles`, removing
/// bindings whose member list becomes empty. Returns how many bindings
/// were touched; zero means the policy is unchanged.
pub fn strip_member_from_policy(policy: &mut IamPolicy, member: &str, roles: &[&str]) -> usize {
    let mut touched = 0;
    policy.bindings.retain_mut(|binding| {
        if !roles.contains(&binding.role.as_str()) {
            return true;
        }
        let before = binding.members.len();
        binding.members.retain(|m| m != member);
        if binding.members.len() < before {
            touched += 1;
        }
        !binding.members.is_empty()
    });
    touched
}

/// Last path segment of a billing account resource name:
/// `billingAccounts/0123AB-CDEF01-234567` -> `0123AB-CDEF01-234567`.
pub fn short_account_id(billing_name: &str) -> &str {
    billing_name.rsplit('/').next().unwrap_or(billing_name)
}

fn join_char(url: &str) -> char {
    if url.contains('?') {
        '&'
    } else {
        '?'
    }
}

fn truncate(s: &str, max: usize) -> String {
    let mut out: String = s.chars().take(max).collect();
    if out.len() < s.len() {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(bindings: Vec<(&str, Vec<&str>)>) -> IamPolicy {
        IamPolicy {
            version: 1,
            bindings: bindings
                .into_iter()
                .map(|(role, members)| IamBinding {
                    role: role.to_string(),
                    members: members.into_iter().map(str::to_string).collect(),
                    condition: None,
                })
                .collect(),
            etag: Some("abc".into()),
        }
    }

    #[test]
    fn strips_member_from_matching_roles_only() {
        let mut p = policy(vec![
            ("roles/owner", vec!["serviceAccount:sa@x.iam", "user:alice@x"]),
            ("roles/editor", vec!["serviceAccount:sa@x.iam"]),
            ("roles/viewer", vec!["serviceAccount:sa@x.iam"]),
        ]);
        let touched = strip_member_from_policy(&mut p, "serviceAccount:sa@x.iam", PROJECT_ADMIN_ROLES);
        assert_eq!(touched, 2);
        // The owner binding keeps its other member, editor is gone entirely,
        // viewer is untouched.
        assert_eq!(p.bindings.len(), 2);
        assert_eq!(p.bindings[0].role, "roles/owner");
        assert_eq!(p.bindings[0].members, vec!["user:alice@x"]);
        assert_eq!(p.bindings[1].role, "roles/viewer");
    }

    #[test]
    fn absent_member_leaves_policy_untouched() {
        let mut p = policy(vec![("roles/owner", vec!["user:alice@x"])]);
        let touched = strip_member_from_policy(&mut p, "serviceAccount:sa@x.iam", PROJECT_ADMIN_ROLES);
        assert_eq!(touched, 0);
        assert_eq!(p.bindings.len(), 1);
        assert_eq!(p.bindings[0].members, vec!["user:alice@x"]);
    }

    #[test]
    fn conditional_bindings_round_trip() {
        let mut p = policy(vec![("roles/owner", vec!["serviceAccount:sa@x.iam"])]);
        p.bindings.push(IamBinding {
            role: "roles/storage.admin".into(),
            members: vec!["group:ops@x".into()],
            condition: Some(serde_json::json!({ "title": "expires", "expression": "true" })),
        });
        strip_member_from_policy(&mut p, "serviceAccount:sa@x.iam", PROJECT_ADMIN_ROLES);
        assert_eq!(p.bindings.len(), 1);
        assert!(p.bindings[0].condition.is_some());
    }

    #[test]
    fn short_account_id_takes_last_segment() {
        assert_eq!(
            short_account_id("billingAccounts/0123AB-CDEF01-234567"),
            "0123AB-CDEF01-234567"
        );
        assert_eq!(short_account_id("0123AB"), "0123AB");
    }
}
