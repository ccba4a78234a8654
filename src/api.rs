use crate::actions::Actions;
use crate::error::ActionError;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

/// Thin JSON adapter over the store and operator actions. Every response
/// carries the `{status, data|message}` envelope.
pub fn router(state: Actions) -> Router {
    Router::new()
        .route("/api/service-accounts", get(list_service_accounts))
        .route("/api/service-accounts/:id", get(service_account_detail))
        .route("/api/projects", get(list_projects))
        .route("/api/projects/:project_id", delete(delete_project))
        .route(
            "/api/projects/:project_id/admin-rights",
            delete(remove_project_admin_rights),
        )
        .route(
            "/api/projects/:project_id/billing",
            delete(unbind_project_billing),
        )
        .route("/api/billing-accounts", get(list_billing_accounts))
        .route("/api/billing-accounts/:billing_id", delete(delete_billing_account))
        .route(
            "/api/billing-accounts/:billing_id/admin-rights",
            delete(remove_billing_admin_rights),
        )
        .route("/api/operations", get(list_operations))
        .route("/api/status", get(status))
        .with_state(state)
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "status": "error", "message": self.message })),
        )
            .into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!(error = %err, "database error in admin surface");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }
}

impl From<ActionError> for ApiError {
    fn from(err: ActionError) -> Self {
        let status = match &err {
            ActionError::NotFound(_) => StatusCode::NOT_FOUND,
            ActionError::Refused(_) | ActionError::Provider(_) => StatusCode::BAD_REQUEST,
            ActionError::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

fn success(data: impl serde::Serialize) -> Json<Value> {
    Json(json!({ "status": "success", "data": data }))
}

fn success_message(message: impl Into<String>) -> Json<Value> {
    Json(json!({ "status": "success", "message": message.into() }))
}

#[derive(Debug, Deserialize, Default)]
struct AccountScope {
    service_account_id: Option<String>,
}

impl AccountScope {
    /// The mutating endpoints require the parameter; a missing or
    /// non-numeric value is the caller's mistake, not ours.
    fn required(&self) -> Result<i64, ApiError> {
        let raw = self
            .service_account_id
            .as_deref()
            .ok_or_else(|| ApiError::bad_request("missing required parameter service_account_id"))?;
        raw.parse()
            .map_err(|_| ApiError::bad_request("service_account_id must be an integer"))
    }
}

fn parse_optional_id(raw: Option<&str>, name: &str) -> Result<Option<i64>, ApiError> {
    match raw {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ApiError::bad_request(format!("{name} must be an integer"))),
    }
}

async fn list_service_accounts(State(state): State<Actions>) -> ApiResult {
    Ok(success(state.store.identity_summaries().await?))
}

async fn service_account_detail(
    State(state): State<Actions>,
    Path(id): Path<i64>,
) -> ApiResult {
    let identity = state
        .store
        .identity(id)
        .await?
        .ok_or_else(|| ApiError::from(ActionError::NotFound("unknown service account".into())))?;

    let projects = state.store.projects(Some(id)).await?;
    let active = state.store.billing_accounts(Some(id), Some(true)).await?;
    let inactive = state.store.billing_accounts(Some(id), Some(false)).await?;
    let recent = state.store.operations(Some(id), None, 20).await?;

    Ok(success(json!({
        "account": { "id": identity.id, "name": identity.name, "email": identity.email },
        "projects": projects,
        "active_billing_accounts": active,
        "inactive_billing_accounts": inactive,
        "recent_operations": recent,
    })))
}

#[derive(Debug, Deserialize, Default)]
struct ProjectsQuery {
    account_id: Option<String>,
}

async fn list_projects(
    State(state): State<Actions>,
    Query(query): Query<ProjectsQuery>,
) -> ApiResult {
    let account_id = parse_optional_id(query.account_id.as_deref(), "account_id")?;
    Ok(success(state.store.projects(account_id).await?))
}

async fn delete_project(
    State(state): State<Actions>,
    Path(project_id): Path<String>,
    Query(scope): Query<AccountScope>,
) -> ApiResult {
    let identity_id = scope.required()?;
    let message = state.delete_project_record(identity_id, &project_id).await?;
    Ok(success_message(message))
}

async fn remove_project_admin_rights(
    State(state): State<Actions>,
    Path(project_id): Path<String>,
    Query(scope): Query<AccountScope>,
) -> ApiResult {
    let identity_id = scope.required()?;
    let message = state.revoke_project_admin(identity_id, &project_id).await?;
    Ok(success_message(message))
}

async fn unbind_project_billing(
    State(state): State<Actions>,
    Path(project_id): Path<String>,
    Query(scope): Query<AccountScope>,
) -> ApiResult {
    let identity_id = scope.required()?;
    let message = state.detach_project_billing(identity_id, &project_id).await?;
    Ok(success_message(message))
}

#[derive(Debug, Deserialize, Default)]
struct BillingAccountsQuery {
    account_id: Option<String>,
    is_open: Option<String>,
}

async fn list_billing_accounts(
    State(state): State<Actions>,
    Query(query): Query<BillingAccountsQuery>,
) -> ApiResult {
    let account_id = parse_optional_id(query.account_id.as_deref(), "account_id")?;
    let is_open = query
        .is_open
        .as_deref()
        .map(|v| v.eq_ignore_ascii_case("true"));
    Ok(success(state.store.billing_accounts(account_id, is_open).await?))
}

async fn delete_billing_account(
    State(state): State<Actions>,
    Path(billing_id): Path<String>,
    Query(scope): Query<AccountScope>,
) -> ApiResult {
    let identity_id = scope.required()?;
    let message = state.delete_billing_record(identity_id, &billing_id).await?;
    Ok(success_message(message))
}

async fn remove_billing_admin_rights(
    State(state): State<Actions>,
    Path(billing_id): Path<String>,
    Query(scope): Query<AccountScope>,
) -> ApiResult {
    let identity_id = scope.required()?;
    let message = state.revoke_billing_admin(identity_id, &billing_id).await?;
    Ok(success_message(message))
}

#[derive(Debug, Deserialize, Default)]
struct OperationsQuery {
    account_id: Option<String>,
    #[serde(rename = "type")]
    operation_type: Option<String>,
    limit: Option<String>,
}

async fn list_operations(
    State(state): State<Actions>,
    Query(query): Query<OperationsQuery>,
) -> ApiResult {
    let account_id = parse_optional_id(query.account_id.as_deref(), "account_id")?;
    let limit = match query.limit.as_deref() {
        None => 50,
        Some(raw) => raw
            .parse::<i64>()
            .map_err(|_| ApiError::bad_request("limit must be an integer"))?,
    };
    Ok(success(
        state
            .store
            .operations(account_id, query.operation_type.as_deref(), limit)
            .await?,
    ))
}

async fn status(State(state): State<Actions>) -> ApiResult {
    let counts = state.store.status_counts().await?;
    let recent = state.store.operations(None, None, 5).await?;
    Ok(success(json!({
        "counts": counts,
        "recent_operations": recent,
    })))
}
