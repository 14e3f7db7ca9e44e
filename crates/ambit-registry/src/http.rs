// HTTP surface of the registry: snapshot, change feed, and status writes.
//
// This is the minimum remote API servers need to mirror the definition
// collection and report progress; authoring definitions stays a thin
// upsert/delete pair used by operators and tests.
use crate::{ChangeSet, DefinitionRegistry, RegistryError, Snapshot};
use ambit_api::{ScopeDefinition, ScopeDefinitionSpec};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Json, Router, routing::get, routing::put};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        let (status, code) = match &err {
            RegistryError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            RegistryError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            RegistryError::Validation(_) | RegistryError::Invalid(_) => {
                (StatusCode::BAD_REQUEST, "validation_error")
            }
            RegistryError::OutdatedCursor { .. } => (StatusCode::GONE, "outdated_cursor"),
        };
        ApiError {
            status,
            body: ErrorResponse {
                code: code.to_string(),
                message: err.to_string(),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChangesParams {
    #[serde(default)]
    since: u64,
}

pub fn router(registry: Arc<DefinitionRegistry>) -> Router {
    Router::new()
        .route("/v1/scopedefinitions/snapshot", get(snapshot))
        .route("/v1/scopedefinitions/changes", get(changes))
        .route(
            "/v1/scopedefinitions/:name",
            get(get_definition).put(upsert_spec).delete(delete_definition),
        )
        .route("/v1/scopedefinitions/:name/status", put(update_status))
        .with_state(registry)
}

async fn snapshot(State(registry): State<Arc<DefinitionRegistry>>) -> Json<Snapshot> {
    Json(registry.snapshot().await)
}

async fn changes(
    State(registry): State<Arc<DefinitionRegistry>>,
    Query(params): Query<ChangesParams>,
) -> Result<Json<ChangeSet>, ApiError> {
    Ok(Json(registry.changes(params.since).await?))
}

async fn get_definition(
    State(registry): State<Arc<DefinitionRegistry>>,
    Path(name): Path<String>,
) -> Result<Json<ScopeDefinition>, ApiError> {
    registry
        .get(&name)
        .await
        .map(Json)
        .ok_or_else(|| RegistryError::NotFound(name).into())
}

async fn upsert_spec(
    State(registry): State<Arc<DefinitionRegistry>>,
    Path(name): Path<String>,
    Json(spec): Json<ScopeDefinitionSpec>,
) -> Result<Json<ScopeDefinition>, ApiError> {
    Ok(Json(registry.upsert_spec(&name, spec).await?))
}

async fn delete_definition(
    State(registry): State<Arc<DefinitionRegistry>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    registry.delete(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn update_status(
    State(registry): State<Arc<DefinitionRegistry>>,
    Path(name): Path<String>,
    Json(def): Json<ScopeDefinition>,
) -> Result<Json<ScopeDefinition>, ApiError> {
    if def.metadata.name != name {
        return Err(RegistryError::Invalid(format!(
            "definition name {:?} does not match path {name:?}",
            def.metadata.name
        ))
        .into());
    }
    Ok(Json(registry.update_status(def).await?))
}
