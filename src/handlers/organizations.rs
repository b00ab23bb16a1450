// handlers/organizations.rs - /api/orgs/*

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::AppState;
use crate::authz::context::Principal;
use crate::authz::error::AuthzError;
use crate::authz::hierarchy::{NewOrganization, Organization};
use crate::error::ApiError;
use crate::handlers::ScopeQuery;
use crate::middleware::{ApiResponse, ApiResult};

#[derive(Debug, Deserialize)]
pub struct MoveRequest {
    pub parent_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct MoveResponse {
    /// Rows whose path was rewritten, the moved organization included
    pub moved: usize,
    pub organization: Organization,
}

/// GET /api/orgs/visible
pub async fn visible(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<ScopeQuery>,
) -> ApiResult<Vec<Organization>> {
    let orgs = state
        .executor
        .run(principal, query.direction, |mut scope| {
            Box::pin(async move { scope.visible_organizations().await })
        })
        .await
        .map_err(ApiError::from)?;

    Ok(ApiResponse::success(orgs))
}

/// GET /api/orgs/:id/ancestors - root first, limited to the caller's scope
pub async fn ancestors(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    Query(query): Query<ScopeQuery>,
) -> ApiResult<Vec<Uuid>> {
    let lineage = state
        .executor
        .run(principal, query.direction, move |mut scope| {
            Box::pin(async move { scope.ancestors_of(id).await })
        })
        .await
        .map_err(ApiError::from)?;

    Ok(ApiResponse::success(lineage))
}

/// GET /api/orgs/:id/descendants
pub async fn descendants(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    Query(query): Query<ScopeQuery>,
) -> ApiResult<Vec<Uuid>> {
    let subtree = state
        .executor
        .run(principal, query.direction, move |mut scope| {
            Box::pin(async move { scope.descendants_of(id).await })
        })
        .await
        .map_err(ApiError::from)?;

    Ok(ApiResponse::success(subtree))
}

/// POST /api/orgs
pub async fn create(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<ScopeQuery>,
    Json(body): Json<NewOrganization>,
) -> ApiResult<Organization> {
    let created = state
        .executor
        .run(principal, query.direction, move |mut scope| {
            Box::pin(async move { scope.create_organization(&body).await })
        })
        .await
        .map_err(ApiError::from)?;

    tracing::info!(org = %created.id, kind = %created.kind, "organization created");
    Ok(ApiResponse::created(created))
}

/// PUT /api/orgs/:id/parent
pub async fn move_parent(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    Query(query): Query<ScopeQuery>,
    Json(body): Json<MoveRequest>,
) -> ApiResult<MoveResponse> {
    let new_parent = body.parent_id;
    let response = state
        .executor
        .run(principal, query.direction, move |mut scope| {
            Box::pin(async move {
                let updates = scope.move_subtree(id, new_parent).await?;
                let organization = scope.organization(id).await?;
                Ok::<_, AuthzError>(MoveResponse {
                    moved: updates.len(),
                    organization,
                })
            })
        })
        .await
        .map_err(ApiError::from)?;

    Ok(ApiResponse::success(response))
}
